//! Process address value
//!
//! A machine-word wrapper over a raw pointer with the arithmetic the rest
//! of the toolkit builds on. An [`Address`] is either zero or the bit
//! pattern of a pointer into the current address space.

use std::fmt;
use std::ops::{Add, AddAssign, BitAnd, BitOr, BitXor, Sub, SubAssign};

/// An address in the current process.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    /// The "no address" value.
    pub const NULL: Address = Address(0);

    pub const fn new(value: usize) -> Self {
        Address(value)
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Address(ptr as usize)
    }

    pub fn from_mut_ptr<T>(ptr: *mut T) -> Self {
        Address(ptr as usize)
    }

    /// The raw integer value.
    pub const fn value(self) -> usize {
        self.0
    }

    /// Whether this is a usable address (non-zero).
    pub const fn valid(self) -> bool {
        self.0 != 0
    }

    /// Takes the value out, leaving [`Address::NULL`] behind.
    ///
    /// This is the move-out operation used by owning guards: the source
    /// slot no longer refers to the resource afterwards.
    pub fn take(&mut self) -> Address {
        std::mem::take(self)
    }

    /// Projects the address as a typed pointer.
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Offsets by a signed byte count.
    pub const fn offset(self, delta: isize) -> Address {
        Address(self.0.wrapping_add_signed(delta))
    }

    /// Rounds down to a multiple of `align` (a power of two).
    pub const fn align_down(self, align: usize) -> Address {
        Address(self.0 & !(align - 1))
    }
}

impl From<usize> for Address {
    fn from(value: usize) -> Self {
        Address(value)
    }
}

impl<T> From<*const T> for Address {
    fn from(ptr: *const T) -> Self {
        Address(ptr as usize)
    }
}

impl<T> From<*mut T> for Address {
    fn from(ptr: *mut T) -> Self {
        Address(ptr as usize)
    }
}

impl Add<usize> for Address {
    type Output = Address;

    fn add(self, rhs: usize) -> Address {
        Address(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<usize> for Address {
    fn add_assign(&mut self, rhs: usize) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<usize> for Address {
    type Output = Address;

    fn sub(self, rhs: usize) -> Address {
        Address(self.0.wrapping_sub(rhs))
    }
}

impl SubAssign<usize> for Address {
    fn sub_assign(&mut self, rhs: usize) {
        self.0 = self.0.wrapping_sub(rhs);
    }
}

/// Distance in bytes between two addresses.
impl Sub<Address> for Address {
    type Output = isize;

    fn sub(self, rhs: Address) -> isize {
        self.0.wrapping_sub(rhs.0) as isize
    }
}

impl BitAnd<usize> for Address {
    type Output = Address;

    fn bitand(self, rhs: usize) -> Address {
        Address(self.0 & rhs)
    }
}

impl BitOr<usize> for Address {
    type Output = Address;

    fn bitor(self, rhs: usize) -> Address {
        Address(self.0 | rhs)
    }
}

impl BitXor<usize> for Address {
    type Output = Address;

    fn bitxor(self, rhs: usize) -> Address {
        Address(self.0 ^ rhs)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity() {
        assert!(!Address::NULL.valid());
        assert!(Address::new(0x1000).valid());
    }

    #[test]
    fn test_arithmetic() {
        let base = Address::new(0x1000);
        assert_eq!((base + 0x10).value(), 0x1010);
        assert_eq!((base - 0x10).value(), 0xff0);
        assert_eq!((base + 0x20) - base, 0x20);
        assert_eq!(base.offset(-16), base - 16);
    }

    #[test]
    fn test_bit_ops() {
        let addr = Address::new(0x1234);
        assert_eq!((addr & 0xff00).value(), 0x1200);
        assert_eq!((addr | 0x000f).value(), 0x123f);
        assert_eq!(addr.align_down(0x1000).value(), 0x1000);
    }

    #[test]
    fn test_take_zeroes_source() {
        let mut a = Address::new(0xdead);
        let b = a.take();
        assert_eq!(b.value(), 0xdead);
        assert!(!a.valid());
    }

    #[test]
    fn test_pointer_round_trip() {
        let value = 42u32;
        let addr = Address::from_ptr(&value);
        assert_eq!(unsafe { *addr.as_ptr::<u32>() }, 42);
    }
}
