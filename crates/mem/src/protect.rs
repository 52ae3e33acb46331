//! Page protection kinds and the scoped protection guard
//!
//! Protection is represented as a small flag set that converts to and from
//! the OS-native page constants. On Windows the conversion round-trips for
//! every representable combination; on Unix several kinds fold into the
//! same `PROT_*` bits (NoAccess and the empty set are both `PROT_NONE`).

use bitflags::bitflags;

use crate::address::Address;

bitflags! {
    /// A page protection kind.
    ///
    /// The empty set means "unknown": it is what queries return on failure
    /// and never describes a real page. A page with no access rights is
    /// [`Protection::NO_ACCESS`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u8 {
        const NO_ACCESS = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
        const READ_EXECUTE = Self::READ.bits() | Self::EXECUTE.bits();
        const READ_WRITE_EXECUTE =
            Self::READ.bits() | Self::WRITE.bits() | Self::EXECUTE.bits();
    }
}

#[cfg(windows)]
mod native {
    use super::Protection;
    use windows::Win32::System::Memory::{
        PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY,
        PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
    };

    // PAGE_GUARD / PAGE_NOCACHE / PAGE_WRITECOMBINE modifiers
    const MODIFIER_MASK: u32 = 0xff;

    pub fn from_native(native: u32) -> Protection {
        match PAGE_PROTECTION_FLAGS(native & MODIFIER_MASK) {
            PAGE_NOACCESS => Protection::NO_ACCESS,
            PAGE_READONLY => Protection::READ,
            PAGE_READWRITE => Protection::READ_WRITE,
            PAGE_WRITECOPY => Protection::WRITE,
            PAGE_EXECUTE => Protection::EXECUTE,
            PAGE_EXECUTE_READ => Protection::READ_EXECUTE,
            PAGE_EXECUTE_READWRITE => Protection::READ_WRITE_EXECUTE,
            PAGE_EXECUTE_WRITECOPY => Protection::WRITE | Protection::EXECUTE,
            _ => Protection::empty(),
        }
    }

    pub fn to_native(kind: Protection) -> u32 {
        let flags = if kind == Protection::NO_ACCESS {
            PAGE_NOACCESS
        } else if kind == Protection::READ {
            PAGE_READONLY
        } else if kind == Protection::READ_WRITE {
            PAGE_READWRITE
        } else if kind == Protection::WRITE {
            PAGE_WRITECOPY
        } else if kind == Protection::EXECUTE {
            PAGE_EXECUTE
        } else if kind == Protection::READ_EXECUTE {
            PAGE_EXECUTE_READ
        } else if kind == Protection::READ_WRITE_EXECUTE {
            PAGE_EXECUTE_READWRITE
        } else if kind == Protection::WRITE | Protection::EXECUTE {
            PAGE_EXECUTE_WRITECOPY
        } else {
            PAGE_PROTECTION_FLAGS(0)
        };
        flags.0
    }
}

#[cfg(unix)]
mod native {
    use super::Protection;

    /// Unix folds kinds: both the empty set and NoAccess become
    /// `PROT_NONE`, and write-copy distinctions do not exist.
    pub fn from_native(native: u32) -> Protection {
        let native = native as i32;
        if native == libc::PROT_NONE {
            return Protection::NO_ACCESS;
        }
        let mut kind = Protection::empty();
        if native & libc::PROT_READ != 0 {
            kind |= Protection::READ;
        }
        if native & libc::PROT_WRITE != 0 {
            kind |= Protection::WRITE;
        }
        if native & libc::PROT_EXEC != 0 {
            kind |= Protection::EXECUTE;
        }
        kind
    }

    pub fn to_native(kind: Protection) -> u32 {
        let mut native = libc::PROT_NONE;
        if kind.contains(Protection::READ) {
            native |= libc::PROT_READ;
        }
        if kind.contains(Protection::WRITE) {
            native |= libc::PROT_WRITE;
        }
        if kind.contains(Protection::EXECUTE) {
            native |= libc::PROT_EXEC;
        }
        native as u32
    }
}

impl Protection {
    /// Converts an OS-native protection constant into a kind.
    pub fn from_native(native: u32) -> Protection {
        native::from_native(native)
    }

    /// Converts this kind into the OS-native protection constant.
    pub fn to_native(self) -> u32 {
        native::to_native(self)
    }

    fn to_region(self) -> Option<region::Protection> {
        if self.is_empty() {
            return None;
        }
        if self == Protection::NO_ACCESS {
            return Some(region::Protection::NONE);
        }
        let mut prot = region::Protection::NONE;
        if self.contains(Protection::READ) {
            prot = prot | region::Protection::READ;
        }
        if self.contains(Protection::WRITE) {
            prot = prot | region::Protection::WRITE;
        }
        if self.contains(Protection::EXECUTE) {
            prot = prot | region::Protection::EXECUTE;
        }
        Some(prot)
    }

    fn from_region(prot: region::Protection) -> Protection {
        let mut kind = Protection::empty();
        if prot & region::Protection::READ == region::Protection::READ {
            kind |= Protection::READ;
        }
        if prot & region::Protection::WRITE == region::Protection::WRITE {
            kind |= Protection::WRITE;
        }
        if prot & region::Protection::EXECUTE == region::Protection::EXECUTE {
            kind |= Protection::EXECUTE;
        }
        if kind.is_empty() {
            // the page exists but carries no rights
            kind = Protection::NO_ACCESS;
        }
        kind
    }
}

/// Queries the protection of the page containing `address`.
///
/// Returns the empty set when the query fails (unmapped page, bad address).
pub fn get_protect(address: Address) -> Protection {
    if !address.valid() {
        return Protection::empty();
    }
    match region::query(address.as_ptr::<u8>()) {
        Ok(info) => Protection::from_region(info.protection()),
        Err(_) => Protection::empty(),
    }
}

/// Changes the protection of the pages covering `[address, address + size)`.
///
/// Returns the protection that was in place before the change, or the empty
/// set when the change (or the prior query) failed.
///
/// # Safety
/// Changing the protection of pages the caller does not control can break
/// any code using them.
pub unsafe fn set_protect(address: Address, kind: Protection, size: usize) -> Protection {
    if !address.valid() || size == 0 {
        return Protection::empty();
    }
    let Some(new_prot) = kind.to_region() else {
        return Protection::empty();
    };
    let prior = get_protect(address);
    if prior.is_empty() {
        return Protection::empty();
    }
    match region::protect(address.as_ptr::<u8>(), size, new_prot) {
        Ok(()) => prior,
        Err(error) => {
            tracing::debug!("protection change at {address} failed: {error}");
            Protection::empty()
        }
    }
}

/// Whether the page containing `address` is readable.
pub fn is_readable(address: Address) -> bool {
    get_protect(address).contains(Protection::READ)
}

/// Whether the page containing `address` is writeable.
pub fn is_writeable(address: Address) -> bool {
    get_protect(address).contains(Protection::WRITE)
}

/// Whether the page containing `address` is executable.
pub fn is_executable(address: Address) -> bool {
    get_protect(address).contains(Protection::EXECUTE)
}

/// Scoped protection change.
///
/// Acquires the requested protection on construction and restores the prior
/// protection on drop, iff the initial change succeeded. A guard that failed
/// to acquire reports `valid() == false` and restores nothing.
#[derive(Debug)]
pub struct ScopedProtect {
    address: Address,
    size: usize,
    prior: Protection,
}

impl ScopedProtect {
    /// Changes `[address, address + size)` to `kind` for the guard's
    /// lifetime.
    ///
    /// # Safety
    /// See [`set_protect`].
    pub unsafe fn new(address: Address, kind: Protection, size: usize) -> Self {
        let prior = set_protect(address, kind, size);
        ScopedProtect {
            address,
            size,
            prior,
        }
    }

    /// Whether the initial protection change succeeded.
    pub fn valid(&self) -> bool {
        !self.prior.is_empty()
    }

    /// The protection in place before the guard was acquired.
    pub fn prior(&self) -> Protection {
        self.prior
    }
}

impl Drop for ScopedProtect {
    fn drop(&mut self) {
        if self.valid() {
            unsafe {
                set_protect(self.address, self.prior, self.size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_round_trip() {
        let kinds = [
            Protection::NO_ACCESS,
            Protection::READ,
            Protection::READ_WRITE,
            Protection::READ_EXECUTE,
            Protection::READ_WRITE_EXECUTE,
        ];
        for kind in kinds {
            assert_eq!(Protection::from_native(kind.to_native()), kind, "{kind:?}");
        }
    }

    #[cfg(windows)]
    #[test]
    fn test_native_round_trip_write_copy() {
        for kind in [Protection::WRITE, Protection::WRITE | Protection::EXECUTE] {
            assert_eq!(Protection::from_native(kind.to_native()), kind, "{kind:?}");
        }
    }

    #[test]
    fn test_query_own_stack() {
        let slot = 0u8;
        let kind = get_protect(Address::from_ptr(&slot));
        assert!(kind.contains(Protection::READ));
        assert!(kind.contains(Protection::WRITE));
    }

    #[test]
    fn test_scoped_protect_restores() {
        // a whole private page we are free to re-protect
        let page = vec![0u8; 0x2000];
        let addr = Address::from_ptr(page.as_ptr()).align_down(0x1000) + 0x1000;

        let before = get_protect(addr);
        {
            let guard =
                unsafe { ScopedProtect::new(addr, Protection::READ_WRITE_EXECUTE, 0x10) };
            assert!(guard.valid());
            assert!(get_protect(addr).contains(Protection::EXECUTE));
        }
        assert_eq!(get_protect(addr), before);
    }

    #[test]
    fn test_invalid_guard() {
        let guard = unsafe { ScopedProtect::new(Address::NULL, Protection::READ, 0x10) };
        assert!(!guard.valid());
    }
}
