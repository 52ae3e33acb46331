//! Low-level typed memory operations
//!
//! Reads, writes, copies, fills and compares over raw addresses. Each
//! operation has a guarded variant that lifts page protection for the
//! duration of the access and an unguarded variant that touches memory
//! as-is. Writes into executable pages are followed by an
//! instruction-cache flush.

use std::cmp::Ordering;

use crate::address::Address;
use crate::error::MemoryError;
use crate::protect::{self, Protection, ScopedProtect};

#[cfg(windows)]
pub fn flush_instruction_cache(address: Address, size: usize) {
    use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows::Win32::System::Threading::GetCurrentProcess;

    let _ = unsafe { FlushInstructionCache(GetCurrentProcess(), Some(address.as_ptr()), size) };
}

/// x86 keeps the instruction cache coherent with data writes; the flush is
/// only an ordering point for the compiler.
#[cfg(unix)]
pub fn flush_instruction_cache(_address: Address, _size: usize) {
    std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
}

fn guard(address: Address, size: usize) -> Result<ScopedProtect, MemoryError> {
    let guard = unsafe { ScopedProtect::new(address, Protection::READ_WRITE_EXECUTE, size) };
    if guard.valid() {
        Ok(guard)
    } else {
        Err(MemoryError::InvalidProtectChange(address))
    }
}

/// Reads a `T` from `address` without touching page protection.
///
/// # Safety
/// `address` must hold a valid bit pattern for `T`.
pub unsafe fn read_unguarded<T: Copy>(address: Address) -> Result<T, MemoryError> {
    if !address.valid() {
        return Err(MemoryError::InvalidAddress);
    }
    if !protect::is_readable(address) {
        return Err(MemoryError::UnreadableMemory(address));
    }
    Ok(std::ptr::read_unaligned(address.as_ptr::<T>()))
}

/// Reads a `T` from `address` under a scoped protection lift.
///
/// # Safety
/// See [`read_unguarded`].
pub unsafe fn read<T: Copy>(address: Address) -> Result<T, MemoryError> {
    if !address.valid() {
        return Err(MemoryError::InvalidAddress);
    }
    let _guard = guard(address, std::mem::size_of::<T>())?;
    Ok(std::ptr::read_unaligned(address.as_ptr::<T>()))
}

/// Writes a `T` to `address` without touching page protection.
///
/// # Safety
/// `address` must be writable memory owned by the caller's contract.
pub unsafe fn write_unguarded<T: Copy>(address: Address, value: T) -> Result<(), MemoryError> {
    if !address.valid() {
        return Err(MemoryError::InvalidAddress);
    }
    if !protect::is_writeable(address) {
        return Err(MemoryError::UnwriteableMemory(address));
    }
    std::ptr::write_unaligned(address.as_mut_ptr::<T>(), value);
    flush_instruction_cache(address, std::mem::size_of::<T>());
    Ok(())
}

/// Writes a `T` to `address` under a scoped protection lift.
///
/// # Safety
/// See [`write_unguarded`].
pub unsafe fn write<T: Copy>(address: Address, value: T) -> Result<(), MemoryError> {
    if !address.valid() {
        return Err(MemoryError::InvalidAddress);
    }
    let _guard = guard(address, std::mem::size_of::<T>())?;
    std::ptr::write_unaligned(address.as_mut_ptr::<T>(), value);
    flush_instruction_cache(address, std::mem::size_of::<T>());
    Ok(())
}

fn check_copy(destination: Address, source: Address, size: usize) -> Result<(), MemoryError> {
    if size == 0 {
        return Err(MemoryError::NullSize);
    }
    if !destination.valid() {
        return Err(MemoryError::InvalidDestination);
    }
    if !source.valid() {
        return Err(MemoryError::InvalidSource);
    }
    Ok(())
}

/// Copies `size` bytes from `source` to `destination` without touching
/// page protection. Overlapping ranges are handled.
///
/// # Safety
/// Both ranges must be valid for the access.
pub unsafe fn copy_unguarded(
    destination: Address,
    source: Address,
    size: usize,
) -> Result<(), MemoryError> {
    check_copy(destination, source, size)?;
    if !protect::is_readable(source) {
        return Err(MemoryError::UnreadableMemory(source));
    }
    if !protect::is_writeable(destination) {
        return Err(MemoryError::UnwriteableMemory(destination));
    }
    std::ptr::copy(source.as_ptr::<u8>(), destination.as_mut_ptr::<u8>(), size);
    flush_instruction_cache(destination, size);
    Ok(())
}

/// Copies `size` bytes from `source` to `destination`, lifting protection
/// on the destination range.
///
/// # Safety
/// See [`copy_unguarded`].
pub unsafe fn copy(destination: Address, source: Address, size: usize) -> Result<(), MemoryError> {
    check_copy(destination, source, size)?;
    let _guard = guard(destination, size)?;
    if !protect::is_readable(source) {
        return Err(MemoryError::UnreadableMemory(source));
    }
    std::ptr::copy(source.as_ptr::<u8>(), destination.as_mut_ptr::<u8>(), size);
    flush_instruction_cache(destination, size);
    Ok(())
}

/// Fills `size` bytes at `destination` with `value` without touching page
/// protection.
///
/// # Safety
/// The range must be writable memory owned by the caller's contract.
pub unsafe fn fill_unguarded(
    destination: Address,
    value: u8,
    size: usize,
) -> Result<(), MemoryError> {
    if size == 0 {
        return Err(MemoryError::NullSize);
    }
    if !destination.valid() {
        return Err(MemoryError::InvalidDestination);
    }
    if !protect::is_writeable(destination) {
        return Err(MemoryError::UnwriteableMemory(destination));
    }
    std::ptr::write_bytes(destination.as_mut_ptr::<u8>(), value, size);
    flush_instruction_cache(destination, size);
    Ok(())
}

/// Fills `size` bytes at `destination` with `value`, lifting protection.
///
/// # Safety
/// See [`fill_unguarded`].
pub unsafe fn fill(destination: Address, value: u8, size: usize) -> Result<(), MemoryError> {
    if size == 0 {
        return Err(MemoryError::NullSize);
    }
    if !destination.valid() {
        return Err(MemoryError::InvalidDestination);
    }
    let _guard = guard(destination, size)?;
    std::ptr::write_bytes(destination.as_mut_ptr::<u8>(), value, size);
    flush_instruction_cache(destination, size);
    Ok(())
}

/// Compares `size` bytes at `a` and `b`, memcmp-style.
///
/// # Safety
/// Both ranges must be readable.
pub unsafe fn compare(a: Address, b: Address, size: usize) -> Result<Ordering, MemoryError> {
    if size == 0 {
        return Err(MemoryError::NullSize);
    }
    if !a.valid() || !b.valid() {
        return Err(MemoryError::InvalidAddress);
    }
    if !protect::is_readable(a) {
        return Err(MemoryError::UnreadableMemory(a));
    }
    if !protect::is_readable(b) {
        return Err(MemoryError::UnreadableMemory(b));
    }
    let lhs = std::slice::from_raw_parts(a.as_ptr::<u8>(), size);
    let rhs = std::slice::from_raw_parts(b.as_ptr::<u8>(), size);
    Ok(lhs.cmp(rhs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_round_trip() {
        let mut slot = 0u64;
        let addr = Address::from_mut_ptr(&mut slot);
        unsafe {
            write::<u64>(addr, 0xdead_beef_cafe_f00d).unwrap();
            assert_eq!(read::<u64>(addr).unwrap(), 0xdead_beef_cafe_f00d);
        }
        assert_eq!(slot, 0xdead_beef_cafe_f00d);
    }

    #[test]
    fn test_invalid_addresses() {
        unsafe {
            assert!(matches!(
                read::<u32>(Address::NULL),
                Err(MemoryError::InvalidAddress)
            ));
            assert!(matches!(
                write::<u32>(Address::NULL, 1),
                Err(MemoryError::InvalidAddress)
            ));
        }
    }

    #[test]
    fn test_copy_then_compare_equal() {
        let source = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut destination = [0u8; 8];
        let src = Address::from_ptr(source.as_ptr());
        let dst = Address::from_mut_ptr(destination.as_mut_ptr());
        unsafe {
            copy(dst, src, source.len()).unwrap();
            assert_eq!(compare(dst, src, source.len()).unwrap(), Ordering::Equal);
        }
        assert_eq!(destination, source);
    }

    #[test]
    fn test_copy_rejects_degenerate_ranges() {
        let buffer = [0u8; 4];
        let addr = Address::from_ptr(buffer.as_ptr());
        unsafe {
            assert!(matches!(copy(addr, addr, 0), Err(MemoryError::NullSize)));
            assert!(matches!(
                copy(Address::NULL, addr, 4),
                Err(MemoryError::InvalidDestination)
            ));
            assert!(matches!(
                copy(addr, Address::NULL, 4),
                Err(MemoryError::InvalidSource)
            ));
        }
    }

    #[test]
    fn test_fill() {
        let mut buffer = [0u8; 16];
        let addr = Address::from_mut_ptr(buffer.as_mut_ptr());
        unsafe {
            fill(addr, 0x90, buffer.len()).unwrap();
        }
        assert!(buffer.iter().all(|&b| b == 0x90));
    }

    #[test]
    fn test_compare_orders() {
        let lo = [1u8, 2, 3];
        let hi = [1u8, 2, 4];
        unsafe {
            let result = compare(
                Address::from_ptr(lo.as_ptr()),
                Address::from_ptr(hi.as_ptr()),
                3,
            )
            .unwrap();
            assert_eq!(result, Ordering::Less);
        }
    }
}
