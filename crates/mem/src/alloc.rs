//! Executable memory allocator
//!
//! Reserves and commits read-write-execute pages, optionally near a target
//! address so the block stays reachable by a signed 32-bit displacement.

use std::io;

use crate::address::Address;
use crate::map;

/// Search window for near allocation, slightly under 2 GiB.
const NEAR_RANGE: usize = 0x7fff_0000;

#[cfg(windows)]
mod os {
    use super::{io, Address};
    use windows::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    };

    pub fn allocate(hint: Address, size: usize) -> io::Result<Address> {
        let base = hint.valid().then(|| hint.as_ptr::<std::ffi::c_void>());
        let block = unsafe { VirtualAlloc(base, size, MEM_COMMIT | MEM_RESERVE, PAGE_EXECUTE_READWRITE) };
        if block.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Address::from_mut_ptr(block))
    }

    pub fn deallocate(address: Address, _size: usize) -> io::Result<()> {
        unsafe { VirtualFree(address.as_mut_ptr(), 0, MEM_RELEASE) }.map_err(io::Error::other)
    }
}

#[cfg(unix)]
mod os {
    use super::{io, Address};
    use nix::sys::mman::{mmap_anonymous, munmap, MapFlags, ProtFlags};
    use std::num::NonZeroUsize;
    use std::ptr::NonNull;

    pub fn allocate(hint: Address, size: usize) -> io::Result<Address> {
        let length = NonZeroUsize::new(size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero-sized allocation"))?;
        let block = unsafe {
            mmap_anonymous(
                NonZeroUsize::new(hint.value()),
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
        .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
        Ok(Address::from_mut_ptr(block.as_ptr()))
    }

    pub fn deallocate(address: Address, size: usize) -> io::Result<()> {
        let block = NonNull::new(address.as_mut_ptr::<std::ffi::c_void>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "null address"))?;
        unsafe { munmap(block, size) }.map_err(|errno| io::Error::from_raw_os_error(errno as i32))
    }
}

/// Commits `size` bytes of read-write-execute memory anywhere.
pub fn allocate(size: usize) -> io::Result<Address> {
    os::allocate(Address::NULL, size)
}

/// Commits `size` bytes of read-write-execute memory at `hint`.
///
/// The hint must be an allocation-granularity-aligned free base; the call
/// fails when the OS places the block elsewhere.
pub fn allocate_at(hint: Address, size: usize) -> io::Result<Address> {
    let block = os::allocate(hint, size)?;
    if block != hint {
        let _ = os::deallocate(block, size);
        return Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "hinted base not available",
        ));
    }
    Ok(block)
}

/// Releases a block obtained from [`allocate`] / [`allocate_at`].
pub fn deallocate(address: Address, size: usize) -> io::Result<()> {
    if !address.valid() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "null address"));
    }
    os::deallocate(address, size)
}

fn within_near_range(a: Address, b: Address) -> bool {
    a.value().abs_diff(b.value()) < NEAR_RANGE
}

/// Commits `size` bytes of read-write-execute memory within ±2 GiB of
/// `target`.
///
/// Asks [`map::find_free_page`] for a candidate first, then walks the
/// window by allocation granularity (backwards, then forwards), verifying
/// each placement. Fails when nothing in range can be committed.
pub fn allocate_near(target: Address, size: usize) -> io::Result<Address> {
    let free = map::find_free_page(target, NEAR_RANGE);
    if free.valid() && within_near_range(free, target) {
        if let Ok(block) = allocate_at(free, size) {
            return Ok(block);
        }
    }

    let granularity = map::allocation_granularity();
    let start = target.align_down(granularity);
    let low = start.value().saturating_sub(NEAR_RANGE);
    let high = start.value().saturating_add(NEAR_RANGE);

    let backwards = (low..start.value()).rev().step_by(granularity);
    let forwards = (start.value() + granularity..high).step_by(granularity);
    for hint in backwards.chain(forwards) {
        let hint = Address::new(hint).align_down(granularity);
        if !hint.valid() {
            continue;
        }
        if let Ok(block) = allocate_at(hint, size) {
            if within_near_range(block, target) {
                return Ok(block);
            }
            let _ = os::deallocate(block, size);
        }
    }

    tracing::error!("no executable page within rel32 range of {target}");
    Err(io::Error::new(
        io::ErrorKind::OutOfMemory,
        "no executable page within rel32 range",
    ))
}

/// An owned read-write-execute block.
///
/// Allocates on construction, releases on drop. A failed allocation leaves
/// the block unusable with the failure available through [`error`].
///
/// [`error`]: ScopedMemoryBlock::error
#[derive(Debug)]
pub struct ScopedMemoryBlock {
    address: Address,
    size: usize,
    error: Option<io::Error>,
}

impl ScopedMemoryBlock {
    /// Allocates `size` bytes anywhere.
    pub fn new(size: usize) -> Self {
        match allocate(size) {
            Ok(address) => ScopedMemoryBlock {
                address,
                size,
                error: None,
            },
            Err(error) => ScopedMemoryBlock {
                address: Address::NULL,
                size,
                error: Some(error),
            },
        }
    }

    /// Allocates `size` bytes within ±2 GiB of `target`.
    pub fn near(target: Address, size: usize) -> Self {
        match allocate_near(target, size) {
            Ok(address) => ScopedMemoryBlock {
                address,
                size,
                error: None,
            },
            Err(error) => ScopedMemoryBlock {
                address: Address::NULL,
                size,
                error: Some(error),
            },
        }
    }

    /// Base address of the block, [`Address::NULL`] when unallocated.
    pub fn get(&self) -> Address {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn allocated(&self) -> bool {
        self.address.valid()
    }

    /// The allocation failure, if any.
    pub fn error(&self) -> Option<&io::Error> {
        self.error.as_ref()
    }

    /// Releases the block now instead of at drop.
    pub fn free(&mut self) -> io::Result<()> {
        if !self.address.valid() {
            return Ok(());
        }
        match deallocate(self.address, self.size) {
            Ok(()) => {
                self.address = Address::NULL;
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Gives up ownership without releasing, returning the base address.
    pub fn into_raw(mut self) -> Address {
        self.address.take()
        // drop runs but sees a null address
    }
}

impl Drop for ScopedMemoryBlock {
    fn drop(&mut self) {
        if self.address.valid() {
            if let Err(error) = deallocate(self.address, self.size) {
                tracing::error!("failed to release block at {}: {error}", self.address);
            }
        }
    }
}
