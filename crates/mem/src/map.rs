//! Memory-map queries
//!
//! Page-state predicates and the free-page search used to place executable
//! blocks within `rel32` range of a target on 64-bit hosts.

use crate::address::Address;

#[cfg(windows)]
mod os {
    use super::Address;
    use windows::Win32::System::Memory::{
        VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_FREE, MEM_RESERVE,
    };
    use windows::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    fn query(address: Address) -> Option<MEMORY_BASIC_INFORMATION> {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        let written = unsafe {
            VirtualQuery(
                Some(address.as_ptr()),
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        (written != 0).then_some(info)
    }

    pub fn is_page_free(address: Address) -> bool {
        query(address).is_some_and(|info| info.State == MEM_FREE)
    }

    pub fn is_page_occupied(address: Address) -> bool {
        query(address).is_some_and(|info| info.State == MEM_COMMIT)
    }

    pub fn is_page_reserved(address: Address) -> bool {
        query(address).is_some_and(|info| info.State == MEM_RESERVE)
    }

    pub fn allocation_granularity() -> usize {
        let mut info = SYSTEM_INFO::default();
        unsafe { GetSystemInfo(&mut info) };
        info.dwAllocationGranularity as usize
    }
}

#[cfg(unix)]
mod os {
    use super::Address;
    use mmap_rs::{MemoryAreas, MmapOptions};

    pub fn is_page_free(address: Address) -> bool {
        matches!(MemoryAreas::query(address.value()), Ok(None))
    }

    pub fn is_page_occupied(address: Address) -> bool {
        matches!(MemoryAreas::query(address.value()), Ok(Some(_)))
    }

    pub fn is_page_reserved(_address: Address) -> bool {
        // reserve-without-commit is a Windows notion
        false
    }

    pub fn allocation_granularity() -> usize {
        MmapOptions::allocation_granularity()
    }
}

/// Whether the page containing `address` is unmapped.
pub fn is_page_free(address: Address) -> bool {
    address.valid() && os::is_page_free(address)
}

/// Whether the page containing `address` is committed.
pub fn is_page_occupied(address: Address) -> bool {
    address.valid() && os::is_page_occupied(address)
}

/// Whether the page containing `address` is reserved but not committed.
pub fn is_page_reserved(address: Address) -> bool {
    address.valid() && os::is_page_reserved(address)
}

/// The OS allocation granularity (the alignment new mappings snap to).
pub fn allocation_granularity() -> usize {
    os::allocation_granularity()
}

/// Finds a free page within `range` bytes of `hint`.
///
/// Searches backwards from `hint` first, then forwards, stepping by the
/// allocation granularity. Backwards is preferred because executable blocks
/// placed below the target stay reachable by a signed 32-bit displacement.
/// Returns [`Address::NULL`] when no free page exists in the window.
pub fn find_free_page(hint: Address, range: usize) -> Address {
    if !hint.valid() {
        return Address::NULL;
    }
    let granularity = allocation_granularity();
    let start = hint.align_down(granularity);
    let low = start.value().saturating_sub(range);
    let high = start.value().saturating_add(range);

    let mut candidate = start.value();
    while candidate > low {
        candidate = candidate.saturating_sub(granularity);
        if candidate == 0 {
            break;
        }
        if is_page_free(Address::new(candidate)) {
            return Address::new(candidate);
        }
    }

    let mut candidate = start.value();
    while candidate < high {
        candidate += granularity;
        if is_page_free(Address::new(candidate)) {
            return Address::new(candidate);
        }
    }

    Address::NULL
}
