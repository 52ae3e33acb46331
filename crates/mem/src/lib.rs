//! detourkit memory toolkit
//!
//! The low-level half of detourkit: everything the hook engine builds on,
//! usable on its own for plain memory manipulation.
//!
//! - [`address`] - the process address value
//! - [`protect`] - page protection kinds and the scoped guard
//! - [`map`] - page-state queries and free-page search
//! - [`alloc`] - read-write-execute allocation
//! - [`ops`] - typed reads, writes, copies, fills, compares
//! - [`scan`] - masked byte-pattern scanning
//! - [`module`] - loaded-module lookup
//! - [`patch`] - grouped byte patches with saved originals

pub mod address;
pub mod alloc;
pub mod error;
pub mod map;
pub mod module;
pub mod ops;
pub mod patch;
pub mod protect;
pub mod scan;

// Re-export commonly used items
pub use address::Address;
pub use alloc::{allocate, allocate_at, allocate_near, deallocate, ScopedMemoryBlock};
pub use error::MemoryError;
pub use map::{
    allocation_granularity, find_free_page, is_page_free, is_page_occupied, is_page_reserved,
};
pub use module::Module;
pub use ops::{compare, copy, fill, flush_instruction_cache, read, write};
pub use patch::Patch;
pub use protect::{
    get_protect, is_executable, is_readable, is_writeable, set_protect, Protection, ScopedProtect,
};
pub use scan::{scan, scan_module, Pattern, PatternError};
