//! Grouped byte patches
//!
//! A [`Patch`] is an ordered group of in-place byte overwrites that can be
//! applied and reverted as one unit. Each entry restores either the bytes
//! snapshotted at apply time or an explicitly configured original image.

use crate::address::Address;
use crate::error::MemoryError;
use crate::ops;

#[derive(Debug)]
struct PatchEntry {
    address: Address,
    replacement: Vec<u8>,
    /// Bytes written back on restore. Snapshotted at apply time when not
    /// configured up front.
    original: Option<Vec<u8>>,
}

/// An ordered group of byte overwrites with saved originals.
#[derive(Debug, Default)]
pub struct Patch {
    entries: Vec<PatchEntry>,
    applied: bool,
}

impl Patch {
    pub fn new() -> Patch {
        Patch::default()
    }

    /// Adds an overwrite whose restore image is snapshotted when the patch
    /// is applied.
    pub fn push(&mut self, address: Address, replacement: impl Into<Vec<u8>>) -> &mut Self {
        self.entries.push(PatchEntry {
            address,
            replacement: replacement.into(),
            original: None,
        });
        self
    }

    /// Adds an overwrite with an explicitly configured restore image.
    pub fn push_with_original(
        &mut self,
        address: Address,
        replacement: impl Into<Vec<u8>>,
        original: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.entries.push(PatchEntry {
            address,
            replacement: replacement.into(),
            original: Some(original.into()),
        });
        self
    }

    pub fn applied(&self) -> bool {
        self.applied
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes every replacement in order. Entries without a configured
    /// original snapshot the live bytes first. A failure rolls back the
    /// entries already written.
    ///
    /// # Safety
    /// Every entry must point at memory this process may rewrite.
    pub unsafe fn apply(&mut self) -> Result<(), MemoryError> {
        if self.applied {
            return Ok(());
        }
        for index in 0..self.entries.len() {
            if let Err(error) = self.apply_entry(index) {
                tracing::error!(
                    "patch entry {index} at {} failed: {error}",
                    self.entries[index].address
                );
                self.rollback(index);
                return Err(error);
            }
        }
        self.applied = true;
        Ok(())
    }

    unsafe fn apply_entry(&mut self, index: usize) -> Result<(), MemoryError> {
        let entry = &mut self.entries[index];
        if entry.original.is_none() {
            let mut snapshot = vec![0u8; entry.replacement.len()];
            ops::copy(
                Address::from_mut_ptr(snapshot.as_mut_ptr()),
                entry.address,
                snapshot.len(),
            )?;
            entry.original = Some(snapshot);
        }
        ops::copy(
            entry.address,
            Address::from_ptr(entry.replacement.as_ptr()),
            entry.replacement.len(),
        )
    }

    unsafe fn rollback(&mut self, upto: usize) {
        for entry in self.entries[..upto].iter().rev() {
            if let Some(original) = &entry.original {
                let _ = ops::copy(
                    entry.address,
                    Address::from_ptr(original.as_ptr()),
                    original.len(),
                );
            }
        }
    }

    /// Writes every original back, in reverse order.
    ///
    /// # Safety
    /// See [`Patch::apply`].
    pub unsafe fn restore(&mut self) -> Result<(), MemoryError> {
        if !self.applied {
            return Ok(());
        }
        for entry in self.entries.iter().rev() {
            let original = entry.original.as_ref().ok_or(MemoryError::InvalidSource)?;
            ops::copy(
                entry.address,
                Address::from_ptr(original.as_ptr()),
                original.len(),
            )?;
        }
        self.applied = false;
        Ok(())
    }
}

impl Drop for Patch {
    fn drop(&mut self) {
        if self.applied {
            if let Err(error) = unsafe { self.restore() } {
                tracing::error!("failed to restore patch on drop: {error}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_and_restore() {
        let mut value = 2u32;
        let addr = Address::from_mut_ptr(&mut value);

        let mut patch = Patch::new();
        patch.push(addr, 4u32.to_le_bytes());
        unsafe {
            patch.apply().unwrap();
            assert_eq!(ops::read::<u32>(addr).unwrap(), 4);
            patch.restore().unwrap();
            assert_eq!(ops::read::<u32>(addr).unwrap(), 2);
        }
    }

    #[test]
    fn test_scoped_patch_with_configured_original() {
        let mut value = 2u32;
        let addr = Address::from_mut_ptr(&mut value);
        {
            let mut patch = Patch::new();
            patch.push_with_original(addr, 4u32.to_le_bytes(), 1u32.to_le_bytes());
            unsafe {
                patch.apply().unwrap();
                assert_eq!(ops::read::<u32>(addr).unwrap(), 4);
            }
            // dropping the patch restores the configured original
        }
        assert_eq!(value, 1);
    }

    #[test]
    fn test_group_applies_in_order() {
        let mut buffer = [0u8; 8];
        let base = Address::from_mut_ptr(buffer.as_mut_ptr());

        let mut patch = Patch::new();
        patch.push(base, [0xaa, 0xbb]).push(base + 4, [0xcc]);
        unsafe {
            patch.apply().unwrap();
        }
        assert_eq!(buffer[0], 0xaa);
        assert_eq!(buffer[1], 0xbb);
        assert_eq!(buffer[4], 0xcc);
        unsafe {
            patch.restore().unwrap();
        }
        assert_eq!(buffer, [0u8; 8]);
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut value = 7u8;
        let addr = Address::from_mut_ptr(&mut value);
        let mut patch = Patch::new();
        patch.push(addr, [9u8]);
        unsafe {
            patch.apply().unwrap();
            patch.apply().unwrap();
            assert_eq!(ops::read::<u8>(addr).unwrap(), 9);
        }
    }
}
