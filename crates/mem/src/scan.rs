//! Byte-pattern scanner
//!
//! Linear first-match search for masked byte patterns over a memory range
//! or a loaded module image.

use crate::address::Address;
use crate::module::Module;

/// Error type for pattern parsing.
#[derive(Debug, thiserror::Error)]
pub enum PatternError {
    #[error("invalid hex byte: {0}")]
    InvalidByte(String),

    #[error("empty pattern")]
    Empty,
}

/// A masked byte pattern.
///
/// Parsed from the usual signature notation: whitespace-separated hex
/// bytes with `?` or `??` wildcards, e.g. `"48 8B ?? 05"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    bytes: Vec<Option<u8>>,
}

impl Pattern {
    pub fn parse(pattern: &str) -> Result<Pattern, PatternError> {
        let mut bytes = Vec::new();
        for part in pattern.split_whitespace() {
            if part == "?" || part == "??" {
                bytes.push(None);
            } else {
                let byte = u8::from_str_radix(part, 16)
                    .map_err(|_| PatternError::InvalidByte(part.to_string()))?;
                bytes.push(Some(byte));
            }
        }
        if bytes.is_empty() {
            return Err(PatternError::Empty);
        }
        Ok(Pattern { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn matches(&self, window: &[u8]) -> bool {
        self.bytes
            .iter()
            .zip(window)
            .all(|(expected, &actual)| expected.map_or(true, |byte| byte == actual))
    }
}

impl std::str::FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pattern::parse(s)
    }
}

/// Scans `[base, base + size)` for the first occurrence of `pattern`.
///
/// # Safety
/// The whole range must be readable.
pub unsafe fn scan(base: Address, size: usize, pattern: &Pattern) -> Option<Address> {
    if !base.valid() || size < pattern.len() {
        return None;
    }
    let haystack = std::slice::from_raw_parts(base.as_ptr::<u8>(), size);
    haystack
        .windows(pattern.len())
        .position(|window| pattern.matches(window))
        .map(|offset| base + offset)
}

/// Scans a loaded module image for the first occurrence of `pattern`.
///
/// # Safety
/// The module must stay loaded for the duration of the scan.
pub unsafe fn scan_module(module: &Module, pattern: &Pattern) -> Option<Address> {
    scan(module.base(), module.size(), pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let pattern = Pattern::parse("48 8B ?? 05 ? C3").unwrap();
        assert_eq!(pattern.len(), 6);
        assert!(Pattern::parse("").is_err());
        assert!(Pattern::parse("XY").is_err());
    }

    #[test]
    fn test_scan_finds_first_match() {
        let haystack = [0x00u8, 0x48, 0x8b, 0x01, 0x05, 0x48, 0x8b, 0x02, 0x05];
        let pattern = Pattern::parse("48 8B ?? 05").unwrap();
        let base = Address::from_ptr(haystack.as_ptr());
        let hit = unsafe { scan(base, haystack.len(), &pattern) };
        assert_eq!(hit, Some(base + 1));
    }

    #[test]
    fn test_scan_miss() {
        let haystack = [0u8; 32];
        let pattern = Pattern::parse("DE AD BE EF").unwrap();
        let hit = unsafe { scan(Address::from_ptr(haystack.as_ptr()), haystack.len(), &pattern) };
        assert_eq!(hit, None);
    }

    #[test]
    fn test_scan_range_too_small() {
        let haystack = [0x48u8, 0x8b];
        let pattern = Pattern::parse("48 8B ?? 05").unwrap();
        let hit = unsafe { scan(Address::from_ptr(haystack.as_ptr()), haystack.len(), &pattern) };
        assert_eq!(hit, None);
    }
}
