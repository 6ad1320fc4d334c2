//! Object dictionary addressing.

use std::fmt;

/// Address of an object dictionary entry, made of a 16-bit index and an 8-bit subindex.
///
/// ```rust
/// let nanoj_input = od_sampler::OdIndex::new(0x2400, 0x01);
/// assert_eq!(nanoj_input.to_string(), "0x2400:01");
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OdIndex {
    /// The 16-bit index
    pub index: u16,
    /// The 8-bit subindex
    pub subindex: u8,
}

impl OdIndex {
    /// Creates a new [`OdIndex`].
    pub const fn new(index: u16, subindex: u8) -> Self {
        Self { index, subindex }
    }
}

impl fmt::Display for OdIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}:{:02X}", self.index, self.subindex)
    }
}

impl From<(u16, u8)> for OdIndex {
    fn from((index, subindex): (u16, u8)) -> Self {
        OdIndex::new(index, subindex)
    }
}
