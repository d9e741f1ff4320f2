//! Optional-feature advertisement.
//!
//! The flag set is published as the data of `/keeper/api_feature_flags`: a
//! byte vector with one bit per flag, so older readers simply see unknown
//! bits as zero.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FeatureFlag {
    FilteredList = 0,
    MultiRead = 1,
    CheckNotExists = 2,
}

const ALL_FLAGS: [FeatureFlag; 3] = [
    FeatureFlag::FilteredList,
    FeatureFlag::MultiRead,
    FeatureFlag::CheckNotExists,
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureFlags {
    bits: Vec<u8>,
}

impl Default for FeatureFlags {
    /// `FILTERED_LIST` and `MULTI_READ` are on by default;
    /// `CHECK_NOT_EXISTS` stays opt-in.
    fn default() -> Self {
        let mut flags = Self { bits: Vec::new() };
        flags.enable(FeatureFlag::FilteredList);
        flags.enable(FeatureFlag::MultiRead);
        flags
    }
}

impl FeatureFlags {
    pub fn empty() -> Self {
        Self { bits: Vec::new() }
    }

    pub fn enable(&mut self, flag: FeatureFlag) {
        let (byte, bit) = Self::position(flag);
        if self.bits.len() <= byte {
            self.bits.resize(byte + 1, 0);
        }
        self.bits[byte] |= 1 << bit;
    }

    pub fn disable(&mut self, flag: FeatureFlag) {
        let (byte, bit) = Self::position(flag);
        if let Some(b) = self.bits.get_mut(byte) {
            *b &= !(1 << bit);
        }
    }

    pub fn is_enabled(&self, flag: FeatureFlag) -> bool {
        let (byte, bit) = Self::position(flag);
        self.bits
            .get(byte)
            .is_some_and(|b| b & (1 << bit) != 0)
    }

    pub fn enabled_flags(&self) -> Vec<FeatureFlag> {
        ALL_FLAGS
            .into_iter()
            .filter(|flag| self.is_enabled(*flag))
            .collect()
    }

    /// The published node data.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.clone()
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            bits: bytes.to_vec(),
        }
    }

    fn position(flag: FeatureFlag) -> (usize, u8) {
        let index = flag as usize;
        (index / 8, (index % 8) as u8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let flags = FeatureFlags::default();
        assert!(flags.is_enabled(FeatureFlag::FilteredList));
        assert!(flags.is_enabled(FeatureFlag::MultiRead));
        assert!(!flags.is_enabled(FeatureFlag::CheckNotExists));
    }

    #[test]
    fn byte_roundtrip() {
        let mut flags = FeatureFlags::empty();
        flags.enable(FeatureFlag::CheckNotExists);
        flags.enable(FeatureFlag::FilteredList);
        let restored = FeatureFlags::from_bytes(&flags.to_bytes());
        assert_eq!(restored, flags);
        assert_eq!(
            restored.enabled_flags(),
            vec![FeatureFlag::FilteredList, FeatureFlag::CheckNotExists]
        );
    }

    #[test]
    fn disable_clears_bit() {
        let mut flags = FeatureFlags::default();
        flags.disable(FeatureFlag::MultiRead);
        assert!(!flags.is_enabled(FeatureFlag::MultiRead));
        assert!(flags.is_enabled(FeatureFlag::FilteredList));
    }
}
