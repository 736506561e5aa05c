use serde::{Deserialize, Serialize};

/// Frame checksum algorithm in force for one link instance.
///
/// The primary bus uses an 8-bit additive sum with end-around carry; the
/// SPI-attached variant uses a plain XOR. A link never mixes the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumPolicy {
    #[default]
    Additive,
    Xor,
}

impl ChecksumPolicy {
    pub fn checksum(&self, bytes: &[u8]) -> u8 {
        match self {
            ChecksumPolicy::Additive => additive_checksum(bytes),
            ChecksumPolicy::Xor => xor_checksum(bytes),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChecksumPolicy::Additive => "additive",
            ChecksumPolicy::Xor => "xor",
        }
    }
}

/// 8-bit sum where every carry out of bit 7 is folded back into bit 0.
pub fn additive_checksum(bytes: &[u8]) -> u8 {
    let mut sum: u32 = 0;

    for &b in bytes {
        let wide = sum + u32::from(b);
        sum = (wide >> 8) + (wide & 0xFF);
    }

    sum as u8
}

pub fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_additive_carry_wraps_into_low_bit() {
        // 0xFF + 0x01 = 0x100 -> 0x00 + carry 1
        assert_eq!(additive_checksum(&[0xFF, 0x01]), 0x01);
        assert_eq!(additive_checksum(&[0xFF, 0xFF]), 0xFF);
        assert_eq!(additive_checksum(&[0x80, 0x80, 0x01]), 0x02);
    }

    #[test]
    fn test_additive_empty_and_zero() {
        assert_eq!(additive_checksum(&[]), 0);
        assert_eq!(additive_checksum(&[0, 0, 0, 0]), 0);
    }

    #[test]
    fn test_policy_dispatch() {
        let bytes = [0x31, 0x52, 0x01, 0x00];
        assert_eq!(ChecksumPolicy::Additive.checksum(&bytes), 0x84);
        assert_eq!(ChecksumPolicy::Xor.checksum(&bytes), 0x31 ^ 0x52 ^ 0x01);
    }
}
