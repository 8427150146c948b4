//! Ethernet MAC addresses

use crate::error::Error;
use rand::Rng;
use std::fmt;
use std::str::FromStr;

/// A 48-bit Ethernet MAC address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Random locally administered unicast address
    pub fn random_local() -> Self {
        let mut octets = [0u8; 6];
        rand::rng().fill(&mut octets);
        // Clear multicast bit, set locally administered bit
        octets[0] = (octets[0] & 0xfe) | 0x02;
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// All-zero address, as reported by VFs that were never assigned one
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }

    pub fn is_locally_administered(&self) -> bool {
        self.0[0] & 0x02 != 0
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split([':', '-']).collect();
        if parts.len() != 6 {
            return Err(Error::InvalidMac(trimmed.to_string()));
        }

        let mut octets = [0u8; 6];
        for (octet, part) in octets.iter_mut().zip(&parts) {
            if part.len() != 2 {
                return Err(Error::InvalidMac(trimmed.to_string()));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| Error::InvalidMac(trimmed.to_string()))?;
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let mac: MacAddress = "02:AB:cd:00:11:ff".parse().unwrap();
        assert_eq!(mac.octets(), [0x02, 0xab, 0xcd, 0x00, 0x11, 0xff]);
        assert_eq!(mac.to_string(), "02:ab:cd:00:11:ff");
    }

    #[test]
    fn test_parse_dash_separated() {
        let mac: MacAddress = "02-00-00-00-00-01".parse().unwrap();
        assert_eq!(mac, MacAddress::new([2, 0, 0, 0, 0, 1]));
    }

    #[test]
    fn test_parse_invalid() {
        assert!("".parse::<MacAddress>().is_err());
        assert!("02:00:00:00:00".parse::<MacAddress>().is_err());
        assert!("02:00:00:00:00:zz".parse::<MacAddress>().is_err());
        assert!("002:00:00:00:00:01".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_random_local() {
        for _ in 0..32 {
            let mac = MacAddress::random_local();
            assert!(mac.is_locally_administered());
            assert!(!mac.is_multicast());
        }
    }

    #[test]
    fn test_is_zero() {
        assert!("00:00:00:00:00:00".parse::<MacAddress>().unwrap().is_zero());
        assert!(!MacAddress::random_local().is_zero());
    }
}
