//! Printer-model identities and chip UIDs.
//!
//! Every printer of a model shares one 8-byte secret (the machine identity);
//! every cartridge chip carries its own read-only 8-byte UID.  Both are mixed
//! into the derived key, so an image only decodes on the model and chip it
//! was written for.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MachineError {
    #[error("Unknown machine type: {0}")]
    UnknownType(String),
    #[error("No known machine type for identity {0}")]
    UnknownIdentity(String),
    #[error("Expected 16 hex digits, got {0:?}")]
    InvalidHex(String),
}

fn parse_hex8(s: &str) -> Result<[u8; 8], MachineError> {
    let mut out = [0u8; 8];
    hex::decode_to_slice(s.trim(), &mut out).map_err(|_| MachineError::InvalidHex(s.to_owned()))?;
    Ok(out)
}

// ── MachineIdentity ──────────────────────────────────────────────────────────

/// 8-byte secret shared by all printers of one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MachineIdentity(pub [u8; 8]);

impl MachineIdentity {
    pub fn as_bytes(&self) -> &[u8; 8] { &self.0 }
}

impl FromStr for MachineIdentity {
    type Err = MachineError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { parse_hex8(s).map(Self) }
}

impl fmt::Display for MachineIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}

// ── DeviceUid ────────────────────────────────────────────────────────────────

/// Unique id burnt into the cartridge chip (family code first, CRC last).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceUid(pub [u8; 8]);

impl DeviceUid {
    pub fn as_bytes(&self) -> &[u8; 8] { &self.0 }
}

impl FromStr for DeviceUid {
    type Err = MachineError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { parse_hex8(s).map(Self) }
}

impl fmt::Display for DeviceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// ── MachineType ──────────────────────────────────────────────────────────────

/// Printer models with a known identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineType {
    Fox,
    Fox2,
    Ktype,
    Prodigy,
    Quantum,
    Uprint,
    UprintSe,
}

impl MachineType {
    pub const ALL: [MachineType; 7] = [
        MachineType::Fox,
        MachineType::Fox2,
        MachineType::Ktype,
        MachineType::Prodigy,
        MachineType::Quantum,
        MachineType::Uprint,
        MachineType::UprintSe,
    ];

    pub fn identity(self) -> MachineIdentity {
        MachineIdentity(match self {
            MachineType::Fox      => [0x2c, 0x30, 0x47, 0x8b, 0xb7, 0xde, 0x81, 0xe8],
            MachineType::Fox2     => [0x2c, 0x30, 0x47, 0x9b, 0xb7, 0xde, 0x81, 0xe8],
            MachineType::Ktype    => [0x6b, 0x2a, 0x26, 0x8b, 0x5e, 0xd3, 0x37, 0x4a],
            MachineType::Prodigy  => [0x53, 0x94, 0xd7, 0x65, 0x7c, 0xed, 0x64, 0x1d],
            MachineType::Quantum  => [0x76, 0xc4, 0x54, 0xd5, 0x32, 0xe6, 0x10, 0xf7],
            MachineType::Uprint   => [0xf3, 0xa9, 0x1d, 0xbe, 0x6b, 0x0b, 0x22, 0x55],
            MachineType::UprintSe => [0x09, 0xfb, 0xd4, 0xb6, 0x1f, 0xc0, 0xb3, 0x27],
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            MachineType::Fox      => "fox",
            MachineType::Fox2     => "fox2",
            MachineType::Ktype    => "ktype",
            MachineType::Prodigy  => "prodigy",
            MachineType::Quantum  => "quantum",
            MachineType::Uprint   => "uprint",
            MachineType::UprintSe => "uprintse",
        }
    }

    pub fn from_name(s: &str) -> Result<Self, MachineError> {
        let lower = s.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| m.name() == lower)
            .ok_or_else(|| MachineError::UnknownType(s.to_owned()))
    }

    pub fn from_identity(identity: &MachineIdentity) -> Result<Self, MachineError> {
        Self::ALL
            .into_iter()
            .find(|m| m.identity() == *identity)
            .ok_or_else(|| MachineError::UnknownIdentity(identity.to_string()))
    }
}

impl FromStr for MachineType {
    type Err = MachineError;
    fn from_str(s: &str) -> Result<Self, Self::Err> { Self::from_name(s) }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_lookup_both_ways() {
        for m in MachineType::ALL {
            assert_eq!(MachineType::from_identity(&m.identity()), Ok(m));
            assert_eq!(MachineType::from_name(m.name()), Ok(m));
        }
    }

    #[test]
    fn identity_hex_matches_table() {
        assert_eq!(MachineType::Fox.identity().to_string(), "2C30478BB7DE81E8");
        assert_eq!("2c30478bb7de81e8".parse::<MachineIdentity>(), Ok(MachineType::Fox.identity()));
    }

    #[test]
    fn unknown_machine_is_rejected() {
        assert_eq!(
            MachineType::from_name("replicator"),
            Err(MachineError::UnknownType("replicator".into()))
        );
        assert!(MachineType::from_identity(&MachineIdentity([0; 8])).is_err());
    }

    #[test]
    fn uid_parse_rejects_bad_length() {
        assert!("11010a01ba325d".parse::<DeviceUid>().is_err());
        assert_eq!(
            "11010a01ba325d23".parse::<DeviceUid>().unwrap().to_string(),
            "11010a01ba325d23"
        );
    }
}
