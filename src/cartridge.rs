use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Signature written when the caller does not supply one.
pub const DEFAULT_SIGNATURE: &str = "STRATASYS";

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("Key fragment must be 16 hex digits, got {0:?}")]
    InvalidKeyFragment(String),
    #[error("Record JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ── KeyFragment ──────────────────────────────────────────────────────────────

/// Per-cartridge 8-byte secret.  Hex text at every boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct KeyFragment(pub [u8; 8]);

impl KeyFragment {
    pub fn as_bytes(&self) -> &[u8; 8] { &self.0 }
}

impl FromStr for KeyFragment {
    type Err = RecordError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 8];
        hex::decode_to_slice(s.trim(), &mut out)
            .map_err(|_| RecordError::InvalidKeyFragment(s.to_owned()))?;
        Ok(Self(out))
    }
}

impl fmt::Display for KeyFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for KeyFragment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for KeyFragment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── CartridgeRecord ──────────────────────────────────────────────────────────

/// Everything a cartridge chip stores, in caller-facing form.
///
/// Dates are naive UTC at second resolution.  `material_name` goes through
/// the [material catalog](crate::material) on its way to and from the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartridgeRecord {
    /// Integer counter, stored on the chip as an `f64`.
    pub serial_number:             f64,
    pub material_name:             String,
    pub manufacturing_lot:         String,
    pub manufacturing_date:        NaiveDateTime,
    pub last_use_date:             NaiveDateTime,
    /// Cubic inches.
    pub initial_material_quantity: f64,
    pub current_material_quantity: f64,
    pub key_fragment:              KeyFragment,
    pub version:                   u16,
    #[serde(default = "default_signature")]
    pub signature:                 String,
}

fn default_signature() -> String {
    DEFAULT_SIGNATURE.to_owned()
}

impl CartridgeRecord {
    pub fn to_json(&self) -> Result<String, RecordError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, RecordError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Mark the cartridge full again: current quantity back to the initial
    /// quantity, both dates set to `now`, and a fresh serial number.
    pub fn refill(&mut self, now: NaiveDateTime, serial_number: f64) {
        self.current_material_quantity = self.initial_material_quantity;
        self.manufacturing_date        = now;
        self.last_use_date             = now;
        self.serial_number             = serial_number;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample() -> CartridgeRecord {
        let date = NaiveDate::from_ymd_opt(2014, 1, 1).unwrap().and_hms_opt(13, 14, 15).unwrap();
        CartridgeRecord {
            serial_number:             413203.0,
            material_name:             "ABS_M30".into(),
            manufacturing_lot:         "1234".into(),
            manufacturing_date:        date,
            last_use_date:             date,
            initial_material_quantity: 56.3,
            current_material_quantity: 12.0,
            key_fragment:              "abcdef0123456789".parse().unwrap(),
            version:                   1,
            signature:                 DEFAULT_SIGNATURE.into(),
        }
    }

    #[test]
    fn json_uses_hex_key_fragment_and_iso_dates() {
        let json = sample().to_json().unwrap();
        assert!(json.contains("\"key_fragment\": \"abcdef0123456789\""));
        assert!(json.contains("\"manufacturing_date\": \"2014-01-01T13:14:15\""));
        assert_eq!(CartridgeRecord::from_json(&json).unwrap(), sample());
    }

    #[test]
    fn json_without_signature_gets_default() {
        let mut value: serde_json::Value = serde_json::from_str(&sample().to_json().unwrap()).unwrap();
        value.as_object_mut().unwrap().remove("signature");
        let record = CartridgeRecord::from_json(&value.to_string()).unwrap();
        assert_eq!(record.signature, DEFAULT_SIGNATURE);
    }

    #[test]
    fn bad_key_fragment_is_rejected() {
        assert!("abcd".parse::<KeyFragment>().is_err());
        assert!("zzcdef0123456789".parse::<KeyFragment>().is_err());
    }

    #[test]
    fn refill_restores_quantity() {
        let mut record = sample();
        let now = NaiveDate::from_ymd_opt(2020, 6, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        record.refill(now, 77.0);
        assert_eq!(record.current_material_quantity, record.initial_material_quantity);
        assert_eq!(record.manufacturing_date, now);
        assert_eq!(record.last_use_date, now);
        assert_eq!(record.serial_number, 77.0);
    }
}
