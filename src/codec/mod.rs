//! Cartridge EEPROM codecs: one per on-chip format version.
//!
//! # Pipeline
//! ```text
//! encode: record → pack → derive key → encrypt → checksum → image
//! decode: image  → checksum → decrypt → checksum / self-check → unpack → record
//! ```
//! Every protected region is verified before any of its bytes are parsed,
//! and decoding stops at the first failing check.  A decode either returns a
//! complete record or an error, never both.
//!
//! # Endianness
//! All multi-byte fields are little-endian.  Dates are packed as
//! `u16 year-1900 | u8 month | u8 day | u8 hour | u8 minute | u16 second`.

pub mod v1;
pub mod v3;

use std::fmt;
use std::ops::Range;

use byteorder::{ByteOrder, LittleEndian};
use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cartridge::CartridgeRecord;
use crate::checksum::Checksum;
use crate::crypto::{BlockCipher, CryptoError};
use crate::machine::{DeviceUid, MachineError, MachineIdentity};
use crate::material::{self, MaterialError};

pub use v1::V1Codec;
pub use v3::V3Codec;

// ── FormatVersion ────────────────────────────────────────────────────────────

/// On-chip layout generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatVersion {
    /// Legacy 113-byte image.
    V1,
    /// Current 136-byte image.
    V3,
}

impl FormatVersion {
    pub fn image_size(self) -> usize {
        match self {
            FormatVersion::V1 => v1::IMAGE_SIZE,
            FormatVersion::V3 => v3::IMAGE_SIZE,
        }
    }

    /// Usable signature bytes in this layout.
    pub fn signature_width(self) -> usize {
        match self {
            FormatVersion::V1 => v1::SIGNATURE_WIDTH,
            FormatVersion::V3 => v3::SIGNATURE_WIDTH,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FormatVersion::V1 => "v1",
            FormatVersion::V3 => "v3",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "v1" | "1" => Some(FormatVersion::V1),
            "v3" | "3" => Some(FormatVersion::V3),
            _          => None,
        }
    }

    /// Format whose fixed image size is `len`, if any.
    pub fn from_image_len(len: usize) -> Option<Self> {
        match len {
            v1::IMAGE_SIZE => Some(FormatVersion::V1),
            v3::IMAGE_SIZE => Some(FormatVersion::V3),
            _              => None,
        }
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

// ── Error types ──────────────────────────────────────────────────────────────

/// Stored and recomputed values of a failed checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub stored:   u16,
    pub computed: u16,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stored {:#06x}, computed {:#06x}", self.stored, self.computed)
    }
}

/// One variant per protected region of the image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("Invalid key fragment checksum ({0})")]
    KeyFragment(Mismatch),
    #[error("Invalid ciphertext content checksum ({0})")]
    CiphertextContent(Mismatch),
    #[error("Invalid plaintext content checksum ({0})")]
    PlaintextContent(Mismatch),
    #[error("Invalid ciphertext current material quantity checksum ({0})")]
    CurrentQuantityCiphertext(Mismatch),
    #[error("Invalid plaintext current material quantity checksum ({0})")]
    CurrentQuantityPlaintext(Mismatch),
    #[error("Serial number self-check failed: decrypted {decrypted}, expected {expected}")]
    SerialNumberSelfCheck { decrypted: String, expected: String },
}

impl IntegrityError {
    /// Short region name, used as a structured log field.
    pub fn region(&self) -> &'static str {
        match self {
            IntegrityError::KeyFragment(_)               => "key_fragment",
            IntegrityError::CiphertextContent(_)         => "ciphertext_content",
            IntegrityError::PlaintextContent(_)          => "plaintext_content",
            IntegrityError::CurrentQuantityCiphertext(_) => "current_quantity_ciphertext",
            IntegrityError::CurrentQuantityPlaintext(_)  => "current_quantity_plaintext",
            IntegrityError::SerialNumberSelfCheck { .. } => "serial_number_self_check",
        }
    }
}

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Field `{field}` is {actual} bytes, slot holds at most {max}")]
    FieldTooLong { field: &'static str, max: usize, actual: usize },
    #[error("Field `{field}` cannot be encoded: {reason}")]
    FieldOutOfRange { field: &'static str, reason: String },
    #[error("Integrity check failed: {0}")]
    Integrity(#[from] IntegrityError),
    #[error("Configuration error: {0}")]
    Material(#[from] MaterialError),
    #[error("Configuration error: {0}")]
    Machine(#[from] MachineError),
    #[error("Image is {actual} bytes, {format} images are {expected}")]
    ImageSize { format: FormatVersion, expected: usize, actual: usize },
    #[error("Field `{field}` is malformed: {reason}")]
    MalformedField { field: &'static str, reason: String },
    #[error("Cipher error: {0}")]
    Crypto(#[from] CryptoError),
}

impl CodecError {
    pub fn integrity(&self) -> Option<&IntegrityError> {
        match self {
            CodecError::Integrity(e) => Some(e),
            _                        => None,
        }
    }
}

// ── Codec trait ──────────────────────────────────────────────────────────────

/// A cartridge image layout.  Implementations are stateless between calls.
pub trait Codec {
    fn format(&self) -> FormatVersion;

    /// Lay the record out in plaintext, with its plaintext checksums.
    fn pack(&self, record: &CartridgeRecord) -> Result<Vec<u8>, CodecError>;

    /// Parse a plaintext image after re-checking its plaintext checksums.
    fn unpack(&self, packed: &[u8]) -> Result<CartridgeRecord, CodecError>;

    fn encrypt(
        &self,
        machine: &MachineIdentity,
        uid:     &DeviceUid,
        packed:  &[u8],
    ) -> Result<Vec<u8>, CodecError>;

    /// Verify and decrypt every protected region, in order, failing fast.
    fn decrypt(
        &self,
        machine: &MachineIdentity,
        uid:     &DeviceUid,
        image:   &[u8],
    ) -> Result<Vec<u8>, CodecError>;

    fn encode(
        &self,
        machine: &MachineIdentity,
        uid:     &DeviceUid,
        record:  &CartridgeRecord,
    ) -> Result<Vec<u8>, CodecError> {
        let packed = self.pack(record)?;
        self.encrypt(machine, uid, &packed)
    }

    fn decode(
        &self,
        machine: &MachineIdentity,
        uid:     &DeviceUid,
        image:   &[u8],
    ) -> Result<CartridgeRecord, CodecError> {
        let packed = self.decrypt(machine, uid, image)?;
        self.unpack(&packed)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

pub fn get_codec<'a>(
    format:   FormatVersion,
    cipher:   &'a dyn BlockCipher,
    checksum: &'a dyn Checksum,
) -> Box<dyn Codec + 'a> {
    match format {
        FormatVersion::V1 => Box::new(V1Codec::new(cipher, checksum)),
        FormatVersion::V3 => Box::new(V3Codec::new(cipher, checksum)),
    }
}

// ── Shared field helpers ─────────────────────────────────────────────────────

pub(crate) fn check_size(format: FormatVersion, data: &[u8]) -> Result<(), CodecError> {
    let expected = format.image_size();
    if data.len() != expected {
        return Err(CodecError::ImageSize { format, expected, actual: data.len() });
    }
    Ok(())
}

/// Compare a recomputed checksum with the stored one; `region` builds the
/// error on mismatch.
pub(crate) fn verify(
    region:   fn(Mismatch) -> IntegrityError,
    stored:   u16,
    computed: u16,
) -> Result<(), CodecError> {
    let err = region(Mismatch { stored, computed });
    if stored == computed {
        debug!(region = err.region(), "checksum verified");
        return Ok(());
    }
    warn!(region = err.region(), stored, computed, "integrity check failed");
    Err(err.into())
}

pub(crate) fn read_block(data: &[u8], span: Range<usize>) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&data[span]);
    out
}

pub(crate) fn xor_block(block: &mut [u8; 8], mask: &[u8; 8]) {
    block.iter_mut().zip(mask).for_each(|(b, m)| *b ^= m);
}

pub(crate) fn get_u16(data: &[u8], offset: usize) -> u16 {
    LittleEndian::read_u16(&data[offset..offset + 2])
}

pub(crate) fn put_u16(data: &mut [u8], offset: usize, value: u16) {
    LittleEndian::write_u16(&mut data[offset..offset + 2], value);
}

pub(crate) fn get_f64(data: &[u8], offset: usize) -> f64 {
    LittleEndian::read_f64(&data[offset..offset + 8])
}

pub(crate) fn put_f64(data: &mut [u8], offset: usize, value: f64) {
    LittleEndian::write_f64(&mut data[offset..offset + 8], value);
}

pub(crate) fn put_material(data: &mut [u8], offset: usize, name: &str) -> Result<(), CodecError> {
    let id = material::id_for(name)?;
    put_f64(data, offset, f64::from(id));
    Ok(())
}

/// Material ids are stored as doubles; anything that is not an integer in
/// the one-byte id space resolves to the unknown sentinel.
pub(crate) fn get_material(data: &[u8], offset: usize) -> String {
    let raw = get_f64(data, offset);
    if raw.fract() == 0.0 && (0.0..=255.0).contains(&raw) {
        material::name_for(raw as u8).to_owned()
    } else {
        material::UNKNOWN.to_owned()
    }
}

/// Write `value` NUL-padded into a fixed `width` slot.
pub(crate) fn put_str(
    data:   &mut [u8],
    offset: usize,
    width:  usize,
    field:  &'static str,
    value:  &str,
) -> Result<(), CodecError> {
    if !value.is_ascii() {
        return Err(CodecError::FieldOutOfRange { field, reason: "must be ASCII".into() });
    }
    // A NUL would end the field early on decode.
    if value.contains('\0') {
        return Err(CodecError::FieldOutOfRange { field, reason: "contains NUL".into() });
    }
    let bytes = value.as_bytes();
    if bytes.len() > width {
        return Err(CodecError::FieldTooLong { field, max: width, actual: bytes.len() });
    }
    let slot = &mut data[offset..offset + width];
    slot.fill(0);
    slot[..bytes.len()].copy_from_slice(bytes);
    Ok(())
}

/// Read a fixed-width slot up to its first NUL.
pub(crate) fn get_str(
    data:   &[u8],
    offset: usize,
    width:  usize,
    field:  &'static str,
) -> Result<String, CodecError> {
    let slot = &data[offset..offset + width];
    let end = slot.iter().position(|&b| b == 0).unwrap_or(width);
    String::from_utf8(slot[..end].to_vec())
        .map_err(|e| CodecError::MalformedField { field, reason: e.to_string() })
}

pub(crate) fn put_date(
    data:   &mut [u8],
    offset: usize,
    field:  &'static str,
    value:  &NaiveDateTime,
) -> Result<(), CodecError> {
    let year = u16::try_from(value.year() - 1900).map_err(|_| CodecError::FieldOutOfRange {
        field,
        reason: format!("year {} outside 1900..=65435", value.year()),
    })?;
    let slot = &mut data[offset..offset + 8];
    LittleEndian::write_u16(&mut slot[0..2], year);
    slot[2] = value.month() as u8;
    slot[3] = value.day() as u8;
    slot[4] = value.hour() as u8;
    slot[5] = value.minute() as u8;
    LittleEndian::write_u16(&mut slot[6..8], value.second() as u16);
    Ok(())
}

pub(crate) fn get_date(
    data:   &[u8],
    offset: usize,
    field:  &'static str,
) -> Result<NaiveDateTime, CodecError> {
    let slot = &data[offset..offset + 8];
    let year   = i32::from(LittleEndian::read_u16(&slot[0..2])) + 1900;
    let second = u32::from(LittleEndian::read_u16(&slot[6..8]));
    NaiveDate::from_ymd_opt(year, u32::from(slot[2]), u32::from(slot[3]))
        .and_then(|d| d.and_hms_opt(u32::from(slot[4]), u32::from(slot[5]), second))
        .ok_or_else(|| CodecError::MalformedField {
            field,
            reason: format!("not a calendar date: {}", hex::encode(slot)),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_layout_uses_1900_offset() {
        let dt = NaiveDate::from_ymd_opt(2001, 1, 1).unwrap().and_hms_opt(1, 1, 1).unwrap();
        let mut buf = [0u8; 8];
        put_date(&mut buf, 0, "date", &dt).unwrap();
        assert_eq!(hex::encode(buf), "6500010101010100");
        assert_eq!(get_date(&buf, 0, "date").unwrap(), dt);
    }

    #[test]
    fn date_before_1900_is_rejected() {
        let dt = NaiveDate::from_ymd_opt(1899, 12, 31).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(
            put_date(&mut buf, 0, "date", &dt),
            Err(CodecError::FieldOutOfRange { field: "date", .. })
        ));
    }

    #[test]
    fn impossible_date_is_malformed() {
        let buf = [0x65, 0x00, 13, 1, 0, 0, 0, 0];
        assert!(matches!(get_date(&buf, 0, "date"), Err(CodecError::MalformedField { .. })));
    }

    #[test]
    fn string_slot_is_padded_and_trimmed() {
        let mut buf = [0xffu8; 20];
        put_str(&mut buf, 0, 20, "lot", "5678").unwrap();
        assert_eq!(&buf[..5], b"5678\0");
        assert!(buf[4..].iter().all(|&b| b == 0));
        assert_eq!(get_str(&buf, 0, 20, "lot").unwrap(), "5678");
    }

    #[test]
    fn string_slot_rejects_overflow() {
        let mut buf = [0u8; 9];
        assert!(matches!(
            put_str(&mut buf, 0, 9, "signature", "TOO LONG SIG"),
            Err(CodecError::FieldTooLong { field: "signature", max: 9, actual: 12 })
        ));
    }

    #[test]
    fn string_slot_rejects_embedded_nul() {
        let mut buf = [0u8; 20];
        assert!(matches!(
            put_str(&mut buf, 0, 20, "manufacturing_lot", "ab\0cd"),
            Err(CodecError::FieldOutOfRange { field: "manufacturing_lot", .. })
        ));
    }

    #[test]
    fn full_width_string_has_no_terminator() {
        let mut buf = [0u8; 9];
        put_str(&mut buf, 0, 9, "signature", "STRATASYS").unwrap();
        assert_eq!(get_str(&buf, 0, 9, "signature").unwrap(), "STRATASYS");
    }

    #[test]
    fn material_outside_id_space_is_unknown() {
        let mut buf = [0u8; 8];
        put_f64(&mut buf, 0, 1.5);
        assert_eq!(get_material(&buf, 0), material::UNKNOWN);
        put_f64(&mut buf, 0, 300.0);
        assert_eq!(get_material(&buf, 0), material::UNKNOWN);
        put_material(&mut buf, 0, "ABS_RED").unwrap();
        assert_eq!(get_material(&buf, 0), "ABS_RED");
    }

    #[test]
    fn format_detection_by_length() {
        assert_eq!(FormatVersion::from_image_len(113), Some(FormatVersion::V1));
        assert_eq!(FormatVersion::from_image_len(136), Some(FormatVersion::V3));
        assert_eq!(FormatVersion::from_image_len(128), None);
        assert_eq!(FormatVersion::from_name("V3"), Some(FormatVersion::V3));
    }
}
