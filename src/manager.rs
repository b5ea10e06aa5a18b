//! High-level entry point: one object that encodes and decodes images for
//! any supported format.
//!
//! ```rust
//! use stratacart::manager::Manager;
//! use stratacart::machine::MachineType;
//!
//! let manager = Manager::default();
//! let machine = MachineType::Fox.identity();
//! let uid     = "11010a01ba325d23".parse()?;
//! # let record = stratacart::cartridge::CartridgeRecord::from_json(r#"{
//! #   "serial_number": 1.0, "material_name": "ABS", "manufacturing_lot": "1",
//! #   "manufacturing_date": "2020-01-01T00:00:00", "last_use_date": "2020-01-01T00:00:00",
//! #   "initial_material_quantity": 10.0, "current_material_quantity": 10.0,
//! #   "key_fragment": "0011223344556677", "version": 1 }"#)?;
//! let image   = manager.encode(&machine, &uid, &record)?;
//! assert_eq!(manager.decode(&machine, &uid, &image)?, record);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use tracing::debug;

use crate::cartridge::CartridgeRecord;
use crate::checksum::{Checksum, Crc16};
use crate::codec::{get_codec, CodecError, FormatVersion};
use crate::crypto::{BlockCipher, DesX};
use crate::machine::{DeviceUid, MachineIdentity};

// ── ManagerOptions ───────────────────────────────────────────────────────────

/// Configuration for [`Manager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerOptions {
    /// Format used for every encode, and for decodes that cannot be detected.
    pub format:        FormatVersion,
    /// Pick the decode format from the image length.
    pub detect_format: bool,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self { format: FormatVersion::V3, detect_format: true }
    }
}

// ── Manager ──────────────────────────────────────────────────────────────────

pub struct Manager {
    cipher:   Box<dyn BlockCipher>,
    checksum: Box<dyn Checksum>,
    options:  ManagerOptions,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new(Box::new(DesX), Box::new(Crc16))
    }
}

impl Manager {
    pub fn new(cipher: Box<dyn BlockCipher>, checksum: Box<dyn Checksum>) -> Self {
        Self::with_options(cipher, checksum, ManagerOptions::default())
    }

    pub fn with_options(
        cipher:   Box<dyn BlockCipher>,
        checksum: Box<dyn Checksum>,
        options:  ManagerOptions,
    ) -> Self {
        Self { cipher, checksum, options }
    }

    pub fn options(&self) -> &ManagerOptions { &self.options }

    pub fn encode(
        &self,
        machine: &MachineIdentity,
        uid:     &DeviceUid,
        record:  &CartridgeRecord,
    ) -> Result<Vec<u8>, CodecError> {
        let format = self.options.format;
        debug!(%format, serial_number = record.serial_number, "encoding cartridge");
        get_codec(format, self.cipher.as_ref(), self.checksum.as_ref()).encode(machine, uid, record)
    }

    pub fn decode(
        &self,
        machine: &MachineIdentity,
        uid:     &DeviceUid,
        image:   &[u8],
    ) -> Result<CartridgeRecord, CodecError> {
        let format = self.format_for(image);
        debug!(%format, len = image.len(), "decoding cartridge");
        get_codec(format, self.cipher.as_ref(), self.checksum.as_ref()).decode(machine, uid, image)
    }

    /// Format a decode of `image` would use.
    pub fn format_for(&self, image: &[u8]) -> FormatVersion {
        if self.options.detect_format {
            if let Some(format) = FormatVersion::from_image_len(image.len()) {
                return format;
            }
        }
        self.options.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_overrides_configured_format() {
        let manager = Manager::default();
        assert_eq!(manager.format_for(&[0u8; 113]), FormatVersion::V1);
        assert_eq!(manager.format_for(&[0u8; 136]), FormatVersion::V3);
        assert_eq!(manager.format_for(&[0u8; 7]), FormatVersion::V3);
    }

    #[test]
    fn detection_can_be_disabled() {
        let options = ManagerOptions { format: FormatVersion::V3, detect_format: false };
        let manager = Manager::with_options(Box::new(DesX), Box::new(Crc16), options);
        assert_eq!(manager.format_for(&[0u8; 113]), FormatVersion::V3);
        let err = manager
            .decode(&MachineIdentity([0; 8]), &DeviceUid([0; 8]), &[0u8; 113])
            .unwrap_err();
        assert!(matches!(err, CodecError::ImageSize { expected: 136, actual: 113, .. }));
    }
}
