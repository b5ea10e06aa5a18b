//! Legacy 113-byte layout.
//!
//! ```text
//! 0x00  serial number      f64        ┐
//! 0x08  material id        f64        │
//! 0x10  manufacturing lot  [u8; 20]   │ content span, encrypted
//! 0x24  version            u16        │ as one 64-byte run
//! 0x28  manufacturing date packed     │
//! 0x30  last use date      packed     │
//! 0x38  initial quantity   f64        ┘
//! 0x40  content plaintext checksum
//! 0x46  content ciphertext checksum
//! 0x48  key fragment       [u8; 8]
//! 0x50  key fragment checksum
//! 0x58  current quantity   f64        encrypted
//! 0x60  current quantity ciphertext checksum
//! 0x62  current quantity plaintext checksum
//! 0x68  signature          [u8; 9]
//! ```

use tracing::debug;

use super::{
    check_size, get_date, get_f64, get_material, get_str, get_u16, put_date, put_f64,
    put_material, put_str, put_u16, read_block, verify, Codec, CodecError, FormatVersion,
    IntegrityError,
};
use crate::cartridge::{CartridgeRecord, KeyFragment};
use crate::checksum::Checksum;
use crate::crypto::BlockCipher;
use crate::keys;
use crate::machine::{DeviceUid, MachineIdentity};

pub const IMAGE_SIZE: usize = 0x71;
pub const SIGNATURE_WIDTH: usize = 9;

const SERIAL_NUMBER:       usize = 0x00;
const MATERIAL:            usize = 0x08;
const LOT:                 usize = 0x10;
const LOT_WIDTH:           usize = 20;
const VERSION:             usize = 0x24;
const MANUFACTURING_DATE:  usize = 0x28;
const LAST_USE_DATE:       usize = 0x30;
const INITIAL_QUANTITY:    usize = 0x38;
const CONTENT_END:         usize = 0x40;
const CONTENT_PLAIN_CRC:   usize = 0x40;
const CONTENT_CIPHER_CRC:  usize = 0x46;
const KEY_FRAGMENT:        usize = 0x48;
const KEY_FRAGMENT_CRC:    usize = 0x50;
const CURRENT_QUANTITY:    usize = 0x58;
const QUANTITY_CIPHER_CRC: usize = 0x60;
const QUANTITY_PLAIN_CRC:  usize = 0x62;
const SIGNATURE:           usize = 0x68;

const CONTENT:  std::ops::Range<usize> = 0..CONTENT_END;
const QUANTITY: std::ops::Range<usize> = CURRENT_QUANTITY..CURRENT_QUANTITY + 8;
const FRAGMENT: std::ops::Range<usize> = KEY_FRAGMENT..KEY_FRAGMENT + 8;

pub struct V1Codec<'a> {
    cipher:   &'a dyn BlockCipher,
    checksum: &'a dyn Checksum,
}

impl<'a> V1Codec<'a> {
    pub fn new(cipher: &'a dyn BlockCipher, checksum: &'a dyn Checksum) -> Self {
        Self { cipher, checksum }
    }

    fn key(&self, data: &[u8], machine: &MachineIdentity, uid: &DeviceUid) -> [u8; keys::V1_KEY_LEN] {
        let fragment = read_block(data, FRAGMENT);
        debug!(format = "v1", "deriving cartridge key");
        keys::derive_v1_key(&fragment, machine.as_bytes(), uid.as_bytes())
    }

    fn verify_plaintext(&self, data: &[u8]) -> Result<(), CodecError> {
        verify(
            IntegrityError::KeyFragment,
            get_u16(data, KEY_FRAGMENT_CRC),
            self.checksum.checksum(&data[FRAGMENT]),
        )?;
        verify(
            IntegrityError::PlaintextContent,
            get_u16(data, CONTENT_PLAIN_CRC),
            self.checksum.checksum(&data[CONTENT]),
        )?;
        verify(
            IntegrityError::CurrentQuantityPlaintext,
            get_u16(data, QUANTITY_PLAIN_CRC),
            self.checksum.checksum(&data[QUANTITY]),
        )
    }
}

impl Codec for V1Codec<'_> {
    fn format(&self) -> FormatVersion { FormatVersion::V1 }

    fn pack(&self, record: &CartridgeRecord) -> Result<Vec<u8>, CodecError> {
        let mut out = vec![0u8; IMAGE_SIZE];

        put_f64(&mut out, SERIAL_NUMBER, record.serial_number);
        put_material(&mut out, MATERIAL, &record.material_name)?;
        put_str(&mut out, LOT, LOT_WIDTH, "manufacturing_lot", &record.manufacturing_lot)?;
        put_u16(&mut out, VERSION, record.version);
        put_date(&mut out, MANUFACTURING_DATE, "manufacturing_date", &record.manufacturing_date)?;
        put_date(&mut out, LAST_USE_DATE, "last_use_date", &record.last_use_date)?;
        put_f64(&mut out, INITIAL_QUANTITY, record.initial_material_quantity);
        let crc = self.checksum.checksum(&out[CONTENT]);
        put_u16(&mut out, CONTENT_PLAIN_CRC, crc);

        out[FRAGMENT].copy_from_slice(record.key_fragment.as_bytes());
        let crc = self.checksum.checksum(&out[FRAGMENT]);
        put_u16(&mut out, KEY_FRAGMENT_CRC, crc);

        put_f64(&mut out, CURRENT_QUANTITY, record.current_material_quantity);
        let crc = self.checksum.checksum(&out[QUANTITY]);
        put_u16(&mut out, QUANTITY_PLAIN_CRC, crc);

        put_str(&mut out, SIGNATURE, SIGNATURE_WIDTH, "signature", &record.signature)?;
        Ok(out)
    }

    fn unpack(&self, packed: &[u8]) -> Result<CartridgeRecord, CodecError> {
        check_size(FormatVersion::V1, packed)?;
        self.verify_plaintext(packed)?;

        Ok(CartridgeRecord {
            serial_number:             get_f64(packed, SERIAL_NUMBER),
            material_name:             get_material(packed, MATERIAL),
            manufacturing_lot:         get_str(packed, LOT, LOT_WIDTH, "manufacturing_lot")?,
            manufacturing_date:        get_date(packed, MANUFACTURING_DATE, "manufacturing_date")?,
            last_use_date:             get_date(packed, LAST_USE_DATE, "last_use_date")?,
            initial_material_quantity: get_f64(packed, INITIAL_QUANTITY),
            current_material_quantity: get_f64(packed, CURRENT_QUANTITY),
            key_fragment:              KeyFragment(read_block(packed, FRAGMENT)),
            version:                   get_u16(packed, VERSION),
            signature:                 get_str(packed, SIGNATURE, SIGNATURE_WIDTH, "signature")?,
        })
    }

    fn encrypt(
        &self,
        machine: &MachineIdentity,
        uid:     &DeviceUid,
        packed:  &[u8],
    ) -> Result<Vec<u8>, CodecError> {
        check_size(FormatVersion::V1, packed)?;
        let key = self.key(packed, machine, uid);
        let mut out = packed.to_vec();

        let content = self.cipher.encrypt(&key, &packed[CONTENT])?;
        out[CONTENT].copy_from_slice(&content);
        put_u16(&mut out, CONTENT_CIPHER_CRC, self.checksum.checksum(&content));

        let quantity = self.cipher.encrypt(&key, &packed[QUANTITY])?;
        out[QUANTITY].copy_from_slice(&quantity);
        put_u16(&mut out, QUANTITY_CIPHER_CRC, self.checksum.checksum(&quantity));

        Ok(out)
    }

    fn decrypt(
        &self,
        machine: &MachineIdentity,
        uid:     &DeviceUid,
        image:   &[u8],
    ) -> Result<Vec<u8>, CodecError> {
        check_size(FormatVersion::V1, image)?;
        verify(
            IntegrityError::KeyFragment,
            get_u16(image, KEY_FRAGMENT_CRC),
            self.checksum.checksum(&image[FRAGMENT]),
        )?;

        let key = self.key(image, machine, uid);
        let mut out = image.to_vec();

        verify(
            IntegrityError::CiphertextContent,
            get_u16(image, CONTENT_CIPHER_CRC),
            self.checksum.checksum(&image[CONTENT]),
        )?;
        let content = self.cipher.decrypt(&key, &image[CONTENT])?;
        verify(
            IntegrityError::PlaintextContent,
            get_u16(image, CONTENT_PLAIN_CRC),
            self.checksum.checksum(&content),
        )?;
        out[CONTENT].copy_from_slice(&content);

        verify(
            IntegrityError::CurrentQuantityCiphertext,
            get_u16(image, QUANTITY_CIPHER_CRC),
            self.checksum.checksum(&image[QUANTITY]),
        )?;
        let quantity = self.cipher.decrypt(&key, &image[QUANTITY])?;
        verify(
            IntegrityError::CurrentQuantityPlaintext,
            get_u16(image, QUANTITY_PLAIN_CRC),
            self.checksum.checksum(&quantity),
        )?;
        out[QUANTITY].copy_from_slice(&quantity);

        // Ciphertext checksums have no meaning once decrypted.
        put_u16(&mut out, CONTENT_CIPHER_CRC, 0);
        put_u16(&mut out, QUANTITY_CIPHER_CRC, 0);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Crc16;
    use crate::crypto::DesX;
    use crate::machine::MachineType;
    use chrono::NaiveDate;

    const PACKED: &str = "0000000000489340000000000000f03f353637380000000000000000000000000000000001000000\
                          650001010101010066000202020202000000004033332640444a0000000000004142434441424344\
                          dc2f00000000000000000040333336400000e8d400000000544553545445535431";

    fn record() -> CartridgeRecord {
        CartridgeRecord {
            serial_number:             1234.0,
            material_name:             "ABS_RED".into(),
            manufacturing_lot:         "5678".into(),
            manufacturing_date:        NaiveDate::from_ymd_opt(2001, 1, 1).unwrap().and_hms_opt(1, 1, 1).unwrap(),
            last_use_date:             NaiveDate::from_ymd_opt(2002, 2, 2).unwrap().and_hms_opt(2, 2, 2).unwrap(),
            initial_material_quantity: 11.1f32 as f64,
            current_material_quantity: 22.2f32 as f64,
            key_fragment:              "4142434441424344".parse().unwrap(),
            version:                   1,
            signature:                 "TESTTEST1".into(),
        }
    }

    fn uid() -> DeviceUid { "11010a01ba325d23".parse().unwrap() }

    #[test]
    fn pack_matches_reference_blob() {
        let codec = V1Codec::new(&DesX, &Crc16);
        assert_eq!(hex::encode(codec.pack(&record()).unwrap()), PACKED);
    }

    #[test]
    fn unpack_reference_blob() {
        let codec = V1Codec::new(&DesX, &Crc16);
        let packed = hex::decode(PACKED).unwrap();
        assert_eq!(codec.unpack(&packed).unwrap(), record());
    }

    #[test]
    fn decrypt_inverts_encrypt() {
        let codec = V1Codec::new(&DesX, &Crc16);
        let machine = MachineType::Fox.identity();
        let packed = hex::decode(PACKED).unwrap();
        let image = codec.encrypt(&machine, &uid(), &packed).unwrap();
        assert_ne!(image[..0x40], packed[..0x40]);
        assert_eq!(codec.decrypt(&machine, &uid(), &image).unwrap(), packed);
    }

    #[test]
    fn key_fragment_checked_before_decryption() {
        let codec = V1Codec::new(&DesX, &Crc16);
        let machine = MachineType::Fox.identity();
        let mut image = codec.encode(&machine, &uid(), &record()).unwrap();
        image[0x00] ^= 0xff;
        image[0x4a] ^= 0x01;
        let err = codec.decrypt(&machine, &uid(), &image).unwrap_err();
        assert!(matches!(err, CodecError::Integrity(IntegrityError::KeyFragment(_))));
    }

    #[test]
    fn long_signature_is_rejected() {
        let codec = V1Codec::new(&DesX, &Crc16);
        let mut rec = record();
        rec.signature = "STRATASYS!".into();
        assert!(matches!(
            codec.pack(&rec),
            Err(CodecError::FieldTooLong { field: "signature", max: 9, actual: 10 })
        ));
    }

    #[test]
    fn wrong_size_image_is_rejected() {
        let codec = V1Codec::new(&DesX, &Crc16);
        let err = codec.unpack(&[0u8; 0x70]).unwrap_err();
        assert!(matches!(err, CodecError::ImageSize { expected: 0x71, actual: 0x70, .. }));
    }
}
