//! Current 136-byte layout.
//!
//! ```text
//! 0x00  current quantity   f64        XOR mask, encrypted
//! 0x08  current quantity ciphertext checksum
//! 0x0a  current quantity plaintext checksum
//! 0x13  key fragment checksum (seeded)
//! 0x17  key fragment       [u8; 8]
//! 0x20  last use date      packed     ┐
//! 0x28  manufacturing date packed     │
//! 0x30  serial number      f64        │ info block: 8 sub-blocks,
//! 0x38  material id        f64        │ each masked with the previous
//! 0x40  manufacturing lot  [u8; 20]   │ sub-block's ciphertext
//! 0x54  version            u16        │
//! 0x58  initial quantity   f64        ┘
//! 0x60  info plaintext checksum
//! 0x66  info ciphertext checksum
//! 0x68  signature          [u8; 16]
//! 0x78  serial number self-check      XOR mask, e(k1) d(k2) e(k3)
//! ```
//!
//! The self-check block has no checksum: it decodes correctly only when it
//! reproduces the serial number stored in the info block.

use std::ops::Range;

use tracing::{debug, warn};

use super::{
    check_size, get_date, get_f64, get_material, get_str, get_u16, put_date, put_f64,
    put_material, put_str, put_u16, read_block, verify, xor_block, Codec, CodecError,
    FormatVersion, IntegrityError,
};
use crate::cartridge::{CartridgeRecord, KeyFragment};
use crate::checksum::{Checksum, KEY_FRAGMENT_SEED};
use crate::crypto::{BlockCipher, DesxKey, BLOCK_LEN};
use crate::keys;
use crate::machine::{DeviceUid, MachineIdentity};

pub const IMAGE_SIZE: usize = 0x88;
pub const SIGNATURE_WIDTH: usize = 16;

const CURRENT_QUANTITY:    usize = 0x00;
const QUANTITY_CIPHER_CRC: usize = 0x08;
const QUANTITY_PLAIN_CRC:  usize = 0x0a;
const KEY_FRAGMENT_CRC:    usize = 0x13;
const KEY_FRAGMENT:        usize = 0x17;
const LAST_USE_DATE:       usize = 0x20;
const MANUFACTURING_DATE:  usize = 0x28;
const SERIAL_NUMBER:       usize = 0x30;
const MATERIAL:            usize = 0x38;
const LOT:                 usize = 0x40;
const LOT_WIDTH:           usize = 20;
const VERSION:             usize = 0x54;
const INITIAL_QUANTITY:    usize = 0x58;
const INFO_PLAIN_CRC:      usize = 0x60;
const INFO_CIPHER_CRC:     usize = 0x66;
const SIGNATURE:           usize = 0x68;
const SELF_CHECK:          usize = 0x78;

const QUANTITY: Range<usize> = CURRENT_QUANTITY..CURRENT_QUANTITY + 8;
const FRAGMENT: Range<usize> = KEY_FRAGMENT..KEY_FRAGMENT + 8;
const INFO:     Range<usize> = LAST_USE_DATE..INFO_PLAIN_CRC;
const SERIAL:   Range<usize> = SERIAL_NUMBER..SERIAL_NUMBER + 8;
const CHECK:    Range<usize> = SELF_CHECK..SELF_CHECK + 8;

/// Mask for the first info sub-block.
const INFO_MASK: [u8; 8] = [0x07, 0x44, 0xdd, 0x84, 0xb5, 0x80, 0xa8, 0x9c];
const QUANTITY_MASK: [u8; 8] = [0xc0, 0xd3, 0x21, 0xa4, 0x41, 0x77, 0x22, 0xcb];
const SELF_CHECK_MASK: [u8; 8] = [0xaf, 0x04, 0xea, 0xd1, 0x5d, 0x52, 0x40, 0x3a];

struct Keys {
    main:       DesxKey,
    self_check: [DesxKey; 3],
}

pub struct V3Codec<'a> {
    cipher:   &'a dyn BlockCipher,
    checksum: &'a dyn Checksum,
}

impl<'a> V3Codec<'a> {
    pub fn new(cipher: &'a dyn BlockCipher, checksum: &'a dyn Checksum) -> Self {
        Self { cipher, checksum }
    }

    fn keys(&self, data: &[u8], machine: &MachineIdentity, uid: &DeviceUid) -> Keys {
        let fragment = keys::shuffle_key_fragment(&read_block(data, FRAGMENT));
        debug!(format = "v3", "deriving cartridge key");
        let key = keys::derive_v3_key(&fragment, machine.as_bytes(), uid.as_bytes());
        Keys { main: keys::desx_key(&key), self_check: keys::self_check_keys(&key) }
    }

    fn verify_key_fragment(&self, data: &[u8]) -> Result<(), CodecError> {
        verify(
            IntegrityError::KeyFragment,
            get_u16(data, KEY_FRAGMENT_CRC),
            self.checksum.checksum_seeded(&data[FRAGMENT], KEY_FRAGMENT_SEED),
        )
    }

    fn encrypt_block(&self, key: &DesxKey, block: &[u8; 8]) -> Result<[u8; 8], CodecError> {
        let out = self.cipher.encrypt(key, block)?;
        Ok(read_block(&out, 0..BLOCK_LEN))
    }

    fn decrypt_block(&self, key: &DesxKey, block: &[u8; 8]) -> Result<[u8; 8], CodecError> {
        let out = self.cipher.decrypt(key, block)?;
        Ok(read_block(&out, 0..BLOCK_LEN))
    }

    /// Serial-number self-check: e(k1), d(k2), e(k3) after masking.
    fn seal_serial(&self, keys: &Keys, serial: &[u8; 8]) -> Result<[u8; 8], CodecError> {
        let [k1, k2, k3] = &keys.self_check;
        let mut block = *serial;
        xor_block(&mut block, &SELF_CHECK_MASK);
        let block = self.encrypt_block(k1, &block)?;
        let block = self.decrypt_block(k2, &block)?;
        self.encrypt_block(k3, &block)
    }

    fn open_serial(&self, keys: &Keys, sealed: &[u8; 8]) -> Result<[u8; 8], CodecError> {
        let [k1, k2, k3] = &keys.self_check;
        let block = self.decrypt_block(k3, sealed)?;
        let block = self.encrypt_block(k2, &block)?;
        let mut block = self.decrypt_block(k1, &block)?;
        xor_block(&mut block, &SELF_CHECK_MASK);
        Ok(block)
    }
}

fn check_serial(decrypted: &[u8; 8], expected: &[u8]) -> Result<(), CodecError> {
    if decrypted[..] == *expected {
        debug!(region = "serial_number_self_check", "self-check verified");
        return Ok(());
    }
    let err = IntegrityError::SerialNumberSelfCheck {
        decrypted: hex::encode(decrypted),
        expected:  hex::encode(expected),
    };
    warn!(region = err.region(), "integrity check failed");
    Err(err.into())
}

impl Codec for V3Codec<'_> {
    fn format(&self) -> FormatVersion { FormatVersion::V3 }

    fn pack(&self, record: &CartridgeRecord) -> Result<Vec<u8>, CodecError> {
        let mut out = vec![0u8; IMAGE_SIZE];

        put_f64(&mut out, CURRENT_QUANTITY, record.current_material_quantity);
        let crc = self.checksum.checksum(&out[QUANTITY]);
        put_u16(&mut out, QUANTITY_PLAIN_CRC, crc);

        out[FRAGMENT].copy_from_slice(record.key_fragment.as_bytes());
        let crc = self.checksum.checksum_seeded(&out[FRAGMENT], KEY_FRAGMENT_SEED);
        put_u16(&mut out, KEY_FRAGMENT_CRC, crc);

        put_date(&mut out, LAST_USE_DATE, "last_use_date", &record.last_use_date)?;
        put_date(&mut out, MANUFACTURING_DATE, "manufacturing_date", &record.manufacturing_date)?;
        put_f64(&mut out, SERIAL_NUMBER, record.serial_number);
        put_material(&mut out, MATERIAL, &record.material_name)?;
        put_str(&mut out, LOT, LOT_WIDTH, "manufacturing_lot", &record.manufacturing_lot)?;
        put_u16(&mut out, VERSION, record.version);
        put_f64(&mut out, INITIAL_QUANTITY, record.initial_material_quantity);
        let crc = self.checksum.checksum(&out[INFO]);
        put_u16(&mut out, INFO_PLAIN_CRC, crc);

        put_str(&mut out, SIGNATURE, SIGNATURE_WIDTH, "signature", &record.signature)?;
        out.copy_within(SERIAL, SELF_CHECK);
        Ok(out)
    }

    fn unpack(&self, packed: &[u8]) -> Result<CartridgeRecord, CodecError> {
        check_size(FormatVersion::V3, packed)?;
        self.verify_key_fragment(packed)?;
        verify(
            IntegrityError::PlaintextContent,
            get_u16(packed, INFO_PLAIN_CRC),
            self.checksum.checksum(&packed[INFO]),
        )?;
        verify(
            IntegrityError::CurrentQuantityPlaintext,
            get_u16(packed, QUANTITY_PLAIN_CRC),
            self.checksum.checksum(&packed[QUANTITY]),
        )?;
        check_serial(&read_block(packed, CHECK), &packed[SERIAL])?;

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
        check_size(FormatVersion::V3, packed)?;
        let keys = self.keys(packed, machine, uid);
        let mut out = packed.to_vec();

        let mut mask = INFO_MASK;
        for start in INFO.step_by(BLOCK_LEN) {
            let mut block = read_block(packed, start..start + BLOCK_LEN);
            xor_block(&mut block, &mask);
            mask = self.encrypt_block(&keys.main, &block)?;
            out[start..start + BLOCK_LEN].copy_from_slice(&mask);
        }
        let crc = self.checksum.checksum(&out[INFO]);
        put_u16(&mut out, INFO_CIPHER_CRC, crc);

        let mut quantity = read_block(packed, QUANTITY);
        xor_block(&mut quantity, &QUANTITY_MASK);
        let quantity = self.encrypt_block(&keys.main, &quantity)?;
        out[QUANTITY].copy_from_slice(&quantity);
        put_u16(&mut out, QUANTITY_CIPHER_CRC, self.checksum.checksum(&quantity));

        let sealed = self.seal_serial(&keys, &read_block(packed, CHECK))?;
        out[CHECK].copy_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(
        &self,
        machine: &MachineIdentity,
        uid:     &DeviceUid,
        image:   &[u8],
    ) -> Result<Vec<u8>, CodecError> {
        check_size(FormatVersion::V3, image)?;
        self.verify_key_fragment(image)?;

        let keys = self.keys(image, machine, uid);
        let mut out = image.to_vec();

        verify(
            IntegrityError::CiphertextContent,
            get_u16(image, INFO_CIPHER_CRC),
            self.checksum.checksum(&image[INFO]),
        )?;
        let plain = self.cipher.decrypt(&keys.main, &image[INFO])?;
        let mut mask = INFO_MASK;
        for (i, start) in INFO.step_by(BLOCK_LEN).enumerate() {
            let mut block = read_block(&plain, i * BLOCK_LEN..(i + 1) * BLOCK_LEN);
            xor_block(&mut block, &mask);
            mask = read_block(image, start..start + BLOCK_LEN);
            out[start..start + BLOCK_LEN].copy_from_slice(&block);
        }
        verify(
            IntegrityError::PlaintextContent,
            get_u16(image, INFO_PLAIN_CRC),
            self.checksum.checksum(&out[INFO]),
        )?;

        verify(
            IntegrityError::CurrentQuantityCiphertext,
            get_u16(image, QUANTITY_CIPHER_CRC),
            self.checksum.checksum(&image[QUANTITY]),
        )?;
        let mut quantity = self.decrypt_block(&keys.main, &read_block(image, QUANTITY))?;
        xor_block(&mut quantity, &QUANTITY_MASK);
        verify(
            IntegrityError::CurrentQuantityPlaintext,
            get_u16(image, QUANTITY_PLAIN_CRC),
            self.checksum.checksum(&quantity),
        )?;
        out[QUANTITY].copy_from_slice(&quantity);

        let serial = self.open_serial(&keys, &read_block(image, CHECK))?;
        check_serial(&serial, &out[SERIAL])?;
        out[CHECK].copy_from_slice(&serial);

        put_u16(&mut out, INFO_CIPHER_CRC, 0);
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

    const PACKED: &str = "00000040333336400000e8d400000000000000857200004142434441424344\
                          006600020202020200650001010101010000000000004893400000000000\
                          00f03f353637380000000000000000000000000000000003000000000000\
                          403333264022ca0000000000005445535454455354310000000000000000\
                          000000004893400000000000000000";

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
            version:                   3,
            signature:                 "TESTTEST1".into(),
        }
    }

    fn uid() -> DeviceUid { "11010a01ba325d23".parse().unwrap() }

    #[test]
    fn pack_layout() {
        let codec = V3Codec::new(&DesX, &Crc16);
        let packed = codec.pack(&record()).unwrap();
        assert_eq!(hex::encode(&packed), PACKED);
        assert_eq!(packed[SELF_CHECK..SELF_CHECK + 8], packed[SERIAL_NUMBER..SERIAL_NUMBER + 8]);
    }

    #[test]
    fn decrypt_inverts_encrypt() {
        let codec = V3Codec::new(&DesX, &Crc16);
        let machine = MachineType::Fox.identity();
        let packed = codec.pack(&record()).unwrap();
        let image = codec.encrypt(&machine, &uid(), &packed).unwrap();
        assert_eq!(codec.decrypt(&machine, &uid(), &image).unwrap(), packed);
        assert_eq!(codec.unpack(&packed).unwrap(), record());
    }

    #[test]
    fn info_chain_masks_with_previous_ciphertext() {
        let codec = V3Codec::new(&DesX, &Crc16);
        let machine = MachineType::Fox.identity();
        let image = codec.encode(&machine, &uid(), &record()).unwrap();

        let key = keys::derive_v3_key(
            &keys::shuffle_key_fragment(b"ABCDABCD"),
            machine.as_bytes(),
            uid().as_bytes(),
        );
        let block1 = DesX.decrypt(&keys::desx_key(&key), &image[0x28..0x30]).unwrap();
        let plain: Vec<u8> = block1.iter().zip(&image[0x20..0x28]).map(|(a, b)| a ^ b).collect();
        assert_eq!(hex::encode(plain), "6500010101010100");
    }

    #[test]
    fn tampered_key_fragment_fails_first() {
        let codec = V3Codec::new(&DesX, &Crc16);
        let machine = MachineType::Fox.identity();
        let mut image = codec.encode(&machine, &uid(), &record()).unwrap();
        image[0x20] ^= 0x01;
        image[0x18] ^= 0x01;
        let err = codec.decrypt(&machine, &uid(), &image).unwrap_err();
        assert!(matches!(err, CodecError::Integrity(IntegrityError::KeyFragment(_))));
    }

    #[test]
    fn self_check_corruption_is_reported() {
        let codec = V3Codec::new(&DesX, &Crc16);
        let machine = MachineType::Fox.identity();
        let mut image = codec.encode(&machine, &uid(), &record()).unwrap();
        image[0x7c] ^= 0x80;
        let err = codec.decode(&machine, &uid(), &image).unwrap_err();
        assert!(matches!(
            err,
            CodecError::Integrity(IntegrityError::SerialNumberSelfCheck { .. })
        ));
    }

    #[test]
    fn signature_may_not_reach_self_check_block() {
        let codec = V3Codec::new(&DesX, &Crc16);
        let mut rec = record();
        rec.signature = "0123456789abcdef".into();
        assert!(codec.pack(&rec).is_ok());
        rec.signature.push('!');
        assert!(matches!(
            codec.pack(&rec),
            Err(CodecError::FieldTooLong { field: "signature", max: 16, actual: 17 })
        ));
    }
}
