//! DES-X block cipher used to protect cartridge EEPROM regions.
//!
//! Key layout (16 bytes): `[ DES key (8 B) | input whitener (8 B) ]`.
//! The output whitener is not stored; it is stretched from all 16 key bytes
//! through the RSADSI substitution table, as RSAREF's DESX does.
//!
//! Per block:  `C = OW ^ DES_k(P ^ IW)`  and  `P = IW ^ DES_k⁻¹(C ^ OW)`.
//!
//! Multi-block input is processed block by block with no chaining.  Any
//! chaining a cartridge format needs is built explicitly by its codec.

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use des::Des;
use thiserror::Error;

/// Cipher block size in bytes.
pub const BLOCK_LEN: usize = 8;
/// DES-X key length: DES key followed by the input whitener.
pub const KEY_LEN: usize = 16;

/// A 16-byte DES-X key.
pub type DesxKey = [u8; KEY_LEN];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Data length {0} is not a multiple of the {BLOCK_LEN}-byte block size")]
    UnalignedLength(usize),
    #[error("Invalid cipher key")]
    InvalidKey,
}

// ── BlockCipher trait ────────────────────────────────────────────────────────

/// A fixed-key-size block cipher applied independently to each 8-byte block.
///
/// Implementations must be reentrant: no state survives between calls, so one
/// instance can serve concurrent encode/decode calls.
pub trait BlockCipher: Send + Sync {
    fn encrypt(&self, key: &DesxKey, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
    fn decrypt(&self, key: &DesxKey, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

// ── DES-X ────────────────────────────────────────────────────────────────────

/// RSADSI substitution table used to derive the DES-X output whitener.
static WHITENER_SBOX: [u8; 256] = [
    0xbd, 0x56, 0xea, 0xf2, 0xa2, 0xf1, 0xac, 0x2a, 0xb0, 0x93, 0xd1, 0x9c,
    0x1b, 0x33, 0xfd, 0xd0, 0x30, 0x04, 0xb6, 0xdc, 0x7d, 0xdf, 0x32, 0x4b,
    0xf7, 0xcb, 0x45, 0x9b, 0x31, 0xbb, 0x21, 0x5a, 0x41, 0x9f, 0xe1, 0xd9,
    0x4a, 0x4d, 0x9e, 0xda, 0xa0, 0x68, 0x2c, 0xc3, 0x27, 0x5f, 0x80, 0x36,
    0x3e, 0xee, 0xfb, 0x95, 0x1a, 0xfe, 0xce, 0xa8, 0x34, 0xa9, 0x13, 0xf0,
    0xa6, 0x3f, 0xd8, 0x0c, 0x78, 0x24, 0xaf, 0x23, 0x52, 0xc1, 0x67, 0x17,
    0xf5, 0x66, 0x90, 0xe7, 0xe8, 0x07, 0xb8, 0x60, 0x48, 0xe6, 0x1e, 0x53,
    0xf3, 0x92, 0xa4, 0x72, 0x8c, 0x08, 0x15, 0x6e, 0x86, 0x00, 0x84, 0xfa,
    0xf4, 0x7f, 0x8a, 0x42, 0x19, 0xf6, 0xdb, 0xcd, 0x14, 0x8d, 0x50, 0x12,
    0xba, 0x3c, 0x06, 0x4e, 0xec, 0xb3, 0x35, 0x11, 0xa1, 0x88, 0x8e, 0x2b,
    0x94, 0x99, 0xb7, 0x71, 0x74, 0xd3, 0xe4, 0xbf, 0x3a, 0xde, 0x96, 0x0e,
    0xbc, 0x0a, 0xed, 0x77, 0xfc, 0x37, 0x6b, 0x03, 0x79, 0x89, 0x62, 0xc6,
    0xd7, 0xc0, 0xd2, 0x7c, 0x6a, 0x8b, 0x22, 0xa3, 0x5b, 0x05, 0x5d, 0x02,
    0x75, 0xd5, 0x61, 0xe3, 0x18, 0x8f, 0x55, 0x51, 0xad, 0x1f, 0x0b, 0x5e,
    0x85, 0xe5, 0xc2, 0x57, 0x63, 0xca, 0x3d, 0x6c, 0xb4, 0xc5, 0xcc, 0x70,
    0xb2, 0x91, 0x59, 0x0d, 0x47, 0x20, 0xc8, 0x4f, 0x58, 0xe0, 0x01, 0xe2,
    0x16, 0x38, 0xc4, 0x6f, 0x3b, 0x0f, 0x65, 0x46, 0xbe, 0x7e, 0x2d, 0x7b,
    0x82, 0xf9, 0x40, 0xb5, 0x1d, 0x73, 0xf8, 0xeb, 0x26, 0xc7, 0x87, 0x97,
    0x25, 0x54, 0xb1, 0x28, 0xaa, 0x98, 0x9d, 0xa5, 0x64, 0x6d, 0x7a, 0xd4,
    0x10, 0x81, 0x44, 0xef, 0x49, 0xd6, 0xae, 0x2e, 0xdd, 0x76, 0x5c, 0x2f,
    0xa7, 0x1c, 0xc9, 0x09, 0x69, 0x9a, 0x83, 0xcf, 0x29, 0x39, 0xb9, 0xe9,
    0x4c, 0xff, 0x43, 0xab,
];

/// Stretch the 16 key bytes into the 8-byte output whitener.
///
/// The whitener is a shift register: each key byte shifts in
/// `SBOX[w[0] ^ w[1]] ^ key[i]` at the tail.
pub fn output_whitener(key: &DesxKey) -> [u8; BLOCK_LEN] {
    let mut w = [0u8; BLOCK_LEN];
    for &k in key.iter() {
        let idx = (w[0] ^ w[1]) as usize;
        w.copy_within(1.., 0);
        w[BLOCK_LEN - 1] = WHITENER_SBOX[idx] ^ k;
    }
    w
}

/// DES-X backed by the RustCrypto `des` core.
#[derive(Debug, Default, Clone, Copy)]
pub struct DesX;

struct Schedule {
    des:    Des,
    input:  [u8; BLOCK_LEN],
    output: [u8; BLOCK_LEN],
}

impl Schedule {
    fn new(key: &DesxKey, data_len: usize) -> Result<Self, CryptoError> {
        if data_len % BLOCK_LEN != 0 {
            return Err(CryptoError::UnalignedLength(data_len));
        }
        let des = Des::new_from_slice(&key[..BLOCK_LEN]).map_err(|_| CryptoError::InvalidKey)?;
        let mut input = [0u8; BLOCK_LEN];
        input.copy_from_slice(&key[BLOCK_LEN..]);
        Ok(Self { des, input, output: output_whitener(key) })
    }
}

fn xor_into(block: &mut [u8], mask: &[u8; BLOCK_LEN]) {
    block.iter_mut().zip(mask).for_each(|(b, m)| *b ^= m);
}

impl BlockCipher for DesX {
    fn encrypt(&self, key: &DesxKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ks = Schedule::new(key, data.len())?;
        let mut out = data.to_vec();
        for chunk in out.chunks_exact_mut(BLOCK_LEN) {
            xor_into(chunk, &ks.input);
            ks.des.encrypt_block(GenericArray::from_mut_slice(chunk));
            xor_into(chunk, &ks.output);
        }
        Ok(out)
    }

    fn decrypt(&self, key: &DesxKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let ks = Schedule::new(key, data.len())?;
        let mut out = data.to_vec();
        for chunk in out.chunks_exact_mut(BLOCK_LEN) {
            xor_into(chunk, &ks.output);
            ks.des.decrypt_block(GenericArray::from_mut_slice(chunk));
            xor_into(chunk, &ks.input);
        }
        Ok(out)
    }
}
