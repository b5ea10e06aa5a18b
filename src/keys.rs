//! Ephemeral key material for cartridge encryption.
//!
//! A derived key is a fixed permutation of bytes drawn from three 8-byte
//! secrets (the cartridge key fragment, the printer-model identity and the
//! chip UID), each byte complemented.  No hashing is involved.  Keys are
//! built fresh for every encode/decode call and never stored.

use crate::crypto::{DesxKey, KEY_LEN};

pub const V1_KEY_LEN: usize = 16;
pub const V3_KEY_LEN: usize = 23;

/// Bit rotation applied between the three serial-number self-check keys.
pub const SELF_CHECK_ROTATION: usize = 29;

#[derive(Debug, Clone, Copy)]
enum Source {
    Fragment,
    Machine,
    Uid,
}

use Source::{Fragment as K, Machine as M, Uid as U};

static V1_TABLE: [(Source, usize); V1_KEY_LEN] = [
    (K, 0), (K, 2), (U, 2), (K, 6), (M, 0), (M, 2), (U, 6), (M, 6),
    (M, 7), (U, 1), (M, 3), (M, 1), (K, 7), (U, 5), (K, 3), (K, 1),
];

static V3_TABLE: [(Source, usize); V3_KEY_LEN] = [
    (U, 3), (M, 3), (M, 1), (K, 0), (K, 1), (K, 2), (U, 5), (K, 3),
    (M, 7), (M, 5), (M, 2), (U, 1), (U, 4), (K, 4), (K, 5), (U, 6),
    (K, 6), (M, 0), (M, 6), (U, 0), (M, 4), (K, 7), (U, 2),
];

/// Order in which V3 reads the stored key fragment before derivation.
static FRAGMENT_SHUFFLE: [usize; 8] = [5, 6, 1, 0, 3, 4, 7, 2];

fn derive<const N: usize>(
    table:    &[(Source, usize); N],
    fragment: &[u8; 8],
    machine:  &[u8; 8],
    uid:      &[u8; 8],
) -> [u8; N] {
    let mut key = [0u8; N];
    for (out, &(source, idx)) in key.iter_mut().zip(table.iter()) {
        let byte = match source {
            Source::Fragment => fragment[idx],
            Source::Machine  => machine[idx],
            Source::Uid      => uid[idx],
        };
        *out = !byte;
    }
    key
}

/// 16-byte V1 key; used directly as the DES-X key.
pub fn derive_v1_key(fragment: &[u8; 8], machine: &[u8; 8], uid: &[u8; 8]) -> [u8; V1_KEY_LEN] {
    derive(&V1_TABLE, fragment, machine, uid)
}

/// 23-byte V3 key.  `fragment` must already be shuffled with
/// [`shuffle_key_fragment`].
pub fn derive_v3_key(fragment: &[u8; 8], machine: &[u8; 8], uid: &[u8; 8]) -> [u8; V3_KEY_LEN] {
    derive(&V3_TABLE, fragment, machine, uid)
}

pub fn shuffle_key_fragment(fragment: &[u8; 8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (dst, &src) in out.iter_mut().zip(FRAGMENT_SHUFFLE.iter()) {
        *dst = fragment[src];
    }
    out
}

/// Rotate `key` right by `n` bits, treating it as one big-endian bit string.
///
/// Done in two steps: a whole-byte rotation by `n / 8`, then a cross-byte
/// circular shift by the remaining `n % 8` bits.
pub fn shuffle_key<const N: usize>(key: &[u8; N], n: usize) -> [u8; N] {
    let mut out = *key;
    let mut remaining = n % (8 * N);

    if remaining > 7 {
        let bytes = remaining / 8;
        out.rotate_right(bytes);
        remaining -= 8 * bytes;
    }

    if remaining > 0 {
        let carry = 8 - remaining;
        let tail = out[N - 1];
        out[N - 1] = tail >> remaining;
        for i in (1..N).rev() {
            let c = out[i - 1];
            out[i] |= c << carry;
            out[i - 1] = c >> remaining;
        }
        out[0] |= tail << carry;
    }

    out
}

/// DES-X key carved out of a 23-byte key: bytes `[0, 8)` then `[15, 23)`.
pub fn desx_key(key: &[u8; V3_KEY_LEN]) -> DesxKey {
    let mut out = [0u8; KEY_LEN];
    out[..8].copy_from_slice(&key[..8]);
    out[8..].copy_from_slice(&key[15..]);
    out
}

/// The three successive keys of the V3 serial-number self-check pass.
pub fn self_check_keys(key: &[u8; V3_KEY_LEN]) -> [DesxKey; 3] {
    let k1 = shuffle_key(key, SELF_CHECK_ROTATION);
    let k2 = shuffle_key(&k1, SELF_CHECK_ROTATION);
    let k3 = shuffle_key(&k2, SELF_CHECK_ROTATION);
    [desx_key(&k1), desx_key(&k2), desx_key(&k3)]
}
