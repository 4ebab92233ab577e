//! AES-CBC decryption for region metadata and bulk blocks.
//!
//! Metadata regions are PKCS#7-padded; bulk block payloads usually are not —
//! their declared sizes already match the plaintext. Unpadding is therefore
//! tolerant: a trailing byte sequence that does not form valid PKCS#7 padding
//! is kept, never rejected.

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{block_padding::NoPadding, BlockCipher, BlockDecryptMut, KeyInit, KeyIvInit};
use thiserror::Error;

/// AES block (and CBC IV) size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

#[derive(Error, Debug)]
pub enum AesError {
    #[error("bad {what} length {len} (expected {expected})")]
    BadSize { what: &'static str, len: usize, expected: &'static str },
    #[error("cipher error: {0}")]
    Cipher(String),
}

/// AES-CBC decrypt, then strip PKCS#7 padding when (and only when) the
/// trailing bytes actually form valid padding.
///
/// Requirements: `ct.len() % 16 == 0`, `key.len() ∈ {16, 24, 32}`,
/// `iv.len() == 16`. Anything else is `AesError::BadSize`.
pub fn decrypt_cbc(ct: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, AesError> {
    if ct.len() % AES_BLOCK_SIZE != 0 {
        return Err(AesError::BadSize {
            what: "ciphertext",
            len: ct.len(),
            expected: "multiple of 16",
        });
    }
    if iv.len() != AES_BLOCK_SIZE {
        return Err(AesError::BadSize { what: "iv", len: iv.len(), expected: "16" });
    }

    let mut buf = ct.to_vec();
    match key.len() {
        16 => decrypt_in_place::<Aes128>(key, iv, &mut buf)?,
        24 => decrypt_in_place::<Aes192>(key, iv, &mut buf)?,
        32 => decrypt_in_place::<Aes256>(key, iv, &mut buf)?,
        n => {
            return Err(AesError::BadSize { what: "key", len: n, expected: "16, 24 or 32" });
        }
    }

    strip_pkcs7(&mut buf);
    Ok(buf)
}

fn decrypt_in_place<C>(key: &[u8], iv: &[u8], buf: &mut [u8]) -> Result<(), AesError>
where
    C: BlockCipher + BlockDecryptMut + KeyInit,
{
    let dec = cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|e| AesError::Cipher(e.to_string()))?;
    dec.decrypt_padded_mut::<NoPadding>(buf)
        .map_err(|e| AesError::Cipher(e.to_string()))?;
    Ok(())
}

/// Strip PKCS#7 padding in place if the buffer ends with it.
///
/// The last byte `p` must be in `1..=16` and the last `p` bytes must all
/// equal `p`; otherwise the buffer is left untouched. Never fails.
fn strip_pkcs7(buf: &mut Vec<u8>) {
    let Some(&last) = buf.last() else { return };
    let p = last as usize;
    if !(1..=AES_BLOCK_SIZE).contains(&p) || p > buf.len() {
        return;
    }
    if buf[buf.len() - p..].iter().all(|&b| b == last) {
        buf.truncate(buf.len() - p);
    }
}
