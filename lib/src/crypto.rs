//! Provides the AES-256-CTR streaming codec
//!
//! Both directions copy between a byte source and a byte sink in
//! bounded chunks, so whole files are never buffered in memory. The
//! nonce travels inline as the first 16 bytes of the ciphertext.
//! There is no authentication: tampered ciphertext decrypts to
//! garbage, not an error.
use crate::errors::StashError;
use crate::identity::SecretKey;
use crate::CHUNK_SIZE;
use std::io::{Read, Write};

// Nonce generation
use rand::rngs::OsRng;
use rand::RngCore;

// Encryption
use aes::Aes256;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{NewCipher, StreamCipher};
use ctr::Ctr128BE;

type Aes256Ctr = Ctr128BE<Aes256>;

/// Nonce length equals the AES block size
pub const NONCE_SIZE: usize = 16;

/// Encrypt every byte of `src` into `dst`, prefixed with a fresh
/// random nonce. Returns the total number of bytes written to `dst`,
/// including the nonce.
///
/// # Example
///
/// ```
/// use stash_lib::crypto::{decrypt_copy, encrypt_copy};
/// use stash_lib::SecretKey;
///
/// let key = SecretKey::generate();
/// let plain = b"my big data file here!";
///
/// let mut wire = Vec::new();
/// let written = encrypt_copy(&key, &mut &plain[..], &mut wire).unwrap();
/// assert_eq!(written as usize, plain.len() + 16);
///
/// let mut out = Vec::new();
/// decrypt_copy(&key, &mut &wire[..], &mut out).unwrap();
/// assert_eq!(out, plain);
/// ```
pub fn encrypt_copy<R, W>(key: &SecretKey, src: &mut R, dst: &mut W) -> Result<u64, StashError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    // Generate and emit the nonce first so the receiver can
    // reconstruct the keystream
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    dst.write_all(&nonce)?;

    let mut cipher = Aes256Ctr::new(
        GenericArray::from_slice(key.as_bytes()),
        GenericArray::from_slice(&nonce),
    );

    let written = xor_copy(&mut cipher, src, dst)?;
    Ok(written + NONCE_SIZE as u64)
}

/// Decrypt a nonce-prefixed ciphertext stream from `src` into `dst`.
/// Returns the number of plaintext bytes written to `dst`.
pub fn decrypt_copy<R, W>(key: &SecretKey, src: &mut R, dst: &mut W) -> Result<u64, StashError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    // The peer's nonce is the first block of the stream
    let mut nonce = [0u8; NONCE_SIZE];
    src.read_exact(&mut nonce)?;

    let mut cipher = Aes256Ctr::new(
        GenericArray::from_slice(key.as_bytes()),
        GenericArray::from_slice(&nonce),
    );

    xor_copy(&mut cipher, src, dst)
}

/// Copy `src` to `dst` through the CTR keystream in bounded chunks.
/// The transform is a length-preserving XOR, so the same routine
/// serves both directions.
fn xor_copy<R, W>(cipher: &mut Aes256Ctr, src: &mut R, dst: &mut W) -> Result<u64, StashError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total: u64 = 0;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        // Encryption and decryption are the same in-place XOR
        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n])?;
        total += n as u64;
    }
    dst.flush()?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(plain: &[u8]) -> Vec<u8> {
        let key = SecretKey::generate();

        let mut wire = Vec::new();
        let written = encrypt_copy(&key, &mut &plain[..], &mut wire).unwrap();
        assert_eq!(written as usize, plain.len() + NONCE_SIZE);
        assert_eq!(wire.len(), plain.len() + NONCE_SIZE);

        let mut out = Vec::new();
        let read = decrypt_copy(&key, &mut &wire[..], &mut out).unwrap();
        assert_eq!(read as usize, plain.len());
        out
    }

    #[test]
    fn test_roundtrip_small() {
        let plain = b"some big data file here!";
        assert_eq!(roundtrip(plain), plain);
    }

    #[test]
    fn test_roundtrip_empty() {
        assert_eq!(roundtrip(b""), b"");
    }

    #[test]
    fn test_roundtrip_chunk_boundaries() {
        // exactly one chunk, and one byte over
        for size in &[CHUNK_SIZE, CHUNK_SIZE + 1, 3 * CHUNK_SIZE - 1] {
            let plain: Vec<u8> = (0..*size).map(|i| (i % 251) as u8).collect();
            assert_eq!(roundtrip(&plain), plain);
        }
    }

    #[test]
    fn test_ciphertext_differs_from_plaintext() {
        let key = SecretKey::generate();
        let plain = vec![0x41u8; 4096];
        let mut wire = Vec::new();
        encrypt_copy(&key, &mut &plain[..], &mut wire).unwrap();
        assert_ne!(&wire[NONCE_SIZE..], &plain[..]);
    }

    #[test]
    fn test_wrong_key_yields_garbage() {
        let plain = b"only the originator can read this";
        let mut wire = Vec::new();
        encrypt_copy(&SecretKey::generate(), &mut &plain[..], &mut wire).unwrap();

        let mut out = Vec::new();
        decrypt_copy(&SecretKey::generate(), &mut &wire[..], &mut out).unwrap();
        assert_eq!(out.len(), plain.len());
        assert_ne!(&out[..], &plain[..]);
    }

    #[test]
    fn test_nonce_freshness() {
        let key = SecretKey::generate();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let mut wire = Vec::new();
            encrypt_copy(&key, &mut &b"x"[..], &mut wire).unwrap();
            assert!(seen.insert(wire[..NONCE_SIZE].to_vec()));
        }
    }
}
