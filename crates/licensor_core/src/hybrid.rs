//! Hybrid codec: AES-256-GCM over the payload, RSA-OAEP(SHA-256) over the
//! symmetric key.
//!
//! Wire form: `base64(W) ":" base64(N || T || C)` where `W` is the wrapped
//! key, `N` the 12-byte nonce, `T` the 16-byte tag and `C` the ciphertext.
//! The layout is shared with every other implementation of the protocol.

use aes_gcm::{aead::AeadInPlace, Aes256Gcm, KeyInit, Nonce, Tag};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;

use crate::error::LicenseError;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const SEPARATOR: char = ':';

/// Encrypt `plaintext` so that only the holder of the matching private key can read it.
pub fn wrap(plaintext: &[u8], recipient: &RsaPublicKey) -> Result<String, LicenseError> {
    let mut rng = rand::thread_rng();

    let mut key_bytes = [0u8; KEY_SIZE];
    rng.fill_bytes(&mut key_bytes);
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rng.fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(&key_bytes)
        .map_err(|e| LicenseError::Encryption(format!("AES init: {}", e)))?;
    let mut ciphertext = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce_bytes), b"", &mut ciphertext)
        .map_err(|e| LicenseError::Encryption(format!("AES encrypt: {}", e)))?;

    let wrapped_key = recipient
        .encrypt(&mut rng, Oaep::new::<Sha256>(), &key_bytes)
        .map_err(|e| LicenseError::Encryption(format!("RSA-OAEP: {}", e)))?;

    let mut frame = Vec::with_capacity(NONCE_SIZE + TAG_SIZE + ciphertext.len());
    frame.extend_from_slice(&nonce_bytes);
    frame.extend_from_slice(&tag);
    frame.extend_from_slice(&ciphertext);

    Ok(format!(
        "{}{}{}",
        BASE64.encode(wrapped_key),
        SEPARATOR,
        BASE64.encode(frame)
    ))
}

/// Recover the plaintext of an artifact produced by [`wrap`].
///
/// Framing problems yield [`LicenseError::Decode`]. Anything that goes wrong
/// once the framing is sound (wrong key, tampered key blob, tampered frame)
/// yields the same [`LicenseError::Authentication`].
pub fn unwrap(artifact: &str, recipient: &RsaPrivateKey) -> Result<Vec<u8>, LicenseError> {
    let (wrapped_key, frame) = split_artifact(artifact)?;

    let frame = BASE64
        .decode(frame)
        .map_err(|_| LicenseError::Decode("frame is not valid base64".to_string()))?;
    let wrapped_key = BASE64
        .decode(wrapped_key)
        .map_err(|_| LicenseError::Decode("wrapped key is not valid base64".to_string()))?;
    if frame.len() < NONCE_SIZE + TAG_SIZE {
        return Err(LicenseError::Decode("frame too short".to_string()));
    }

    let key_bytes = recipient
        .decrypt(Oaep::new::<Sha256>(), &wrapped_key)
        .map_err(|_| LicenseError::Authentication)?;
    if key_bytes.len() != KEY_SIZE {
        return Err(LicenseError::Authentication);
    }

    let (nonce_bytes, rest) = frame.split_at(NONCE_SIZE);
    let (tag_bytes, ciphertext) = rest.split_at(TAG_SIZE);

    let cipher =
        Aes256Gcm::new_from_slice(&key_bytes).map_err(|_| LicenseError::Authentication)?;
    let mut plaintext = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce_bytes),
            b"",
            &mut plaintext,
            Tag::from_slice(tag_bytes),
        )
        .map_err(|_| LicenseError::Authentication)?;

    Ok(plaintext)
}

/// Split on the single separator. Zero or several separators are rejected.
fn split_artifact(artifact: &str) -> Result<(&str, &str), LicenseError> {
    let artifact = artifact.trim();
    let mut parts = artifact.split(SEPARATOR);
    match (parts.next(), parts.next(), parts.next()) {
        (Some(key), Some(frame), None) if !key.is_empty() && !frame.is_empty() => {
            Ok((key, frame))
        }
        (Some(_), Some(_), None) => Err(LicenseError::Decode("empty segment".to_string())),
        (_, None, _) => Err(LicenseError::Decode("missing separator".to_string())),
        _ => Err(LicenseError::Decode("more than one separator".to_string())),
    }
}
