//! Key Trust Store: RSA key generation, canonical encodings and the
//! in-memory registry of master and per-license keys.
//!
//! Public keys travel as base64 of SPKI DER (this string *is* the license
//! key handed to customers), private keys as base64 of PKCS8 DER.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use sha2::{Digest, Sha256};
use rsa::{RsaPrivateKey, RsaPublicKey};
use uuid::Uuid;

use crate::error::LicenseError;

pub const DEFAULT_KEY_BITS: usize = 2048;
pub const MIN_KEY_BITS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// Wraps and unwraps artifacts.
    Master,
    /// Signs the payload of exactly one license.
    License,
}

/// Generate an RSA keypair of the default size for the given kind.
pub fn generate_keypair(kind: KeyKind) -> Result<(RsaPrivateKey, RsaPublicKey), LicenseError> {
    generate_keypair_with_bits(kind, DEFAULT_KEY_BITS)
}

pub fn generate_keypair_with_bits(
    kind: KeyKind,
    bits: usize,
) -> Result<(RsaPrivateKey, RsaPublicKey), LicenseError> {
    if bits < MIN_KEY_BITS {
        return Err(LicenseError::KeyGeneration(format!(
            "{:?} keys must be at least {} bits, got {}",
            kind, MIN_KEY_BITS, bits
        )));
    }
    let mut rng = rand::thread_rng();
    let private_key = RsaPrivateKey::new(&mut rng, bits)
        .map_err(|e| LicenseError::KeyGeneration(e.to_string()))?;
    let public_key = RsaPublicKey::from(&private_key);
    log::debug!("generated {}-bit {:?} keypair", bits, kind);
    Ok((private_key, public_key))
}

/// Encode a public key as base64 SPKI DER.
pub fn encode_public(key: &RsaPublicKey) -> Result<String, LicenseError> {
    let der = key
        .to_public_key_der()
        .map_err(|e| LicenseError::KeyEncoding(e.to_string()))?;
    Ok(BASE64.encode(der.as_bytes()))
}

/// Decode a base64 SPKI DER public key. Surrounding whitespace is ignored.
pub fn decode_public(encoded: &str) -> Result<RsaPublicKey, LicenseError> {
    let der = BASE64.decode(encoded.trim())?;
    RsaPublicKey::from_public_key_der(&der).map_err(|e| LicenseError::KeyEncoding(e.to_string()))
}

/// Encode a private key as base64 PKCS8 DER.
pub fn encode_private(key: &RsaPrivateKey) -> Result<String, LicenseError> {
    let der = key
        .to_pkcs8_der()
        .map_err(|e| LicenseError::KeyEncoding(e.to_string()))?;
    Ok(BASE64.encode(der.as_bytes()))
}

/// Decode a base64 PKCS8 DER private key. Surrounding whitespace is ignored.
pub fn decode_private(encoded: &str) -> Result<RsaPrivateKey, LicenseError> {
    let der = BASE64.decode(encoded.trim())?;
    RsaPrivateKey::from_pkcs8_der(&der).map_err(|e| LicenseError::KeyEncoding(e.to_string()))
}

pub fn private_key_to_pem(key: &RsaPrivateKey) -> Result<String, LicenseError> {
    key.to_pkcs8_pem(LineEnding::LF)
        .map(|s| s.to_string())
        .map_err(|e| LicenseError::KeyEncoding(e.to_string()))
}

pub fn public_key_to_pem(key: &RsaPublicKey) -> Result<String, LicenseError> {
    key.to_public_key_pem(LineEnding::LF)
        .map_err(|e| LicenseError::KeyEncoding(e.to_string()))
}

pub fn private_key_from_pem(pem: &str) -> Result<RsaPrivateKey, LicenseError> {
    RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| LicenseError::KeyEncoding(e.to_string()))
}

/// Read a private key from a key file or env var: PKCS8 PEM when it carries
/// a `-----BEGIN` armor line, bare base64 PKCS8 DER otherwise.
pub fn load_private_key(text: &str) -> Result<RsaPrivateKey, LicenseError> {
    let text = text.trim();
    if text.starts_with("-----BEGIN") {
        private_key_from_pem(text)
    } else {
        decode_private(text)
    }
}

/// Short hex digest of a license key, safe to print and log.
pub fn license_key_fingerprint(license_key: &str) -> String {
    let digest = match BASE64.decode(license_key.trim()) {
        Ok(der) => Sha256::digest(&der),
        Err(_) => Sha256::digest(license_key.trim().as_bytes()),
    };
    hex::encode(&digest[..8])
}

/// The master keypair currently used to wrap artifacts.
#[derive(Debug, Clone)]
pub struct MasterKeyPair {
    pub id: String,
    pub private_key: RsaPrivateKey,
    pub public_key: RsaPublicKey,
}

impl MasterKeyPair {
    pub fn generate() -> Result<Self, LicenseError> {
        let (private_key, _) = generate_keypair(KeyKind::Master)?;
        Ok(Self::from_private(Uuid::new_v4().to_string(), private_key))
    }

    pub fn from_private(id: String, private_key: RsaPrivateKey) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        Self {
            id,
            private_key,
            public_key,
        }
    }
}

/// Explicit holder of all key material, passed into the packager and the
/// validator instead of living in global state.
#[derive(Debug, Clone)]
pub struct KeyTrustStore {
    master: MasterKeyPair,
    license_keys: HashMap<String, RsaPrivateKey>,
}

impl KeyTrustStore {
    pub fn new(master: MasterKeyPair) -> Self {
        Self {
            master,
            license_keys: HashMap::new(),
        }
    }

    pub fn with_generated_master() -> Result<Self, LicenseError> {
        Ok(Self::new(MasterKeyPair::generate()?))
    }

    /// Store for a distributed validator: only the embedded master private half.
    pub fn for_validator(master_private: RsaPrivateKey) -> Self {
        Self::new(MasterKeyPair::from_private(
            "embedded".to_string(),
            master_private,
        ))
    }

    pub fn master_id(&self) -> &str {
        &self.master.id
    }

    pub fn master_public(&self) -> &RsaPublicKey {
        &self.master.public_key
    }

    pub fn master_private(&self) -> &RsaPrivateKey {
        &self.master.private_key
    }

    /// Replace the active master keypair and hand back the previous one.
    /// Artifacts wrapped under the previous key stop unwrapping with this store.
    pub fn rotate_master(&mut self, next: MasterKeyPair) -> MasterKeyPair {
        log::info!("rotating master key {} -> {}", self.master.id, next.id);
        std::mem::replace(&mut self.master, next)
    }

    /// Record the private half of a license keypair. A license id is bound to
    /// exactly one keypair; re-binding an id to a different key is refused.
    pub fn insert_license_key(
        &mut self,
        license_id: &str,
        private_key: RsaPrivateKey,
    ) -> Result<(), LicenseError> {
        if let Some(existing) = self.license_keys.get(license_id) {
            if *existing != private_key {
                return Err(LicenseError::DuplicateLicense(license_id.to_string()));
            }
            return Ok(());
        }
        self.license_keys.insert(license_id.to_string(), private_key);
        Ok(())
    }

    pub fn license_private_key(&self, license_id: &str) -> Result<&RsaPrivateKey, LicenseError> {
        self.license_keys
            .get(license_id)
            .ok_or_else(|| LicenseError::UnknownLicense(license_id.to_string()))
    }

    /// The customer-facing license key string for a stored license.
    pub fn license_key_string(&self, license_id: &str) -> Result<String, LicenseError> {
        let private_key = self.license_private_key(license_id)?;
        encode_public(&RsaPublicKey::from(private_key))
    }

    pub fn license_count(&self) -> usize {
        self.license_keys.len()
    }
}
