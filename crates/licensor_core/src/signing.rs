use rsa::pss::{Signature, SigningKey, VerifyingKey};
use sha2::Sha256;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::LicenseError;
use crate::license::{LicensePayload, SignedLicense, SignedLicenseEnvelope};

/// RSASSA-PSS salt length. Fixed by the protocol, never negotiated.
pub const PSS_SALT_LEN: usize = 32;

/// Sign raw bytes with RSASSA-PSS(SHA-256).
pub fn sign_bytes(private_key: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>, LicenseError> {
    let signing_key = SigningKey::<Sha256>::new_with_salt_len(private_key.clone(), PSS_SALT_LEN);
    let signature = signing_key
        .try_sign_with_rng(&mut rand::thread_rng(), message)
        .map_err(|e| LicenseError::Encryption(format!("PSS sign: {}", e)))?;
    Ok(signature.to_vec())
}

pub fn verify_bytes(
    public_key: &RsaPublicKey,
    message: &[u8],
    signature: &[u8],
) -> Result<(), LicenseError> {
    let verifying_key = VerifyingKey::<Sha256>::new_with_salt_len(public_key.clone(), PSS_SALT_LEN);
    let signature =
        Signature::try_from(signature).map_err(|_| LicenseError::SignatureMismatch)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| LicenseError::SignatureMismatch)
}

/// Sign the canonical bytes of a payload with its license private key.
pub fn sign_license(
    private_key: &RsaPrivateKey,
    payload: &LicensePayload,
) -> Result<SignedLicense, LicenseError> {
    let signature = sign_bytes(private_key, &payload.canonical_bytes()?)?;
    Ok(SignedLicense {
        payload: payload.clone(),
        signature,
    })
}

/// Verify a decrypted envelope and return its payload.
pub fn verify_license(
    public_key: &RsaPublicKey,
    envelope: &SignedLicenseEnvelope,
) -> Result<LicensePayload, LicenseError> {
    let signature = envelope.signature_bytes()?;
    verify_bytes(public_key, &envelope.signed_bytes()?, &signature)?;
    envelope.payload()
}
