//! Operator-side diagnosis of a single artifact.
//!
//! Unlike the validator this never stops at the first problem it can report
//! on: decryption, signature and expiry are each judged on their own so a
//! support engineer can see *which* part of an artifact is wrong.

use chrono::{DateTime, Utc};
use rsa::RsaPrivateKey;
use serde::Serialize;

use crate::clock::Clock;
use crate::hybrid;
use crate::keys::decode_public;
use crate::license::{LicensePayload, SignedLicenseEnvelope};
use crate::signing::verify_bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsingStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureStatus {
    Verified,
    VerificationFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidityStatus {
    Valid,
    Expired,
    /// Payload could not be read, so expiry is unknown.
    Invalid,
}

#[derive(Debug, Clone, Serialize)]
pub struct InspectionReport {
    pub parsing: ParsingStatus,
    pub signature: SignatureStatus,
    pub validity: ValidityStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<LicensePayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl InspectionReport {
    fn failed(error: String) -> Self {
        Self {
            parsing: ParsingStatus::Failed,
            signature: SignatureStatus::VerificationFailed,
            validity: ValidityStatus::Invalid,
            payload: None,
            expires_at: None,
            error: Some(error),
        }
    }

    /// True only when every check passed.
    pub fn is_clean(&self) -> bool {
        self.parsing == ParsingStatus::Success
            && self.signature == SignatureStatus::Verified
            && self.validity == ValidityStatus::Valid
    }
}

/// Inspect `artifact` against the master private key and the license key it
/// was supposedly issued for.
pub fn inspect_artifact(
    artifact: &str,
    master_private: &RsaPrivateKey,
    license_key: &str,
    clock: &dyn Clock,
) -> InspectionReport {
    let plaintext = match hybrid::unwrap(artifact, master_private) {
        Ok(p) => p,
        Err(e) => return InspectionReport::failed(format!("cannot decrypt artifact: {}", e)),
    };
    let envelope = match SignedLicenseEnvelope::from_bytes(&plaintext) {
        Ok(env) => env,
        Err(e) => return InspectionReport::failed(format!("cannot parse license: {}", e)),
    };

    let mut errors = Vec::new();

    let signature = match check_signature(&envelope, license_key) {
        Ok(()) => SignatureStatus::Verified,
        Err(e) => {
            errors.push(e);
            SignatureStatus::VerificationFailed
        }
    };

    let (payload, validity, expires_at) = match envelope.payload() {
        Ok(payload) => match payload.expires_at() {
            Ok(expires_at) if clock.now() > expires_at => {
                errors.push(format!("expired at {}", expires_at.to_rfc3339()));
                (Some(payload), ValidityStatus::Expired, Some(expires_at))
            }
            Ok(expires_at) => (Some(payload), ValidityStatus::Valid, Some(expires_at)),
            Err(e) => {
                errors.push(e.to_string());
                (Some(payload), ValidityStatus::Invalid, None)
            }
        },
        Err(e) => {
            errors.push(format!("payload fields: {}", e));
            (None, ValidityStatus::Invalid, None)
        }
    };

    InspectionReport {
        parsing: ParsingStatus::Success,
        signature,
        validity,
        payload,
        expires_at,
        error: if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        },
    }
}

fn check_signature(envelope: &SignedLicenseEnvelope, license_key: &str) -> Result<(), String> {
    let public = decode_public(license_key).map_err(|e| format!("license key: {}", e))?;
    let message = envelope.signed_bytes().map_err(|e| e.to_string())?;
    let signature = envelope.signature_bytes().map_err(|e| e.to_string())?;
    verify_bytes(&public, &message, &signature).map_err(|e| e.to_string())
}
