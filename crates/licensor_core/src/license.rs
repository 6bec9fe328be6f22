use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::canonical::{canonical_value_bytes, to_canonical_bytes};
use crate::error::LicenseError;

/// The record that gets signed. Field names are part of the wire contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LicensePayload {
    pub license_id: String,
    pub tenant_id: String,
    pub issued_at: DateTime<Utc>,
    pub validity_days: u32,
    /// Template-validated entitlements.
    #[serde(default)]
    pub features: Map<String, Value>,
}

impl LicensePayload {
    /// Build a payload issued at `now`, truncated to whole seconds.
    pub fn new(
        license_id: Option<String>,
        tenant_id: String,
        issued_at: DateTime<Utc>,
        validity_days: u32,
        features: Map<String, Value>,
    ) -> Result<Self, LicenseError> {
        if validity_days == 0 {
            return Err(LicenseError::SchemaValidation(
                "validity_days must be positive".to_string(),
            ));
        }
        let payload = Self {
            license_id: license_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            tenant_id,
            issued_at: issued_at.trunc_subsecs(0),
            validity_days,
            features,
        };
        payload
            .expires_at()
            .map_err(|e| LicenseError::SchemaValidation(e.to_string()))?;
        Ok(payload)
    }

    /// Fails when `issued_at + validity_days` is not a representable instant.
    pub fn expires_at(&self) -> Result<DateTime<Utc>, LicenseError> {
        self.issued_at
            .checked_add_signed(Duration::days(i64::from(self.validity_days)))
            .ok_or(LicenseError::ValidityOutOfRange(self.validity_days))
    }

    /// Expired strictly after `issued_at + validity_days`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> Result<bool, LicenseError> {
        Ok(now > self.expires_at()?)
    }

    pub fn canonical_bytes(&self) -> Result<Vec<u8>, LicenseError> {
        to_canonical_bytes(self)
    }

    pub fn feature(&self, name: &str) -> Option<&Value> {
        self.features.get(name)
    }
}

/// Payload plus the license key's signature over its canonical bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedLicense {
    pub payload: LicensePayload,
    pub signature: Vec<u8>,
}

/// JSON form inside an artifact. `license` stays an untyped value so that the
/// verifier re-canonicalizes exactly what the issuer signed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedLicenseEnvelope {
    pub license: Value,
    pub signature: String,
}

impl SignedLicense {
    pub fn to_envelope(&self) -> Result<SignedLicenseEnvelope, LicenseError> {
        Ok(SignedLicenseEnvelope {
            license: serde_json::to_value(&self.payload)?,
            signature: BASE64.encode(&self.signature),
        })
    }

    /// Canonical bytes of the whole signed license, ready for wrapping.
    pub fn to_canonical_bytes(&self) -> Result<Vec<u8>, LicenseError> {
        to_canonical_bytes(&self.to_envelope()?)
    }
}

impl SignedLicenseEnvelope {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LicenseError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// The exact bytes the signature must cover.
    pub fn signed_bytes(&self) -> Result<Vec<u8>, LicenseError> {
        canonical_value_bytes(&self.license)
    }

    pub fn signature_bytes(&self) -> Result<Vec<u8>, LicenseError> {
        // A signature that cannot even be decoded cannot match.
        BASE64
            .decode(self.signature.trim())
            .map_err(|_| LicenseError::SignatureMismatch)
    }

    pub fn payload(&self) -> Result<LicensePayload, LicenseError> {
        let payload: LicensePayload = serde_json::from_value(self.license.clone())?;
        if payload.validity_days == 0 {
            return Err(LicenseError::Decode(
                "validity_days must be positive".to_string(),
            ));
        }
        payload
            .expires_at()
            .map_err(|e| LicenseError::Decode(e.to_string()))?;
        Ok(payload)
    }
}
