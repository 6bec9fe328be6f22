//! Issuance side: payload → signature → hybrid wrap under the master key.

use std::sync::Arc;

use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::Value;

use crate::clock::{Clock, SystemClock};
use crate::error::LicenseError;
use crate::hybrid;
use crate::keys::{encode_public, generate_keypair, KeyKind, KeyTrustStore};
use crate::license::LicensePayload;
use crate::schema::{validate_features, Template};
use crate::signing::sign_license;

/// What the caller asks to be issued.
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub tenant_id: String,
    pub validity_days: u32,
    pub features: Value,
    /// Use this id instead of generating one.
    pub license_id: Option<String>,
}

impl IssueRequest {
    pub fn new(tenant_id: impl Into<String>, validity_days: u32, features: Value) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            validity_days,
            features,
            license_id: None,
        }
    }
}

/// Result of a successful issuance.
#[derive(Debug, Clone)]
pub struct IssuedLicense {
    pub license_id: String,
    /// base64 SPKI public key handed to the customer.
    pub license_key: String,
    pub payload: LicensePayload,
    pub artifact: String,
    /// Private half, for callers that persist it outside the trust store.
    pub license_private_key: RsaPrivateKey,
}

/// Sign `payload` with the license key and wrap it under the master public key.
pub fn package(
    payload: &LicensePayload,
    license_private: &RsaPrivateKey,
    master_public: &RsaPublicKey,
) -> Result<String, LicenseError> {
    let signed = sign_license(license_private, payload)?;
    hybrid::wrap(&signed.to_canonical_bytes()?, master_public)
}

pub struct LicensePackager {
    store: KeyTrustStore,
    clock: Arc<dyn Clock>,
}

impl LicensePackager {
    pub fn new(store: KeyTrustStore) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: KeyTrustStore, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &KeyTrustStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut KeyTrustStore {
        &mut self.store
    }

    /// Issue a new license. Nothing is recorded in the trust store unless the
    /// whole pipeline succeeds, so a failed issuance leaves no partial state.
    pub fn issue_license(
        &mut self,
        request: IssueRequest,
        template: Option<&Template>,
    ) -> Result<IssuedLicense, LicenseError> {
        let features = validate_features(template, &request.features)?;

        if let Some(id) = &request.license_id {
            if self.store.license_private_key(id).is_ok() {
                return Err(LicenseError::DuplicateLicense(id.clone()));
            }
        }

        let payload = LicensePayload::new(
            request.license_id,
            request.tenant_id,
            self.clock.now(),
            request.validity_days,
            features,
        )?;
        let (license_private, license_public) = generate_keypair(KeyKind::License)?;

        let artifact = package(&payload, &license_private, self.store.master_public())?;
        let license_key = encode_public(&license_public)?;

        self.store
            .insert_license_key(&payload.license_id, license_private.clone())?;

        log::info!(
            "issued license {} for tenant {} ({} days)",
            payload.license_id,
            payload.tenant_id,
            payload.validity_days
        );

        Ok(IssuedLicense {
            license_id: payload.license_id.clone(),
            license_key,
            payload,
            artifact,
            license_private_key: license_private,
        })
    }

    /// Produce a fresh artifact for an already issued payload, wrapped under
    /// the currently active master key.
    pub fn reissue(&self, payload: &LicensePayload) -> Result<String, LicenseError> {
        let license_private = self.store.license_private_key(&payload.license_id)?;
        let artifact = package(payload, license_private, self.store.master_public())?;
        log::debug!(
            "re-issued artifact for license {} under master {}",
            payload.license_id,
            self.store.master_id()
        );
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::keys::{decode_public, test_keys, MasterKeyPair};
    use crate::license::SignedLicenseEnvelope;
    use crate::signing::verify_license;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn packager() -> LicensePackager {
        let store = KeyTrustStore::new(MasterKeyPair::from_private(
            "m1".to_string(),
            test_keys::master(),
        ));
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2026, 5, 4, 10, 30, 0).unwrap());
        LicensePackager::with_clock(store, Arc::new(clock))
    }

    fn open(artifact: &str, master: &RsaPrivateKey) -> SignedLicenseEnvelope {
        let bytes = hybrid::unwrap(artifact, master).unwrap();
        SignedLicenseEnvelope::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn test_issue_produces_verifiable_artifact() {
        let mut packager = packager();
        let issued = packager
            .issue_license(IssueRequest::new("acme", 30, json!({"edition": "pro"})), None)
            .unwrap();

        let envelope = open(&issued.artifact, &test_keys::master());
        let public = decode_public(&issued.license_key).unwrap();
        let payload = verify_license(&public, &envelope).unwrap();

        assert_eq!(payload, issued.payload);
        assert_eq!(payload.tenant_id, "acme");
        assert_eq!(payload.validity_days, 30);
        assert_eq!(
            payload.issued_at,
            Utc.with_ymd_and_hms(2026, 5, 4, 10, 30, 0).unwrap()
        );
        assert_eq!(packager.store().license_count(), 1);
        assert_eq!(
            packager.store().license_key_string(&issued.license_id).unwrap(),
            issued.license_key
        );
    }

    #[test]
    fn test_schema_violation_aborts_issuance() {
        let mut packager = packager();
        let template = Template::new(
            "tpl",
            "tpl",
            json!({"type": "object", "required": ["seats"]}),
        );
        let result = packager.issue_license(
            IssueRequest::new("acme", 30, json!({"edition": "pro"})),
            Some(&template),
        );
        assert!(matches!(result, Err(LicenseError::SchemaValidation(_))));
        assert_eq!(packager.store().license_count(), 0);
    }

    #[test]
    fn test_zero_validity_aborts_issuance() {
        let mut packager = packager();
        let result = packager.issue_license(IssueRequest::new("acme", 0, json!({})), None);
        assert!(result.is_err());
        assert_eq!(packager.store().license_count(), 0);
    }

    #[test]
    fn test_out_of_range_validity_aborts_issuance() {
        let mut packager = packager();
        let result =
            packager.issue_license(IssueRequest::new("acme", 100_000_000, json!({})), None);
        assert!(matches!(result, Err(LicenseError::SchemaValidation(_))));
        assert_eq!(packager.store().license_count(), 0);
    }

    #[test]
    fn test_float_feature_aborts_issuance() {
        let mut packager = packager();
        let result =
            packager.issue_license(IssueRequest::new("acme", 3, json!({"ratio": 0.5})), None);
        assert!(matches!(result, Err(LicenseError::Canonicalization(_))));
        assert_eq!(packager.store().license_count(), 0);
    }

    #[test]
    fn test_duplicate_license_id_refused() {
        let mut packager = packager();
        let mut request = IssueRequest::new("acme", 3, json!({}));
        request.license_id = Some("fixed-id".to_string());
        packager.issue_license(request.clone(), None).unwrap();
        assert!(matches!(
            packager.issue_license(request, None),
            Err(LicenseError::DuplicateLicense(id)) if id == "fixed-id"
        ));
    }

    #[test]
    fn test_each_license_gets_its_own_key() {
        let mut packager = packager();
        let a = packager
            .issue_license(IssueRequest::new("acme", 3, json!({})), None)
            .unwrap();
        let b = packager
            .issue_license(IssueRequest::new("acme", 3, json!({})), None)
            .unwrap();
        assert_ne!(a.license_id, b.license_id);
        assert_ne!(a.license_key, b.license_key);
    }

    #[test]
    fn test_reissue_after_master_rotation() {
        let mut packager = packager();
        let issued = packager
            .issue_license(IssueRequest::new("acme", 30, json!({})), None)
            .unwrap();

        let next = MasterKeyPair::from_private("m2".to_string(), test_keys::license_b());
        packager.store_mut().rotate_master(next);

        // Old artifact no longer opens under the new master
        assert!(matches!(
            hybrid::unwrap(&issued.artifact, packager.store().master_private()),
            Err(LicenseError::Authentication)
        ));

        let fresh = packager.reissue(&issued.payload).unwrap();
        let envelope = open(&fresh, &test_keys::license_b());
        let public = decode_public(&issued.license_key).unwrap();
        assert_eq!(verify_license(&public, &envelope).unwrap(), issued.payload);
    }

    #[test]
    fn test_reissue_unknown_license() {
        let packager = packager();
        let payload = LicensePayload::new(
            Some("nobody".to_string()),
            "acme".to_string(),
            Utc::now(),
            1,
            Default::default(),
        )
        .unwrap();
        assert!(matches!(
            packager.reissue(&payload),
            Err(LicenseError::UnknownLicense(_))
        ));
    }
}
