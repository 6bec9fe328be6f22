pub mod cache;
pub mod source;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use licensor_core::hybrid;
use licensor_core::keys::{decode_public, license_key_fingerprint};
use licensor_core::signing::verify_bytes;
use licensor_core::{Clock, KeyTrustStore, LicenseError, LicensePayload, SignedLicenseEnvelope, SystemClock};
use rsa::RsaPublicKey;

pub use cache::{ArtifactCache, CacheMeta};
pub use source::{ArtifactSource, HttpArtifactSource, OfflineSource};

pub const REASON_DOWNLOAD_FAILED: &str = "download failed";
pub const REASON_MALFORMED_ARTIFACT: &str = "malformed artifact";
pub const REASON_AUTHENTICATION: &str = "artifact authentication failed";
pub const REASON_MALFORMED_LICENSE: &str = "malformed license";
pub const REASON_SIGNATURE_MISMATCH: &str = "signature mismatch";
pub const REASON_INVALID_LICENSE_KEY: &str = "invalid license key";
pub const REASON_EXPIRED: &str = "license expired";

/// Outcome of one validation run.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Valid {
        payload: LicensePayload,
        expires_at: DateTime<Utc>,
    },
    Invalid {
        reason: String,
        /// Nothing could be validated because no artifact was obtainable.
        infrastructure: bool,
    },
}

impl Verdict {
    fn invalid(reason: &str) -> Self {
        Verdict::Invalid {
            reason: reason.to_string(),
            infrastructure: false,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid { .. })
    }

    pub fn is_infrastructure_failure(&self) -> bool {
        matches!(
            self,
            Verdict::Invalid {
                infrastructure: true,
                ..
            }
        )
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Verdict::Invalid { reason, .. } => Some(reason),
            Verdict::Valid { .. } => None,
        }
    }

    pub fn payload(&self) -> Option<&LicensePayload> {
        match self {
            Verdict::Valid { payload, .. } => Some(payload),
            Verdict::Invalid { .. } => None,
        }
    }

    /// Check if a feature flag is present in a valid license.
    pub fn has_feature(&self, feature: &str) -> bool {
        self.payload()
            .map(|p| p.feature(feature).is_some())
            .unwrap_or(false)
    }
}

/// Why a particular artifact was rejected. Every variant is curable by a
/// fresh artifact, so each one triggers the single re-fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    MalformedArtifact,
    Authentication,
    MalformedLicense,
    SignatureMismatch,
    Expired,
}

impl Rejection {
    fn reason(self) -> &'static str {
        match self {
            Rejection::MalformedArtifact => REASON_MALFORMED_ARTIFACT,
            Rejection::Authentication => REASON_AUTHENTICATION,
            Rejection::MalformedLicense => REASON_MALFORMED_LICENSE,
            Rejection::SignatureMismatch => REASON_SIGNATURE_MISMATCH,
            Rejection::Expired => REASON_EXPIRED,
        }
    }
}

/// Client-side license validator. Holds the embedded master key, a local
/// artifact cache and a way to download fresh artifacts.
pub struct LicenseValidator {
    store: KeyTrustStore,
    source: Box<dyn ArtifactSource>,
    cache: ArtifactCache,
    clock: Arc<dyn Clock>,
}

impl LicenseValidator {
    pub fn new(store: KeyTrustStore, source: Box<dyn ArtifactSource>, cache: ArtifactCache) -> Self {
        Self {
            store,
            source,
            cache,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Validate the license identified by `license_key` (base64 SPKI).
    ///
    /// Performs at most one download per call: either to fill an empty cache
    /// or to replace a cached artifact that failed validation.
    pub fn validate(&self, license_key: &str) -> Verdict {
        let public_key = match decode_public(license_key) {
            Ok(key) => key,
            Err(e) => {
                log::debug!("license key rejected: {}", e);
                return Verdict::invalid(REASON_INVALID_LICENSE_KEY);
            }
        };
        log::debug!(
            "validating license {}",
            license_key_fingerprint(license_key)
        );

        let mut downloaded = false;
        let mut artifact = match self.cache.load() {
            Some(cached) => {
                log::debug!("using cached artifact {}", self.cache.path().display());
                cached
            }
            None => {
                log::debug!("no cached artifact, downloading");
                match self.download(license_key) {
                    Ok(fresh) => {
                        downloaded = true;
                        fresh
                    }
                    Err(e) => {
                        log::warn!("License download failed: {}", e);
                        return Verdict::Invalid {
                            reason: REASON_DOWNLOAD_FAILED.to_string(),
                            infrastructure: true,
                        };
                    }
                }
            }
        };

        loop {
            let rejection = match self.check(&artifact, &public_key) {
                Ok((payload, expires_at)) => {
                    log::debug!("license {} valid until {}", payload.license_id, expires_at);
                    return Verdict::Valid {
                        payload,
                        expires_at,
                    };
                }
                Err(rejection) => rejection,
            };

            if downloaded {
                log::debug!("artifact rejected after download: {}", rejection.reason());
                return Verdict::invalid(rejection.reason());
            }

            log::debug!(
                "cached artifact rejected ({}), re-fetching once",
                rejection.reason()
            );
            match self.download(license_key) {
                Ok(fresh) => {
                    downloaded = true;
                    artifact = fresh;
                }
                Err(e) => {
                    log::warn!("License re-fetch failed: {}", e);
                    return Verdict::invalid(rejection.reason());
                }
            }
        }
    }

    /// Fetch and persist a fresh artifact. A failed cache write is logged and
    /// the in-memory artifact is still used.
    fn download(&self, license_key: &str) -> Result<String, LicenseError> {
        let artifact = self.source.fetch(license_key)?;
        let meta = CacheMeta::new(self.clock.now(), license_key);
        if let Err(e) = self.cache.store(&artifact, &meta) {
            log::warn!(
                "Could not persist license cache {}: {}",
                self.cache.path().display(),
                e
            );
        }
        Ok(artifact)
    }

    fn check(
        &self,
        artifact: &str,
        public_key: &RsaPublicKey,
    ) -> Result<(LicensePayload, DateTime<Utc>), Rejection> {
        let plaintext = hybrid::unwrap(artifact, self.store.master_private()).map_err(|e| match e {
            LicenseError::Authentication => Rejection::Authentication,
            _ => Rejection::MalformedArtifact,
        })?;

        let envelope =
            SignedLicenseEnvelope::from_bytes(&plaintext).map_err(|_| Rejection::MalformedLicense)?;
        let message = envelope
            .signed_bytes()
            .map_err(|_| Rejection::MalformedLicense)?;
        let signature = envelope
            .signature_bytes()
            .map_err(|_| Rejection::SignatureMismatch)?;
        verify_bytes(public_key, &message, &signature).map_err(|_| Rejection::SignatureMismatch)?;

        let payload = envelope.payload().map_err(|_| Rejection::MalformedLicense)?;
        let expires_at = payload
            .expires_at()
            .map_err(|_| Rejection::MalformedLicense)?;
        if self.clock.now() > expires_at {
            return Err(Rejection::Expired);
        }
        Ok((payload, expires_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;

    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use chrono::{Duration, TimeZone};
    use licensor_core::keys::{encode_public, generate_keypair, KeyKind, MasterKeyPair};
    use licensor_core::packager::package;
    use licensor_core::{FixedClock, IssueRequest, LicensePackager};
    use rsa::RsaPrivateKey;
    use serde_json::json;

    struct Keys {
        master: RsaPrivateKey,
        license: RsaPrivateKey,
        other_license: RsaPrivateKey,
    }

    fn keys() -> &'static Keys {
        static KEYS: OnceLock<Keys> = OnceLock::new();
        KEYS.get_or_init(|| Keys {
            master: generate_keypair(KeyKind::Master).unwrap().0,
            license: generate_keypair(KeyKind::License).unwrap().0,
            other_license: generate_keypair(KeyKind::License).unwrap().0,
        })
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn license_key() -> String {
        encode_public(&RsaPublicKey::from(&keys().license)).unwrap()
    }

    fn artifact_signed_by(signer: &RsaPrivateKey, validity_days: u32) -> String {
        let payload = LicensePayload::new(
            Some("lic-test".to_string()),
            "acme".to_string(),
            t0(),
            validity_days,
            json!({"edition": "pro"}).as_object().unwrap().clone(),
        )
        .unwrap();
        package(&payload, signer, &RsaPublicKey::from(&keys().master)).unwrap()
    }

    fn good_artifact() -> String {
        artifact_signed_by(&keys().license, 30)
    }

    /// Serves a fixed artifact (or fails) and counts calls.
    struct StubSource {
        artifact: Option<String>,
        calls: Arc<AtomicUsize>,
    }

    impl ArtifactSource for StubSource {
        fn fetch(&self, _license_key: &str) -> Result<String, LicenseError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.artifact
                .clone()
                .ok_or_else(|| LicenseError::DownloadFailure("stub offline".to_string()))
        }
    }

    struct Harness {
        validator: LicenseValidator,
        calls: Arc<AtomicUsize>,
        clock: Arc<FixedClock>,
        _dir: tempfile::TempDir,
    }

    fn harness(cached: Option<&str>, served: Option<String>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path().join("license.lic"));
        if let Some(content) = cached {
            std::fs::write(cache.path(), content).unwrap();
        }
        let calls = Arc::new(AtomicUsize::new(0));
        let source = StubSource {
            artifact: served,
            calls: calls.clone(),
        };
        let clock = Arc::new(FixedClock::new(t0() + Duration::days(1)));
        let validator = LicenseValidator::new(
            KeyTrustStore::for_validator(keys().master.clone()),
            Box::new(source),
            cache,
        )
        .with_clock(clock.clone());
        Harness {
            validator,
            calls,
            clock,
            _dir: dir,
        }
    }

    fn corrupt_ciphertext(artifact: &str) -> String {
        let (wrapped, frame) = artifact.trim().split_once(':').unwrap();
        let mut bytes = BASE64.decode(frame).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        format!("{}:{}", wrapped, BASE64.encode(bytes))
    }

    #[test]
    fn test_freshly_issued_license_is_valid() {
        let master = MasterKeyPair::from_private("m1".to_string(), keys().master.clone());
        let clock = Arc::new(FixedClock::new(t0()));
        let mut packager = LicensePackager::with_clock(KeyTrustStore::new(master), clock.clone());
        let issued = packager
            .issue_license(IssueRequest::new("acme", 1, json!({"seats": 3})), None)
            .unwrap();

        let h = harness(None, Some(issued.artifact.clone()));
        h.clock.set(t0());
        let verdict = h.validator.validate(&issued.license_key);
        assert!(verdict.is_valid(), "{:?}", verdict);
        assert!(verdict.has_feature("seats"));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.validator.cache().load().as_deref(), Some(issued.artifact.as_str()));
    }

    #[test]
    fn test_valid_cache_needs_no_download() {
        let h = harness(Some(&good_artifact()), None);
        let verdict = h.validator.validate(&license_key());
        assert!(verdict.is_valid());
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        if let Verdict::Valid { expires_at, payload } = verdict {
            assert_eq!(expires_at, t0() + Duration::days(30));
            assert_eq!(payload.tenant_id, "acme");
        }
    }

    #[test]
    fn test_corrupted_cache_heals_with_one_download() {
        let good = good_artifact();
        let h = harness(Some(&corrupt_ciphertext(&good)), Some(good.clone()));
        assert!(h.validator.validate(&license_key()).is_valid());
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.validator.cache().load().as_deref(), Some(good.as_str()));

        // The healed cache now validates offline
        assert!(h.validator.validate(&license_key()).is_valid());
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_corrupted_download_on_cache_miss_is_terminal() {
        let h = harness(None, Some(corrupt_ciphertext(&good_artifact())));
        let verdict = h.validator.validate(&license_key());
        assert_eq!(verdict.reason(), Some(REASON_AUTHENTICATION));
        assert!(!verdict.is_infrastructure_failure());
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_is_bounded_to_one_download() {
        let bad = corrupt_ciphertext(&good_artifact());
        let h = harness(Some(&bad), Some(bad.clone()));
        let verdict = h.validator.validate(&license_key());
        assert_eq!(verdict.reason(), Some(REASON_AUTHENTICATION));
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wrong_signer_offline_reports_signature_mismatch() {
        let forged = artifact_signed_by(&keys().other_license, 30);
        let h = harness(Some(&forged), None);
        let verdict = h.validator.validate(&license_key());
        assert_eq!(verdict.reason(), Some(REASON_SIGNATURE_MISMATCH));
        assert!(!verdict.is_infrastructure_failure());
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_missing_separator_is_malformed() {
        let h = harness(Some("bm8tc2VwYXJhdG9yLWhlcmU="), None);
        let verdict = h.validator.validate(&license_key());
        assert_eq!(verdict.reason(), Some(REASON_MALFORMED_ARTIFACT));
    }

    #[test]
    fn test_no_cache_and_no_network_is_infrastructure_failure() {
        let h = harness(None, None);
        let verdict = h.validator.validate(&license_key());
        assert_eq!(verdict.reason(), Some(REASON_DOWNLOAD_FAILED));
        assert!(verdict.is_infrastructure_failure());
        assert!(h.validator.cache().load().is_none());
    }

    #[test]
    fn test_expiry_boundary() {
        let h = harness(Some(&good_artifact()), None);
        let expiry = t0() + Duration::days(30);

        h.clock.set(expiry - Duration::seconds(1));
        assert!(h.validator.validate(&license_key()).is_valid());

        h.clock.set(expiry);
        assert!(h.validator.validate(&license_key()).is_valid());

        h.clock.set(expiry + Duration::seconds(1));
        let verdict = h.validator.validate(&license_key());
        assert_eq!(verdict.reason(), Some(REASON_EXPIRED));
    }

    #[test]
    fn test_expired_cache_replaced_by_renewed_artifact() {
        let renewed = artifact_signed_by(&keys().license, 90);
        let h = harness(Some(&good_artifact()), Some(renewed));
        h.clock.set(t0() + Duration::days(45));
        let verdict = h.validator.validate(&license_key());
        assert!(verdict.is_valid(), "{:?}", verdict);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_invalid_license_key_string() {
        let h = harness(Some(&good_artifact()), Some(good_artifact()));
        let verdict = h.validator.validate("definitely not a key");
        assert_eq!(verdict.reason(), Some(REASON_INVALID_LICENSE_KEY));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unwritable_cache_still_validates() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path().join("missing-dir").join("license.lic"));
        let good = good_artifact();
        let source = move |_: &str| -> Result<String, LicenseError> { Ok(good.clone()) };
        let validator = LicenseValidator::new(
            KeyTrustStore::for_validator(keys().master.clone()),
            Box::new(source),
            cache,
        )
        .with_clock(Arc::new(FixedClock::new(t0())));
        assert!(validator.validate(&license_key()).is_valid());
    }

    #[test]
    fn test_malformed_license_json() {
        let master_public = RsaPublicKey::from(&keys().master);
        let artifact = hybrid::wrap(b"{\"license\": 42}", &master_public).unwrap();
        let h = harness(Some(&artifact), None);
        let verdict = h.validator.validate(&license_key());
        assert_eq!(verdict.reason(), Some(REASON_MALFORMED_LICENSE));
    }

    #[test]
    fn test_out_of_range_validity_is_malformed_license() {
        let payload = LicensePayload {
            license_id: "lic-huge".to_string(),
            tenant_id: "acme".to_string(),
            issued_at: t0(),
            validity_days: 100_000_000,
            features: Default::default(),
        };
        let artifact =
            package(&payload, &keys().license, &RsaPublicKey::from(&keys().master)).unwrap();
        let h = harness(Some(&artifact), Some(artifact.clone()));
        let verdict = h.validator.validate(&license_key());
        assert_eq!(verdict.reason(), Some(REASON_MALFORMED_LICENSE));
        assert!(!verdict.is_infrastructure_failure());
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_reason_never_contains_key_material() {
        let h = harness(None, None);
        let key = license_key();
        let verdict = h.validator.validate(&key);
        let reason = verdict.reason().unwrap();
        assert!(!reason.contains(&key[..20]));
    }
}
