use thiserror::Error;

#[derive(Debug, Error)]
pub enum LicenseError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Key encoding error: {0}")]
    KeyEncoding(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Artifact framing is broken (separator, base64 or frame length).
    #[error("Malformed artifact: {0}")]
    Decode(String),

    /// Key unwrap or GCM tag check failed. Deliberately carries no detail.
    #[error("Artifact authentication failed")]
    Authentication,

    #[error("Payload rejected by template: {0}")]
    SchemaValidation(String),

    #[error("Signature mismatch")]
    SignatureMismatch,

    #[error("validity_days {0} puts expiry out of range")]
    ValidityOutOfRange(u32),

    #[error("License {0} already exists")]
    DuplicateLicense(String),

    #[error("License expired at {0}")]
    Expired(String),

    #[error("Download failed: {0}")]
    DownloadFailure(String),

    #[error("Payload is not canonically serializable: {0}")]
    Canonicalization(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Unknown license: {0}")]
    UnknownLicense(String),

    #[error("No active master key")]
    NoMasterKey,
}

impl LicenseError {
    /// Failures that a fresh artifact from the server could cure.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            LicenseError::Decode(_)
                | LicenseError::Authentication
                | LicenseError::SignatureMismatch
                | LicenseError::Expired(_)
                | LicenseError::Json(_)
                | LicenseError::Canonicalization(_)
        )
    }
}

#[cfg(feature = "db")]
impl From<rusqlite::Error> for LicenseError {
    fn from(e: rusqlite::Error) -> Self {
        LicenseError::Registry(e.to_string())
    }
}

impl From<base64::DecodeError> for LicenseError {
    fn from(e: base64::DecodeError) -> Self {
        LicenseError::KeyEncoding(format!("base64: {}", e))
    }
}
