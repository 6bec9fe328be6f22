use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use licensor_core::LicenseError;

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Where fresh artifacts come from. The validator treats this as a black box
/// that either yields artifact text or fails.
pub trait ArtifactSource {
    fn fetch(&self, license_key: &str) -> Result<String, LicenseError>;
}

impl<F> ArtifactSource for F
where
    F: Fn(&str) -> Result<String, LicenseError>,
{
    fn fetch(&self, license_key: &str) -> Result<String, LicenseError> {
        self(license_key)
    }
}

/// Downloads artifacts from the license server's issue endpoint.
pub struct HttpArtifactSource {
    api_url: String,
    client: reqwest::blocking::Client,
}

impl HttpArtifactSource {
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self, LicenseError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LicenseError::DownloadFailure(format!("HTTP client: {}", e)))?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn issue_url(&self) -> String {
        format!("{}/api/licenses/issue", self.api_url)
    }
}

impl ArtifactSource for HttpArtifactSource {
    fn fetch(&self, license_key: &str) -> Result<String, LicenseError> {
        let encoded = BASE64.encode(license_key.trim().as_bytes());
        // without_url: the query string carries the license key
        let response = self
            .client
            .get(self.issue_url())
            .query(&[("encoded_license_key", encoded.as_str())])
            .send()
            .map_err(|e| {
                LicenseError::DownloadFailure(format!("HTTP request failed: {}", e.without_url()))
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(LicenseError::DownloadFailure(format!(
                "server returned {}",
                status
            )));
        }

        response.text().map_err(|e| {
            LicenseError::DownloadFailure(format!("reading response: {}", e.without_url()))
        })
    }
}

/// A source for hosts without network access. Every fetch fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineSource;

impl ArtifactSource for OfflineSource {
    fn fetch(&self, _license_key: &str) -> Result<String, LicenseError> {
        Err(LicenseError::DownloadFailure("offline mode".to_string()))
    }
}
