pub mod canonical;
pub mod clock;
#[cfg(feature = "db")]
pub mod db;
pub mod error;
pub mod hybrid;
pub mod inspect;
pub mod keys;
pub mod license;
pub mod packager;
pub mod schema;
pub mod signing;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::LicenseError;
pub use inspect::{inspect_artifact, InspectionReport};
pub use keys::{decode_private, decode_public, encode_private, encode_public, KeyTrustStore, MasterKeyPair};
pub use license::{LicensePayload, SignedLicense, SignedLicenseEnvelope};
pub use packager::{IssueRequest, IssuedLicense, LicensePackager};
pub use schema::Template;
pub use signing::{sign_license, verify_license};
