use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use licensor_client::cache::DEFAULT_CACHE_PATH;
use licensor_client::source::{DEFAULT_API_URL, DEFAULT_TIMEOUT_SECS};
use licensor_client::{
    ArtifactCache, ArtifactSource, HttpArtifactSource, LicenseValidator, OfflineSource, Verdict,
};
use licensor_core::keys::load_private_key;
use licensor_core::KeyTrustStore;

/// Master private key baked in at build time, if any.
const EMBEDDED_MASTER_KEY: Option<&str> = option_env!("LICENSOR_EMBEDDED_MASTER_KEY");

const EXIT_VALID: u8 = 0;
const EXIT_INVALID: u8 = 1;
const EXIT_INFRASTRUCTURE: u8 = 2;

#[derive(Parser)]
#[command(name = "licensor-validate", about = "Validate a license against its cached or downloaded artifact")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a license and exit 0 (valid), 1 (invalid) or 2 (no artifact obtainable)
    Validate {
        /// License key (base64 public key)
        #[arg(env = "LICENSE_KEY", hide_env_values = true)]
        license_key: String,
        /// License server base URL
        #[arg(long, env = "LICENSOR_API_URL", default_value = DEFAULT_API_URL)]
        api_url: String,
        /// Path of the cached artifact
        #[arg(long, env = "LICENSOR_CACHE_PATH", default_value = DEFAULT_CACHE_PATH)]
        cache_path: String,
        /// File holding the master private key (PKCS8 PEM or base64 DER)
        #[arg(long)]
        master_key_file: Option<String>,
        /// Base64 PKCS8 master private key
        #[arg(long, env = "LICENSOR_MASTER_KEY", hide_env_values = true)]
        master_key: Option<String>,
        /// Never contact the license server
        #[arg(long)]
        offline: bool,
        /// HTTP timeout in seconds
        #[arg(long, env = "LICENSOR_HTTP_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
        timeout_secs: u64,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Validate {
            license_key,
            api_url,
            cache_path,
            master_key_file,
            master_key,
            offline,
            timeout_secs,
        } => cmd_validate(
            &license_key,
            &api_url,
            &cache_path,
            master_key_file,
            master_key,
            offline,
            timeout_secs,
        ),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_INFRASTRUCTURE)
        }
    }
}

fn cmd_validate(
    license_key: &str,
    api_url: &str,
    cache_path: &str,
    master_key_file: Option<String>,
    master_key: Option<String>,
    offline: bool,
    timeout_secs: u64,
) -> Result<u8> {
    let master_private =
        load_private_key(&resolve_master_key(master_key_file, master_key, EMBEDDED_MASTER_KEY)?)
            .context("Master private key is neither PKCS8 PEM nor base64 PKCS8")?;

    let source: Box<dyn ArtifactSource> = if offline {
        Box::new(OfflineSource)
    } else {
        Box::new(HttpArtifactSource::new(
            api_url,
            Duration::from_secs(timeout_secs),
        )?)
    };

    let validator = LicenseValidator::new(
        KeyTrustStore::for_validator(master_private),
        source,
        ArtifactCache::new(cache_path),
    );

    let verdict = validator.validate(license_key);
    match &verdict {
        Verdict::Valid { expires_at, .. } => {
            println!("License is valid (expires {})", expires_at.format("%Y-%m-%d %H:%M:%S UTC"))
        }
        Verdict::Invalid { reason, .. } => eprintln!("License invalid: {}", reason),
    }
    Ok(exit_status(&verdict))
}

fn exit_status(verdict: &Verdict) -> u8 {
    if verdict.is_valid() {
        EXIT_VALID
    } else if verdict.is_infrastructure_failure() {
        EXIT_INFRASTRUCTURE
    } else {
        EXIT_INVALID
    }
}

/// Flag file first, then the env/flag value, then the build-time key.
fn resolve_master_key(
    file: Option<String>,
    inline: Option<String>,
    embedded: Option<&str>,
) -> Result<String> {
    if let Some(path) = file {
        return std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read master key file {}", path));
    }
    if let Some(key) = inline {
        return Ok(key);
    }
    match embedded {
        Some(key) => Ok(key.to_string()),
        None => bail!(
            "No master key: pass --master-key-file, set LICENSOR_MASTER_KEY, \
             or build with LICENSOR_EMBEDDED_MASTER_KEY"
        ),
    }
}
