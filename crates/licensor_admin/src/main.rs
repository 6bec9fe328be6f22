use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use licensor_core::db::{LicenseDb, LicenseRecord};
use licensor_core::keys::{
    encode_private, encode_public, license_key_fingerprint, load_private_key, private_key_to_pem,
    public_key_to_pem,
};
use licensor_core::{
    inspect_artifact, IssueRequest, KeyTrustStore, LicensePackager, MasterKeyPair, SystemClock,
    Template,
};

#[derive(Parser)]
#[command(name = "licensor-admin", about = "License issuance administration tool")]
struct Cli {
    /// Path to SQLite database
    #[arg(long, env = "LICENSOR_DB", default_value = "licenses.db", global = true)]
    db: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum MasterKeyAction {
    /// Make an existing master keypair the active one
    Import {
        /// File holding the master private key (PKCS8 PEM or base64 DER)
        #[arg(long)]
        private_key_file: String,
    },
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new master keypair and make it the active one
    Keygen,

    /// Print the active master key for embedding into validators
    MasterKey {
        /// Also print the private half
        #[arg(long)]
        private: bool,
        /// Print PKCS8/SPKI PEM instead of bare base64 DER
        #[arg(long)]
        pem: bool,
        #[command(subcommand)]
        action: Option<MasterKeyAction>,
    },

    /// List all master keys, active and retired
    MasterKeys,

    /// Issue a new license and write its artifact
    Create {
        /// Tenant the license belongs to
        #[arg(long)]
        tenant: String,
        /// Days of validity from now
        #[arg(long, default_value = "365")]
        days: u32,
        /// Feature payload as a JSON object
        #[arg(long, default_value = "{}")]
        features: String,
        /// JSON Schema (or template document) the features must satisfy
        #[arg(long)]
        template: Option<String>,
        /// Use this license id instead of a random UUID
        #[arg(long)]
        license_id: Option<String>,
        /// Output file for the artifact
        #[arg(long, default_value = "license.lic")]
        output: String,
    },

    /// Re-issue the artifact of an existing license under the active master key
    Export {
        /// License key (base64 public key)
        #[arg(long, required_unless_present = "id", conflicts_with = "id")]
        key: Option<String>,
        /// License id
        #[arg(long)]
        id: Option<String>,
        /// Output file for the artifact
        #[arg(long, default_value = "license.lic")]
        output: String,
    },

    /// List all licenses
    List,

    /// Decrypt and check an artifact file against the registry's master key
    Inspect {
        /// Artifact file
        #[arg(long)]
        file: String,
        /// License key (base64 public key) the artifact should belong to
        #[arg(long)]
        key: String,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let db = LicenseDb::open(&cli.db).with_context(|| format!("Failed to open {}", cli.db))?;
    log::debug!("using license registry {}", cli.db);

    match cli.command {
        Commands::Keygen => cmd_keygen(&db),
        Commands::MasterKey {
            action: Some(MasterKeyAction::Import { private_key_file }),
            ..
        } => cmd_import_master_key(&db, &private_key_file),
        Commands::MasterKey {
            private,
            pem,
            action: None,
        } => cmd_master_key(&db, private, pem),
        Commands::MasterKeys => cmd_master_keys(&db),
        Commands::Create {
            tenant,
            days,
            features,
            template,
            license_id,
            output,
        } => cmd_create(&db, tenant, days, &features, template, license_id, &output),
        Commands::Export { key, id, output } => cmd_export(&db, key, id, &output),
        Commands::List => cmd_list(&db),
        Commands::Inspect { file, key } => cmd_inspect(&db, &file, &key),
    }
}

fn cmd_keygen(db: &LicenseDb) -> Result<()> {
    println!("Generating master keypair...");
    let master = MasterKeyPair::generate()?;
    db.rotate_master_key(&master)?;

    println!("Master key {} is now active.", master.id);
    println!();
    println!("IMPORTANT: artifacts issued under the previous master key no longer");
    println!("decrypt. Rebuild validators and re-export licenses as needed.");
    Ok(())
}

fn cmd_master_key(db: &LicenseDb, private: bool, pem: bool) -> Result<()> {
    let master = db
        .active_master_key()
        .context("No active master key, run `licensor-admin keygen` first")?;

    println!("Master key id: {}", master.id);
    if pem {
        print!("{}", public_key_to_pem(&master.public_key)?);
        if private {
            print!("{}", private_key_to_pem(&master.private_key)?);
        }
        return Ok(());
    }
    println!("Public:  {}", encode_public(&master.public_key)?);
    if private {
        println!("Private: {}", encode_private(&master.private_key)?);
    }
    Ok(())
}

fn cmd_import_master_key(db: &LicenseDb, path: &str) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read master key file {}", path))?;
    let private_key = load_private_key(&text)
        .with_context(|| format!("{} is neither PKCS8 PEM nor base64 PKCS8", path))?;
    let master = db.import_master_key(private_key)?;

    println!("Master key {} is now active.", master.id);
    println!("Validators embedding this key accept newly exported artifacts.");
    Ok(())
}

fn cmd_master_keys(db: &LicenseDb) -> Result<()> {
    let keys = db.list_master_keys()?;
    if keys.is_empty() {
        println!("No master keys found.");
        return Ok(());
    }

    println!("{:<38} {:<8} {:<20} {}", "ID", "STATUS", "CREATED", "KEY");
    println!("{}", "-".repeat(86));
    for key in &keys {
        println!(
            "{:<38} {:<8} {:<20} {}",
            key.id,
            if key.is_active { "ACTIVE" } else { "RETIRED" },
            key.created_at.format("%Y-%m-%d %H:%M:%S"),
            license_key_fingerprint(&key.public_key),
        );
    }
    Ok(())
}

fn cmd_create(
    db: &LicenseDb,
    tenant: String,
    days: u32,
    features: &str,
    template_path: Option<String>,
    license_id: Option<String>,
    output: &str,
) -> Result<()> {
    let features: serde_json::Value =
        serde_json::from_str(features).context("--features must be valid JSON")?;

    let template = match template_path {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read template {}", path))?;
            Some(Template::from_json(&path, &raw)?)
        }
        None => None,
    };

    let master = db
        .active_master_key()
        .context("No active master key, run `licensor-admin keygen` first")?;
    let mut packager = LicensePackager::with_clock(KeyTrustStore::new(master), Arc::new(SystemClock));

    if let Some(id) = &license_id {
        if db.get_license(id)?.is_some() {
            bail!("License {} already exists", id);
        }
    }

    let mut request = IssueRequest::new(tenant, days, features);
    request.license_id = license_id;
    let issued = packager.issue_license(request, template.as_ref())?;

    db.insert_license(&LicenseRecord::from_issued(
        &issued,
        template.map(|t| t.id),
    ))?;
    std::fs::write(output, &issued.artifact)
        .with_context(|| format!("Failed to write artifact to {}", output))?;

    println!("License created successfully!");
    println!();
    println!("  ID:       {}", issued.license_id);
    println!("  Tenant:   {}", issued.payload.tenant_id);
    println!(
        "  Expires:  {}",
        issued.payload.expires_at()?.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("  Artifact: {}", output);
    println!();
    println!("License key:");
    println!("{}", issued.license_key);
    Ok(())
}

fn cmd_export(db: &LicenseDb, key: Option<String>, id: Option<String>, output: &str) -> Result<()> {
    let record = match (key, id) {
        (Some(key), _) => db
            .get_license_by_key(&key)?
            .with_context(|| format!("License key not found: {}", license_key_fingerprint(&key)))?,
        (None, Some(id)) => db
            .get_license(&id)?
            .with_context(|| format!("License not found: {}", id))?,
        (None, None) => bail!("Pass --key or --id"),
    };

    let packager = LicensePackager::new(db.load_trust_store()?);
    let artifact = packager.reissue(&record.payload())?;

    std::fs::write(output, &artifact)
        .with_context(|| format!("Failed to write artifact to {}", output))?;

    println!("Artifact exported to: {}", output);
    println!("  License: {}", record.license_id);
    let expires_at = record.expires_at()?;
    println!("  Expires: {}", expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if expires_at < Utc::now() {
        println!("  WARNING: this license has already expired");
    }
    Ok(())
}

fn cmd_list(db: &LicenseDb) -> Result<()> {
    let licenses = db.list_licenses()?;

    if licenses.is_empty() {
        println!("No licenses found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<20} {:<12} {:<8} {:<18} {}",
        "ID", "TENANT", "EXPIRES", "STATUS", "KEY", "FEATURES"
    );
    println!("{}", "-".repeat(110));

    let now = Utc::now();
    for lic in &licenses {
        let (expires, status) = match lic.expires_at() {
            Ok(at) if now > at => (at.format("%Y-%m-%d").to_string(), "EXPIRED"),
            Ok(at) => (at.format("%Y-%m-%d").to_string(), "ACTIVE"),
            Err(_) => ("-".to_string(), "INVALID"),
        };
        let features = serde_json::Value::Object(lic.features.clone()).to_string();
        println!(
            "{:<38} {:<20} {:<12} {:<8} {:<18} {}",
            lic.license_id,
            truncate(&lic.tenant_id, 18),
            expires,
            status,
            license_key_fingerprint(&lic.license_key),
            truncate(&features, 40),
        );
    }

    println!();
    println!("Total: {} license(s)", licenses.len());
    Ok(())
}

fn cmd_inspect(db: &LicenseDb, file: &str, key: &str) -> Result<()> {
    let artifact = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read artifact {}", file))?;
    let master = db
        .active_master_key()
        .context("No active master key, run `licensor-admin keygen` first")?;

    let report = inspect_artifact(&artifact, &master.private_key, key, &SystemClock);
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_clean() {
        bail!("Artifact did not pass inspection");
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}
