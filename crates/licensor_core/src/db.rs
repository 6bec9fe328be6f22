use chrono::{DateTime, Utc};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::LicenseError;
use crate::keys::{
    decode_private, encode_private, encode_public, KeyTrustStore, MasterKeyPair, MIN_KEY_BITS,
};
use crate::license::LicensePayload;
use crate::packager::IssuedLicense;

/// One issued license as the registry remembers it.
#[derive(Debug, Clone)]
pub struct LicenseRecord {
    pub license_id: String,
    pub tenant_id: String,
    pub template_id: Option<String>,
    pub license_key: String,
    pub license_private_key: RsaPrivateKey,
    pub issued_at: DateTime<Utc>,
    pub validity_days: u32,
    pub features: Map<String, Value>,
}

impl LicenseRecord {
    pub fn from_issued(issued: &IssuedLicense, template_id: Option<String>) -> Self {
        Self {
            license_id: issued.license_id.clone(),
            tenant_id: issued.payload.tenant_id.clone(),
            template_id,
            license_key: issued.license_key.clone(),
            license_private_key: issued.license_private_key.clone(),
            issued_at: issued.payload.issued_at,
            validity_days: issued.payload.validity_days,
            features: issued.payload.features.clone(),
        }
    }

    /// The payload exactly as it was signed at issuance.
    pub fn payload(&self) -> LicensePayload {
        LicensePayload {
            license_id: self.license_id.clone(),
            tenant_id: self.tenant_id.clone(),
            issued_at: self.issued_at,
            validity_days: self.validity_days,
            features: self.features.clone(),
        }
    }

    pub fn expires_at(&self) -> Result<DateTime<Utc>, LicenseError> {
        self.payload().expires_at()
    }
}

/// A master key row without its private half.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterKeyInfo {
    pub id: String,
    pub public_key: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

pub struct LicenseDb {
    conn: Connection,
}

const LICENSE_COLUMNS: &str =
    "id, tenant_id, template_id, license_key, license_secret, issued_at, validity_days, features";

impl LicenseDb {
    pub fn open(path: &str) -> Result<Self, LicenseError> {
        let conn = Connection::open(path)
            .map_err(|e| LicenseError::Registry(format!("DB open: {}", e)))?;
        let db = Self { conn };
        db.init_tables()?;
        Ok(db)
    }

    fn init_tables(&self) -> Result<(), LicenseError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS master_keys (
                id TEXT PRIMARY KEY,
                public_key TEXT NOT NULL,
                private_key TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS licenses (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                template_id TEXT,
                license_key TEXT NOT NULL UNIQUE,
                license_secret TEXT NOT NULL,
                issued_at TEXT NOT NULL,
                validity_days INTEGER NOT NULL,
                features TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_license_key ON licenses(license_key);
            CREATE INDEX IF NOT EXISTS idx_license_tenant ON licenses(tenant_id);",
            )
            .map_err(|e| LicenseError::Registry(format!("DB init: {}", e)))?;
        Ok(())
    }

    pub fn insert_master_key(&self, master: &MasterKeyPair, active: bool) -> Result<(), LicenseError> {
        self.conn
            .execute(
                "INSERT INTO master_keys (id, public_key, private_key, is_active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    master.id,
                    encode_public(&master.public_key)?,
                    encode_private(&master.private_key)?,
                    active as i32,
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| LicenseError::Registry(format!("DB insert master key: {}", e)))?;
        Ok(())
    }

    /// Make `next` the only active master key.
    pub fn rotate_master_key(&self, next: &MasterKeyPair) -> Result<(), LicenseError> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| LicenseError::Registry(format!("DB begin: {}", e)))?;
        tx.execute("UPDATE master_keys SET is_active = 0", [])
            .map_err(|e| LicenseError::Registry(format!("DB deactivate: {}", e)))?;
        self.insert_master_key(next, true)?;
        tx.commit()
            .map_err(|e| LicenseError::Registry(format!("DB commit: {}", e)))?;
        log::info!("master key {} is now active", next.id);
        Ok(())
    }

    /// Make an externally supplied master key the active one. A key that is
    /// already registered is reactivated under its existing id.
    pub fn import_master_key(&self, private_key: RsaPrivateKey) -> Result<MasterKeyPair, LicenseError> {
        let bits = private_key.size() * 8;
        if bits < MIN_KEY_BITS {
            return Err(LicenseError::KeyEncoding(format!(
                "master keys must be at least {} bits, got {}",
                MIN_KEY_BITS, bits
            )));
        }
        let public_key = encode_public(&RsaPublicKey::from(&private_key))?;
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM master_keys WHERE public_key = ?1",
                params![public_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| LicenseError::Registry(format!("DB query: {}", e)))?;

        match existing {
            Some(id) => {
                let tx = self
                    .conn
                    .unchecked_transaction()
                    .map_err(|e| LicenseError::Registry(format!("DB begin: {}", e)))?;
                tx.execute(
                    "UPDATE master_keys SET is_active = (id = ?1)",
                    params![id],
                )
                .map_err(|e| LicenseError::Registry(format!("DB activate: {}", e)))?;
                tx.commit()
                    .map_err(|e| LicenseError::Registry(format!("DB commit: {}", e)))?;
                log::info!("master key {} reactivated", id);
                Ok(MasterKeyPair::from_private(id, private_key))
            }
            None => {
                let master = MasterKeyPair::from_private(Uuid::new_v4().to_string(), private_key);
                self.rotate_master_key(&master)?;
                Ok(master)
            }
        }
    }

    /// All master keys, newest first.
    pub fn list_master_keys(&self) -> Result<Vec<MasterKeyInfo>, LicenseError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, public_key, is_active, created_at FROM master_keys
             ORDER BY created_at DESC, id",
            )
            .map_err(|e| LicenseError::Registry(format!("DB prepare: {}", e)))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| LicenseError::Registry(format!("DB query: {}", e)))?;

        let mut keys = Vec::new();
        for row in rows {
            let (id, public_key, is_active, created_str) =
                row.map_err(|e| LicenseError::Registry(format!("DB get: {}", e)))?;
            let created_at = DateTime::parse_from_rfc3339(&created_str)
                .map_err(|e| LicenseError::Registry(format!("Date parse: {}", e)))?
                .with_timezone(&Utc);
            keys.push(MasterKeyInfo {
                id,
                public_key,
                is_active,
                created_at,
            });
        }
        Ok(keys)
    }

    pub fn active_master_key(&self) -> Result<MasterKeyPair, LicenseError> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT id, private_key FROM master_keys WHERE is_active = 1
             ORDER BY created_at DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| LicenseError::Registry(format!("DB query: {}", e)))?;

        let (id, private_key) = row.ok_or(LicenseError::NoMasterKey)?;
        Ok(MasterKeyPair::from_private(id, decode_private(&private_key)?))
    }

    pub fn insert_license(&self, record: &LicenseRecord) -> Result<(), LicenseError> {
        let features_json = serde_json::to_string(&record.features)?;
        self.conn
            .execute(
                "INSERT INTO licenses (id, tenant_id, template_id, license_key, license_secret, issued_at, validity_days, features)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.license_id,
                    record.tenant_id,
                    record.template_id,
                    record.license_key,
                    encode_private(&record.license_private_key)?,
                    record.issued_at.to_rfc3339(),
                    record.validity_days,
                    features_json,
                ],
            )
            .map_err(|e| LicenseError::Registry(format!("DB insert: {}", e)))?;
        Ok(())
    }

    pub fn get_license(&self, license_id: &str) -> Result<Option<LicenseRecord>, LicenseError> {
        self.query_one(&format!("SELECT {} FROM licenses WHERE id = ?1", LICENSE_COLUMNS), license_id)
    }

    pub fn get_license_by_key(&self, license_key: &str) -> Result<Option<LicenseRecord>, LicenseError> {
        self.query_one(
            &format!("SELECT {} FROM licenses WHERE license_key = ?1", LICENSE_COLUMNS),
            license_key.trim(),
        )
    }

    fn query_one(&self, sql: &str, arg: &str) -> Result<Option<LicenseRecord>, LicenseError> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|e| LicenseError::Registry(format!("DB prepare: {}", e)))?;
        let mut rows = stmt
            .query(params![arg])
            .map_err(|e| LicenseError::Registry(format!("DB query: {}", e)))?;

        match rows
            .next()
            .map_err(|e| LicenseError::Registry(format!("DB next: {}", e)))?
        {
            Some(row) => Ok(Some(record_from_row(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_licenses(&self) -> Result<Vec<LicenseRecord>, LicenseError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM licenses ORDER BY issued_at DESC, id",
                LICENSE_COLUMNS
            ))
            .map_err(|e| LicenseError::Registry(format!("DB prepare: {}", e)))?;
        let mut rows = stmt
            .query([])
            .map_err(|e| LicenseError::Registry(format!("DB query: {}", e)))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| LicenseError::Registry(format!("DB next: {}", e)))?
        {
            records.push(record_from_row(row)?);
        }
        Ok(records)
    }

    /// Active master plus every stored license private key.
    pub fn load_trust_store(&self) -> Result<KeyTrustStore, LicenseError> {
        let mut store = KeyTrustStore::new(self.active_master_key()?);
        for record in self.list_licenses()? {
            store.insert_license_key(&record.license_id, record.license_private_key)?;
        }
        Ok(store)
    }
}

fn record_from_row(row: &Row<'_>) -> Result<LicenseRecord, LicenseError> {
    let get_err = |e: rusqlite::Error| LicenseError::Registry(format!("DB get: {}", e));

    let issued_str: String = row.get(5).map_err(get_err)?;
    let issued_at = DateTime::parse_from_rfc3339(&issued_str)
        .map_err(|e| LicenseError::Registry(format!("Date parse: {}", e)))?
        .with_timezone(&Utc);
    let secret: String = row.get(4).map_err(get_err)?;
    let features_json: String = row.get(7).map_err(get_err)?;

    Ok(LicenseRecord {
        license_id: row.get(0).map_err(get_err)?,
        tenant_id: row.get(1).map_err(get_err)?,
        template_id: row.get(2).map_err(get_err)?,
        license_key: row.get(3).map_err(get_err)?,
        license_private_key: decode_private(&secret)?,
        issued_at,
        validity_days: row.get(6).map_err(get_err)?,
        features: serde_json::from_str(&features_json)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::test_keys;
    use chrono::TimeZone;
    use serde_json::json;

    fn test_db() -> LicenseDb {
        LicenseDb::open(":memory:").unwrap()
    }

    fn record(id: &str, private_key: RsaPrivateKey) -> LicenseRecord {
        LicenseRecord {
            license_id: id.to_string(),
            tenant_id: "Test Corp".to_string(),
            template_id: Some("tpl-1".to_string()),
            license_key: encode_public(&RsaPublicKey::from(&private_key)).unwrap(),
            license_private_key: private_key,
            issued_at: Utc.with_ymd_and_hms(2026, 4, 1, 8, 0, 0).unwrap(),
            validity_days: 90,
            features: json!({"seats": 5}).as_object().unwrap().clone(),
        }
    }

    #[test]
    fn test_no_master_key_initially() {
        let db = test_db();
        assert!(matches!(
            db.active_master_key(),
            Err(LicenseError::NoMasterKey)
        ));
    }

    #[test]
    fn test_rotate_keeps_exactly_one_active() {
        let db = test_db();
        let first = MasterKeyPair::from_private("m1".to_string(), test_keys::master());
        let second = MasterKeyPair::from_private("m2".to_string(), test_keys::license_b());

        db.rotate_master_key(&first).unwrap();
        assert_eq!(db.active_master_key().unwrap().id, "m1");

        db.rotate_master_key(&second).unwrap();
        let active = db.active_master_key().unwrap();
        assert_eq!(active.id, "m2");
        assert_eq!(active.private_key, test_keys::license_b());

        let active_count: i64 = db
            .conn
            .query_row(
                "SELECT COUNT(*) FROM master_keys WHERE is_active = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(active_count, 1);
    }

    #[test]
    fn test_import_master_key() {
        let db = test_db();
        db.rotate_master_key(&MasterKeyPair::from_private(
            "generated".to_string(),
            test_keys::license_a(),
        ))
        .unwrap();

        let imported = db.import_master_key(test_keys::master()).unwrap();
        assert_ne!(imported.id, "generated");
        let active = db.active_master_key().unwrap();
        assert_eq!(active.id, imported.id);
        assert_eq!(active.private_key, test_keys::master());

        // Re-importing a known key reactivates it instead of duplicating it
        let again = db.import_master_key(test_keys::license_a()).unwrap();
        assert_eq!(again.id, "generated");
        assert_eq!(db.active_master_key().unwrap().id, "generated");
        assert_eq!(db.list_master_keys().unwrap().len(), 2);

        let small = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        assert!(matches!(
            db.import_master_key(small),
            Err(LicenseError::KeyEncoding(_))
        ));
        assert_eq!(db.active_master_key().unwrap().id, "generated");
    }

    #[test]
    fn test_list_master_keys() {
        let db = test_db();
        assert!(db.list_master_keys().unwrap().is_empty());

        db.rotate_master_key(&MasterKeyPair::from_private("m1".to_string(), test_keys::master()))
            .unwrap();
        db.rotate_master_key(&MasterKeyPair::from_private(
            "m2".to_string(),
            test_keys::license_b(),
        ))
        .unwrap();

        let keys = db.list_master_keys().unwrap();
        assert_eq!(keys.len(), 2);
        let active: Vec<&str> = keys
            .iter()
            .filter(|k| k.is_active)
            .map(|k| k.id.as_str())
            .collect();
        assert_eq!(active, vec!["m2"]);
        let m1 = keys.iter().find(|k| k.id == "m1").unwrap();
        assert_eq!(
            m1.public_key,
            encode_public(&RsaPublicKey::from(&test_keys::master())).unwrap()
        );
    }

    #[test]
    fn test_create_and_get_license() {
        let db = test_db();
        let rec = record("lic-1", test_keys::license_a());
        db.insert_license(&rec).unwrap();

        let by_id = db.get_license("lic-1").unwrap().unwrap();
        assert_eq!(by_id.tenant_id, "Test Corp");
        assert_eq!(by_id.template_id.as_deref(), Some("tpl-1"));
        assert_eq!(by_id.issued_at, rec.issued_at);
        assert_eq!(by_id.validity_days, 90);
        assert_eq!(by_id.features.get("seats"), Some(&json!(5)));
        assert_eq!(by_id.license_private_key, test_keys::license_a());
        assert_eq!(by_id.payload(), rec.payload());

        let by_key = db
            .get_license_by_key(&format!("{}\n", rec.license_key))
            .unwrap()
            .unwrap();
        assert_eq!(by_key.license_id, "lic-1");

        assert!(db.get_license("missing").unwrap().is_none());
        assert!(db.get_license_by_key("missing").unwrap().is_none());
    }

    #[test]
    fn test_license_key_is_unique() {
        let db = test_db();
        db.insert_license(&record("lic-1", test_keys::license_a()))
            .unwrap();
        let result = db.insert_license(&record("lic-2", test_keys::license_a()));
        assert!(matches!(result, Err(LicenseError::Registry(_))));
    }

    #[test]
    fn test_load_trust_store() {
        let db = test_db();
        db.rotate_master_key(&MasterKeyPair::from_private(
            "m1".to_string(),
            test_keys::master(),
        ))
        .unwrap();
        db.insert_license(&record("lic-a", test_keys::license_a()))
            .unwrap();
        db.insert_license(&record("lic-b", test_keys::license_b()))
            .unwrap();

        assert_eq!(db.list_licenses().unwrap().len(), 2);

        let store = db.load_trust_store().unwrap();
        assert_eq!(store.master_id(), "m1");
        assert_eq!(store.license_count(), 2);
        assert_eq!(
            *store.license_private_key("lic-b").unwrap(),
            test_keys::license_b()
        );
    }
}
