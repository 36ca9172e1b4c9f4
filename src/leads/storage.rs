use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::integrations::CrmType;

pub struct Storage {
    conn: Connection,
}

/// A sales rep with a known Dynamics system user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepRecord {
    pub id: i64,
    pub name: String,
    pub rep_code: Option<String>,
    pub dynamics_user_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewCrmConnection {
    #[serde(default)]
    pub tenant_id: i64,
    pub crm_type: String,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub tenant_id_crm: Option<String>,
    pub instance_url: Option<String>,
    pub tag_id: Option<String>,
    #[serde(default)]
    pub field_mappings: Option<serde_json::Value>,
    #[serde(default = "default_true")]
    pub sync_enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct CrmConnectionRow {
    pub id: i64,
    pub tenant_id: i64,
    pub crm_type: String,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub tenant_id_crm: Option<String>,
    pub instance_url: Option<String>,
    pub tag_id: Option<String>,
    pub field_mappings: Option<String>,
    pub is_active: bool,
    pub sync_enabled: bool,
    pub connection_status: Option<String>,
    pub last_sync_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeshowCredentialsRow {
    pub tradeshow_id: i64,
    pub api_url: Option<String>,
    pub api_key: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub tenant_id_crm: Option<String>,
    pub instance_url: Option<String>,
    #[serde(default)]
    pub field_mappings: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredSubmission {
    pub id: String,
    pub tenant_id: Option<i64>,
    pub tradeshow_id: Option<i64>,
    pub rep_code: Option<String>,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub company: Option<String>,
    pub phone: Option<String>,
    pub country: Option<String>,
    pub comments: Option<String>,
    pub photo_path: Option<String>,
    pub created_at: String,
}

impl Storage {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(db_path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS tenants (
                id INTEGER PRIMARY KEY,
                slug TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                default_country TEXT
            );

            CREATE TABLE IF NOT EXISTS tradeshows (
                id INTEGER PRIMARY KEY,
                tenant_id INTEGER NOT NULL REFERENCES tenants(id),
                slug TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                default_country TEXT,
                ac_tag_id TEXT
            );

            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                tenant_id INTEGER REFERENCES tenants(id),
                name TEXT NOT NULL,
                rep_code TEXT,
                email TEXT,
                dynamics_user_id TEXT
            );

            CREATE TABLE IF NOT EXISTS tenant_crm_connections (
                id INTEGER PRIMARY KEY,
                tenant_id INTEGER NOT NULL REFERENCES tenants(id),
                crm_type TEXT NOT NULL,
                api_url TEXT,
                api_key TEXT,
                client_id TEXT,
                client_secret TEXT,
                tenant_id_crm TEXT,
                instance_url TEXT,
                tag_id TEXT,
                field_mappings TEXT,
                is_active INTEGER NOT NULL DEFAULT 1,
                sync_enabled INTEGER NOT NULL DEFAULT 1,
                connection_status TEXT,
                last_sync_at TEXT,
                UNIQUE (tenant_id, crm_type)
            );

            CREATE TABLE IF NOT EXISTS tradeshow_credentials (
                tradeshow_id INTEGER PRIMARY KEY REFERENCES tradeshows(id),
                api_url TEXT,
                api_key TEXT,
                client_id TEXT,
                client_secret TEXT,
                tenant_id_crm TEXT,
                instance_url TEXT,
                field_mappings TEXT
            );

            CREATE TABLE IF NOT EXISTS lead_submissions (
                id TEXT PRIMARY KEY,
                tenant_id INTEGER,
                tradeshow_id INTEGER,
                rep_code TEXT,
                email TEXT NOT NULL,
                first_name TEXT NOT NULL,
                last_name TEXT NOT NULL,
                company TEXT,
                phone TEXT,
                country TEXT,
                comments TEXT,
                photo_path TEXT,
                created_at TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self { conn })
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn insert_tenant(
        &self,
        slug: &str,
        name: &str,
        default_country: Option<&str>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO tenants (slug, name, default_country) VALUES (?1, ?2, ?3)",
            params![slug, name, default_country],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_tradeshow(
        &self,
        tenant_id: i64,
        slug: &str,
        name: &str,
        default_country: Option<&str>,
        ac_tag_id: Option<&str>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO tradeshows (tenant_id, slug, name, default_country, ac_tag_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![tenant_id, slug, name, default_country, ac_tag_id],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_user(
        &self,
        tenant_id: Option<i64>,
        name: &str,
        rep_code: Option<&str>,
        dynamics_user_id: Option<&str>,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO users (tenant_id, name, rep_code, dynamics_user_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![tenant_id, name, rep_code, dynamics_user_id],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Reps that can own Dynamics leads, in insertion order. `None` lists every tenant's reps.
    pub fn reps_with_dynamics_ids(&self, tenant_id: Option<i64>) -> Result<Vec<RepRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, rep_code, dynamics_user_id FROM users
             WHERE dynamics_user_id IS NOT NULL AND dynamics_user_id != ''
               AND (?1 IS NULL OR tenant_id = ?1)
             ORDER BY id",
        )?;

        let reps = stmt
            .query_map(params![tenant_id], rep_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(reps)
    }

    pub fn find_rep_by_code(
        &self,
        tenant_id: Option<i64>,
        rep_code: &str,
    ) -> Result<Option<RepRecord>> {
        let rep = self
            .conn
            .query_row(
                "SELECT id, name, rep_code, dynamics_user_id FROM users
                 WHERE rep_code = ?1
                   AND dynamics_user_id IS NOT NULL AND dynamics_user_id != ''
                   AND (?2 IS NULL OR tenant_id = ?2)
                 ORDER BY id LIMIT 1",
                params![rep_code, tenant_id],
                rep_from_row,
            )
            .optional()?;
        Ok(rep)
    }

    /// Inserts or replaces the connection for `(tenant, crm_type)`, reactivating it.
    pub fn upsert_crm_connection(&self, new: &NewCrmConnection) -> Result<i64> {
        let crm_type: CrmType = new.crm_type.parse()?;
        let mappings = new.field_mappings.as_ref().map(|v| v.to_string());

        self.conn.execute(
            "INSERT INTO tenant_crm_connections
                (tenant_id, crm_type, api_url, api_key, client_id, client_secret,
                 tenant_id_crm, instance_url, tag_id, field_mappings, is_active, sync_enabled)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11)
             ON CONFLICT (tenant_id, crm_type) DO UPDATE SET
                api_url = excluded.api_url,
                api_key = excluded.api_key,
                client_id = excluded.client_id,
                client_secret = excluded.client_secret,
                tenant_id_crm = excluded.tenant_id_crm,
                instance_url = excluded.instance_url,
                tag_id = excluded.tag_id,
                field_mappings = excluded.field_mappings,
                is_active = 1,
                sync_enabled = excluded.sync_enabled",
            params![
                new.tenant_id,
                crm_type.as_str(),
                new.api_url,
                new.api_key,
                new.client_id,
                new.client_secret,
                new.tenant_id_crm,
                new.instance_url,
                new.tag_id,
                mappings,
                new.sync_enabled,
            ],
        )?;

        let id = self.conn.query_row(
            "SELECT id FROM tenant_crm_connections WHERE tenant_id = ?1 AND crm_type = ?2",
            params![new.tenant_id, crm_type.as_str()],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Soft-deletes a connection. Returns false when no active row matched.
    pub fn deactivate_crm_connection(&self, tenant_id: i64, crm_type: CrmType) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE tenant_crm_connections SET is_active = 0, sync_enabled = 0
             WHERE tenant_id = ?1 AND crm_type = ?2 AND is_active = 1",
            params![tenant_id, crm_type.as_str()],
        )?;
        Ok(changed > 0)
    }

    pub fn crm_connections(&self, tenant_id: i64) -> Result<Vec<CrmConnectionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, tenant_id, crm_type, api_url, api_key, client_id, client_secret,
                    tenant_id_crm, instance_url, tag_id, field_mappings, is_active,
                    sync_enabled, connection_status, last_sync_at
             FROM tenant_crm_connections WHERE tenant_id = ?1 ORDER BY crm_type",
        )?;

        let rows = stmt
            .query_map(params![tenant_id], |row| {
                Ok(CrmConnectionRow {
                    id: row.get(0)?,
                    tenant_id: row.get(1)?,
                    crm_type: row.get(2)?,
                    api_url: row.get(3)?,
                    api_key: row.get(4)?,
                    client_id: row.get(5)?,
                    client_secret: row.get(6)?,
                    tenant_id_crm: row.get(7)?,
                    instance_url: row.get(8)?,
                    tag_id: row.get(9)?,
                    field_mappings: row.get(10)?,
                    is_active: row.get(11)?,
                    sync_enabled: row.get(12)?,
                    connection_status: row.get(13)?,
                    last_sync_at: row.get(14)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_connection_status(&self, connection_id: i64, status: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE tenant_crm_connections SET connection_status = ?1 WHERE id = ?2",
            params![status, connection_id],
        )?;
        Ok(())
    }

    /// Stamps `last_sync_at` on every active connection of the tenant.
    pub fn mark_synced(&self, tenant_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE tenant_crm_connections SET last_sync_at = ?1
             WHERE tenant_id = ?2 AND is_active = 1",
            params![chrono::Utc::now().to_rfc3339(), tenant_id],
        )?;
        Ok(())
    }

    pub fn upsert_tradeshow_credentials(&self, creds: &TradeshowCredentialsRow) -> Result<()> {
        let mappings = creds.field_mappings.as_ref().map(|v| v.to_string());
        self.conn.execute(
            "INSERT OR REPLACE INTO tradeshow_credentials
                (tradeshow_id, api_url, api_key, client_id, client_secret,
                 tenant_id_crm, instance_url, field_mappings)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                creds.tradeshow_id,
                creds.api_url,
                creds.api_key,
                creds.client_id,
                creds.client_secret,
                creds.tenant_id_crm,
                creds.instance_url,
                mappings,
            ],
        )?;
        Ok(())
    }

    pub fn insert_submission(&self, submission: &StoredSubmission) -> Result<()> {
        self.conn.execute(
            "INSERT INTO lead_submissions
                (id, tenant_id, tradeshow_id, rep_code, email, first_name, last_name,
                 company, phone, country, comments, photo_path, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                submission.id,
                submission.tenant_id,
                submission.tradeshow_id,
                submission.rep_code,
                submission.email,
                submission.first_name,
                submission.last_name,
                submission.company,
                submission.phone,
                submission.country,
                submission.comments,
                submission.photo_path,
                submission.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn submission(&self, id: &str) -> Result<Option<StoredSubmission>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, tenant_id, tradeshow_id, rep_code, email, first_name, last_name,
                        company, phone, country, comments, photo_path, created_at
                 FROM lead_submissions WHERE id = ?1",
                params![id],
                |row| {
                    Ok(StoredSubmission {
                        id: row.get(0)?,
                        tenant_id: row.get(1)?,
                        tradeshow_id: row.get(2)?,
                        rep_code: row.get(3)?,
                        email: row.get(4)?,
                        first_name: row.get(5)?,
                        last_name: row.get(6)?,
                        company: row.get(7)?,
                        phone: row.get(8)?,
                        country: row.get(9)?,
                        comments: row.get(10)?,
                        photo_path: row.get(11)?,
                        created_at: row.get(12)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }
}

fn rep_from_row(row: &Row<'_>) -> rusqlite::Result<RepRecord> {
    Ok(RepRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        rep_code: row.get(2)?,
        dynamics_user_id: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(tenant_id: i64, crm_type: &str) -> NewCrmConnection {
        NewCrmConnection {
            tenant_id,
            crm_type: crm_type.to_string(),
            api_url: Some("https://acme.api-us1.com".into()),
            api_key: Some("key".into()),
            sync_enabled: true,
            ..Default::default()
        }
    }

    #[test]
    fn upsert_keeps_one_row_per_tenant_and_type() {
        let storage = Storage::open_in_memory().unwrap();
        let tenant = storage.insert_tenant("acme", "Acme", Some("Canada")).unwrap();

        let first = storage.upsert_crm_connection(&connection(tenant, "activecampaign")).unwrap();
        let mut changed = connection(tenant, "activecampaign");
        changed.api_key = Some("rotated".into());
        let second = storage.upsert_crm_connection(&changed).unwrap();

        assert_eq!(first, second);
        let rows = storage.crm_connections(tenant).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].api_key.as_deref(), Some("rotated"));
    }

    #[test]
    fn unknown_crm_type_is_rejected() {
        let storage = Storage::open_in_memory().unwrap();
        let tenant = storage.insert_tenant("acme", "Acme", None).unwrap();

        let err = storage
            .upsert_crm_connection(&connection(tenant, "salesforce"))
            .unwrap_err();
        assert_eq!(err.kind(), "unsupported-type");
    }

    #[test]
    fn deactivation_is_soft() {
        let storage = Storage::open_in_memory().unwrap();
        let tenant = storage.insert_tenant("acme", "Acme", None).unwrap();
        storage.upsert_crm_connection(&connection(tenant, "activecampaign")).unwrap();

        assert!(storage.deactivate_crm_connection(tenant, CrmType::ActiveCampaign).unwrap());
        assert!(!storage.deactivate_crm_connection(tenant, CrmType::ActiveCampaign).unwrap());

        let rows = storage.crm_connections(tenant).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].is_active);
        assert!(!rows[0].sync_enabled);
    }

    #[test]
    fn reps_are_scoped_to_tenant_and_require_dynamics_id() {
        let storage = Storage::open_in_memory().unwrap();
        let acme = storage.insert_tenant("acme", "Acme", None).unwrap();
        let other = storage.insert_tenant("other", "Other", None).unwrap();
        storage
            .insert_user(Some(acme), "Malina Fontaine", Some("malina"), Some("guid-1"))
            .unwrap();
        storage.insert_user(Some(acme), "No Dynamics", Some("nod"), None).unwrap();
        storage.insert_user(Some(acme), "Blank Dynamics", Some("blank"), Some("")).unwrap();
        storage
            .insert_user(Some(other), "Patrick Poetsch", Some("patrick"), Some("guid-2"))
            .unwrap();

        let reps = storage.reps_with_dynamics_ids(Some(acme)).unwrap();
        assert_eq!(reps.len(), 1);
        assert_eq!(reps[0].name, "Malina Fontaine");

        assert_eq!(storage.reps_with_dynamics_ids(None).unwrap().len(), 2);

        let rep = storage.find_rep_by_code(Some(other), "patrick").unwrap().unwrap();
        assert_eq!(rep.dynamics_user_id, "guid-2");
        assert!(storage.find_rep_by_code(Some(acme), "patrick").unwrap().is_none());
        assert!(storage.find_rep_by_code(Some(acme), "nod").unwrap().is_none());
        assert!(storage.find_rep_by_code(Some(acme), "blank").unwrap().is_none());
    }

    #[test]
    fn mark_synced_stamps_active_connections() {
        let storage = Storage::open_in_memory().unwrap();
        let tenant = storage.insert_tenant("acme", "Acme", None).unwrap();
        storage.upsert_crm_connection(&connection(tenant, "activecampaign")).unwrap();

        storage.mark_synced(tenant).unwrap();

        let rows = storage.crm_connections(tenant).unwrap();
        assert!(rows[0].last_sync_at.is_some());
    }
}
