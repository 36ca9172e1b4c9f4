//! Resolves the credential bundle for both CRMs from the tenant connection
//! table, the legacy per-trade-show table, or the process environment.

use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::params;
use std::fmt;
use std::str::FromStr;

use super::{is_blank, CrmType, FieldMappings};
use crate::error::{Result, SyncError};
use crate::leads::storage::{CrmConnectionRow, Storage};

static SLUG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").unwrap());

/// A tenant or trade show addressed by numeric id or slug.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetRef {
    Id(i64),
    Slug(String),
}

impl TargetRef {
    fn as_params(&self) -> (Option<i64>, Option<&str>) {
        match self {
            TargetRef::Id(id) => (Some(*id), None),
            TargetRef::Slug(slug) => (None, Some(slug.as_str())),
        }
    }
}

impl FromStr for TargetRef {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            return s
                .parse()
                .map(TargetRef::Id)
                .map_err(|e| SyncError::Config(format!("invalid id {:?}: {}", s, e)));
        }
        let slug = s.to_ascii_lowercase();
        if SLUG_RE.is_match(&slug) {
            Ok(TargetRef::Slug(slug))
        } else {
            Err(SyncError::Config(format!("invalid slug {:?}", s)))
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetRef::Id(id) => write!(f, "#{}", id),
            TargetRef::Slug(slug) => f.write_str(slug),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialScope {
    Tenant(TargetRef),
    /// Legacy pre-multi-tenant credentials stored per trade show.
    Tradeshow(TargetRef),
    Environment,
}

#[derive(Debug, Clone, Default)]
pub struct ActiveCampaignCredentials {
    pub api_url: String,
    pub api_key: String,
    pub tag_id: Option<String>,
    pub field_mappings: FieldMappings,
    pub sync_enabled: bool,
}

impl ActiveCampaignCredentials {
    pub fn missing_fields(&self) -> Vec<String> {
        let mut missing = Vec::new();
        if is_blank(&self.api_url) {
            missing.push("activecampaign.api_url".to_string());
        }
        if is_blank(&self.api_key) {
            missing.push("activecampaign.api_key".to_string());
        }
        missing
    }

    pub fn api_base(&self) -> String {
        format!("{}/api/3", self.api_url.trim().trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DynamicsCredentials {
    /// Azure AD directory (tenant) id.
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub instance_url: String,
    pub sync_enabled: bool,
}

impl DynamicsCredentials {
    pub fn missing_fields(&self) -> Vec<String> {
        [
            ("dynamics.tenant_id", &self.tenant_id),
            ("dynamics.client_id", &self.client_id),
            ("dynamics.client_secret", &self.client_secret),
            ("dynamics.instance_url", &self.instance_url),
        ]
        .into_iter()
        .filter(|(_, value)| is_blank(value))
        .map(|(name, _)| name.to_string())
        .collect()
    }

    pub fn instance_base(&self) -> &str {
        self.instance_url.trim().trim_end_matches('/')
    }

    pub fn scope(&self) -> String {
        format!("{}/.default", self.instance_base())
    }

    pub fn api_base(&self) -> String {
        format!("{}/api/data/v9.2", self.instance_base())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    Tenant,
    Tradeshow,
    Environment,
}

/// The tenant or trade show the credentials belong to.
#[derive(Debug, Clone)]
pub struct OwnerMeta {
    pub kind: OwnerKind,
    pub tenant_id: Option<i64>,
    pub tradeshow_id: Option<i64>,
    pub name: String,
    pub default_country: Option<String>,
}

impl OwnerMeta {
    /// Subject line of Dynamics leads created for this owner.
    pub fn lead_topic(&self) -> String {
        lead_topic(&self.name)
    }
}

pub fn lead_topic(event_name: &str) -> String {
    format!("{} - Trade Show Lead", event_name.trim())
}

#[derive(Debug, Clone)]
pub struct CrmCredentials {
    pub owner: OwnerMeta,
    pub activecampaign: ActiveCampaignCredentials,
    pub dynamics: DynamicsCredentials,
}

impl CrmCredentials {
    fn ensure_complete(self) -> Result<Self> {
        let mut fields = self.activecampaign.missing_fields();
        fields.extend(self.dynamics.missing_fields());
        if fields.is_empty() {
            Ok(self)
        } else {
            Err(SyncError::MissingCredentials { fields })
        }
    }
}

/// Resolves credentials, reading the process environment for [`CredentialScope::Environment`].
pub fn resolve(storage: &Storage, scope: &CredentialScope) -> Result<CrmCredentials> {
    resolve_with_env(storage, scope, |key| std::env::var(key).ok())
}

pub fn resolve_with_env(
    storage: &Storage,
    scope: &CredentialScope,
    env: impl Fn(&str) -> Option<String>,
) -> Result<CrmCredentials> {
    lookup(storage, scope, env)?.ensure_complete()
}

/// Like [`resolve`], but hands back incomplete bundles. Lead capture uses this
/// so each adapter reports its own missing fields instead of losing the lead.
pub fn resolve_partial(storage: &Storage, scope: &CredentialScope) -> Result<CrmCredentials> {
    lookup(storage, scope, |key| std::env::var(key).ok())
}

fn lookup(
    storage: &Storage,
    scope: &CredentialScope,
    env: impl Fn(&str) -> Option<String>,
) -> Result<CrmCredentials> {
    match scope {
        CredentialScope::Tenant(target) => resolve_tenant(storage, target),
        CredentialScope::Tradeshow(target) => resolve_tradeshow(storage, target),
        CredentialScope::Environment => resolve_env(env),
    }
}

pub fn find_tenant_id(storage: &Storage, target: &TargetRef) -> Result<i64> {
    let (id, slug) = target.as_params();
    let found = storage.conn().query_row(
        "SELECT id FROM tenants WHERE id = ?1 OR slug = ?2",
        params![id, slug],
        |row| row.get(0),
    );
    match found {
        Ok(id) => Ok(id),
        Err(rusqlite::Error::QueryReturnedNoRows) => {
            Err(SyncError::NotFound(format!("tenant {}", target)))
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn activecampaign_from_connection(
    row: &CrmConnectionRow,
) -> Result<ActiveCampaignCredentials> {
    Ok(ActiveCampaignCredentials {
        api_url: row.api_url.clone().unwrap_or_default(),
        api_key: row.api_key.clone().unwrap_or_default(),
        tag_id: row.tag_id.clone().filter(|t| !is_blank(t)),
        field_mappings: FieldMappings::parse(row.field_mappings.as_deref())?,
        sync_enabled: row.sync_enabled,
    })
}

pub(crate) fn dynamics_from_connection(row: &CrmConnectionRow) -> DynamicsCredentials {
    DynamicsCredentials {
        tenant_id: row.tenant_id_crm.clone().unwrap_or_default(),
        client_id: row.client_id.clone().unwrap_or_default(),
        client_secret: row.client_secret.clone().unwrap_or_default(),
        instance_url: row.instance_url.clone().unwrap_or_default(),
        sync_enabled: row.sync_enabled,
    }
}

fn resolve_tenant(storage: &Storage, target: &TargetRef) -> Result<CrmCredentials> {
    let (id, slug) = target.as_params();
    let mut stmt = storage.conn().prepare(
        "SELECT t.id, t.name, t.default_country,
                c.id, c.crm_type, c.api_url, c.api_key, c.client_id, c.client_secret,
                c.tenant_id_crm, c.instance_url, c.tag_id, c.field_mappings, c.sync_enabled
         FROM tenants t
         LEFT JOIN tenant_crm_connections c ON c.tenant_id = t.id AND c.is_active = 1
         WHERE t.id = ?1 OR t.slug = ?2",
    )?;

    let rows = stmt
        .query_map(params![id, slug], |row| {
            let owner = OwnerMeta {
                kind: OwnerKind::Tenant,
                tenant_id: Some(row.get(0)?),
                tradeshow_id: None,
                name: row.get(1)?,
                default_country: row.get(2)?,
            };
            let connection = match row.get::<_, Option<i64>>(3)? {
                Some(connection_id) => Some(CrmConnectionRow {
                    id: connection_id,
                    tenant_id: row.get(0)?,
                    crm_type: row.get(4)?,
                    api_url: row.get(5)?,
                    api_key: row.get(6)?,
                    client_id: row.get(7)?,
                    client_secret: row.get(8)?,
                    tenant_id_crm: row.get(9)?,
                    instance_url: row.get(10)?,
                    tag_id: row.get(11)?,
                    field_mappings: row.get(12)?,
                    is_active: true,
                    sync_enabled: row.get(13)?,
                    connection_status: None,
                    last_sync_at: None,
                }),
                None => None,
            };
            Ok((owner, connection))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let owner = match rows.first() {
        Some((owner, _)) => owner.clone(),
        None => return Err(SyncError::NotFound(format!("tenant {}", target))),
    };

    let mut activecampaign = ActiveCampaignCredentials::default();
    let mut dynamics = DynamicsCredentials::default();
    for connection in rows.iter().filter_map(|(_, c)| c.as_ref()) {
        match connection.crm_type.parse::<CrmType>() {
            Ok(CrmType::ActiveCampaign) => {
                activecampaign = activecampaign_from_connection(connection)?
            }
            Ok(CrmType::Dynamics365) => dynamics = dynamics_from_connection(connection),
            Err(_) => log::warn!(
                "Ignoring connection {} with unsupported type {:?}",
                connection.id,
                connection.crm_type
            ),
        }
    }

    Ok(CrmCredentials {
        owner,
        activecampaign,
        dynamics,
    })
}

fn resolve_tradeshow(storage: &Storage, target: &TargetRef) -> Result<CrmCredentials> {
    let (id, slug) = target.as_params();
    let mut stmt = storage.conn().prepare(
        "SELECT ts.id, ts.tenant_id, ts.name, ts.default_country, ts.ac_tag_id,
                tc.api_url, tc.api_key, tc.client_id, tc.client_secret,
                tc.tenant_id_crm, tc.instance_url, tc.field_mappings
         FROM tradeshows ts
         LEFT JOIN tradeshow_credentials tc ON tc.tradeshow_id = ts.id
         WHERE ts.id = ?1 OR ts.slug = ?2",
    )?;

    let mut rows = stmt.query_map(params![id, slug], |row| {
        let owner = OwnerMeta {
            kind: OwnerKind::Tradeshow,
            tenant_id: row.get(1)?,
            tradeshow_id: Some(row.get(0)?),
            name: row.get(2)?,
            default_country: row.get(3)?,
        };
        let tag_id: Option<String> = row.get(4)?;
        let mappings: Option<String> = row.get(11)?;
        let activecampaign = ActiveCampaignCredentials {
            api_url: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
            api_key: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
            tag_id: tag_id.filter(|t| !is_blank(t)),
            field_mappings: FieldMappings::default(),
            sync_enabled: true,
        };
        let dynamics = DynamicsCredentials {
            client_id: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
            client_secret: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
            tenant_id: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
            instance_url: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
            sync_enabled: true,
        };
        Ok((owner, activecampaign, dynamics, mappings))
    })?;

    let (owner, mut activecampaign, dynamics, mappings) = match rows.next() {
        Some(row) => row?,
        None => return Err(SyncError::NotFound(format!("tradeshow {}", target))),
    };
    activecampaign.field_mappings = FieldMappings::parse(mappings.as_deref())?;

    Ok(CrmCredentials {
        owner,
        activecampaign,
        dynamics,
    })
}

fn resolve_env(env: impl Fn(&str) -> Option<String>) -> Result<CrmCredentials> {
    let var = |key: &str| env(key).unwrap_or_default();

    let field_mappings = FieldMappings::parse(env("ACTIVECAMPAIGN_FIELD_MAPPINGS").as_deref())?;
    let owner_name = env("LEADSYNC_OWNER_NAME")
        .filter(|v| !is_blank(v))
        .unwrap_or_else(|| "Trade Show".to_string());

    Ok(CrmCredentials {
        owner: OwnerMeta {
            kind: OwnerKind::Environment,
            tenant_id: None,
            tradeshow_id: None,
            name: owner_name,
            default_country: env("LEADSYNC_DEFAULT_COUNTRY").filter(|v| !is_blank(v)),
        },
        activecampaign: ActiveCampaignCredentials {
            api_url: var("ACTIVECAMPAIGN_API_URL"),
            api_key: var("ACTIVECAMPAIGN_API_KEY"),
            tag_id: env("ACTIVECAMPAIGN_TAG_ID").filter(|v| !is_blank(v)),
            field_mappings,
            sync_enabled: true,
        },
        dynamics: DynamicsCredentials {
            tenant_id: var("DYNAMICS_TENANT_ID"),
            client_id: var("DYNAMICS_CLIENT_ID"),
            client_secret: var("DYNAMICS_CLIENT_SECRET"),
            instance_url: var("DYNAMICS_INSTANCE_URL"),
            sync_enabled: true,
        },
    })
}
