pub mod activecampaign;
pub mod credentials;
pub mod dynamics;
pub mod token;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::SyncError;
use crate::leads::storage::{CrmConnectionRow, Storage};

use activecampaign::ActiveCampaignClient;
use dynamics::DynamicsClient;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CrmType {
    ActiveCampaign,
    Dynamics365,
}

impl CrmType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrmType::ActiveCampaign => "activecampaign",
            CrmType::Dynamics365 => "dynamics365",
        }
    }
}

impl FromStr for CrmType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "activecampaign" | "active_campaign" => Ok(CrmType::ActiveCampaign),
            "dynamics365" | "dynamics" | "dynamics_365" => Ok(CrmType::Dynamics365),
            other => Err(SyncError::UnsupportedType(other.to_string())),
        }
    }
}

/// Logical lead attributes that live in ActiveCampaign custom fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadField {
    Country,
    Company,
    Comments,
    Rep,
    Tradeshow,
}

impl LeadField {
    pub fn key(&self) -> &'static str {
        match self {
            LeadField::Country => "country",
            LeadField::Company => "company",
            LeadField::Comments => "comments",
            LeadField::Rep => "rep",
            LeadField::Tradeshow => "tradeshow",
        }
    }
}

/// The `field_mappings` JSON stored on a connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMappings {
    /// Logical field name to ActiveCampaign custom field id.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub rep_aliases: BTreeMap<String, String>,
}

impl FieldMappings {
    pub fn parse(raw: Option<&str>) -> Result<Self, SyncError> {
        match raw.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(json) => serde_json::from_str(json)
                .map_err(|e| SyncError::Config(format!("invalid field_mappings: {}", e))),
        }
    }

    pub fn field_id(&self, field: LeadField) -> Option<&str> {
        self.fields
            .get(field.key())
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    pub fn require(&self, field: LeadField) -> Result<&str, SyncError> {
        self.field_id(field).ok_or_else(|| SyncError::MissingCredentials {
            fields: vec![format!("field_mappings.fields.{}", field.key())],
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Success,
    MissingCredentials(Vec<String>),
    AuthFailed(String),
    UnsupportedType(String),
    Failed(String),
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Success => "success",
            ConnectionStatus::MissingCredentials(_) => "missing-credentials",
            ConnectionStatus::AuthFailed(_) => "auth-failed",
            ConnectionStatus::UnsupportedType(_) => "unsupported-type",
            ConnectionStatus::Failed(_) => "failed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ConnectionStatus::Success)
    }
}

impl From<SyncError> for ConnectionStatus {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::MissingCredentials { fields } => {
                ConnectionStatus::MissingCredentials(fields)
            }
            SyncError::AuthFailed(msg) => ConnectionStatus::AuthFailed(msg),
            SyncError::UnsupportedType(t) => ConnectionStatus::UnsupportedType(t),
            other => ConnectionStatus::Failed(other.to_string()),
        }
    }
}

/// Tests a stored connection and records the outcome on the row.
pub async fn test_connection(
    storage: &Storage,
    activecampaign: &ActiveCampaignClient,
    dynamics: &DynamicsClient,
    row: &CrmConnectionRow,
) -> Result<ConnectionStatus, SyncError> {
    let status = match row.crm_type.parse::<CrmType>() {
        Ok(CrmType::ActiveCampaign) => match credentials::activecampaign_from_connection(row) {
            Ok(creds) => activecampaign.test_connection(&creds).await,
            Err(err) => ConnectionStatus::from(err),
        },
        Ok(CrmType::Dynamics365) => {
            let creds = credentials::dynamics_from_connection(row);
            dynamics.test_connection(&creds).await
        }
        Err(err) => ConnectionStatus::from(err),
    };

    log::info!(
        "Connection {} ({}) for tenant {}: {}",
        row.id,
        row.crm_type,
        row.tenant_id,
        status.as_str()
    );
    storage.set_connection_status(row.id, status.as_str())?;
    Ok(status)
}

pub(crate) fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}
