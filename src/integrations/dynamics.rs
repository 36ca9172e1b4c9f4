use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::credentials::DynamicsCredentials;
use super::token::{AccessToken, TokenCache, TokenKey};
use super::ConnectionStatus;
use crate::config::DEFAULT_AUTHORITY_URL;
use crate::error::{Result, SyncError};

static ENTITY_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(([0-9a-fA-F-]{36})\)\s*$").unwrap());

const LEAD_SELECT: &str = "leadid,emailaddress1,subject,description,companyname,\
address1_country,telephone1,leadsourcecode,_ownerid_value";

/// Fields written when a lead is created.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LeadFields {
    pub subject: String,
    #[serde(rename = "firstname")]
    pub first_name: String,
    #[serde(rename = "lastname")]
    pub last_name: String,
    #[serde(rename = "emailaddress1")]
    pub email: String,
    #[serde(rename = "companyname", skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(rename = "address1_country", skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(rename = "telephone1", skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "leadsourcecode", skip_serializing_if = "Option::is_none")]
    pub lead_source_code: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Lead {
    #[serde(rename = "leadid")]
    pub id: String,
    #[serde(rename = "emailaddress1", default)]
    pub email: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "companyname", default)]
    pub company: Option<String>,
    #[serde(rename = "address1_country", default)]
    pub country: Option<String>,
    #[serde(rename = "telephone1", default)]
    pub phone: Option<String>,
    #[serde(rename = "leadsourcecode", default)]
    pub lead_source_code: Option<i64>,
    #[serde(rename = "_ownerid_value", default)]
    pub owner_id: Option<String>,
}

impl Lead {
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.owner_id
            .as_deref()
            .is_some_and(|owner| owner.eq_ignore_ascii_case(user_id.trim()))
    }
}

/// Desired values for the descriptive lead fields. `None` means "leave alone".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesiredLeadFields {
    pub subject: Option<String>,
    pub description: Option<String>,
    pub company: Option<String>,
    pub country: Option<String>,
}

/// Partial update of a lead; only populated fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LeadPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "companyname", skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(rename = "address1_country", skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl LeadPatch {
    /// Fields whose desired value is non-empty and differs from the current one.
    pub fn diff(current: &Lead, desired: &DesiredLeadFields) -> Self {
        fn changed(current: &Option<String>, desired: &Option<String>) -> Option<String> {
            let desired = desired.as_deref().map(str::trim).filter(|v| !v.is_empty())?;
            let current = current.as_deref().map(str::trim).unwrap_or("");
            (current != desired).then(|| desired.to_string())
        }

        Self {
            subject: changed(&current.subject, &desired.subject),
            description: changed(&current.description, &desired.description),
            company: changed(&current.company, &desired.company),
            country: changed(&current.country, &desired.country),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subject.is_none()
            && self.description.is_none()
            && self.company.is_none()
            && self.country.is_none()
    }

    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.subject.is_some() {
            fields.push("subject");
        }
        if self.description.is_some() {
            fields.push("description");
        }
        if self.company.is_some() {
            fields.push("companyname");
        }
        if self.country.is_some() {
            fields.push("address1_country");
        }
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SystemUser {
    #[serde(rename = "systemuserid")]
    pub id: String,
    #[serde(rename = "fullname", default)]
    pub full_name: Option<String>,
    #[serde(rename = "internalemailaddress", default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ODataList<T> {
    value: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Clone)]
pub struct DynamicsClient {
    client: Client,
    authority_url: String,
    tokens: Arc<TokenCache>,
}

impl Default for DynamicsClient {
    fn default() -> Self {
        Self::new(DEFAULT_AUTHORITY_URL)
    }
}

impl DynamicsClient {
    pub fn new(authority_url: &str) -> Self {
        Self::with_client(Client::new(), authority_url)
    }

    pub fn with_client(client: Client, authority_url: &str) -> Self {
        Self {
            client,
            authority_url: authority_url.trim_end_matches('/').to_string(),
            tokens: Arc::new(TokenCache::default()),
        }
    }

    fn check(creds: &DynamicsCredentials) -> Result<()> {
        let fields = creds.missing_fields();
        if fields.is_empty() {
            Ok(())
        } else {
            Err(SyncError::MissingCredentials { fields })
        }
    }

    fn token_key(creds: &DynamicsCredentials) -> TokenKey {
        TokenKey {
            directory: creds.tenant_id.trim().to_string(),
            client_id: creds.client_id.trim().to_string(),
            scope: creds.scope(),
        }
    }

    /// Client-credentials token for the instance, served from cache until near expiry.
    pub async fn get_access_token(&self, creds: &DynamicsCredentials) -> Result<String> {
        Self::check(creds)?;

        let key = Self::token_key(creds);
        if let Some(token) = self.tokens.get(&key) {
            return Ok(token);
        }

        let token_url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_url,
            creds.tenant_id.trim()
        );
        let scope = creds.scope();
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", creds.client_id.trim()),
            ("client_secret", creds.client_secret.trim()),
            ("scope", scope.as_str()),
        ];

        let response = self.client.post(&token_url).form(&params).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::error!("Dynamics token request failed: {} - {}", status, body);
            return Err(SyncError::AuthFailed(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| SyncError::InvalidResponse(format!("token response: {}", e)))?;
        if token.access_token.is_empty() {
            return Err(SyncError::AuthFailed("empty access_token in token response".into()));
        }

        self.tokens
            .insert(key, AccessToken::new(token.access_token.clone(), token.expires_in));
        Ok(token.access_token)
    }

    async fn request(
        &self,
        creds: &DynamicsCredentials,
        method: Method,
        path: &str,
    ) -> Result<RequestBuilder> {
        let token = self.get_access_token(creds).await?;
        let url = format!("{}/{}", creds.api_base(), path.trim_start_matches('/'));
        Ok(self
            .client
            .request(method, url)
            .bearer_auth(token)
            .header("OData-MaxVersion", "4.0")
            .header("OData-Version", "4.0")
            .header("Accept", "application/json"))
    }

    async fn send(&self, creds: &DynamicsCredentials, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate(&Self::token_key(creds));
        }
        let body = response.text().await.unwrap_or_default();
        Err(SyncError::from_status(status, body))
    }

    /// Creates a lead, optionally owned by a system user. Returns the lead id.
    pub async fn create_lead(
        &self,
        creds: &DynamicsCredentials,
        fields: &LeadFields,
        owner_user_id: Option<&str>,
    ) -> Result<String> {
        let mut body = serde_json::to_value(fields)
            .map_err(|e| SyncError::InvalidResponse(format!("lead body: {}", e)))?;
        if let (Some(owner), Some(map)) = (owner_user_id, body.as_object_mut()) {
            map.insert(
                "ownerid@odata.bind".to_string(),
                serde_json::Value::String(format!("/systemusers({})", owner.trim())),
            );
        }

        let builder = self
            .request(creds, Method::POST, "leads")
            .await?
            .header("Prefer", "return=representation")
            .json(&body);

        let response = match self.send(creds, builder).await {
            Ok(response) => response,
            Err(e) => {
                log::error!("Failed to create Dynamics lead for {}: {}", fields.email, e);
                return Err(e);
            }
        };

        let from_header = response
            .headers()
            .get("OData-EntityId")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| ENTITY_ID_RE.captures(v))
            .map(|c| c[1].to_string());

        let lead_id = match from_header {
            Some(id) => id,
            None => {
                let body: serde_json::Value = response.json().await.map_err(|e| {
                    SyncError::InvalidResponse(format!("lead create response: {}", e))
                })?;
                body.get("leadid")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .ok_or_else(|| SyncError::InvalidResponse("lead id missing".into()))?
            }
        };

        log::info!("Created Dynamics lead {} for {}", lead_id, fields.email);
        Ok(lead_id)
    }

    /// Sends only the fields set in `patch`. Returns false without a request when it is empty.
    pub async fn update_lead_fields(
        &self,
        creds: &DynamicsCredentials,
        lead_id: &str,
        patch: &LeadPatch,
    ) -> Result<bool> {
        if patch.is_empty() {
            return Ok(false);
        }
        let body = serde_json::to_value(patch)
            .map_err(|e| SyncError::InvalidResponse(format!("lead patch: {}", e)))?;
        self.patch_lead(creds, lead_id, &body).await?;
        Ok(true)
    }

    pub async fn set_lead_owner(
        &self,
        creds: &DynamicsCredentials,
        lead_id: &str,
        user_id: &str,
    ) -> Result<()> {
        let body = serde_json::json!({
            "ownerid@odata.bind": format!("/systemusers({})", user_id.trim()),
        });
        self.patch_lead(creds, lead_id, &body).await
    }

    pub async fn set_lead_source(
        &self,
        creds: &DynamicsCredentials,
        lead_id: &str,
        lead_source_code: i64,
    ) -> Result<()> {
        let body = serde_json::json!({ "leadsourcecode": lead_source_code });
        self.patch_lead(creds, lead_id, &body).await
    }

    async fn patch_lead(
        &self,
        creds: &DynamicsCredentials,
        lead_id: &str,
        body: &serde_json::Value,
    ) -> Result<()> {
        let path = format!("leads({})", lead_id.trim());
        let builder = self.request(creds, Method::PATCH, &path).await?.json(body);
        self.send(creds, builder).await?;
        Ok(())
    }

    /// Most recently created lead with this email, if any.
    pub async fn find_lead_by_email(
        &self,
        creds: &DynamicsCredentials,
        email: &str,
    ) -> Result<Option<Lead>> {
        let filter = format!("emailaddress1 eq '{}'", odata_escape(email.trim()));
        let builder = self.request(creds, Method::GET, "leads").await?.query(&[
            ("$select", LEAD_SELECT),
            ("$filter", filter.as_str()),
            ("$orderby", "createdon desc"),
            ("$top", "1"),
        ]);

        let list: ODataList<Lead> = self
            .send(creds, builder)
            .await?
            .json()
            .await
            .map_err(|e| SyncError::InvalidResponse(format!("lead lookup: {}", e)))?;
        Ok(list.value.into_iter().next())
    }

    pub async fn list_system_users(&self, creds: &DynamicsCredentials) -> Result<Vec<SystemUser>> {
        let builder = self.request(creds, Method::GET, "systemusers").await?.query(&[
            ("$select", "systemuserid,fullname,internalemailaddress"),
            ("$filter", "isdisabled eq false"),
            ("$orderby", "fullname asc"),
        ]);

        let list: ODataList<SystemUser> = self
            .send(creds, builder)
            .await?
            .json()
            .await
            .map_err(|e| SyncError::InvalidResponse(format!("system users: {}", e)))?;
        Ok(list.value)
    }

    pub async fn test_connection(&self, creds: &DynamicsCredentials) -> ConnectionStatus {
        let builder = match self.request(creds, Method::GET, "systemusers").await {
            Ok(builder) => builder.query(&[("$select", "systemuserid"), ("$top", "1")]),
            Err(e) => return e.into(),
        };
        match self.send(creds, builder).await {
            Ok(_) => ConnectionStatus::Success,
            Err(e) => e.into(),
        }
    }
}

fn odata_escape(value: &str) -> String {
    value.replace('\'', "''")
}
