use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::credentials::ActiveCampaignCredentials;
use super::ConnectionStatus;
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactFields {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    /// Custom field id to value.
    #[serde(default)]
    pub field_values: BTreeMap<String, String>,
}

/// A contact as read back from ActiveCampaign, with its custom field values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Contact {
    pub id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub field_values: BTreeMap<String, String>,
}

impl Contact {
    pub fn field(&self, field_id: &str) -> Option<&str> {
        self.field_values
            .get(field_id)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FieldValue {
    #[serde(deserialize_with = "de_id")]
    pub contact: String,
    #[serde(deserialize_with = "de_id")]
    pub field: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContactEnvelope {
    contact: ContactPayload,
    #[serde(default, rename = "fieldValues")]
    field_values: Vec<FieldValue>,
}

#[derive(Debug, Deserialize)]
struct ContactList {
    #[serde(default)]
    contacts: Vec<ContactPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContactPayload {
    #[serde(deserialize_with = "de_id")]
    id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    phone: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FieldValueList {
    #[serde(default, rename = "fieldValues")]
    field_values: Vec<FieldValue>,
}

/// ActiveCampaign returns ids as strings, but older accounts send numbers.
fn de_id<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("unexpected id {}", other))),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActiveCampaignClient {
    client: Client,
}

impl ActiveCampaignClient {
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn authed(
        &self,
        builder: RequestBuilder,
        creds: &ActiveCampaignCredentials,
    ) -> RequestBuilder {
        builder
            .header("Api-Token", creds.api_key.trim())
            .header("Accept", "application/json")
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SyncError::from_status(status, body))
    }

    fn check(creds: &ActiveCampaignCredentials) -> Result<()> {
        let fields = creds.missing_fields();
        if fields.is_empty() {
            Ok(())
        } else {
            Err(SyncError::MissingCredentials { fields })
        }
    }

    /// Creates the contact, or updates the existing one with the same email.
    /// Returns the ActiveCampaign contact id.
    pub async fn create_or_update_contact(
        &self,
        creds: &ActiveCampaignCredentials,
        contact: &ContactFields,
    ) -> Result<String> {
        Self::check(creds)?;

        let body = contact_body(contact);
        let url = format!("{}/contacts", creds.api_base());

        let response = self
            .authed(self.client.post(&url), creds)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let created: ContactEnvelope = response
                .json()
                .await
                .map_err(|e| SyncError::InvalidResponse(format!("contact create: {}", e)))?;
            log::info!(
                "Created ActiveCampaign contact {} for {}",
                created.contact.id,
                contact.email
            );
            return Ok(created.contact.id);
        }

        let error_body = response.text().await.unwrap_or_default();
        if status != StatusCode::UNPROCESSABLE_ENTITY {
            log::warn!("ActiveCampaign contact create failed ({}): {}", status, error_body);
            return Err(SyncError::from_status(status, error_body));
        }

        // 422 is returned for an email that already exists.
        let existing = match self.find_contact_id(creds, &contact.email).await? {
            Some(id) => id,
            None => {
                return Err(SyncError::Http {
                    status: status.as_u16(),
                    body: error_body,
                })
            }
        };

        let url = format!("{}/contacts/{}", creds.api_base(), existing);
        self.send(self.authed(self.client.put(&url), creds).json(&body))
            .await?;
        log::info!("Updated ActiveCampaign contact {} for {}", existing, contact.email);
        Ok(existing)
    }

    pub async fn find_contact_id(
        &self,
        creds: &ActiveCampaignCredentials,
        email: &str,
    ) -> Result<Option<String>> {
        Self::check(creds)?;

        let url = format!("{}/contacts", creds.api_base());
        let response = self
            .send(self.authed(self.client.get(&url), creds).query(&[("email", email)]))
            .await?;
        let list: ContactList = response
            .json()
            .await
            .map_err(|e| SyncError::InvalidResponse(format!("contact search: {}", e)))?;
        Ok(list.contacts.into_iter().next().map(|c| c.id))
    }

    /// Best effort: failures are logged and reported as `false`.
    pub async fn add_note(
        &self,
        creds: &ActiveCampaignCredentials,
        contact_id: &str,
        note: &str,
    ) -> bool {
        let body = serde_json::json!({
            "note": {
                "note": note,
                "relid": contact_id,
                "reltype": "Subscriber",
            }
        });
        let url = format!("{}/notes", creds.api_base());

        let result = match Self::check(creds) {
            Ok(()) => self.send(self.authed(self.client.post(&url), creds).json(&body)).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Failed to add note to ActiveCampaign contact {}: {}", contact_id, e);
                false
            }
        }
    }

    /// Best effort: failures are logged and reported as `false`.
    pub async fn add_tag(
        &self,
        creds: &ActiveCampaignCredentials,
        contact_id: &str,
        tag_id: &str,
    ) -> bool {
        let body = serde_json::json!({
            "contactTag": {
                "contact": contact_id,
                "tag": tag_id,
            }
        });
        let url = format!("{}/contactTags", creds.api_base());

        let result = match Self::check(creds) {
            Ok(()) => self.send(self.authed(self.client.post(&url), creds).json(&body)).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(_) => true,
            Err(e) => {
                log::warn!(
                    "Failed to tag ActiveCampaign contact {} with {}: {}",
                    contact_id,
                    tag_id,
                    e
                );
                false
            }
        }
    }

    pub async fn test_connection(&self, creds: &ActiveCampaignCredentials) -> ConnectionStatus {
        if let Err(e) = Self::check(creds) {
            return e.into();
        }
        let url = format!("{}/contacts", creds.api_base());
        match self
            .send(self.authed(self.client.get(&url), creds).query(&[("limit", "1")]))
            .await
        {
            Ok(_) => ConnectionStatus::Success,
            Err(e) => e.into(),
        }
    }

    /// One page of values for a custom field, across all contacts.
    pub async fn list_field_values(
        &self,
        creds: &ActiveCampaignCredentials,
        field_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<FieldValue>> {
        Self::check(creds)?;

        let url = format!("{}/fieldValues", creds.api_base());
        let limit = limit.to_string();
        let offset = offset.to_string();
        let response = self
            .send(self.authed(self.client.get(&url), creds).query(&[
                ("filters[fieldid]", field_id),
                ("limit", limit.as_str()),
                ("offset", offset.as_str()),
            ]))
            .await?;

        let page: FieldValueList = response
            .json()
            .await
            .map_err(|e| SyncError::InvalidResponse(format!("field values: {}", e)))?;
        Ok(page.field_values)
    }

    pub async fn get_contact(
        &self,
        creds: &ActiveCampaignCredentials,
        contact_id: &str,
    ) -> Result<Contact> {
        Self::check(creds)?;

        let url = format!("{}/contacts/{}", creds.api_base(), contact_id);
        let response = match self.send(self.authed(self.client.get(&url), creds)).await {
            Err(SyncError::Http { status: 404, .. }) => {
                return Err(SyncError::NotFound(format!("ActiveCampaign contact {}", contact_id)))
            }
            other => other?,
        };

        let envelope: ContactEnvelope = response
            .json()
            .await
            .map_err(|e| SyncError::InvalidResponse(format!("contact {}: {}", contact_id, e)))?;

        let field_values = envelope
            .field_values
            .into_iter()
            .filter_map(|fv| fv.value.map(|value| (fv.field, value)))
            .collect();

        Ok(Contact {
            id: envelope.contact.id,
            email: envelope.contact.email.unwrap_or_default(),
            first_name: envelope.contact.first_name,
            last_name: envelope.contact.last_name,
            phone: envelope.contact.phone,
            field_values,
        })
    }
}

fn contact_body(contact: &ContactFields) -> serde_json::Value {
    let field_values: Vec<_> = contact
        .field_values
        .iter()
        .filter(|(_, value)| !value.trim().is_empty())
        .map(|(field, value)| serde_json::json!({ "field": field, "value": value }))
        .collect();

    serde_json::json!({
        "contact": {
            "email": contact.email,
            "firstName": contact.first_name,
            "lastName": contact.last_name,
            "phone": contact.phone.as_deref().unwrap_or(""),
            "fieldValues": field_values,
        }
    })
}
