use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::storage::{Storage, StoredSubmission};
use crate::error::{Result, SyncError};
use crate::integrations::activecampaign::{ActiveCampaignClient, ContactFields};
use crate::integrations::credentials::CrmCredentials;
use crate::integrations::dynamics::{DynamicsClient, LeadFields};
use crate::integrations::LeadField;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeadSubmission {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub rep_code: Option<String>,
    #[serde(default)]
    pub photo: Option<PhotoUpload>,
}

/// Badge or business-card photo, sent by the form as a base64 data URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoUpload {
    pub file_name: String,
    pub data_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "lowercase")]
pub enum CrmOutcome {
    Synced(String),
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmissionOutcome {
    pub submission_id: String,
    pub activecampaign: CrmOutcome,
    pub dynamics: CrmOutcome,
}

pub struct SubmissionOptions {
    pub upload_dir: PathBuf,
    pub lead_source_code: i64,
}

/// Stores the lead locally, then pushes it to ActiveCampaign and Dynamics.
///
/// Only the local write can fail the submission. The two CRM calls run in
/// sequence, are independent of each other, and their failures are logged and
/// reported in the outcome.
pub async fn submit_lead(
    storage: &Storage,
    activecampaign: &ActiveCampaignClient,
    dynamics: &DynamicsClient,
    creds: &CrmCredentials,
    options: &SubmissionOptions,
    submission: &LeadSubmission,
) -> Result<SubmissionOutcome> {
    let email = submission.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(SyncError::Invalid(format!("invalid email {:?}", submission.email)));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let photo_path = match &submission.photo {
        Some(photo) => Some(save_photo(&options.upload_dir, &id, photo)?),
        None => None,
    };

    let stored = StoredSubmission {
        id: id.clone(),
        tenant_id: creds.owner.tenant_id,
        tradeshow_id: creds.owner.tradeshow_id,
        rep_code: submission.rep_code.clone(),
        email: email.to_string(),
        first_name: submission.first_name.trim().to_string(),
        last_name: submission.last_name.trim().to_string(),
        company: submission.company.clone(),
        phone: submission.phone.clone(),
        country: submission
            .country
            .clone()
            .or_else(|| creds.owner.default_country.clone()),
        comments: submission.comments.clone(),
        photo_path: photo_path.map(|p| p.to_string_lossy().into_owned()),
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    if let Err(e) = storage.insert_submission(&stored) {
        if let Some(photo) = stored.photo_path.as_deref() {
            if let Err(rm) = std::fs::remove_file(photo) {
                log::warn!("Could not remove orphaned photo {}: {}", photo, rm);
            }
        }
        return Err(e);
    }
    log::info!("Stored lead submission {} for {}", id, email);

    let rep = match stored.rep_code.as_deref().filter(|c| !c.trim().is_empty()) {
        Some(code) => match storage.find_rep_by_code(creds.owner.tenant_id, code.trim()) {
            Ok(rep) => {
                if rep.is_none() {
                    log::warn!(
                        "Rep code {:?} has no Dynamics user; lead will be unassigned",
                        code
                    );
                }
                rep
            }
            Err(e) => {
                log::warn!("Rep lookup for {:?} failed: {}", code, e);
                None
            }
        },
        None => None,
    };

    let ac_outcome = if creds.activecampaign.sync_enabled {
        let rep_name = rep.as_ref().map(|r| r.name.as_str());
        push_to_activecampaign(activecampaign, creds, &stored, rep_name).await
    } else {
        CrmOutcome::Skipped("ActiveCampaign sync disabled".into())
    };

    let dynamics_outcome = if creds.dynamics.sync_enabled {
        let fields = LeadFields {
            subject: creds.owner.lead_topic(),
            first_name: stored.first_name.clone(),
            last_name: stored.last_name.clone(),
            email: stored.email.clone(),
            company: stored.company.clone(),
            country: stored.country.clone(),
            phone: stored.phone.clone(),
            description: stored.comments.clone(),
            lead_source_code: Some(options.lead_source_code),
        };
        let owner = rep.as_ref().map(|r| r.dynamics_user_id.as_str());
        match dynamics.create_lead(&creds.dynamics, &fields, owner).await {
            Ok(lead_id) => CrmOutcome::Synced(lead_id),
            Err(e) => {
                log::warn!("Dynamics sync failed for submission {}: {} ({})", id, e, e.kind());
                CrmOutcome::Failed(e.to_string())
            }
        }
    } else {
        CrmOutcome::Skipped("Dynamics sync disabled".into())
    };

    Ok(SubmissionOutcome {
        submission_id: id,
        activecampaign: ac_outcome,
        dynamics: dynamics_outcome,
    })
}

async fn push_to_activecampaign(
    client: &ActiveCampaignClient,
    creds: &CrmCredentials,
    stored: &StoredSubmission,
    rep_name: Option<&str>,
) -> CrmOutcome {
    let ac = &creds.activecampaign;
    let mappings = &ac.field_mappings;

    let mut field_values = BTreeMap::new();
    let mut put = |field: LeadField, value: Option<&str>| {
        if let (Some(id), Some(value)) = (mappings.field_id(field), value) {
            field_values.insert(id.to_string(), value.to_string());
        }
    };
    put(LeadField::Country, stored.country.as_deref());
    put(LeadField::Company, stored.company.as_deref());
    put(LeadField::Comments, stored.comments.as_deref());
    put(LeadField::Rep, rep_name.or(stored.rep_code.as_deref()));
    put(LeadField::Tradeshow, Some(creds.owner.name.as_str()));

    let contact = ContactFields {
        email: stored.email.clone(),
        first_name: stored.first_name.clone(),
        last_name: stored.last_name.clone(),
        phone: stored.phone.clone(),
        field_values,
    };

    let contact_id = match client.create_or_update_contact(ac, &contact).await {
        Ok(id) => id,
        Err(e) => {
            log::warn!(
                "ActiveCampaign sync failed for submission {}: {} ({})",
                stored.id,
                e,
                e.kind()
            );
            return CrmOutcome::Failed(e.to_string());
        }
    };

    if let Some(comments) = stored.comments.as_deref().filter(|c| !c.trim().is_empty()) {
        client.add_note(ac, &contact_id, comments).await;
    }
    if let Some(tag_id) = ac.tag_id.as_deref() {
        client.add_tag(ac, &contact_id, tag_id).await;
    }
    CrmOutcome::Synced(contact_id)
}

/// Decodes a `data:<mime>;base64,<payload>` URL and writes it under `upload_dir`.
fn save_photo(upload_dir: &Path, submission_id: &str, photo: &PhotoUpload) -> Result<PathBuf> {
    let (header, payload) = photo
        .data_url
        .split_once(',')
        .ok_or_else(|| SyncError::Invalid("photo is not a data URL".into()))?;
    let mime = header
        .strip_prefix("data:")
        .and_then(|h| h.strip_suffix(";base64"))
        .ok_or_else(|| SyncError::Invalid("photo must be a base64 data URL".into()))?;

    let extension = match mime {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/heic" => "heic",
        _ => Path::new(&photo.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("bin"),
    };

    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| SyncError::Invalid(format!("photo payload: {}", e)))?;

    std::fs::create_dir_all(upload_dir)?;
    let path = upload_dir.join(format!("{}.{}", submission_id, extension));
    std::fs::write(&path, bytes)?;
    Ok(path)
}
