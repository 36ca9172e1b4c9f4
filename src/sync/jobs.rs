//! Batch jobs that repair drift between ActiveCampaign contacts and their
//! Dynamics leads.
//!
//! Every job runs the same pass: authenticate, page through the contacts whose
//! marker field is populated, find the Dynamics lead by email, and patch only
//! what differs. A contact that already matches counts as already correct, so
//! a second run writes nothing.

use std::collections::BTreeMap;

use super::rep_matcher::{RepMatch, RepMatcher};
use super::{ContactOutcome, SyncCounters};
use crate::error::{Result, SyncError};
use crate::integrations::activecampaign::{ActiveCampaignClient, Contact, FieldValue};
use crate::integrations::credentials::{lead_topic, CrmCredentials};
use crate::integrations::dynamics::{DesiredLeadFields, DynamicsClient, Lead, LeadPatch};
use crate::integrations::LeadField;
use crate::leads::storage::Storage;

/// ActiveCampaign never returns more than this many rows per page.
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Sets the lead owner from the free-text rep field.
    OwnerSync,
    /// Sets `leadsourcecode` on leads that came from a trade show.
    LeadSourceSync,
    /// Copies country, company, comments and topic onto the lead.
    FieldBackfill,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::OwnerSync => "owner sync",
            JobKind::LeadSourceSync => "lead source sync",
            JobKind::FieldBackfill => "field backfill",
        }
    }

    fn marker(&self) -> LeadField {
        match self {
            JobKind::OwnerSync => LeadField::Rep,
            JobKind::LeadSourceSync | JobKind::FieldBackfill => LeadField::Tradeshow,
        }
    }
}

pub struct JobOptions {
    pub page_size: u32,
    pub lead_source_code: i64,
    /// Aliases from configuration; the connection's own aliases override them.
    pub rep_aliases: BTreeMap<String, String>,
}

pub struct SyncContext<'a> {
    pub storage: &'a Storage,
    pub activecampaign: &'a ActiveCampaignClient,
    pub dynamics: &'a DynamicsClient,
    pub creds: &'a CrmCredentials,
    pub options: &'a JobOptions,
}

pub async fn run_job(ctx: &SyncContext<'_>, kind: JobKind) -> Result<SyncCounters> {
    let creds = ctx.creds;
    let mappings = &creds.activecampaign.field_mappings;
    let marker = mappings.require(kind.marker())?;

    ctx.dynamics.get_access_token(&creds.dynamics).await?;
    log::info!(
        "Starting {} for {} (marker field {})",
        kind.name(),
        creds.owner.name,
        marker
    );

    let matcher = match kind {
        JobKind::OwnerSync => {
            let reps = ctx.storage.reps_with_dynamics_ids(creds.owner.tenant_id)?;
            if reps.is_empty() {
                log::warn!("No reps with a Dynamics user id; every contact will be skipped");
            }
            let mut aliases = ctx.options.rep_aliases.clone();
            aliases.extend(mappings.rep_aliases.clone());
            Some(RepMatcher::new(reps, aliases))
        }
        _ => None,
    };

    let page_size = ctx.options.page_size.clamp(1, MAX_PAGE_SIZE);
    if page_size != ctx.options.page_size {
        log::warn!(
            "Page size {} out of range, using {}",
            ctx.options.page_size,
            page_size
        );
    }
    let mut counters = SyncCounters::default();
    let mut offset = 0;

    loop {
        let page = ctx
            .activecampaign
            .list_field_values(&creds.activecampaign, marker, page_size, offset)
            .await?;
        let page_len = page.len();

        for value in page {
            let Some(marker_value) = value.value.as_deref().map(str::trim).filter(|v| !v.is_empty())
            else {
                continue;
            };

            match reconcile_contact(ctx, kind, matcher.as_ref(), &value, marker_value).await {
                Ok((email, outcome)) => {
                    match &outcome {
                        ContactOutcome::Updated(what) => log::info!("{}: updated {}", email, what),
                        ContactOutcome::AlreadyCorrect => log::debug!("{}: already correct", email),
                        ContactOutcome::Skipped(why) => log::warn!("{}: skipped, {}", email, why),
                    }
                    counters.record(&outcome);
                }
                Err(e) => {
                    counters.errors += 1;
                    log::error!("Contact {}: {} ({})", value.contact, e, e.kind());
                }
            }
        }

        if page_len < page_size as usize {
            break;
        }
        offset += page_size;
    }

    if let Some(tenant_id) = creds.owner.tenant_id {
        ctx.storage.mark_synced(tenant_id)?;
    }
    log::info!("Finished {} for {}: {}", kind.name(), creds.owner.name, counters);
    Ok(counters)
}

async fn reconcile_contact(
    ctx: &SyncContext<'_>,
    kind: JobKind,
    matcher: Option<&RepMatcher>,
    value: &FieldValue,
    marker_value: &str,
) -> Result<(String, ContactOutcome)> {
    let creds = ctx.creds;
    let contact = ctx
        .activecampaign
        .get_contact(&creds.activecampaign, &value.contact)
        .await?;
    let email = contact.email.trim().to_string();
    if email.is_empty() {
        return Ok((
            format!("contact {}", contact.id),
            ContactOutcome::Skipped("contact has no email".into()),
        ));
    }

    let lead = match ctx.dynamics.find_lead_by_email(&creds.dynamics, &email).await {
        Ok(Some(lead)) => lead,
        Ok(None) => {
            let missing = SyncError::NotFound(format!("Dynamics lead for {}", email));
            return Ok((email, ContactOutcome::Skipped(missing.to_string())));
        }
        Err(e) => {
            log::error!("Lead lookup failed for {}", email);
            return Err(e);
        }
    };

    let outcome = match kind {
        JobKind::OwnerSync => {
            let matcher =
                matcher.ok_or_else(|| SyncError::Config("rep matcher not prepared".into()))?;
            sync_owner(ctx, matcher, &lead, marker_value).await
        }
        JobKind::LeadSourceSync => sync_lead_source(ctx, &lead).await,
        JobKind::FieldBackfill => backfill_fields(ctx, &contact, &lead, marker_value).await,
    };

    match outcome {
        Ok(outcome) => Ok((email, outcome)),
        Err(e) => {
            log::error!("Update failed for {}", email);
            Err(e)
        }
    }
}

async fn sync_owner(
    ctx: &SyncContext<'_>,
    matcher: &RepMatcher,
    lead: &Lead,
    rep_name: &str,
) -> Result<ContactOutcome> {
    let (rep, rule) = match matcher.resolve(rep_name) {
        RepMatch::Matched { rep, rule } => (rep, rule),
        RepMatch::NoMatch => {
            return Ok(ContactOutcome::Skipped(
                SyncError::NoRepMatch(rep_name.to_string()).to_string(),
            ))
        }
    };

    if lead.is_owned_by(&rep.dynamics_user_id) {
        return Ok(ContactOutcome::AlreadyCorrect);
    }

    ctx.dynamics
        .set_lead_owner(&ctx.creds.dynamics, &lead.id, &rep.dynamics_user_id)
        .await?;
    Ok(ContactOutcome::Updated(format!(
        "owner -> {} ({} match on {:?})",
        rep.name, rule, rep_name
    )))
}

async fn sync_lead_source(ctx: &SyncContext<'_>, lead: &Lead) -> Result<ContactOutcome> {
    let code = ctx.options.lead_source_code;
    if lead.lead_source_code == Some(code) {
        return Ok(ContactOutcome::AlreadyCorrect);
    }

    ctx.dynamics
        .set_lead_source(&ctx.creds.dynamics, &lead.id, code)
        .await?;
    Ok(ContactOutcome::Updated(format!(
        "leadsourcecode {:?} -> {}",
        lead.lead_source_code, code
    )))
}

async fn backfill_fields(
    ctx: &SyncContext<'_>,
    contact: &Contact,
    lead: &Lead,
    tradeshow: &str,
) -> Result<ContactOutcome> {
    let creds = ctx.creds;
    let mappings = &creds.activecampaign.field_mappings;
    let field = |f: LeadField| {
        mappings
            .field_id(f)
            .and_then(|id| contact.field(id))
            .map(str::to_string)
    };

    let desired = DesiredLeadFields {
        subject: Some(lead_topic(tradeshow)),
        description: field(LeadField::Comments),
        company: field(LeadField::Company),
        country: field(LeadField::Country).or_else(|| creds.owner.default_country.clone()),
    };

    let patch = LeadPatch::diff(lead, &desired);
    if patch.is_empty() {
        return Ok(ContactOutcome::AlreadyCorrect);
    }

    ctx.dynamics
        .update_lead_fields(&creds.dynamics, &lead.id, &patch)
        .await?;
    Ok(ContactOutcome::Updated(patch.changed_fields().join(", ")))
}
