use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::AppConfig;
use crate::integrations::activecampaign::ActiveCampaignClient;
use crate::integrations::credentials::{self, CredentialScope, TargetRef};
use crate::integrations::dynamics::DynamicsClient;
use crate::integrations::{self, ConnectionStatus, CrmType};
use crate::leads::storage::{NewCrmConnection, Storage};
use crate::leads::submission::{self, LeadSubmission, SubmissionOptions};
use crate::sync::jobs::{self, JobKind, JobOptions, SyncContext};

#[derive(Parser, Debug)]
#[command(
    name = "leadsync",
    version,
    about = "Keeps trade-show leads in step across ActiveCampaign and Dynamics 365"
)]
pub struct Cli {
    /// Config file (defaults to <config dir>/leadsync/config.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Tenant id or slug. Credentials come from the environment when omitted.
    pub target: Option<String>,
    /// Treat TARGET as a trade show with legacy per-show credentials
    #[arg(long)]
    pub tradeshow: bool,
}

impl TargetArgs {
    pub fn scope(&self) -> anyhow::Result<CredentialScope> {
        let Some(raw) = self.target.as_deref() else {
            if self.tradeshow {
                bail!("--tradeshow needs a trade show id or slug");
            }
            return Ok(CredentialScope::Environment);
        };
        let target: TargetRef = raw.parse()?;
        Ok(if self.tradeshow {
            CredentialScope::Tradeshow(target)
        } else {
            CredentialScope::Tenant(target)
        })
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Set Dynamics lead owners from the ActiveCampaign rep field
    SyncOwners(TargetArgs),
    /// Mark trade-show leads with the trade-show lead source
    SyncLeadSource(TargetArgs),
    /// Backfill country, company, comments and topic onto Dynamics leads
    SyncFields(TargetArgs),
    /// Check the stored (or environment) credentials against both CRMs
    TestConnection(TargetArgs),
    /// List enabled Dynamics system users and the reps mapped to them
    ListUsers(TargetArgs),
    /// Capture a lead from a JSON file and push it to both CRMs
    SubmitLead {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        file: PathBuf,
    },
    /// Store a tenant CRM connection read from a JSON file
    ImportConnection {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Soft-delete a tenant CRM connection
    DeactivateConnection {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        crm: String,
    },
}

struct App {
    config: AppConfig,
    storage: Storage,
    activecampaign: ActiveCampaignClient,
    dynamics: DynamicsClient,
}

pub async fn execute(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(&config_path);
    let storage = Storage::open(&config.database_path)
        .with_context(|| format!("failed to open database {}", config.database_path.display()))?;

    let app = App {
        activecampaign: ActiveCampaignClient::new(),
        dynamics: DynamicsClient::new(&config.dynamics_authority_url),
        config,
        storage,
    };

    match cli.command {
        Command::SyncOwners(target) => app.sync(&target, JobKind::OwnerSync).await,
        Command::SyncLeadSource(target) => app.sync(&target, JobKind::LeadSourceSync).await,
        Command::SyncFields(target) => app.sync(&target, JobKind::FieldBackfill).await,
        Command::TestConnection(target) => app.test_connection(&target).await,
        Command::ListUsers(target) => app.list_users(&target).await,
        Command::SubmitLead { target, file } => app.submit_lead(&target, &file).await,
        Command::ImportConnection { tenant, file } => app.import_connection(&tenant, &file),
        Command::DeactivateConnection { tenant, crm } => app.deactivate_connection(&tenant, &crm),
    }
}

impl App {
    async fn sync(&self, target: &TargetArgs, kind: JobKind) -> anyhow::Result<()> {
        let creds = credentials::resolve(&self.storage, &target.scope()?)?;
        let options = JobOptions {
            page_size: self.config.page_size,
            lead_source_code: self.config.default_lead_source_code,
            rep_aliases: self.config.rep_aliases.clone(),
        };
        let ctx = SyncContext {
            storage: &self.storage,
            activecampaign: &self.activecampaign,
            dynamics: &self.dynamics,
            creds: &creds,
            options: &options,
        };

        let counters = jobs::run_job(&ctx, kind).await?;
        println!(
            "{} for {}: {} ({} processed)",
            kind.name(),
            creds.owner.name,
            counters,
            counters.processed()
        );
        Ok(())
    }

    async fn test_connection(&self, target: &TargetArgs) -> anyhow::Result<()> {
        let statuses = match target.scope()? {
            CredentialScope::Tenant(target) => {
                let tenant_id = credentials::find_tenant_id(&self.storage, &target)?;
                let rows = self.storage.crm_connections(tenant_id)?;
                let mut statuses = Vec::new();
                for row in rows.iter().filter(|r| r.is_active) {
                    let status = integrations::test_connection(
                        &self.storage,
                        &self.activecampaign,
                        &self.dynamics,
                        row,
                    )
                    .await?;
                    statuses.push((row.crm_type.clone(), status));
                }
                if statuses.is_empty() {
                    bail!("tenant {} has no active CRM connections", target);
                }
                statuses
            }
            scope => {
                let creds = credentials::resolve(&self.storage, &scope)?;
                vec![
                    (
                        CrmType::ActiveCampaign.as_str().to_string(),
                        self.activecampaign.test_connection(&creds.activecampaign).await,
                    ),
                    (
                        CrmType::Dynamics365.as_str().to_string(),
                        self.dynamics.test_connection(&creds.dynamics).await,
                    ),
                ]
            }
        };

        let mut failed = 0;
        for (crm, status) in &statuses {
            println!("{:<16} {}", crm, describe(status));
            if !status.is_success() {
                failed += 1;
            }
        }
        if failed > 0 {
            bail!("{} of {} connections failed", failed, statuses.len());
        }
        Ok(())
    }

    async fn list_users(&self, target: &TargetArgs) -> anyhow::Result<()> {
        let creds = credentials::resolve(&self.storage, &target.scope()?)?;
        let users = self.dynamics.list_system_users(&creds.dynamics).await?;
        let reps = self.storage.reps_with_dynamics_ids(creds.owner.tenant_id)?;

        for user in &users {
            let rep = reps
                .iter()
                .find(|r| r.dynamics_user_id.eq_ignore_ascii_case(&user.id))
                .map(|r| format!(" <- {}", r.name))
                .unwrap_or_default();
            println!(
                "{}  {:<30} {}{}",
                user.id,
                user.full_name.as_deref().unwrap_or("-"),
                user.email.as_deref().unwrap_or("-"),
                rep
            );
        }
        println!("{} system users", users.len());
        Ok(())
    }

    async fn submit_lead(&self, target: &TargetArgs, file: &Path) -> anyhow::Result<()> {
        let lead: LeadSubmission = read_json(file)?;
        let creds = credentials::resolve_partial(&self.storage, &target.scope()?)?;
        let options = SubmissionOptions {
            upload_dir: self.config.upload_dir.clone(),
            lead_source_code: self.config.default_lead_source_code,
        };

        let outcome = submission::submit_lead(
            &self.storage,
            &self.activecampaign,
            &self.dynamics,
            &creds,
            &options,
            &lead,
        )
        .await?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        Ok(())
    }

    fn import_connection(&self, tenant: &str, file: &Path) -> anyhow::Result<()> {
        let tenant_id = credentials::find_tenant_id(&self.storage, &tenant.parse()?)?;
        let mut connection: NewCrmConnection = read_json(file)?;
        connection.tenant_id = tenant_id;

        let id = self.storage.upsert_crm_connection(&connection)?;
        log::info!("Stored {} connection {} for tenant {}", connection.crm_type, id, tenant_id);
        println!("connection {} saved", id);
        Ok(())
    }

    fn deactivate_connection(&self, tenant: &str, crm: &str) -> anyhow::Result<()> {
        let tenant_id = credentials::find_tenant_id(&self.storage, &tenant.parse()?)?;
        let crm_type: CrmType = crm.parse()?;

        if !self.storage.deactivate_crm_connection(tenant_id, crm_type)? {
            bail!("no active {} connection for tenant {}", crm_type.as_str(), tenant);
        }
        println!("{} connection deactivated", crm_type.as_str());
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

fn describe(status: &ConnectionStatus) -> String {
    match status {
        ConnectionStatus::MissingCredentials(fields) => {
            format!("{} ({})", status.as_str(), fields.join(", "))
        }
        ConnectionStatus::AuthFailed(detail)
        | ConnectionStatus::UnsupportedType(detail)
        | ConnectionStatus::Failed(detail) => format!("{}: {}", status.as_str(), detail),
        ConnectionStatus::Success => status.as_str().to_string(),
    }
}
