use std::collections::BTreeMap;

use leadsync_lib::integrations::activecampaign::ActiveCampaignClient;
use leadsync_lib::integrations::credentials::{self, CredentialScope, CrmCredentials, TargetRef};
use leadsync_lib::integrations::dynamics::DynamicsClient;
use leadsync_lib::leads::storage::{NewCrmConnection, Storage};
use leadsync_lib::sync::jobs::{run_job, JobKind, JobOptions, SyncContext};
use leadsync_lib::sync::SyncCounters;
use serde_json::json;
use wiremock::matchers::{body_json, body_string_contains, method, path, path_regex, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const MALINA: &str = "0f8fad5b-d9cb-469f-a165-70867728950e";
const PATRICK: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
const LEAD_A: &str = "1b9d6bcd-bbfd-4b2d-9b5d-ab8dfbbd4bed";
const LEAD_B: &str = "6ec0bd7f-11c0-43da-975e-2a8ad9ebae0b";

struct Fixture {
    server: MockServer,
    storage: Storage,
    tenant: i64,
    activecampaign: ActiveCampaignClient,
    dynamics: DynamicsClient,
}

impl Fixture {
    async fn new(fields: serde_json::Value) -> Self {
        let server = MockServer::start().await;
        let storage = Storage::open_in_memory().unwrap();
        let tenant = storage.insert_tenant("acme", "Acme Corp", Some("Canada")).unwrap();
        storage
            .insert_user(Some(tenant), "Malina Fontaine", Some("malina"), Some(MALINA))
            .unwrap();
        storage
            .insert_user(Some(tenant), "Patrick Roy", Some("patrick"), Some(PATRICK))
            .unwrap();
        storage
            .upsert_crm_connection(&NewCrmConnection {
                tenant_id: tenant,
                crm_type: "activecampaign".into(),
                api_url: Some(server.uri()),
                api_key: Some("ac-key".into()),
                field_mappings: Some(json!({ "fields": fields })),
                sync_enabled: true,
                ..Default::default()
            })
            .unwrap();
        storage
            .upsert_crm_connection(&NewCrmConnection {
                tenant_id: tenant,
                crm_type: "dynamics365".into(),
                client_id: Some("client".into()),
                client_secret: Some("secret".into()),
                tenant_id_crm: Some("aad".into()),
                instance_url: Some(server.uri()),
                sync_enabled: true,
                ..Default::default()
            })
            .unwrap();

        let dynamics = DynamicsClient::new(&server.uri());
        Self {
            server,
            storage,
            tenant,
            activecampaign: ActiveCampaignClient::new(),
            dynamics,
        }
    }

    fn creds(&self) -> CrmCredentials {
        credentials::resolve(&self.storage, &CredentialScope::Tenant(TargetRef::Id(self.tenant)))
            .unwrap()
    }

    async fn run(&self, kind: JobKind, page_size: u32) -> SyncCounters {
        self.try_run(kind, page_size).await.unwrap()
    }

    async fn try_run(
        &self,
        kind: JobKind,
        page_size: u32,
    ) -> leadsync_lib::error::Result<SyncCounters> {
        let creds = self.creds();
        let options = JobOptions {
            page_size,
            lead_source_code: 7,
            rep_aliases: BTreeMap::new(),
        };
        let ctx = SyncContext {
            storage: &self.storage,
            activecampaign: &self.activecampaign,
            dynamics: &self.dynamics,
            creds: &creds,
            options: &options,
        };
        run_job(&ctx, kind).await
    }

    async fn mount_token(&self) {
        Mock::given(method("POST"))
            .and(path("/aad/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "tok",
                "expires_in": 3599
            })))
            .mount(&self.server)
            .await;
    }

    async fn mount_field_values(&self, field: &str, offset: u32, values: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path("/api/3/fieldValues"))
            .and(query_param("filters[fieldid]", field))
            .and(query_param("offset", offset.to_string().as_str()))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "fieldValues": values })),
            )
            .mount(&self.server)
            .await;
    }

    async fn mount_contact(&self, id: &str, email: &str, field_values: serde_json::Value) {
        Mock::given(method("GET"))
            .and(path(format!("/api/3/contacts/{}", id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "contact": {"id": id, "email": email},
                "fieldValues": field_values
            })))
            .mount(&self.server)
            .await;
    }

    async fn mount_lead(&self, email: &str, lead: serde_json::Value) {
        let filter = format!("emailaddress1 eq '{}'", email);
        let value = if lead.is_null() { json!([]) } else { json!([lead]) };
        Mock::given(method("GET"))
            .and(path("/api/data/v9.2/leads"))
            .and(query_param("$filter", filter.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": value })))
            .mount(&self.server)
            .await;
    }
}

async fn mount_owner_scenario(fx: &Fixture, lead_a_owner: &str) {
    fx.mount_token().await;
    fx.mount_field_values(
        "15",
        0,
        json!([
            {"contact": "1", "field": "15", "value": "Malina - English"},
            {"contact": "2", "field": "15", "value": "Somebody Else"},
            {"contact": "3", "field": "15", "value": null}
        ]),
    )
    .await;
    fx.mount_contact("1", "a@example.com", json!([])).await;
    fx.mount_contact("2", "b@example.com", json!([])).await;
    fx.mount_lead("a@example.com", json!({"leadid": LEAD_A, "_ownerid_value": lead_a_owner}))
        .await;
    fx.mount_lead("b@example.com", json!({"leadid": LEAD_B, "_ownerid_value": PATRICK}))
        .await;
}

#[tokio::test]
async fn owner_sync_is_idempotent() {
    let fx = Fixture::new(json!({"rep": "15"})).await;
    mount_owner_scenario(&fx, PATRICK).await;
    Mock::given(method("PATCH"))
        .and(path(format!("/api/data/v9.2/leads({})", LEAD_A)))
        .and(body_string_contains(&format!("/systemusers({})", MALINA)))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&fx.server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(format!("/api/data/v9.2/leads({})", LEAD_B)))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&fx.server)
        .await;

    let first = fx.run(JobKind::OwnerSync, 100).await;
    assert_eq!(
        first,
        SyncCounters {
            updated: 1,
            already_correct: 0,
            skipped: 1,
            errors: 0
        }
    );
    fx.server.verify().await;

    // Second pass sees the owner the first pass wrote.
    fx.server.reset().await;
    mount_owner_scenario(&fx, MALINA).await;
    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&fx.server)
        .await;

    let second = fx.run(JobKind::OwnerSync, 100).await;
    assert_eq!(second.updated, 0);
    assert_eq!(second.already_correct, 1);
    assert_eq!(second.skipped, 1);
    fx.server.verify().await;

    let connections = fx.storage.crm_connections(fx.tenant).unwrap();
    assert!(connections.iter().all(|c| c.last_sync_at.is_some()));
}

#[tokio::test]
async fn lead_source_already_trade_show_is_not_patched() {
    let fx = Fixture::new(json!({"tradeshow": "20"})).await;
    fx.mount_token().await;
    fx.mount_field_values(
        "20",
        0,
        json!([
            {"contact": "1", "field": "20", "value": "Expo 2024"},
            {"contact": "2", "field": "20", "value": "Expo 2024"}
        ]),
    )
    .await;
    fx.mount_contact("1", "a@example.com", json!([])).await;
    fx.mount_contact("2", "b@example.com", json!([])).await;
    fx.mount_lead("a@example.com", json!({"leadid": LEAD_A, "leadsourcecode": 7}))
        .await;
    fx.mount_lead("b@example.com", json!({"leadid": LEAD_B, "leadsourcecode": 1}))
        .await;

    Mock::given(method("PATCH"))
        .and(path(format!("/api/data/v9.2/leads({})", LEAD_A)))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&fx.server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(format!("/api/data/v9.2/leads({})", LEAD_B)))
        .and(body_json(json!({"leadsourcecode": 7})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&fx.server)
        .await;

    let counters = fx.run(JobKind::LeadSourceSync, 100).await;

    assert_eq!(counters.updated, 1);
    assert_eq!(counters.already_correct, 1);
    fx.server.verify().await;
}

#[tokio::test]
async fn backfill_patches_only_differing_fields() {
    let fx = Fixture::new(json!({
        "tradeshow": "20",
        "country": "12",
        "company": "7",
        "comments": "9"
    }))
    .await;
    fx.mount_token().await;
    fx.mount_field_values("20", 0, json!([{"contact": "1", "field": "20", "value": "Expo 2024"}]))
        .await;
    fx.mount_contact(
        "1",
        "a@example.com",
        json!([
            {"contact": "1", "field": "20", "value": "Expo 2024"},
            {"contact": "1", "field": "7", "value": "Acme"},
            {"contact": "1", "field": "9", "value": "Met at booth"}
        ]),
    )
    .await;
    fx.mount_lead(
        "a@example.com",
        json!({"leadid": LEAD_A, "companyname": "Acme ", "subject": null}),
    )
    .await;

    // Country falls back to the tenant default.
    Mock::given(method("PATCH"))
        .and(path(format!("/api/data/v9.2/leads({})", LEAD_A)))
        .and(body_json(json!({
            "subject": "Expo 2024 - Trade Show Lead",
            "description": "Met at booth",
            "address1_country": "Canada"
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&fx.server)
        .await;

    let counters = fx.run(JobKind::FieldBackfill, 100).await;

    assert_eq!(counters.updated, 1);
    assert_eq!(counters.processed(), 1);
    fx.server.verify().await;
}

#[tokio::test]
async fn pagination_stops_on_short_page() {
    let fx = Fixture::new(json!({"tradeshow": "20"})).await;
    fx.mount_token().await;
    fx.mount_field_values(
        "20",
        0,
        json!([
            {"contact": "1", "field": "20", "value": "Expo"},
            {"contact": "2", "field": "20", "value": "Expo"}
        ]),
    )
    .await;
    fx.mount_field_values("20", 2, json!([{"contact": "3", "field": "20", "value": "Expo"}]))
        .await;
    Mock::given(method("GET"))
        .and(path("/api/3/fieldValues"))
        .and(query_param("offset", "4"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"fieldValues": []})))
        .expect(0)
        .mount(&fx.server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/api/3/contacts/\d+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "contact": {"id": "1", "email": "nobody@example.com"}
        })))
        .mount(&fx.server)
        .await;
    fx.mount_lead("nobody@example.com", serde_json::Value::Null).await;

    let counters = fx.run(JobKind::LeadSourceSync, 2).await;

    assert_eq!(counters.skipped, 3);
    assert_eq!(counters.processed(), 3);
    fx.server.verify().await;
}

#[tokio::test]
async fn contact_errors_are_counted_and_the_batch_continues() {
    let fx = Fixture::new(json!({"tradeshow": "20"})).await;
    fx.mount_token().await;
    fx.mount_field_values(
        "20",
        0,
        json!([
            {"contact": "1", "field": "20", "value": "Expo"},
            {"contact": "2", "field": "20", "value": "Expo"}
        ]),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/api/3/contacts/1"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&fx.server)
        .await;
    fx.mount_contact("2", "b@example.com", json!([])).await;
    fx.mount_lead("b@example.com", json!({"leadid": LEAD_B, "leadsourcecode": 7}))
        .await;

    let counters = fx.run(JobKind::LeadSourceSync, 100).await;

    assert_eq!(counters.errors, 1);
    assert_eq!(counters.already_correct, 1);
}

#[tokio::test]
async fn missing_marker_mapping_fails_before_any_request() {
    let fx = Fixture::new(json!({"rep": "15"})).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&fx.server)
        .await;

    let err = fx.try_run(JobKind::LeadSourceSync, 100).await.unwrap_err();

    assert_eq!(err.kind(), "missing-credentials");
    assert!(err.to_string().contains("field_mappings.fields.tradeshow"));
    fx.server.verify().await;
}

#[tokio::test]
async fn oversized_page_size_is_capped_and_paging_continues() {
    let fx = Fixture::new(json!({"rep": "15"})).await;
    fx.mount_token().await;
    let empty: Vec<_> = (0..100)
        .map(|i| json!({"contact": format!("x{}", i), "field": "15", "value": null}))
        .collect();
    Mock::given(method("GET"))
        .and(path("/api/3/fieldValues"))
        .and(query_param("limit", "100"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "fieldValues": empty })))
        .expect(1)
        .mount(&fx.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/3/fieldValues"))
        .and(query_param("limit", "100"))
        .and(query_param("offset", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "fieldValues": [{"contact": "1", "field": "15", "value": "Malina - English"}]
        })))
        .expect(1)
        .mount(&fx.server)
        .await;
    fx.mount_contact("1", "a@example.com", json!([])).await;
    fx.mount_lead("a@example.com", json!({"leadid": LEAD_A, "_ownerid_value": MALINA}))
        .await;

    let counters = fx.run(JobKind::OwnerSync, 500).await;

    assert_eq!(counters.already_correct, 1);
    assert_eq!(counters.processed(), 1);
    fx.server.verify().await;
}
