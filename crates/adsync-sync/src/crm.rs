use std::sync::Arc;

use adsync_adapters::{CrmClient, CrmCredentials};
use adsync_core::SyncSource;
use adsync_storage::{HttpFetcher, NaturalKeyStore};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{Reconciler, SyncError, SyncObserver, SyncStatusRecorder, TracingObserver, UpsertTally};

pub const CRM_SUCCESS_MESSAGE: &str = "CRM sync success";

#[derive(Debug, Clone, Default, Serialize)]
pub struct DealSyncReport {
    pub pages: u32,
    pub hit_page_cap: bool,
    pub skipped: usize,
    pub deals: UpsertTally,
    pub line_items: UpsertTally,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MediaPlanReport {
    pub pages: u32,
    pub hit_page_cap: bool,
    /// Plans whose deal is not stored (not Closed Won, or not synced yet).
    pub skipped_plans: usize,
    pub applied: usize,
    /// Plan months with no matching budget line.
    pub unmatched: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CrmSyncSummary {
    pub run_id: Uuid,
    pub query_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub products: UpsertTally,
    pub deals: DealSyncReport,
    pub media_plans: Option<MediaPlanReport>,
    pub status_id: i64,
}

/// CRM job: products first, then Closed Won deals with their line items,
/// then (when enabled) media-plan rate terms for those line items.
/// `sync_deals` refuses to run until `sync_products` succeeded on the same
/// instance.
pub struct CrmSync {
    client: CrmClient,
    store: Arc<dyn NaturalKeyStore>,
    observer: Arc<dyn SyncObserver>,
    max_deal_pages: Option<u32>,
    media_plans: bool,
    products_synced: bool,
}

impl CrmSync {
    pub fn new(client: CrmClient, store: Arc<dyn NaturalKeyStore>) -> Self {
        Self {
            client,
            store,
            observer: Arc::new(TracingObserver),
            max_deal_pages: None,
            media_plans: false,
            products_synced: false,
        }
    }

    /// Authenticate once; the session is reused for every call of the run.
    pub async fn connect(
        http: HttpFetcher,
        base_url: &str,
        credentials: &CrmCredentials,
        store: Arc<dyn NaturalKeyStore>,
    ) -> Result<Self, SyncError> {
        let client = CrmClient::connect(http, base_url, credentials).await?;
        Ok(Self::new(client, store))
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn with_max_deal_pages(mut self, max_deal_pages: Option<u32>) -> Self {
        self.max_deal_pages = max_deal_pages;
        self
    }

    pub fn with_media_plans(mut self, enabled: bool) -> Self {
        self.media_plans = enabled;
        self
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(Arc::clone(&self.store), Arc::clone(&self.observer))
    }

    pub async fn sync_products(&mut self) -> Result<UpsertTally, SyncError> {
        let reconciler = self.reconciler();
        let products = self.client.fetch_products().await?;
        self.observer.page_fetched("products", 1, products.len());

        let mut tally = UpsertTally::default();
        for product in &products {
            tally.record(reconciler.reconcile_product(&product.to_product()).await?);
        }
        self.products_synced = true;
        info!(created = tally.created, updated = tally.updated, "products synced");
        Ok(tally)
    }

    /// Walk deal pages, upserting each Closed Won deal and then its line
    /// items. Only Closed Won deals are fully decoded. Pages already
    /// reconciled stay committed if a later one fails.
    pub async fn sync_deals(&self) -> Result<DealSyncReport, SyncError> {
        if !self.products_synced {
            return Err(SyncError::ProductsNotSynced);
        }
        let reconciler = self.reconciler();
        let mut report = DealSyncReport::default();

        let mut walk = self.client.deals(self.max_deal_pages);
        while let Some(page) = walk.next_page().await? {
            self.observer
                .page_fetched("deals", walk.completed_pages(), page.len());
            for entry in &page {
                if !entry.is_closed_won() {
                    self.observer
                        .deal_skipped(entry.id, entry.stage_name.as_deref().unwrap_or_default());
                    report.skipped += 1;
                    continue;
                }
                let deal = entry.decode()?;
                report.deals.record(reconciler.reconcile_deal(&deal.to_deal()).await?);
                self.resolve_line_items(&reconciler, deal.id, &mut report.line_items)
                    .await?;
            }
        }

        report.pages = walk.completed_pages();
        report.hit_page_cap = walk.hit_page_cap();
        self.observer
            .pages_completed("deals", report.pages, report.hit_page_cap);
        Ok(report)
    }

    async fn resolve_line_items(
        &self,
        reconciler: &Reconciler,
        deal_id: i64,
        tally: &mut UpsertTally,
    ) -> Result<(), SyncError> {
        for line_item in self.client.fetch_deal_products(deal_id).await? {
            let product_id = line_item.product.id;
            if reconciler.store().find_product(product_id).await?.is_none() {
                return Err(SyncError::MissingProduct {
                    deal_id,
                    product_id,
                });
            }
            for deal_product in line_item.monthly_budgets(deal_id) {
                tally.record(reconciler.reconcile_deal_product(&deal_product).await?);
            }
        }
        Ok(())
    }

    /// Walk media plans and copy rate type, rate and monthly quantity onto
    /// the budget lines of stored deals. Never creates deals or lines.
    pub async fn sync_media_plans(&self) -> Result<MediaPlanReport, SyncError> {
        let reconciler = self.reconciler();
        let mut report = MediaPlanReport::default();

        let mut walk = self.client.media_plans(self.max_deal_pages);
        while let Some(page) = walk.next_page().await? {
            self.observer
                .page_fetched("media_plans", walk.completed_pages(), page.len());
            for plan in &page {
                if reconciler.store().find_deal(plan.deal_id).await?.is_none() {
                    self.observer.media_plan_skipped(plan.id, plan.deal_id);
                    report.skipped_plans += 1;
                    continue;
                }
                for line_item in self.client.fetch_media_plan_line_items(plan.id).await? {
                    for terms in line_item.plan_terms(plan.deal_id) {
                        if reconciler.apply_plan(&terms).await? {
                            report.applied += 1;
                        } else {
                            report.unmatched += 1;
                        }
                    }
                }
            }
        }

        report.pages = walk.completed_pages();
        report.hit_page_cap = walk.hit_page_cap();
        self.observer
            .pages_completed("media_plans", report.pages, report.hit_page_cap);
        Ok(report)
    }

    async fn sync_all(&mut self) -> Result<CrmPhases, SyncError> {
        let products = self.sync_products().await?;
        let deals = self.sync_deals().await?;
        let media_plans = if self.media_plans {
            Some(self.sync_media_plans().await?)
        } else {
            None
        };
        Ok(CrmPhases {
            products,
            deals,
            media_plans,
        })
    }

    /// Every phase plus one audit row tagged `crm`, written on success and
    /// on failure alike.
    pub async fn run(&mut self, query_date: NaiveDate) -> Result<CrmSyncSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("crm_sync", %run_id, %query_date);
        self.run_recorded(run_id, query_date).instrument(span).await
    }

    async fn run_recorded(
        &mut self,
        run_id: Uuid,
        query_date: NaiveDate,
    ) -> Result<CrmSyncSummary, SyncError> {
        let started_at = Utc::now();
        let recorder = SyncStatusRecorder::new(
            SyncSource::Crm,
            Arc::clone(&self.store),
            Arc::clone(&self.observer),
        );

        match self.sync_all().await {
            Ok(CrmPhases {
                products,
                deals,
                media_plans,
            }) => {
                let status_id = recorder.record_success(CRM_SUCCESS_MESSAGE, query_date).await?;
                Ok(CrmSyncSummary {
                    run_id,
                    query_date,
                    started_at,
                    finished_at: Utc::now(),
                    products,
                    deals,
                    media_plans,
                    status_id,
                })
            }
            Err(err) => {
                self.observer.job_failed("crm", &err);
                if let Err(record_err) = recorder.record_failure(&err, query_date).await {
                    warn!(error = %record_err, "could not record crm sync failure");
                }
                Err(err)
            }
        }
    }
}

struct CrmPhases {
    products: UpsertTally,
    deals: DealSyncReport,
    media_plans: Option<MediaPlanReport>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncErrorKind;
    use adsync_core::{CampaignType, SyncOutcome, UpsertOutcome};
    use adsync_storage::testing::ScriptedTransport;
    use adsync_storage::{ApiRequest, ApiResponse, MemoryStore, StatusCode};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;

    const BASE_URL: &str = "https://crm.test/api";

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 4, 2).expect("valid")
    }

    fn credentials() -> CrmCredentials {
        CrmCredentials {
            email: "sync@example.com".into(),
            password: "hunter2".into(),
        }
    }

    fn deal(id: i64, stage: &str) -> Value {
        json!({
            "id": id,
            "name": format!("Deal {id}"),
            "stage_name": stage,
            "advertiser_name": "HiProduce",
            "currency": "$",
            "budget": "500.0",
            "deal_members": [{"email": "jsales@example.com"}],
            "start_date": "2024-04-01",
            "end_date": "2024-04-30"
        })
    }

    fn line_item(product_id: i64, month: &str, budget: &str) -> Value {
        json!({
            "product": {"id": product_id, "full_name": "X US (CPC)"},
            "deal_product_budgets": [{"month": month, "budget": budget}]
        })
    }

    /// Fake CRM: token endpoint, one products page, numbered deal pages and
    /// per-deal line items. Anything else is a 404.
    struct FakeCrm {
        products: Value,
        deal_pages: Vec<Value>,
        line_items: HashMap<i64, Value>,
        media_plans: Value,
        plan_line_items: HashMap<i64, Value>,
        failing_deal_page: Option<u32>,
    }

    impl FakeCrm {
        fn new(products: Value, deal_pages: Vec<Value>) -> Self {
            Self {
                products,
                deal_pages,
                line_items: HashMap::new(),
                media_plans: json!([]),
                plan_line_items: HashMap::new(),
                failing_deal_page: None,
            }
        }

        fn with_line_items(mut self, deal_id: i64, items: Value) -> Self {
            self.line_items.insert(deal_id, items);
            self
        }

        fn with_media_plans(mut self, plans: Value) -> Self {
            self.media_plans = plans;
            self
        }

        fn with_plan_line_items(mut self, media_plan_id: i64, items: Value) -> Self {
            self.plan_line_items.insert(media_plan_id, items);
            self
        }

        fn failing_on_deal_page(mut self, page: u32) -> Self {
            self.failing_deal_page = Some(page);
            self
        }

        fn respond(&self, req: &ApiRequest) -> ApiResponse {
            let path = req.url.trim_start_matches(BASE_URL);
            if path == "/user_token" {
                return ApiResponse::json(StatusCode::CREATED, &json!({"jwt": "i.am.jwt"}));
            }
            if path == "/products" {
                return ApiResponse::json(StatusCode::OK, &self.products);
            }
            if path == "/deals" {
                let page: u32 = req
                    .query_value("page")
                    .and_then(|p| p.parse().ok())
                    .unwrap_or(0);
                if Some(page) == self.failing_deal_page {
                    return ApiResponse::new(StatusCode::INTERNAL_SERVER_ERROR, "boom");
                }
                let body = self
                    .deal_pages
                    .get((page as usize).wrapping_sub(1))
                    .cloned()
                    .unwrap_or_else(|| json!([]));
                return ApiResponse::json(StatusCode::OK, &body);
            }
            if let Some(id) = path
                .strip_prefix("/deals/")
                .and_then(|rest| rest.strip_suffix("/deal_products"))
                .and_then(|id| id.parse::<i64>().ok())
            {
                let body = self.line_items.get(&id).cloned().unwrap_or_else(|| json!([]));
                return ApiResponse::json(StatusCode::OK, &body);
            }
            if path == "/media_plans" {
                let body = match req.query_value("page") {
                    Some("1") => self.media_plans.clone(),
                    _ => json!([]),
                };
                return ApiResponse::json(StatusCode::OK, &body);
            }
            if let Some(id) = path
                .strip_prefix("/media_plans/")
                .and_then(|rest| rest.strip_suffix("/line_items"))
                .and_then(|id| id.parse::<i64>().ok())
            {
                let body = self
                    .plan_line_items
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| json!([]));
                return ApiResponse::json(StatusCode::OK, &body);
            }
            ApiResponse::new(StatusCode::NOT_FOUND, "not found")
        }

        fn into_transport(self) -> Arc<ScriptedTransport> {
            ScriptedTransport::new(move |req| self.respond(req))
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<String>>,
    }

    impl RecordingObserver {
        fn events(&self) -> Vec<String> {
            self.events.lock().expect("events").clone()
        }

        fn push(&self, event: String) {
            self.events.lock().expect("events").push(event);
        }
    }

    impl SyncObserver for RecordingObserver {
        fn page_fetched(&self, endpoint: &str, page: u32, count: usize) {
            self.push(format!("page {endpoint} {page} {count}"));
        }

        fn pages_completed(&self, endpoint: &str, pages: u32, hit_page_cap: bool) {
            self.push(format!("done {endpoint} {pages} {hit_page_cap}"));
        }

        fn upserted(&self, entity: &'static str, key: &str, outcome: UpsertOutcome) {
            self.push(format!("{} {entity} {key}", outcome.as_str()));
        }

        fn deal_skipped(&self, deal_id: i64, stage: &str) {
            self.push(format!("skip {deal_id} {stage}"));
        }

        fn media_plan_skipped(&self, media_plan_id: i64, deal_id: i64) {
            self.push(format!("skip plan {media_plan_id} deal {deal_id}"));
        }
    }

    async fn job(transport: &Arc<ScriptedTransport>, store: &Arc<MemoryStore>) -> CrmSync {
        CrmSync::connect(transport.fetcher(), BASE_URL, &credentials(), store.clone())
            .await
            .expect("connect")
    }

    #[tokio::test]
    async fn end_to_end_scenario_populates_the_store() {
        let transport = FakeCrm::new(
            json!([{"id": 1, "full_name": "X US (CPC)"}]),
            vec![json!([deal(10, "Closed Won")])],
        )
        .with_line_items(10, json!([line_item(1, "2024-04", "500")]))
        .into_transport();
        let store = Arc::new(MemoryStore::new());

        let summary = job(&transport, &store).await.run(date()).await.expect("run");

        let products = store.products().await;
        assert_eq!(products.len(), 1);
        assert_eq!(products[0].external_id, 1);
        assert_eq!(products[0].campaign_type, CampaignType::Cpc);
        assert_eq!(products[0].country_code.as_deref(), Some("US"));

        let deals = store.deals().await;
        assert_eq!(deals.len(), 1);
        assert_eq!(deals[0].external_id, 10);
        assert_eq!(deals[0].amount, 500);

        let line_items = store.deal_products().await;
        assert_eq!(line_items.len(), 1);
        assert_eq!(line_items[0].key.deal_id, 10);
        assert_eq!(line_items[0].key.product_id, 1);
        assert_eq!(line_items[0].key.month, "2024-04");
        assert_eq!(line_items[0].budget, 500);

        assert_eq!(summary.products.created, 1);
        assert_eq!(summary.deals.deals.created, 1);
        assert_eq!(summary.deals.line_items.created, 1);
        assert_eq!(summary.deals.pages, 1);
        assert_eq!(transport.requests_to("/deals").len(), 2);

        let statuses = store.sync_statuses().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].id, summary.status_id);
        assert_eq!(statuses[0].status.source, SyncSource::Crm);
        assert_eq!(statuses[0].status.outcome, SyncOutcome::Success);
        assert_eq!(statuses[0].status.message, CRM_SUCCESS_MESSAGE);
        assert_eq!(statuses[0].status.query_date, date());
        assert_eq!(summary.query_date, date());
    }

    #[tokio::test]
    async fn rerunning_the_job_keeps_one_row_per_key() {
        let transport = FakeCrm::new(
            json!([{"id": 1, "full_name": "X US (CPC)"}]),
            vec![json!([deal(10, "Closed Won")])],
        )
        .with_line_items(10, json!([line_item(1, "2024-04", "500")]))
        .into_transport();
        let store = Arc::new(MemoryStore::new());

        job(&transport, &store).await.run(date()).await.expect("first");
        let second = job(&transport, &store).await.run(date()).await.expect("second");

        assert_eq!(store.products().await.len(), 1);
        assert_eq!(store.deals().await.len(), 1);
        assert_eq!(store.deal_products().await.len(), 1);
        assert_eq!(second.deals.deals.updated, 1);
        assert_eq!(second.deals.line_items.updated, 1);
        assert_eq!(store.sync_statuses().await.len(), 2);
    }

    #[tokio::test]
    async fn only_closed_won_deals_are_synced() {
        let transport = FakeCrm::new(
            json!([{"id": 1, "full_name": "X US (CPC)"}]),
            vec![
                json!([deal(10, "Closed Won"), deal(11, "Closed Lost"), deal(12, "closed won")]),
                json!([deal(13, "Closed Won - Pending"), deal(14, "Closed Won")]),
            ],
        )
        .into_transport();
        let store = Arc::new(MemoryStore::new());
        let observer = Arc::new(RecordingObserver::default());

        let mut crm = job(&transport, &store).await.with_observer(observer.clone());
        crm.sync_products().await.expect("products");
        let report = crm.sync_deals().await.expect("deals");

        let ids: Vec<i64> = store.deals().await.iter().map(|d| d.external_id).collect();
        assert_eq!(ids, vec![10, 14]);
        assert_eq!(report.skipped, 3);
        assert_eq!(report.pages, 2);
        assert!(!report.hit_page_cap);

        let line_item_calls: Vec<String> = transport
            .requests_to("/deal_products")
            .into_iter()
            .map(|r| r.url)
            .collect();
        assert_eq!(
            line_item_calls,
            vec![
                "https://crm.test/api/deals/10/deal_products",
                "https://crm.test/api/deals/14/deal_products",
            ]
        );

        let events = observer.events();
        assert!(events.contains(&"skip 11 Closed Lost".to_string()));
        assert!(events.contains(&"page deals 2 2".to_string()));
        assert_eq!(events.last().map(String::as_str), Some("done deals 2 false"));
    }

    #[tokio::test]
    async fn incomplete_deals_outside_closed_won_do_not_fail_the_page() {
        let mut pitch = deal(11, "Pitch");
        pitch["budget"] = Value::Null;
        pitch["start_date"] = Value::Null;
        pitch["end_date"] = Value::Null;
        let mut no_stage = deal(12, "Pitch");
        no_stage["stage_name"] = Value::Null;
        let transport = FakeCrm::new(
            json!([{"id": 1, "full_name": "X US (CPC)"}]),
            vec![json!([deal(10, "Closed Won"), pitch, no_stage])],
        )
        .with_line_items(10, json!([line_item(1, "2024-04", "500")]))
        .into_transport();
        let store = Arc::new(MemoryStore::new());

        let summary = job(&transport, &store).await.run(date()).await.expect("run");

        let ids: Vec<i64> = store.deals().await.iter().map(|d| d.external_id).collect();
        assert_eq!(ids, vec![10]);
        assert_eq!(summary.deals.skipped, 2);
        assert_eq!(store.deal_products().await.len(), 1);
        assert_eq!(store.sync_statuses().await[0].status.outcome, SyncOutcome::Success);
    }

    #[tokio::test]
    async fn malformed_closed_won_deal_is_a_decode_failure() {
        let mut broken = deal(10, "Closed Won");
        broken["budget"] = Value::Null;
        let transport = FakeCrm::new(
            json!([{"id": 1, "full_name": "X US (CPC)"}]),
            vec![json!([broken])],
        )
        .into_transport();
        let store = Arc::new(MemoryStore::new());

        let err = job(&transport, &store)
            .await
            .run(date())
            .await
            .expect_err("decode");

        assert_eq!(err.kind(), SyncErrorKind::Decode);
        assert!(store.deals().await.is_empty());
        assert_eq!(store.sync_statuses().await[0].status.outcome, SyncOutcome::Failure);
    }

    fn plan_line_item(
        product_id: i64,
        rate_type: &str,
        rate: &str,
        months: &[(&str, &str)],
    ) -> Value {
        let monthlies: Vec<Value> = months
            .iter()
            .map(|(month, quantity)| json!({"month": month, "quantity": quantity, "budget": "1.0"}))
            .collect();
        json!({
            "product": {"id": product_id, "name": "X US (CPM)"},
            "rate_type": {"id": 124, "name": rate_type},
            "rate": rate,
            "line_item_monthlies": monthlies
        })
    }

    #[tokio::test]
    async fn media_plans_enrich_existing_budget_lines() {
        let transport = FakeCrm::new(
            json!([{"id": 1, "full_name": "X US (CPM)"}]),
            vec![json!([deal(10, "Closed Won"), deal(11, "Pitch")])],
        )
        .with_line_items(10, json!([line_item(1, "2024-04", "500")]))
        .with_media_plans(json!([
            {"id": 500, "deal_id": 10, "deal_name": "Deal 10"},
            {"id": 501, "deal_id": 11, "deal_name": "Deal 11"}
        ]))
        .with_plan_line_items(
            500,
            json!([plan_line_item(1, "CPM", "0.93", &[("2024-04", "1500.7"), ("2024-05", "10")])]),
        )
        .into_transport();
        let store = Arc::new(MemoryStore::new());
        let observer = Arc::new(RecordingObserver::default());

        let summary = job(&transport, &store)
            .await
            .with_observer(observer.clone())
            .with_media_plans(true)
            .run(date())
            .await
            .expect("run");

        let report = summary.media_plans.expect("media plan report");
        assert_eq!(report.pages, 1);
        assert_eq!(report.skipped_plans, 1);
        assert_eq!(report.applied, 1);
        assert_eq!(report.unmatched, 1);

        let plans = store.deal_product_plans().await;
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].key.deal_id, 10);
        assert_eq!(plans[0].key.month, "2024-04");
        assert_eq!(plans[0].rate_type, "CPM");
        assert_eq!(plans[0].rate, 0.93);
        assert_eq!(plans[0].quantity, 1500);
        assert_eq!(store.deal_products().await.len(), 1);

        assert_eq!(transport.requests_to("/line_items").len(), 1);
        assert!(observer
            .events()
            .contains(&"skip plan 501 deal 11".to_string()));
    }

    #[tokio::test]
    async fn media_plans_are_not_fetched_unless_enabled() {
        let transport = FakeCrm::new(
            json!([{"id": 1, "full_name": "X US (CPM)"}]),
            vec![json!([deal(10, "Closed Won")])],
        )
        .with_media_plans(json!([{"id": 500, "deal_id": 10}]))
        .into_transport();
        let store = Arc::new(MemoryStore::new());

        let summary = job(&transport, &store).await.run(date()).await.expect("run");

        assert!(summary.media_plans.is_none());
        assert!(transport.requests_to("/media_plans").is_empty());
        assert!(store.deal_product_plans().await.is_empty());
    }

    #[tokio::test]
    async fn deal_page_cap_stops_the_walk() {
        let pages = (0..5).map(|i| json!([deal(100 + i, "Pitch")])).collect();
        let transport =
            FakeCrm::new(json!([{"id": 1, "full_name": "X US (CPC)"}]), pages).into_transport();
        let store = Arc::new(MemoryStore::new());

        let mut crm = job(&transport, &store).await.with_max_deal_pages(Some(2));
        crm.sync_products().await.expect("products");
        let report = crm.sync_deals().await.expect("deals");

        assert!(report.hit_page_cap);
        assert_eq!(report.pages, 2);
        assert_eq!(transport.requests_to("/deals").len(), 2);
    }

    #[tokio::test]
    async fn deals_before_products_is_rejected() {
        let transport =
            FakeCrm::new(json!([]), vec![json!([deal(10, "Closed Won")])]).into_transport();
        let store = Arc::new(MemoryStore::new());

        let crm = job(&transport, &store).await;
        let err = crm.sync_deals().await.expect_err("precondition");

        assert_eq!(err.kind(), SyncErrorKind::ProductsNotSynced);
        assert!(transport.requests_to("/deals").is_empty());
        assert!(store.deals().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_product_fails_loudly() {
        let transport = FakeCrm::new(
            json!([{"id": 1, "full_name": "X US (CPC)"}]),
            vec![json!([deal(10, "Closed Won")])],
        )
        .with_line_items(10, json!([line_item(2, "2024-04", "500")]))
        .into_transport();
        let store = Arc::new(MemoryStore::new());

        let err = job(&transport, &store)
            .await
            .run(date())
            .await
            .expect_err("missing product");

        assert!(matches!(
            err,
            SyncError::MissingProduct {
                deal_id: 10,
                product_id: 2
            }
        ));
        assert_eq!(store.deals().await.len(), 1);
        assert!(store.deal_products().await.is_empty());

        let statuses = store.sync_statuses().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status.outcome, SyncOutcome::Failure);
        assert!(statuses[0]
            .status
            .message
            .contains("product 2 referenced by deal 10 has not been synced"));
    }

    #[tokio::test]
    async fn failed_page_keeps_earlier_pages_committed() {
        let transport = FakeCrm::new(
            json!([{"id": 1, "full_name": "X US (CPC)"}]),
            vec![json!([deal(10, "Closed Won")]), json!([deal(11, "Closed Won")])],
        )
        .failing_on_deal_page(2)
        .into_transport();
        let store = Arc::new(MemoryStore::new());

        let err = job(&transport, &store)
            .await
            .run(date())
            .await
            .expect_err("page 2 fails");

        match err {
            SyncError::ApiResponse { endpoint, status } => {
                assert_eq!(endpoint, "deals");
                assert_eq!(status, 500);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let ids: Vec<i64> = store.deals().await.iter().map(|d| d.external_id).collect();
        assert_eq!(ids, vec![10]);
        assert_eq!(store.sync_statuses().await.len(), 1);
    }

    #[tokio::test]
    async fn authentication_failure_writes_nothing() {
        let transport = ScriptedTransport::new(|_req| {
            ApiResponse::new(StatusCode::UNAUTHORIZED, "bad credentials")
        });
        let store = Arc::new(MemoryStore::new());

        let err = CrmSync::connect(transport.fetcher(), BASE_URL, &credentials(), store.clone())
            .await
            .err()
            .expect("auth must fail");

        assert_eq!(err.kind(), SyncErrorKind::Authentication);
        assert_eq!(transport.request_count(), 1);
        assert!(store.sync_statuses().await.is_empty());
        assert!(store.products().await.is_empty());
    }
}
