//! Natural-key persistence + HTTP fetch utilities for adsync.

use std::collections::BTreeMap;

use adsync_core::{
    Deal, DealProduct, DealProductKey, DealProductPlan, DeliveredFlight, DeliveredFlightKey,
    Product, SyncStatus, UpsertOutcome,
};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

mod http;
mod postgres;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use http::{
    classify_status, ApiRequest, ApiResponse, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, HttpTransport, ReqwestTransport, RetryDisposition,
};
pub use postgres::PgStore;
pub use reqwest::{Method, StatusCode};

pub const CRATE_NAME: &str = "adsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("{entity} {external_id} does not exist")]
    MissingReference {
        entity: &'static str,
        external_id: i64,
    },
    #[error("unexpected value {value:?} in column {column}")]
    InvalidValue { column: &'static str, value: String },
}

/// Upsert-by-natural-key surface used by both sync jobs.
///
/// Every upsert overwrites all non-key fields of an existing row (last write
/// wins) or inserts a new one, atomically per row.
#[async_trait]
pub trait NaturalKeyStore: Send + Sync {
    async fn upsert_product(&self, product: &Product) -> Result<UpsertOutcome, StoreError>;

    async fn find_product(&self, external_id: i64) -> Result<Option<Product>, StoreError>;

    async fn upsert_deal(&self, deal: &Deal) -> Result<UpsertOutcome, StoreError>;

    async fn find_deal(&self, external_id: i64) -> Result<Option<Deal>, StoreError>;

    /// Both the deal and the product of the key must already be stored.
    async fn upsert_deal_product(
        &self,
        deal_product: &DealProduct,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Overwrite the plan terms of an existing budget line. Returns false,
    /// changing nothing, when no line with that key is stored.
    async fn apply_deal_product_plan(&self, plan: &DealProductPlan) -> Result<bool, StoreError>;

    async fn upsert_delivered_flight(
        &self,
        flight: &DeliveredFlight,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Append an audit row and return its generated id.
    async fn insert_sync_status(&self, status: &SyncStatus) -> Result<i64, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSyncStatus {
    pub id: i64,
    pub status: SyncStatus,
}

/// In-process store with the same upsert semantics as [`PgStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    products: BTreeMap<i64, Product>,
    deals: BTreeMap<i64, Deal>,
    deal_products: BTreeMap<DealProductKey, DealProduct>,
    deal_product_plans: BTreeMap<DealProductKey, DealProductPlan>,
    delivered_flights: BTreeMap<DeliveredFlightKey, DeliveredFlight>,
    sync_statuses: Vec<StoredSyncStatus>,
}

fn upsert_entry<K: Ord, V>(map: &mut BTreeMap<K, V>, key: K, value: V) -> UpsertOutcome {
    match map.insert(key, value) {
        Some(_) => UpsertOutcome::Updated,
        None => UpsertOutcome::Created,
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn products(&self) -> Vec<Product> {
        self.state.lock().await.products.values().cloned().collect()
    }

    pub async fn deals(&self) -> Vec<Deal> {
        self.state.lock().await.deals.values().cloned().collect()
    }

    pub async fn deal_products(&self) -> Vec<DealProduct> {
        self.state.lock().await.deal_products.values().cloned().collect()
    }

    pub async fn deal_product_plans(&self) -> Vec<DealProductPlan> {
        self.state
            .lock()
            .await
            .deal_product_plans
            .values()
            .cloned()
            .collect()
    }

    pub async fn delivered_flights(&self) -> Vec<DeliveredFlight> {
        self.state
            .lock()
            .await
            .delivered_flights
            .values()
            .cloned()
            .collect()
    }

    pub async fn sync_statuses(&self) -> Vec<StoredSyncStatus> {
        self.state.lock().await.sync_statuses.clone()
    }
}

#[async_trait]
impl NaturalKeyStore for MemoryStore {
    async fn upsert_product(&self, product: &Product) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        Ok(upsert_entry(
            &mut state.products,
            product.external_id,
            product.clone(),
        ))
    }

    async fn find_product(&self, external_id: i64) -> Result<Option<Product>, StoreError> {
        Ok(self.state.lock().await.products.get(&external_id).cloned())
    }

    async fn upsert_deal(&self, deal: &Deal) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        Ok(upsert_entry(&mut state.deals, deal.external_id, deal.clone()))
    }

    async fn find_deal(&self, external_id: i64) -> Result<Option<Deal>, StoreError> {
        Ok(self.state.lock().await.deals.get(&external_id).cloned())
    }

    async fn upsert_deal_product(
        &self,
        deal_product: &DealProduct,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let key = &deal_product.key;
        if !state.deals.contains_key(&key.deal_id) {
            return Err(StoreError::MissingReference {
                entity: "deal",
                external_id: key.deal_id,
            });
        }
        if !state.products.contains_key(&key.product_id) {
            return Err(StoreError::MissingReference {
                entity: "product",
                external_id: key.product_id,
            });
        }
        Ok(upsert_entry(
            &mut state.deal_products,
            key.clone(),
            deal_product.clone(),
        ))
    }

    async fn apply_deal_product_plan(&self, plan: &DealProductPlan) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if !state.deal_products.contains_key(&plan.key) {
            return Ok(false);
        }
        state.deal_product_plans.insert(plan.key.clone(), plan.clone());
        Ok(true)
    }

    async fn upsert_delivered_flight(
        &self,
        flight: &DeliveredFlight,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        Ok(upsert_entry(
            &mut state.delivered_flights,
            flight.key.clone(),
            flight.clone(),
        ))
    }

    async fn insert_sync_status(&self, status: &SyncStatus) -> Result<i64, StoreError> {
        let mut state = self.state.lock().await;
        let id = state.sync_statuses.len() as i64 + 1;
        state.sync_statuses.push(StoredSyncStatus {
            id,
            status: status.clone(),
        });
        Ok(id)
    }
}
