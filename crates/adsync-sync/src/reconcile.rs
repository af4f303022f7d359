use std::sync::Arc;

use adsync_core::{Deal, DealProduct, DealProductPlan, DeliveredFlight, Product, UpsertOutcome};
use adsync_storage::NaturalKeyStore;

use crate::{SyncError, SyncObserver};

/// Idempotent write path shared by both jobs. Each call is one upsert keyed
/// by natural identity; created vs updated is reported to the observer only.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn NaturalKeyStore>,
    observer: Arc<dyn SyncObserver>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn NaturalKeyStore>, observer: Arc<dyn SyncObserver>) -> Self {
        Self { store, observer }
    }

    pub fn store(&self) -> &dyn NaturalKeyStore {
        self.store.as_ref()
    }

    pub async fn reconcile_product(&self, product: &Product) -> Result<UpsertOutcome, SyncError> {
        let outcome = self.store.upsert_product(product).await?;
        self.observer
            .upserted("product", &product.external_id.to_string(), outcome);
        Ok(outcome)
    }

    pub async fn reconcile_deal(&self, deal: &Deal) -> Result<UpsertOutcome, SyncError> {
        let outcome = self.store.upsert_deal(deal).await?;
        self.observer
            .upserted("deal", &deal.external_id.to_string(), outcome);
        Ok(outcome)
    }

    pub async fn reconcile_deal_product(
        &self,
        deal_product: &DealProduct,
    ) -> Result<UpsertOutcome, SyncError> {
        let outcome = self.store.upsert_deal_product(deal_product).await?;
        self.observer
            .upserted("deal_product", &deal_product.key.to_string(), outcome);
        Ok(outcome)
    }

    /// True when the terms landed on an existing budget line.
    pub async fn apply_plan(&self, plan: &DealProductPlan) -> Result<bool, SyncError> {
        let applied = self.store.apply_deal_product_plan(plan).await?;
        self.observer.plan_applied(&plan.key.to_string(), applied);
        Ok(applied)
    }

    pub async fn reconcile_delivery(
        &self,
        flight: &DeliveredFlight,
    ) -> Result<UpsertOutcome, SyncError> {
        let outcome = self.store.upsert_delivered_flight(flight).await?;
        self.observer
            .upserted("delivered_flight", &flight.key.to_string(), outcome);
        Ok(outcome)
    }
}
