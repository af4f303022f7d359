use std::sync::Arc;

use adsync_adapters::{run_delivery_query, DeliveryWarehouse};
use adsync_core::SyncSource;
use adsync_storage::NaturalKeyStore;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{
    Reconciler, SyncError, SyncErrorKind, SyncObserver, SyncStatusRecorder, TracingObserver,
    UpsertTally,
};

pub const WAREHOUSE_SUCCESS_MESSAGE: &str = "Warehouse sync success";

#[derive(Debug, Clone, Serialize)]
pub struct WarehouseSyncSummary {
    pub run_id: Uuid,
    pub query_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub rows: usize,
    pub flights: UpsertTally,
    pub status_id: i64,
}

/// Daily delivery job: one aggregate query, one upsert per row, one audit
/// row per run. Configuration errors skip the audit row.
pub struct WarehouseSync {
    warehouse: Arc<dyn DeliveryWarehouse>,
    store: Arc<dyn NaturalKeyStore>,
    observer: Arc<dyn SyncObserver>,
}

impl WarehouseSync {
    pub fn new(warehouse: Arc<dyn DeliveryWarehouse>, store: Arc<dyn NaturalKeyStore>) -> Self {
        Self {
            warehouse,
            store,
            observer: Arc::new(TracingObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub async fn run(&self, query_date: NaiveDate) -> Result<WarehouseSyncSummary, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("warehouse_sync", %run_id, %query_date);
        self.run_recorded(run_id, query_date).instrument(span).await
    }

    async fn reconcile_rows(
        &self,
        query_date: NaiveDate,
    ) -> Result<(usize, UpsertTally), SyncError> {
        let rows = run_delivery_query(self.warehouse.as_ref(), query_date).await?;
        let reconciler = Reconciler::new(Arc::clone(&self.store), Arc::clone(&self.observer));

        let mut tally = UpsertTally::default();
        for row in &rows {
            tally.record(reconciler.reconcile_delivery(&row.to_delivered_flight()).await?);
        }
        info!(
            rows = rows.len(),
            created = tally.created,
            updated = tally.updated,
            "delivery rows reconciled"
        );
        Ok((rows.len(), tally))
    }

    async fn run_recorded(
        &self,
        run_id: Uuid,
        query_date: NaiveDate,
    ) -> Result<WarehouseSyncSummary, SyncError> {
        let started_at = Utc::now();
        let recorder = SyncStatusRecorder::new(
            SyncSource::Warehouse,
            Arc::clone(&self.store),
            Arc::clone(&self.observer),
        );

        match self.reconcile_rows(query_date).await {
            Ok((rows, flights)) => {
                let status_id = recorder
                    .record_success(WAREHOUSE_SUCCESS_MESSAGE, query_date)
                    .await?;
                Ok(WarehouseSyncSummary {
                    run_id,
                    query_date,
                    started_at,
                    finished_at: Utc::now(),
                    rows,
                    flights,
                    status_id,
                })
            }
            Err(err) if err.kind() == SyncErrorKind::Configuration => {
                self.observer.job_failed("warehouse", &err);
                Err(err)
            }
            Err(err) => {
                self.observer.job_failed("warehouse", &err);
                if let Err(record_err) = recorder.record_failure(&err, query_date).await {
                    warn!(error = %record_err, "could not record warehouse sync failure");
                }
                Err(err)
            }
        }
    }
}
