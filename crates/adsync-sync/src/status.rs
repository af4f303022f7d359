use std::error::Error as StdError;
use std::sync::Arc;

use adsync_core::{SyncOutcome, SyncSource, SyncStatus};
use adsync_storage::NaturalKeyStore;
use chrono::{NaiveDate, Utc};

use crate::{SyncError, SyncObserver};

/// Renders an error and each of its sources, outermost first.
pub fn error_trace(err: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(" <- ")
}

/// Audit message for a run that failed for any reason other than an empty
/// result set.
pub fn failure_message(query_date: NaiveDate, err: &SyncError) -> String {
    format!(
        "Exception: failure, query date: {query_date}, {err} Trace: {}",
        error_trace(err)
    )
}

/// Writes the append-only audit row for one job invocation.
#[derive(Clone)]
pub struct SyncStatusRecorder {
    source: SyncSource,
    store: Arc<dyn NaturalKeyStore>,
    observer: Arc<dyn SyncObserver>,
}

impl SyncStatusRecorder {
    pub fn new(
        source: SyncSource,
        store: Arc<dyn NaturalKeyStore>,
        observer: Arc<dyn SyncObserver>,
    ) -> Self {
        Self {
            source,
            store,
            observer,
        }
    }

    /// `synced_on` is stamped at the moment of recording.
    pub async fn record(
        &self,
        outcome: SyncOutcome,
        message: impl Into<String>,
        query_date: NaiveDate,
    ) -> Result<i64, SyncError> {
        let status = SyncStatus {
            source: self.source,
            outcome,
            message: message.into(),
            synced_on: Utc::now(),
            query_date,
        };
        let id = self.store.insert_sync_status(&status).await?;
        self.observer.status_recorded(id, &status);
        Ok(id)
    }

    pub async fn record_success(
        &self,
        message: &str,
        query_date: NaiveDate,
    ) -> Result<i64, SyncError> {
        self.record(SyncOutcome::Success, message, query_date).await
    }

    /// NoData keeps its own short message; everything else gets the
    /// message plus trace.
    pub async fn record_failure(
        &self,
        err: &SyncError,
        query_date: NaiveDate,
    ) -> Result<i64, SyncError> {
        let message = match err {
            SyncError::NoData { .. } => err.to_string(),
            _ => failure_message(query_date, err),
        };
        self.record(SyncOutcome::Failure, message, query_date).await
    }
}
