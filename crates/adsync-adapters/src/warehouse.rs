//! Daily delivery aggregation against the analytics warehouse.

use adsync_core::{DeliveredFlight, DeliveredFlightKey};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tracing::info;

pub const DEFAULT_DELIVERY_TABLE: &str = "consolidated_ad_metrics_daily";

#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("No data returned for date {date}")]
    NoData { date: NaiveDate },
    #[error("invalid warehouse table name {0:?}")]
    InvalidTable(String),
    #[error("warehouse connection failed: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("warehouse query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// One aggregated result row: clicks and impressions summed per
/// (date, campaign, flight, provider) group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRow {
    pub submission_date: NaiveDate,
    pub campaign_id: i64,
    pub campaign_name: String,
    pub flight_id: i64,
    pub flight_name: String,
    pub provider: String,
    pub clicks: i64,
    pub impressions: i64,
}

impl DeliveryRow {
    pub fn to_delivered_flight(&self) -> DeliveredFlight {
        DeliveredFlight {
            key: DeliveredFlightKey {
                submission_date: self.submission_date,
                campaign_id: self.campaign_id,
                flight_id: self.flight_id,
                provider: self.provider.clone(),
            },
            campaign_name: self.campaign_name.clone(),
            flight_name: self.flight_name.clone(),
            clicks_delivered: self.clicks,
            impressions_delivered: self.impressions,
        }
    }
}

#[async_trait]
pub trait DeliveryWarehouse: Send + Sync {
    async fn aggregate_delivery(&self, date: NaiveDate) -> Result<Vec<DeliveryRow>, WarehouseError>;
}

fn valid_table_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').all(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) if first.is_ascii_alphabetic() || first == '_' => {
                    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                }
                _ => false,
            }
        })
}

/// Aggregation statement over a validated (optionally schema-qualified)
/// table. The date is always bound as a parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryQuery {
    table: String,
}

impl DeliveryQuery {
    pub fn new(table: impl Into<String>) -> Result<Self, WarehouseError> {
        let table = table.into();
        if !valid_table_name(&table) {
            return Err(WarehouseError::InvalidTable(table));
        }
        Ok(Self { table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// One row per delivered-flight key. Names are not part of the key, so a
    /// flight renamed mid-day still aggregates into a single row.
    pub fn sql(&self) -> String {
        format!(
            r#"
            SELECT submission_date,
                   campaign_id,
                   COALESCE(MAX(campaign_name), '') AS campaign_name,
                   flight_id,
                   COALESCE(MAX(flight_name), '') AS flight_name,
                   COALESCE(provider, '') AS provider,
                   COALESCE(SUM(clicks), 0)::BIGINT AS clicks,
                   COALESCE(SUM(impressions), 0)::BIGINT AS impressions
              FROM {table}
             WHERE submission_date = $1
               AND campaign_id IS NOT NULL
               AND flight_id IS NOT NULL
             GROUP BY submission_date, campaign_id, flight_id, COALESCE(provider, '')
             ORDER BY campaign_id, flight_id, provider
            "#,
            table = self.table
        )
    }
}

impl Default for DeliveryQuery {
    fn default() -> Self {
        Self {
            table: DEFAULT_DELIVERY_TABLE.to_string(),
        }
    }
}

fn delivery_row(row: &PgRow) -> Result<DeliveryRow, sqlx::Error> {
    Ok(DeliveryRow {
        submission_date: row.try_get("submission_date")?,
        campaign_id: row.try_get("campaign_id")?,
        campaign_name: row.try_get("campaign_name")?,
        flight_id: row.try_get("flight_id")?,
        flight_name: row.try_get("flight_name")?,
        provider: row.try_get("provider")?,
        clicks: row.try_get("clicks")?,
        impressions: row.try_get("impressions")?,
    })
}

/// Warehouse reached through a Postgres-compatible SQL endpoint.
#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
    query: DeliveryQuery,
}

impl PgWarehouse {
    pub async fn connect(url: &str, query: DeliveryQuery) -> Result<Self, WarehouseError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(url)
            .await
            .map_err(WarehouseError::Connect)?;
        Ok(Self { pool, query })
    }

    pub fn from_pool(pool: PgPool, query: DeliveryQuery) -> Self {
        Self { pool, query }
    }

}

#[async_trait]
impl DeliveryWarehouse for PgWarehouse {
    async fn aggregate_delivery(
        &self,
        date: NaiveDate,
    ) -> Result<Vec<DeliveryRow>, WarehouseError> {
        let sql = self.query.sql();
        let rows = sqlx::query(&sql).bind(date).fetch_all(&self.pool).await?;
        rows.iter()
            .map(delivery_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(WarehouseError::from)
    }
}

/// Run the aggregation for `date`. An empty result set is an error, not an
/// empty success.
pub async fn run_delivery_query(
    warehouse: &dyn DeliveryWarehouse,
    date: NaiveDate,
) -> Result<Vec<DeliveryRow>, WarehouseError> {
    let rows = warehouse.aggregate_delivery(date).await?;
    if rows.is_empty() {
        return Err(WarehouseError::NoData { date });
    }
    info!(%date, rows = rows.len(), "warehouse query returned rows");
    Ok(rows)
}
