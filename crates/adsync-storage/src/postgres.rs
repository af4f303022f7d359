use adsync_core::{
    CampaignType, Deal, DealProduct, DealProductPlan, DeliveredFlight, Product, SyncStatus,
    UpsertOutcome,
};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::debug;

use crate::{NaturalKeyStore, StoreError};

/// Postgres-backed store. Each upsert is a single `INSERT .. ON CONFLICT`
/// statement, so it is atomic per row; `xmax = 0` on the returned row tells
/// an insert apart from an update.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn product_from_row(row: &PgRow) -> Result<Product, StoreError> {
    let campaign_type: String = row.try_get("campaign_type")?;
    let campaign_type =
        CampaignType::parse(&campaign_type).ok_or_else(|| StoreError::InvalidValue {
            column: "products.campaign_type",
            value: campaign_type.clone(),
        })?;
    Ok(Product {
        external_id: row.try_get("external_id")?,
        full_name: row.try_get("full_name")?,
        campaign_type,
        country_code: row.try_get("country_code")?,
    })
}

fn deal_from_row(row: &PgRow) -> Result<Deal, StoreError> {
    Ok(Deal {
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        advertiser: row.try_get("advertiser")?,
        currency: row.try_get("currency")?,
        amount: row.try_get("amount")?,
        sales_representatives: row.try_get("sales_representatives")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
    })
}

#[async_trait]
impl NaturalKeyStore for PgStore {
    async fn upsert_product(&self, product: &Product) -> Result<UpsertOutcome, StoreError> {
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO products (external_id, full_name, campaign_type, country_code)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (external_id) DO UPDATE
               SET full_name = EXCLUDED.full_name,
                   campaign_type = EXCLUDED.campaign_type,
                   country_code = EXCLUDED.country_code,
                   updated_on = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(product.external_id)
        .bind(&product.full_name)
        .bind(product.campaign_type.as_str())
        .bind(product.country_code.as_deref())
        .fetch_one(&self.pool)
        .await?;
        Ok(UpsertOutcome::from_inserted(inserted))
    }

    async fn find_product(&self, external_id: i64) -> Result<Option<Product>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT external_id, full_name, campaign_type, country_code
              FROM products
             WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(product_from_row).transpose()
    }

    async fn upsert_deal(&self, deal: &Deal) -> Result<UpsertOutcome, StoreError> {
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO deals (external_id, name, advertiser, currency, amount,
                               sales_representatives, start_date, end_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (external_id) DO UPDATE
               SET name = EXCLUDED.name,
                   advertiser = EXCLUDED.advertiser,
                   currency = EXCLUDED.currency,
                   amount = EXCLUDED.amount,
                   sales_representatives = EXCLUDED.sales_representatives,
                   start_date = EXCLUDED.start_date,
                   end_date = EXCLUDED.end_date,
                   updated_on = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(deal.external_id)
        .bind(&deal.name)
        .bind(&deal.advertiser)
        .bind(&deal.currency)
        .bind(deal.amount)
        .bind(&deal.sales_representatives)
        .bind(deal.start_date)
        .bind(deal.end_date)
        .fetch_one(&self.pool)
        .await?;
        Ok(UpsertOutcome::from_inserted(inserted))
    }

    async fn find_deal(&self, external_id: i64) -> Result<Option<Deal>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT external_id, name, advertiser, currency, amount,
                   sales_representatives, start_date, end_date
              FROM deals
             WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(deal_from_row).transpose()
    }

    async fn upsert_deal_product(
        &self,
        deal_product: &DealProduct,
    ) -> Result<UpsertOutcome, StoreError> {
        let key = &deal_product.key;
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO deal_products (deal_id, product_id, month, budget)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (deal_id, product_id, month) DO UPDATE
               SET budget = EXCLUDED.budget,
                   updated_on = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(key.deal_id)
        .bind(key.product_id)
        .bind(&key.month)
        .bind(deal_product.budget)
        .fetch_one(&self.pool)
        .await?;
        Ok(UpsertOutcome::from_inserted(inserted))
    }

    async fn apply_deal_product_plan(&self, plan: &DealProductPlan) -> Result<bool, StoreError> {
        let key = &plan.key;
        let result = sqlx::query(
            r#"
            UPDATE deal_products
               SET rate_type = $4,
                   rate = $5,
                   quantity = $6,
                   updated_on = NOW()
             WHERE deal_id = $1 AND product_id = $2 AND month = $3
            "#,
        )
        .bind(key.deal_id)
        .bind(key.product_id)
        .bind(&key.month)
        .bind(&plan.rate_type)
        .bind(plan.rate)
        .bind(plan.quantity)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_delivered_flight(
        &self,
        flight: &DeliveredFlight,
    ) -> Result<UpsertOutcome, StoreError> {
        let key = &flight.key;
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO delivered_flights (submission_date, campaign_id, flight_id, provider,
                                           campaign_name, flight_name,
                                           clicks_delivered, impressions_delivered)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (submission_date, campaign_id, flight_id, provider) DO UPDATE
               SET campaign_name = EXCLUDED.campaign_name,
                   flight_name = EXCLUDED.flight_name,
                   clicks_delivered = EXCLUDED.clicks_delivered,
                   impressions_delivered = EXCLUDED.impressions_delivered,
                   updated_on = NOW()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(key.submission_date)
        .bind(key.campaign_id)
        .bind(key.flight_id)
        .bind(&key.provider)
        .bind(&flight.campaign_name)
        .bind(&flight.flight_name)
        .bind(flight.clicks_delivered)
        .bind(flight.impressions_delivered)
        .fetch_one(&self.pool)
        .await?;
        Ok(UpsertOutcome::from_inserted(inserted))
    }

    async fn insert_sync_status(&self, status: &SyncStatus) -> Result<i64, StoreError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sync_statuses (source, status, message, synced_on, query_date)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(status.source.as_str())
        .bind(status.outcome.as_str())
        .bind(&status.message)
        .bind(status.synced_on)
        .bind(status.query_date)
        .fetch_one(&self.pool)
        .await?;
        debug!(id, source = status.source.as_str(), "inserted sync status");
        Ok(id)
    }
}
