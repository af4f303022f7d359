//! Core domain model for the adsync ingestion pipeline.
//!
//! Every entity here is identified by a natural key coming from the external
//! system that owns it (CRM ids, warehouse campaign/flight ids), never by a
//! surrogate id. Stores upsert on those keys.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "adsync-core";

/// Rate type of a CRM product, derived from its display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CampaignType {
    #[serde(rename = "CPC")]
    Cpc,
    #[serde(rename = "CPM")]
    Cpm,
    #[serde(rename = "Flat Fee")]
    FlatFee,
    #[serde(rename = "None")]
    Unclassified,
}

impl CampaignType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpc => "CPC",
            Self::Cpm => "CPM",
            Self::FlatFee => "Flat Fee",
            Self::Unclassified => "None",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CPC" => Some(Self::Cpc),
            "CPM" => Some(Self::Cpm),
            "Flat Fee" => Some(Self::FlatFee),
            "None" => Some(Self::Unclassified),
            _ => None,
        }
    }

    /// Classify a product by case-sensitive substring match, CPC > CPM > Flat Fee.
    pub fn for_product_name(full_name: &str) -> Self {
        if full_name.contains("CPC") {
            Self::Cpc
        } else if full_name.contains("CPM") {
            Self::Cpm
        } else if full_name.contains("Flat Fee") {
            Self::FlatFee
        } else {
            Self::Unclassified
        }
    }
}

impl fmt::Display for CampaignType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// First whitespace-delimited token made of exactly two ASCII uppercase letters.
pub fn country_code_for_name(full_name: &str) -> Option<String> {
    full_name
        .split_whitespace()
        .find(|token| token.len() == 2 && token.bytes().all(|b| b.is_ascii_uppercase()))
        .map(ToString::to_string)
}

/// Whether an upsert inserted a new row or overwrote an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

impl UpsertOutcome {
    pub fn from_inserted(inserted: bool) -> Self {
        if inserted {
            Self::Created
        } else {
            Self::Updated
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub external_id: i64,
    pub full_name: String,
    pub campaign_type: CampaignType,
    pub country_code: Option<String>,
}

impl Product {
    /// Build a product with its derived attributes filled in from the name.
    pub fn from_name(external_id: i64, full_name: impl Into<String>) -> Self {
        let full_name = full_name.into();
        Self {
            external_id,
            campaign_type: CampaignType::for_product_name(&full_name),
            country_code: country_code_for_name(&full_name),
            full_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deal {
    pub external_id: i64,
    pub name: String,
    pub advertiser: String,
    pub currency: String,
    pub amount: i64,
    /// Comma-joined sales representative emails.
    pub sales_representatives: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DealProductKey {
    pub deal_id: i64,
    pub product_id: i64,
    /// Budget month as sent by the CRM, e.g. `2024-04`.
    pub month: String,
}

impl fmt::Display for DealProductKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "deal={} product={} month={}", self.deal_id, self.product_id, self.month)
    }
}

/// Monthly budget line of a deal for one product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealProduct {
    pub key: DealProductKey,
    pub budget: i64,
}

/// Media-plan terms for one budget line. Only ever applied to a line that
/// already exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealProductPlan {
    pub key: DealProductKey,
    pub rate_type: String,
    pub rate: f64,
    pub quantity: i64,
}

/// Canonical natural key of a delivered flight. Campaign and flight names are
/// attributes, not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeliveredFlightKey {
    pub submission_date: NaiveDate,
    pub campaign_id: i64,
    pub flight_id: i64,
    pub provider: String,
}

impl fmt::Display for DeliveredFlightKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "date={} campaign={} flight={} provider={}",
            self.submission_date, self.campaign_id, self.flight_id, self.provider
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredFlight {
    pub key: DeliveredFlightKey,
    pub campaign_name: String,
    pub flight_name: String,
    pub clicks_delivered: i64,
    pub impressions_delivered: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    Failure,
}

impl SyncOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Which job produced an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSource {
    Crm,
    Warehouse,
}

impl SyncSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crm => "crm",
            Self::Warehouse => "warehouse",
        }
    }
}

/// Append-only audit row describing one sync invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub source: SyncSource,
    pub outcome: SyncOutcome,
    pub message: String,
    pub synced_on: DateTime<Utc>,
    pub query_date: NaiveDate,
}
