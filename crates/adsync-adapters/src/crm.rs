//! CRM (deal/product API) session, typed wire records and page walking.

use std::fmt;
use std::marker::PhantomData;

use adsync_core::{Deal, DealProduct, DealProductKey, DealProductPlan, Product};
use adsync_storage::{ApiRequest, FetchError, HttpFetcher};
use chrono::NaiveDate;
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

pub const ACCEPT_HEADER: &str = "application/vnd.boostr.public";
pub const PAGE_SIZE: u32 = 300;
pub const PAGE_FILTER: &str = "all";
pub const CLOSED_WON_STAGE: &str = "Closed Won";

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("authentication failed with status {status}: {body}")]
    Authentication { status: u16, body: String },
    #[error("bad response status {status} from /{endpoint}")]
    ApiResponse { endpoint: String, status: u16 },
    #[error("unexpected payload from /{endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[derive(Clone)]
pub struct CrmCredentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for CrmCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrmCredentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    jwt: String,
}

fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Authenticated CRM session: base address plus bearer header, reused for
/// every call of a run. Token expiry is not tracked.
#[derive(Clone)]
pub struct CrmSession {
    base_url: String,
    authorization: String,
}

impl fmt::Debug for CrmSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrmSession")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl CrmSession {
    /// Single `POST /user_token`, never replayed; any non-success status,
    /// 429 included, fails immediately.
    pub async fn authenticate(
        http: &HttpFetcher,
        base_url: &str,
        credentials: &CrmCredentials,
    ) -> Result<Self, CrmError> {
        let request = ApiRequest::post(join_url(base_url, "user_token"))
            .header("Accept", ACCEPT_HEADER)
            .header("Content-Type", "application/json")
            .json(json!({
                "auth": {
                    "email": credentials.email,
                    "password": credentials.password,
                }
            }));

        let response = http.execute_once(&request).await?;
        if !response.is_success() {
            return Err(CrmError::Authentication {
                status: response.status.as_u16(),
                body: response.text(),
            });
        }

        let token: TokenResponse =
            serde_json::from_slice(&response.body).map_err(|source| CrmError::Decode {
                endpoint: "user_token".to_string(),
                source,
            })?;
        info!(base_url, "authenticated with crm");

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            authorization: format!("Bearer {}", token.jwt),
        })
    }

    pub fn get(&self, path: &str) -> ApiRequest {
        ApiRequest::get(join_url(&self.base_url, path))
            .header("Accept", ACCEPT_HEADER)
            .header("Content-Type", "application/json")
            .header("Authorization", self.authorization.clone())
    }
}

/// Accepts decimals sent either as JSON numbers or as strings like `"10000.0"`.
fn decimal<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    let value = match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n,
        Raw::Text(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| de::Error::custom(format!("invalid decimal {text:?}")))?,
    };
    if value.is_finite() {
        Ok(value)
    } else {
        Err(de::Error::custom("decimal is not finite"))
    }
}

fn optional_decimal<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct Decimal(#[serde(deserialize_with = "decimal")] f64);

    Ok(Option::<Decimal>::deserialize(deserializer)?.map(|Decimal(value)| value))
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CrmProduct {
    pub id: i64,
    pub full_name: String,
}

impl CrmProduct {
    pub fn to_product(&self) -> Product {
        Product::from_name(self.id, self.full_name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CrmDealMember {
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CrmDeal {
    pub id: i64,
    pub name: String,
    pub stage_name: String,
    pub advertiser_name: String,
    pub currency: String,
    #[serde(deserialize_with = "decimal")]
    pub budget: f64,
    #[serde(default)]
    pub deal_members: Vec<CrmDealMember>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl CrmDeal {
    pub fn to_deal(&self) -> Deal {
        Deal {
            external_id: self.id,
            name: self.name.clone(),
            advertiser: self.advertiser_name.clone(),
            currency: self.currency.clone(),
            amount: self.budget.floor() as i64,
            sales_representatives: self
                .deal_members
                .iter()
                .map(|m| m.email.as_str())
                .collect::<Vec<_>>()
                .join(","),
            start_date: self.start_date,
            end_date: self.end_date,
        }
    }
}

/// One element of a `/deals` page. Only the id and stage are read eagerly;
/// the full record is decoded on demand, so deals that will be skipped may
/// carry nulls where a [`CrmDeal`] needs values.
#[derive(Debug, Clone, PartialEq)]
pub struct CrmDealEntry {
    pub id: i64,
    pub stage_name: Option<String>,
    raw: Value,
}

impl<'de> Deserialize<'de> for CrmDealEntry {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Stage {
            id: i64,
            #[serde(default)]
            stage_name: Option<String>,
        }

        let raw = Value::deserialize(deserializer)?;
        let stage = Stage::deserialize(&raw).map_err(de::Error::custom)?;
        Ok(Self {
            id: stage.id,
            stage_name: stage.stage_name,
            raw,
        })
    }
}

impl CrmDealEntry {
    /// Exact, case-sensitive stage comparison.
    pub fn is_closed_won(&self) -> bool {
        self.stage_name.as_deref() == Some(CLOSED_WON_STAGE)
    }

    pub fn decode(&self) -> Result<CrmDeal, CrmError> {
        CrmDeal::deserialize(&self.raw).map_err(|source| CrmError::Decode {
            endpoint: "deals".to_string(),
            source,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CrmProductRef {
    pub id: i64,
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CrmMonthlyBudget {
    pub month: String,
    #[serde(deserialize_with = "decimal")]
    pub budget: f64,
}

/// Deal line item: a product reference with its per-month budgets.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CrmDealProduct {
    pub product: CrmProductRef,
    #[serde(default)]
    pub deal_product_budgets: Vec<CrmMonthlyBudget>,
}

impl CrmDealProduct {
    pub fn monthly_budgets(&self, deal_id: i64) -> Vec<DealProduct> {
        self.deal_product_budgets
            .iter()
            .map(|entry| DealProduct {
                key: DealProductKey {
                    deal_id,
                    product_id: self.product.id,
                    month: entry.month.clone(),
                },
                budget: entry.budget.floor() as i64,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CrmMediaPlan {
    pub id: i64,
    pub deal_id: i64,
    #[serde(default)]
    pub deal_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CrmRateType {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CrmLineItemMonthly {
    pub month: String,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub quantity: Option<f64>,
}

/// Media-plan line item: rate terms for a product, spread over months.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CrmMediaPlanLineItem {
    pub product: CrmProductRef,
    #[serde(default)]
    pub rate_type: Option<CrmRateType>,
    #[serde(default, deserialize_with = "optional_decimal")]
    pub rate: Option<f64>,
    #[serde(default)]
    pub line_item_monthlies: Vec<CrmLineItemMonthly>,
}

impl CrmMediaPlanLineItem {
    /// Per-month plan terms. Items without a rate type or rate carry no
    /// terms; a month without a quantity counts as zero.
    pub fn plan_terms(&self, deal_id: i64) -> Vec<DealProductPlan> {
        let (Some(rate_type), Some(rate)) = (&self.rate_type, self.rate) else {
            return Vec::new();
        };
        self.line_item_monthlies
            .iter()
            .map(|monthly| DealProductPlan {
                key: DealProductKey {
                    deal_id,
                    product_id: self.product.id,
                    month: monthly.month.clone(),
                },
                rate_type: rate_type.name.clone(),
                rate,
                quantity: monthly.quantity.unwrap_or_default().floor() as i64,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct CrmClient {
    http: HttpFetcher,
    session: CrmSession,
    page_size: u32,
}

impl CrmClient {
    pub fn new(http: HttpFetcher, session: CrmSession) -> Self {
        Self {
            http,
            session,
            page_size: PAGE_SIZE,
        }
    }

    pub async fn connect(
        http: HttpFetcher,
        base_url: &str,
        credentials: &CrmCredentials,
    ) -> Result<Self, CrmError> {
        let session = CrmSession::authenticate(&http, base_url, credentials).await?;
        Ok(Self::new(http, session))
    }

    fn list_request(&self, endpoint: &str, page: u32) -> ApiRequest {
        self.session
            .get(endpoint)
            .query("per", self.page_size)
            .query("page", page)
            .query("filter", PAGE_FILTER)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: ApiRequest,
    ) -> Result<T, CrmError> {
        let response = self.http.execute(&request).await?;
        if !response.is_success() {
            return Err(CrmError::ApiResponse {
                endpoint: endpoint.to_string(),
                status: response.status.as_u16(),
            });
        }
        serde_json::from_slice(&response.body).map_err(|source| CrmError::Decode {
            endpoint: endpoint.to_string(),
            source,
        })
    }

    /// All products in one request; a single page of 300 is assumed to hold them.
    pub async fn fetch_products(&self) -> Result<Vec<CrmProduct>, CrmError> {
        let products: Vec<CrmProduct> = self
            .get_json("products", self.list_request("products", 1))
            .await?;
        debug!(count = products.len(), "fetched products");
        Ok(products)
    }

    /// Page walker over `/deals`, optionally capped at `max_pages` requests.
    pub fn deals(&self, max_pages: Option<u32>) -> Paginator<'_, CrmDealEntry> {
        Paginator::new(self, "deals", max_pages)
    }

    pub fn media_plans(&self, max_pages: Option<u32>) -> Paginator<'_, CrmMediaPlan> {
        Paginator::new(self, "media_plans", max_pages)
    }

    /// First page of a plan's line items; 300 per plan is assumed to be enough.
    pub async fn fetch_media_plan_line_items(
        &self,
        media_plan_id: i64,
    ) -> Result<Vec<CrmMediaPlanLineItem>, CrmError> {
        let endpoint = format!("media_plans/{media_plan_id}/line_items");
        let request = self.list_request(&endpoint, 1);
        let line_items: Vec<CrmMediaPlanLineItem> = self.get_json(&endpoint, request).await?;
        debug!(media_plan_id, count = line_items.len(), "fetched media plan line items");
        Ok(line_items)
    }

    pub async fn fetch_deal_products(
        &self,
        deal_id: i64,
    ) -> Result<Vec<CrmDealProduct>, CrmError> {
        let endpoint = format!("deals/{deal_id}/deal_products");
        let request = self.session.get(&endpoint);
        let line_items: Vec<CrmDealProduct> = self.get_json(&endpoint, request).await?;
        debug!(deal_id, count = line_items.len(), "fetched deal products");
        Ok(line_items)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageState {
    Open,
    Exhausted,
    Capped,
}

/// Walks a list endpoint from page 1 until the server answers with an empty
/// list. The server is trusted to terminate; `max_pages` bounds the walk
/// otherwise.
pub struct Paginator<'a, T> {
    client: &'a CrmClient,
    endpoint: String,
    next_page: u32,
    max_pages: Option<u32>,
    completed_pages: u32,
    state: PageState,
    _items: PhantomData<fn() -> T>,
}

impl<'a, T: DeserializeOwned> Paginator<'a, T> {
    fn new(client: &'a CrmClient, endpoint: &str, max_pages: Option<u32>) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            next_page: 1,
            max_pages,
            completed_pages: 0,
            state: PageState::Open,
            _items: PhantomData,
        }
    }

    /// Number of non-empty pages yielded so far.
    pub fn completed_pages(&self) -> u32 {
        self.completed_pages
    }

    /// True when the walk stopped at `max_pages` rather than an empty page.
    pub fn hit_page_cap(&self) -> bool {
        self.state == PageState::Capped
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<T>>, CrmError> {
        if self.state != PageState::Open {
            return Ok(None);
        }
        if let Some(max_pages) = self.max_pages {
            if self.next_page > max_pages {
                self.state = PageState::Capped;
                debug!(endpoint = %self.endpoint, max_pages, "page cap reached");
                return Ok(None);
            }
        }

        let page = self.next_page;
        let request = self.client.list_request(&self.endpoint, page);
        let items: Vec<T> = self.client.get_json(&self.endpoint, request).await?;
        debug!(endpoint = %self.endpoint, page, count = items.len(), "fetched page");

        if items.is_empty() {
            self.state = PageState::Exhausted;
            debug!(
                endpoint = %self.endpoint,
                pages = self.completed_pages,
                "empty page, walk finished"
            );
            return Ok(None);
        }

        self.completed_pages += 1;
        self.next_page += 1;
        Ok(Some(items))
    }

    /// Drain the walk, concatenating pages in order.
    pub async fn collect_all(mut self) -> Result<Vec<T>, CrmError> {
        let mut out = Vec::new();
        while let Some(items) = self.next_page().await? {
            out.extend(items);
        }
        Ok(out)
    }
}
