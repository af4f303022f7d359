//! Source adapters: the CRM REST API and the delivery warehouse.

pub mod crm;
pub mod warehouse;

pub use crm::{
    CrmClient, CrmCredentials, CrmDeal, CrmDealEntry, CrmDealMember, CrmDealProduct, CrmError,
    CrmLineItemMonthly, CrmMediaPlan, CrmMediaPlanLineItem, CrmMonthlyBudget, CrmProduct,
    CrmProductRef, CrmRateType, CrmSession, Paginator, CLOSED_WON_STAGE,
};
pub use warehouse::{
    run_delivery_query, DeliveryQuery, DeliveryRow, DeliveryWarehouse, PgWarehouse,
    WarehouseError, DEFAULT_DELIVERY_TABLE,
};

pub const CRATE_NAME: &str = "adsync-adapters";
