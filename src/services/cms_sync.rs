//! Pushes categories and promoted coupons to the Strapi CMS.
//!
//! Records are upserted by `backend_id`, so a run can be repeated any number
//! of times. A failed record or run is logged and left for the next tick.

use crate::{
    config::CmsConfig,
    entities::{
        category,
        coupon::{self, CouponVisibility},
    },
    errors::ServiceError,
};
use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

const CATEGORIES_COLLECTION: &str = "categories";
const COUPONS_COLLECTION: &str = "coupons";

#[derive(Debug, Serialize)]
struct CmsCategory {
    backend_id: String,
    name: String,
    slug: String,
    description: Option<String>,
    image_url: Option<String>,
    is_active: bool,
}

impl From<&category::Model> for CmsCategory {
    fn from(c: &category::Model) -> Self {
        Self {
            backend_id: c.id.to_string(),
            name: c.name.clone(),
            slug: c.slug.clone(),
            description: c.description.clone(),
            image_url: c.image_url.clone(),
            is_active: c.is_active,
        }
    }
}

#[derive(Debug, Serialize)]
struct CmsCoupon {
    backend_id: String,
    code: String,
    name: String,
    description: Option<String>,
    visibility: CouponVisibility,
    discount_type: coupon::DiscountType,
    discount_value: Decimal,
    max_discount: Option<Decimal>,
    min_order_value: Decimal,
    start_date: DateTime<Utc>,
    end_date: DateTime<Utc>,
    is_active: bool,
}

impl From<&coupon::Model> for CmsCoupon {
    fn from(c: &coupon::Model) -> Self {
        Self {
            backend_id: c.id.to_string(),
            code: c.code.clone(),
            name: c.name.clone(),
            description: c.description.clone(),
            visibility: c.visibility,
            discount_type: c.discount_type,
            discount_value: c.discount_value,
            max_discount: c.max_discount,
            min_order_value: c.min_order_value,
            start_date: c.start_date,
            end_date: c.end_date,
            is_active: c.is_active,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StrapiList {
    #[serde(default)]
    data: Vec<StrapiEntry>,
}

#[derive(Debug, Deserialize)]
struct StrapiEntry {
    id: Value,
}

impl StrapiEntry {
    fn id_string(&self) -> String {
        match &self.id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct StrapiBody<'a, T> {
    data: &'a T,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Created,
    Updated,
}

/// Counts from one sync run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
}

impl SyncReport {
    fn record(&mut self, result: &Result<UpsertAction, ServiceError>) {
        match result {
            Ok(UpsertAction::Created) => self.created += 1,
            Ok(UpsertAction::Updated) => self.updated += 1,
            Err(_) => self.failed += 1,
        }
    }
}

#[derive(Clone)]
pub struct CmsSyncJob {
    db: Arc<DatabaseConnection>,
    client: reqwest::Client,
    config: CmsConfig,
}

impl CmsSyncJob {
    pub fn new(db: Arc<DatabaseConnection>, config: CmsConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { db, client, config })
    }

    fn collection_url(&self, collection: &str) -> String {
        format!(
            "{}/api/{}",
            self.config.base_url.trim_end_matches('/'),
            collection
        )
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Create or update the entry whose `backend_id` matches.
    async fn upsert<T: Serialize>(
        &self,
        collection: &str,
        backend_id: &str,
        record: &T,
    ) -> Result<UpsertAction, ServiceError> {
        let url = self.collection_url(collection);
        let existing: StrapiList = self
            .authorized(self.client.get(&url))
            .query(&[("filters[backend_id][$eq]", backend_id)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let body = StrapiBody { data: record };
        match existing.data.first() {
            Some(entry) => {
                self.authorized(self.client.put(format!("{url}/{}", entry.id_string())))
                    .json(&body)
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(UpsertAction::Updated)
            }
            None => {
                self.authorized(self.client.post(&url))
                    .json(&body)
                    .send()
                    .await?
                    .error_for_status()?;
                Ok(UpsertAction::Created)
            }
        }
    }

    /// One pass over categories and featured or landing-page coupons.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<SyncReport, ServiceError> {
        let started = std::time::Instant::now();
        let mut report = SyncReport::default();

        let categories = category::Entity::find()
            .order_by_asc(category::Column::Name)
            .all(&*self.db)
            .await?;
        for c in &categories {
            let result = self
                .upsert(CATEGORIES_COLLECTION, &c.id.to_string(), &CmsCategory::from(c))
                .await;
            if let Err(e) = &result {
                warn!(category = %c.slug, error = %e, "category sync failed");
            }
            report.record(&result);
        }

        let coupons = coupon::Entity::find()
            .filter(
                coupon::Column::Visibility
                    .is_in([CouponVisibility::Featured, CouponVisibility::LandingPage]),
            )
            .order_by_asc(coupon::Column::Code)
            .all(&*self.db)
            .await?;
        for c in &coupons {
            let result = self
                .upsert(COUPONS_COLLECTION, &c.id.to_string(), &CmsCoupon::from(c))
                .await;
            if let Err(e) = &result {
                warn!(coupon = %c.code, error = %e, "coupon sync failed");
            }
            report.record(&result);
        }

        histogram!("fashion_store.cms_sync.duration", started.elapsed());
        counter!("fashion_store.cms_sync.records", report.created as u64, "action" => "created");
        counter!("fashion_store.cms_sync.records", report.updated as u64, "action" => "updated");
        counter!("fashion_store.cms_sync.records", report.failed as u64, "action" => "failed");
        info!(
            created = report.created,
            updated = report.updated,
            failed = report.failed,
            "CMS sync finished"
        );
        Ok(report)
    }

    /// Run now, then every `sync_interval_secs`. Runs are sequential, so a
    /// slow run delays the next one instead of overlapping it.
    pub fn spawn(self) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.sync_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!("CMS sync tick");
                match self.run_once().await {
                    Ok(_) => counter!("fashion_store.cms_sync.runs", 1, "result" => "ok"),
                    Err(e) => {
                        counter!("fashion_store.cms_sync.runs", 1, "result" => "error");
                        error!(error = %e, "CMS sync run failed; waiting for next tick");
                    }
                }
            }
        })
    }
}
