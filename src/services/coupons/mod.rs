//! Coupons: lookup, eligibility, redemption and admin management.

pub mod discount;
pub mod ledger;
pub mod rules;

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, PaginatorTrait, QueryFilter, QueryOrder, Set, SqlErr, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::entities::coupon::{self, ApplyType, CouponType, CouponVisibility, DiscountType};
use crate::entities::{coupon_usage, order, IdSet};
use crate::errors::{CouponRejection, ServiceError};
use crate::events::{Event, EventSender};

pub use discount::{compute_discount, round_vnd};
pub use ledger::{Redemption, UsageLedger};
pub use rules::{normalize_code, CartContext, CartLine, UserContext};

/// Storefront view of a coupon; hides assignment lists and counters
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CouponSummary {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub description: Option<String>,
    pub visibility: CouponVisibility,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub max_discount: Option<Decimal>,
    pub min_order_value: Decimal,
    pub apply_type: ApplyType,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    /// `None` when the coupon has no global cap
    pub remaining_uses: Option<i32>,
}

impl From<&coupon::Model> for CouponSummary {
    fn from(c: &coupon::Model) -> Self {
        Self {
            id: c.id,
            code: c.code.clone(),
            name: c.name.clone(),
            description: c.description.clone(),
            visibility: c.visibility,
            discount_type: c.discount_type,
            discount_value: c.discount_value,
            max_discount: c.max_discount,
            min_order_value: c.min_order_value,
            apply_type: c.apply_type,
            start_date: c.start_date,
            end_date: c.end_date,
            remaining_uses: c.remaining_uses(),
        }
    }
}

/// Machine readable rejection plus display message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RejectionReason {
    pub code: String,
    pub message: String,
}

impl From<&CouponRejection> for RejectionReason {
    fn from(rejection: &CouponRejection) -> Self {
        Self {
            code: rejection.code().to_string(),
            message: rejection.to_string(),
        }
    }
}

/// Outcome of `POST /coupons/validate`
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CouponValidation {
    pub eligible: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectionReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon: Option<CouponSummary>,
    /// Discount the order would receive, present when eligible
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_amount: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
pub struct ValidateCouponRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
    pub order_value: Decimal,
    #[serde(default)]
    pub category_ids: Vec<Uuid>,
    #[serde(default)]
    pub product_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
pub struct ApplyCouponRequest {
    pub coupon_id: Uuid,
    pub order_id: Uuid,
    pub discount_amount: Decimal,
}

/// Result of recording a redemption through the API
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AppliedCoupon {
    pub usage_id: Uuid,
    pub coupon_id: Uuid,
    pub coupon_code: String,
    pub order_id: Uuid,
    pub discount_amount: Decimal,
    pub applied_at: DateTime<Utc>,
    /// False when the redemption had already been recorded
    pub newly_recorded: bool,
}

impl AppliedCoupon {
    fn from_usage(usage: coupon_usage::Model, newly_recorded: bool) -> Self {
        Self {
            usage_id: usage.id,
            coupon_id: usage.coupon_id,
            coupon_code: usage.coupon_code,
            order_id: usage.order_id,
            discount_amount: usage.discount_amount,
            applied_at: usage.applied_at,
            newly_recorded,
        }
    }
}

fn default_per_user() -> i32 {
    1
}

fn default_true() -> bool {
    true
}

/// Admin payload for creating or replacing a coupon
#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
pub struct CouponInput {
    #[validate(custom = "validate_code_format")]
    pub code: String,
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub description: Option<String>,
    pub coupon_type: CouponType,
    pub visibility: CouponVisibility,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub max_discount: Option<Decimal>,
    #[serde(default)]
    pub min_order_value: Decimal,
    #[validate(range(min = 1))]
    pub usage_limit: Option<i32>,
    #[serde(default = "default_per_user")]
    #[validate(range(min = 1))]
    pub usage_limit_per_user: i32,
    pub apply_type: ApplyType,
    #[serde(default)]
    pub applicable_categories: Vec<Uuid>,
    #[serde(default)]
    pub applicable_products: Vec<Uuid>,
    #[serde(default)]
    pub assigned_users: Vec<Uuid>,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn validate_code_format(code: &str) -> Result<(), ValidationError> {
    let normalized = normalize_code(code);
    let valid_chars = normalized
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !(3..=30).contains(&normalized.len()) || !valid_chars {
        let mut err = ValidationError::new("code");
        err.message = Some("code must be 3-30 characters of A-Z, 0-9, '_' or '-'".into());
        return Err(err);
    }
    Ok(())
}

impl CouponInput {
    /// Field validation plus the rules that span several fields.
    pub fn validate_all(&self) -> Result<(), ValidationErrors> {
        self.validate()?;

        let mut errors = ValidationErrors::new();
        let mut fail = |field: &'static str, message: &'static str| {
            let mut err = ValidationError::new(field);
            err.message = Some(message.into());
            errors.add(field, err);
        };

        if self.discount_value <= Decimal::ZERO {
            fail("discount_value", "discount_value must be positive");
        }
        if self.discount_type == DiscountType::Percentage
            && self.discount_value > Decimal::ONE_HUNDRED
        {
            fail("discount_value", "percentage discounts cannot exceed 100");
        }
        match (self.discount_type, self.max_discount) {
            (DiscountType::Fixed, Some(_)) => {
                fail("max_discount", "max_discount only applies to percentage coupons")
            }
            (_, Some(cap)) if cap <= Decimal::ZERO => {
                fail("max_discount", "max_discount must be positive")
            }
            _ => {}
        }
        if self.min_order_value < Decimal::ZERO {
            fail("min_order_value", "min_order_value cannot be negative");
        }
        if self.end_date < self.start_date {
            fail("end_date", "end_date must not be before start_date");
        }
        if self.coupon_type == CouponType::Public && !self.assigned_users.is_empty() {
            fail("assigned_users", "only private coupons can be assigned to users");
        }
        let needs_categories = matches!(self.apply_type, ApplyType::Category);
        let needs_products = matches!(self.apply_type, ApplyType::Product);
        if needs_categories && self.applicable_categories.is_empty() {
            fail("applicable_categories", "category coupons need at least one category");
        }
        if needs_products && self.applicable_products.is_empty() {
            fail("applicable_products", "product coupons need at least one product");
        }
        if self.apply_type == ApplyType::Mixed
            && self.applicable_categories.is_empty()
            && self.applicable_products.is_empty()
        {
            fail("apply_type", "mixed coupons need at least one category or product");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Filters for the admin listing
#[derive(Debug, Clone, Default, Deserialize, Serialize, utoipa::IntoParams)]
pub struct CouponFilter {
    pub is_active: Option<bool>,
    pub visibility: Option<CouponVisibility>,
}

/// Coupon service
#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: Arc<EventSender>) -> Self {
        Self { db, event_sender }
    }

    pub async fn find_by_code<C: ConnectionTrait>(
        db: &C,
        code: &str,
    ) -> Result<Option<coupon::Model>, ServiceError> {
        Ok(coupon::Entity::find()
            .filter(coupon::Column::Code.eq(normalize_code(code)))
            .one(db)
            .await?)
    }

    /// Look up `code` and run every eligibility check against `cart`.
    ///
    /// Generic over the connection so checkout can evaluate inside its own
    /// transaction.
    pub async fn evaluate_on<C: ConnectionTrait>(
        db: &C,
        code: &str,
        user_id: Option<Uuid>,
        cart: &CartContext,
        now: DateTime<Utc>,
    ) -> Result<coupon::Model, ServiceError> {
        let coupon = Self::lookup_and_check(db, code, user_id, now).await?;
        rules::check_cart(&coupon, cart).map_err(|r| rejected(&coupon.code, r))?;
        counter!("fashion_store.coupons.evaluations", 1, "outcome" => "eligible");
        Ok(coupon)
    }

    /// Lookup, coupon state and per-user limit; everything but the cart.
    async fn lookup_and_check<C: ConnectionTrait>(
        db: &C,
        code: &str,
        user_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<coupon::Model, ServiceError> {
        let normalized = normalize_code(code);
        let coupon = Self::find_by_code(db, &normalized).await?.ok_or_else(|| {
            rejected(
                &normalized,
                CouponRejection::NotFound {
                    code: normalized.clone(),
                },
            )
        })?;

        rules::check_state(&coupon, user_id, now).map_err(|r| rejected(&coupon.code, r))?;

        let user = match user_id {
            Some(id) => UserContext::signed_in(
                id,
                UsageLedger::count_user_redemptions(db, coupon.id, id).await?,
            ),
            None => UserContext::anonymous(),
        };
        rules::check_user_limit(&coupon, &user).map_err(|r| rejected(&coupon.code, r))?;

        Ok(coupon)
    }

    #[instrument(skip(self, cart))]
    pub async fn evaluate(
        &self,
        code: &str,
        user_id: Option<Uuid>,
        cart: &CartContext,
        now: DateTime<Utc>,
    ) -> Result<coupon::Model, ServiceError> {
        Self::evaluate_on(&*self.db, code, user_id, cart, now).await
    }

    /// Eligibility as data: rule failures become `eligible = false`, other
    /// failures are still errors.
    #[instrument(skip(self, request), fields(code = %request.code))]
    pub async fn validate(
        &self,
        request: &ValidateCouponRequest,
        user_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<CouponValidation, ServiceError> {
        let cart = CartContext::new(
            request.order_value,
            request.product_ids.clone(),
            request.category_ids.clone(),
        );

        match self.evaluate(&request.code, user_id, &cart, now).await {
            Ok(coupon) => Ok(CouponValidation {
                eligible: true,
                reason: None,
                discount_amount: Some(compute_discount(&coupon, request.order_value)),
                coupon: Some(CouponSummary::from(&coupon)),
            }),
            Err(ServiceError::CouponRejected(rejection)) => Ok(CouponValidation {
                eligible: false,
                reason: Some(RejectionReason::from(&rejection)),
                coupon: None,
                discount_amount: None,
            }),
            Err(other) => Err(other),
        }
    }

    /// Availability probe without cart context.
    #[instrument(skip(self))]
    pub async fn check(
        &self,
        code: &str,
        user_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<coupon::Model, ServiceError> {
        Self::lookup_and_check(&*self.db, code, user_id, now).await
    }

    /// Record a redemption for one of the caller's orders.
    ///
    /// Idempotent: a redemption already on the ledger is returned as is.
    /// Checkout records the redemption in the order's own transaction, so
    /// for orders placed through it this only confirms the existing entry
    /// (`newly_recorded: false`). A fresh entry is written only for an order
    /// that carries the coupon but has no ledger row yet, such as one
    /// created by a back-office import.
    #[instrument(skip(self, request), fields(coupon_id = %request.coupon_id, order_id = %request.order_id))]
    pub async fn apply(
        &self,
        user_id: Uuid,
        request: &ApplyCouponRequest,
        now: DateTime<Utc>,
    ) -> Result<AppliedCoupon, ServiceError> {
        let txn = self.db.begin().await?;

        let order = order::Entity::find_by_id(request.order_id)
            .filter(order::Column::UserId.eq(user_id))
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", request.order_id)))?;

        if let Some(existing) =
            UsageLedger::find_for_order(&txn, request.coupon_id, order.id).await?
        {
            txn.commit().await?;
            return Ok(AppliedCoupon::from_usage(existing, false));
        }

        if order.status == order::OrderStatus::Cancelled {
            return Err(ServiceError::InvalidOperation(
                "Cannot apply a coupon to a cancelled order".to_string(),
            ));
        }
        if order.coupon_id != Some(request.coupon_id) {
            return Err(ServiceError::InvalidOperation(
                "Order was not placed with this coupon".to_string(),
            ));
        }
        if round_vnd(request.discount_amount) != round_vnd(order.discount_amount) {
            return Err(ServiceError::InvalidInput(format!(
                "discount_amount {} does not match the order discount {}",
                request.discount_amount,
                round_vnd(order.discount_amount)
            )));
        }

        let usage = UsageLedger::record_redemption(
            &txn,
            Redemption {
                coupon_id: request.coupon_id,
                user_id,
                order_id: order.id,
                discount_amount: order.discount_amount,
                applied_at: now,
            },
        )
        .await?;
        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::CouponRedeemed {
                coupon_id: usage.coupon_id,
                order_id: usage.order_id,
                user_id,
                discount_amount: usage.discount_amount,
            })
            .await;

        Ok(AppliedCoupon::from_usage(usage, true))
    }

    /// Coupons a shopper may currently use, for the storefront.
    #[instrument(skip(self))]
    pub async fn available(
        &self,
        user_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Vec<coupon::Model>, ServiceError> {
        let candidates = coupon::Entity::find()
            .filter(coupon::Column::IsActive.eq(true))
            .filter(coupon::Column::StartDate.lte(now))
            .filter(coupon::Column::EndDate.gte(now))
            .filter(coupon::Column::Visibility.ne(CouponVisibility::Hidden))
            .order_by_asc(coupon::Column::EndDate)
            .all(&*self.db)
            .await?;

        let used: HashMap<Uuid, u64> = match user_id {
            Some(id) => {
                let mut counts = HashMap::new();
                let usages = coupon_usage::Entity::find()
                    .filter(coupon_usage::Column::UserId.eq(id))
                    .all(&*self.db)
                    .await?;
                for usage in usages {
                    *counts.entry(usage.coupon_id).or_insert(0) += 1;
                }
                counts
            }
            None => HashMap::new(),
        };

        Ok(candidates
            .into_iter()
            .filter(|c| {
                let user = UserContext {
                    user_id,
                    user_redemptions: used.get(&c.id).copied().unwrap_or(0),
                };
                rules::evaluate_without_cart(c, &user, now).is_ok()
            })
            .collect())
    }

    #[instrument(skip(self, input), fields(code = %input.code))]
    pub async fn create(&self, input: CouponInput) -> Result<coupon::Model, ServiceError> {
        input.validate_all()?;
        let code = normalize_code(&input.code);

        if Self::find_by_code(&*self.db, &code).await?.is_some() {
            return Err(ServiceError::Conflict(format!("Coupon code {code} already exists")));
        }

        let now = Utc::now();
        let model = coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.clone()),
            name: Set(input.name),
            description: Set(input.description),
            coupon_type: Set(input.coupon_type),
            visibility: Set(input.visibility),
            discount_type: Set(input.discount_type),
            discount_value: Set(input.discount_value),
            max_discount: Set(input.max_discount),
            min_order_value: Set(input.min_order_value),
            usage_limit: Set(input.usage_limit),
            usage_limit_per_user: Set(input.usage_limit_per_user),
            used_count: Set(0),
            apply_type: Set(input.apply_type),
            applicable_categories: Set(IdSet::from(input.applicable_categories)),
            applicable_products: Set(IdSet::from(input.applicable_products)),
            assigned_users: Set(IdSet::from(input.assigned_users)),
            start_date: Set(input.start_date),
            end_date: Set(input.end_date),
            is_active: Set(input.is_active),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .map_err(|e| unique_code_conflict(e, &code))?;

        self.event_sender
            .send_or_log(Event::CouponCreated(model.id))
            .await;
        info!(coupon_id = %model.id, code = %model.code, "coupon created");
        Ok(model)
    }

    /// Replace a coupon's definition. `used_count` is left alone.
    #[instrument(skip(self, input))]
    pub async fn update(&self, id: Uuid, input: CouponInput) -> Result<coupon::Model, ServiceError> {
        input.validate_all()?;
        let existing = self.get(id).await?;
        let code = normalize_code(&input.code);

        if code != existing.code {
            if let Some(other) = Self::find_by_code(&*self.db, &code).await? {
                if other.id != id {
                    return Err(ServiceError::Conflict(format!(
                        "Coupon code {code} already exists"
                    )));
                }
            }
        }
        if let Some(limit) = input.usage_limit {
            if limit < existing.used_count {
                return Err(ServiceError::InvalidInput(format!(
                    "usage_limit {limit} is below the {} redemptions already made",
                    existing.used_count
                )));
            }
        }

        let mut model = existing.into_active_model();
        model.code = Set(code.clone());
        model.name = Set(input.name);
        model.description = Set(input.description);
        model.coupon_type = Set(input.coupon_type);
        model.visibility = Set(input.visibility);
        model.discount_type = Set(input.discount_type);
        model.discount_value = Set(input.discount_value);
        model.max_discount = Set(input.max_discount);
        model.min_order_value = Set(input.min_order_value);
        model.usage_limit = Set(input.usage_limit);
        model.usage_limit_per_user = Set(input.usage_limit_per_user);
        model.apply_type = Set(input.apply_type);
        model.applicable_categories = Set(IdSet::from(input.applicable_categories));
        model.applicable_products = Set(IdSet::from(input.applicable_products));
        model.assigned_users = Set(IdSet::from(input.assigned_users));
        model.start_date = Set(input.start_date);
        model.end_date = Set(input.end_date);
        model.is_active = Set(input.is_active);
        model.updated_at = Set(Utc::now());

        let updated = model
            .update(&*self.db)
            .await
            .map_err(|e| unique_code_conflict(e, &code))?;

        self.event_sender
            .send_or_log(Event::CouponUpdated(updated.id))
            .await;
        Ok(updated)
    }

    pub async fn get(&self, id: Uuid) -> Result<coupon::Model, ServiceError> {
        coupon::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Coupon {id} not found")))
    }

    /// Page through coupons, newest first. `page` is 1-based.
    pub async fn list(
        &self,
        filter: &CouponFilter,
        page: u64,
        per_page: u64,
    ) -> Result<(Vec<coupon::Model>, u64), ServiceError> {
        let mut condition = Condition::all();
        if let Some(active) = filter.is_active {
            condition = condition.add(coupon::Column::IsActive.eq(active));
        }
        if let Some(visibility) = filter.visibility {
            condition = condition.add(coupon::Column::Visibility.eq(visibility));
        }

        let paginator = coupon::Entity::find()
            .filter(condition)
            .order_by_desc(coupon::Column::CreatedAt)
            .paginate(&*self.db, per_page.max(1));
        let total = paginator.num_items().await?;
        let coupons = paginator.fetch_page(page.saturating_sub(1)).await?;
        Ok((coupons, total))
    }

    /// Delete a coupon that was never redeemed.
    ///
    /// Redeemed coupons are referenced by the ledger; deactivate them instead.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<(), ServiceError> {
        let coupon = self.get(id).await?;
        let redemptions = coupon_usage::Entity::find()
            .filter(coupon_usage::Column::CouponId.eq(id))
            .count(&*self.db)
            .await?;

        if coupon.used_count > 0 || redemptions > 0 {
            warn!(code = %coupon.code, "refusing to delete a redeemed coupon");
            return Err(ServiceError::Conflict(format!(
                "Coupon {} has been redeemed; deactivate it instead",
                coupon.code
            )));
        }

        coupon::Entity::delete_by_id(id).exec(&*self.db).await?;
        self.event_sender.send_or_log(Event::CouponDeleted(id)).await;
        info!(code = %coupon.code, "coupon deleted");
        Ok(())
    }
}

fn rejected(code: &str, rejection: CouponRejection) -> ServiceError {
    counter!("fashion_store.coupons.rejections", 1, "code" => rejection.code());
    info!(%code, reason = rejection.code(), "coupon rejected");
    ServiceError::CouponRejected(rejection)
}

fn unique_code_conflict(err: sea_orm::DbErr, code: &str) -> ServiceError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => {
            ServiceError::Conflict(format!("Coupon code {code} already exists"))
        }
        _ => ServiceError::DatabaseError(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn input() -> CouponInput {
        CouponInput {
            code: " welcome10 ".to_string(),
            name: "Welcome".to_string(),
            description: None,
            coupon_type: CouponType::Public,
            visibility: CouponVisibility::Featured,
            discount_type: DiscountType::Percentage,
            discount_value: dec!(10),
            max_discount: Some(dec!(50000)),
            min_order_value: dec!(0),
            usage_limit: Some(100),
            usage_limit_per_user: 1,
            apply_type: ApplyType::All,
            applicable_categories: vec![],
            applicable_products: vec![],
            assigned_users: vec![],
            start_date: Utc::now(),
            end_date: Utc::now() + Duration::days(7),
            is_active: true,
        }
    }

    fn failed_fields(input: &CouponInput) -> Vec<&'static str> {
        let mut fields: Vec<_> = input
            .validate_all()
            .err()
            .map(|e| e.field_errors().keys().copied().collect())
            .unwrap_or_default();
        fields.sort();
        fields
    }

    #[test]
    fn well_formed_input_passes() {
        assert!(input().validate_all().is_ok());
    }

    #[test]
    fn percentage_above_hundred_is_rejected() {
        let mut i = input();
        i.discount_value = dec!(120);
        assert_eq!(failed_fields(&i), vec!["discount_value"]);
    }

    #[test]
    fn fixed_coupon_cannot_carry_max_discount() {
        let mut i = input();
        i.discount_type = DiscountType::Fixed;
        i.discount_value = dec!(30000);
        assert_eq!(failed_fields(&i), vec!["max_discount"]);
    }

    #[test]
    fn public_coupon_cannot_be_assigned() {
        let mut i = input();
        i.assigned_users = vec![Uuid::new_v4()];
        assert_eq!(failed_fields(&i), vec!["assigned_users"]);
    }

    #[test]
    fn scoped_coupon_needs_targets() {
        let mut i = input();
        i.apply_type = ApplyType::Category;
        assert_eq!(failed_fields(&i), vec!["applicable_categories"]);
    }

    #[test]
    fn reversed_window_and_bad_code_are_both_reported() {
        let mut i = input();
        i.code = "a!".to_string();
        i.end_date = i.start_date - Duration::days(1);
        // field-level errors short-circuit the cross-field pass
        assert_eq!(failed_fields(&i), vec!["code"]);
        i.code = "OK_CODE".to_string();
        assert_eq!(failed_fields(&i), vec!["end_date"]);
    }

    mod apply {
        use super::*;
        use crate::db::{self, DbConfig};
        use crate::entities::order::{OrderStatus, PaymentMethod, PaymentStatus, ShippingAddress};
        use assert_matches::assert_matches;
        use tokio::sync::mpsc;

        struct Harness {
            service: CouponService,
            db: Arc<DatabaseConnection>,
            user_id: Uuid,
        }

        async fn harness() -> Harness {
            let conn = db::establish_connection_with_config(&DbConfig {
                url: "sqlite::memory:".into(),
                max_connections: 1,
                sqlx_logging: false,
                ..Default::default()
            })
            .await
            .unwrap();
            db::run_migrations(&conn).await.unwrap();
            let db = Arc::new(conn);
            let (tx, _rx) = mpsc::channel(64);
            Harness {
                service: CouponService::new(db.clone(), Arc::new(EventSender::new(tx))),
                db,
                user_id: Uuid::new_v4(),
            }
        }

        /// An order that already carries the coupon but has no ledger entry.
        async fn imported_order(h: &Harness, coupon: &coupon::Model) -> order::Model {
            let now = Utc::now();
            order::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_number: Set("ORD-20240615-KX7P2Q".into()),
                user_id: Set(h.user_id),
                status: Set(OrderStatus::Pending),
                payment_method: Set(PaymentMethod::Cod),
                payment_status: Set(PaymentStatus::Unpaid),
                subtotal: Set(dec!(400000)),
                shipping_fee: Set(Decimal::ZERO),
                discount_amount: Set(dec!(40000)),
                total: Set(dec!(360000)),
                coupon_id: Set(Some(coupon.id)),
                coupon_code: Set(Some(coupon.code.clone())),
                shipping_address: Set(ShippingAddress {
                    recipient_name: "Lan".into(),
                    phone: "0912345678".into(),
                    province: "Ha Noi".into(),
                    ward: "Phuc Xa".into(),
                    street: "1 Hang Bac".into(),
                }),
                note: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&*h.db)
            .await
            .unwrap()
        }

        #[tokio::test]
        async fn records_missing_redemption_once() {
            let h = harness().await;
            let coupon = h.service.create(input()).await.unwrap();
            let order = imported_order(&h, &coupon).await;
            let request = ApplyCouponRequest {
                coupon_id: coupon.id,
                order_id: order.id,
                discount_amount: dec!(40000),
            };

            let first = h.service.apply(h.user_id, &request, Utc::now()).await.unwrap();
            assert!(first.newly_recorded);
            assert_eq!(first.coupon_code, "WELCOME10");

            let again = h.service.apply(h.user_id, &request, Utc::now()).await.unwrap();
            assert!(!again.newly_recorded);
            assert_eq!(again.usage_id, first.usage_id);

            let stored = h.service.get(coupon.id).await.unwrap();
            assert_eq!(stored.used_count, 1);
        }

        #[tokio::test]
        async fn mismatched_discount_is_refused() {
            let h = harness().await;
            let coupon = h.service.create(input()).await.unwrap();
            let order = imported_order(&h, &coupon).await;
            let request = ApplyCouponRequest {
                coupon_id: coupon.id,
                order_id: order.id,
                discount_amount: dec!(50000),
            };

            assert_matches!(
                h.service.apply(h.user_id, &request, Utc::now()).await,
                Err(ServiceError::InvalidInput(_))
            );
            assert_eq!(h.service.get(coupon.id).await.unwrap().used_count, 0);
        }

        #[tokio::test]
        async fn other_users_order_is_not_found() {
            let h = harness().await;
            let coupon = h.service.create(input()).await.unwrap();
            let order = imported_order(&h, &coupon).await;
            let request = ApplyCouponRequest {
                coupon_id: coupon.id,
                order_id: order.id,
                discount_amount: dec!(40000),
            };

            assert_matches!(
                h.service.apply(Uuid::new_v4(), &request, Utc::now()).await,
                Err(ServiceError::NotFound(_))
            );
        }
    }

    #[test]
    fn rejection_reason_carries_code_and_message() {
        let reason = RejectionReason::from(&CouponRejection::ScopeMismatch);
        assert_eq!(reason.code, "COUPON_SCOPE_MISMATCH");
        assert!(!reason.message.is_empty());
    }
}
