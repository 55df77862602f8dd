//! Coupon eligibility rules.
//!
//! Everything here is a pure function of the coupon snapshot, the caller's
//! context and the clock. Checks run in a fixed order and the first failure
//! wins, so a given input always yields the same rejection.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::coupon::{self, ApplyType};
use crate::errors::CouponRejection;

/// One cart line as far as coupon scoping is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: Uuid,
    pub category_id: Uuid,
}

/// What the evaluator needs to know about the cart.
///
/// Scope rules only ask whether *some* line matches, so the ids of all lines
/// are enough.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartContext {
    pub subtotal: Decimal,
    pub product_ids: Vec<Uuid>,
    pub category_ids: Vec<Uuid>,
}

impl CartContext {
    pub fn new(subtotal: Decimal, product_ids: Vec<Uuid>, category_ids: Vec<Uuid>) -> Self {
        Self {
            subtotal,
            product_ids,
            category_ids,
        }
    }

    pub fn from_lines(subtotal: Decimal, lines: &[CartLine]) -> Self {
        Self {
            subtotal,
            product_ids: lines.iter().map(|l| l.product_id).collect(),
            category_ids: lines.iter().map(|l| l.category_id).collect(),
        }
    }
}

/// Who is asking and how often they have already redeemed the coupon.
///
/// `user_redemptions` is ignored for anonymous callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct UserContext {
    pub user_id: Option<Uuid>,
    pub user_redemptions: u64,
}

impl UserContext {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn signed_in(user_id: Uuid, user_redemptions: u64) -> Self {
        Self {
            user_id: Some(user_id),
            user_redemptions,
        }
    }
}

/// Full evaluation against a cart.
pub fn evaluate(
    coupon: &coupon::Model,
    user: &UserContext,
    cart: &CartContext,
    now: DateTime<Utc>,
) -> Result<(), CouponRejection> {
    check_state(coupon, user.user_id, now)?;
    check_user_limit(coupon, user)?;
    check_cart(coupon, cart)
}

/// Availability probe without a cart (steps up to the per-user limit).
pub fn evaluate_without_cart(
    coupon: &coupon::Model,
    user: &UserContext,
    now: DateTime<Utc>,
) -> Result<(), CouponRejection> {
    check_state(coupon, user.user_id, now)?;
    check_user_limit(coupon, user)
}

/// Kill switch, validity window, global cap and private-coupon access.
///
/// These need nothing but the coupon row, so callers run them before paying
/// for a ledger count.
pub fn check_state(
    coupon: &coupon::Model,
    user_id: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<(), CouponRejection> {
    if !coupon.is_active {
        return Err(CouponRejection::Inactive);
    }

    // Window is inclusive at both ends.
    if now < coupon.start_date {
        return Err(CouponRejection::Expired { before_start: true });
    }
    if now > coupon.end_date {
        return Err(CouponRejection::Expired {
            before_start: false,
        });
    }

    if let Some(limit) = coupon.usage_limit {
        if coupon.used_count >= limit {
            return Err(CouponRejection::UsageLimitReached);
        }
    }

    if coupon.is_private() {
        let user_id = user_id.ok_or(CouponRejection::AuthRequired)?;
        // An empty assignment list opens the coupon to any signed-in user.
        if !coupon.assigned_users.is_empty() && !coupon.assigned_users.contains(&user_id) {
            return Err(CouponRejection::NotAvailableForUser);
        }
    }

    Ok(())
}

pub fn check_user_limit(coupon: &coupon::Model, user: &UserContext) -> Result<(), CouponRejection> {
    if user.user_id.is_none() {
        return Ok(());
    }
    let limit = coupon.usage_limit_per_user.max(0) as u64;
    if user.user_redemptions >= limit {
        return Err(CouponRejection::UserUsageLimitReached {
            limit: coupon.usage_limit_per_user,
        });
    }
    Ok(())
}

/// Minimum order value, then line scoping.
pub fn check_cart(coupon: &coupon::Model, cart: &CartContext) -> Result<(), CouponRejection> {
    if cart.subtotal < coupon.min_order_value {
        return Err(CouponRejection::MinOrderNotMet {
            min_order_value: coupon.min_order_value.normalize(),
            shortfall: (coupon.min_order_value - cart.subtotal).normalize(),
        });
    }

    if !matches_scope(coupon, cart) {
        return Err(CouponRejection::ScopeMismatch);
    }

    Ok(())
}

/// True when at least one cart line falls inside the coupon's scope.
pub fn matches_scope(coupon: &coupon::Model, cart: &CartContext) -> bool {
    let any_category = || {
        cart.category_ids
            .iter()
            .any(|id| coupon.applicable_categories.contains(id))
    };
    let any_product = || {
        cart.product_ids
            .iter()
            .any(|id| coupon.applicable_products.contains(id))
    };

    match coupon.apply_type {
        ApplyType::All => true,
        ApplyType::Category => any_category(),
        ApplyType::Product => any_product(),
        ApplyType::Mixed => any_category() || any_product(),
    }
}

/// Trim and upper-case a user supplied code.
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}


#[cfg(test)]
mod tests {
    use super::fixtures::{cart, coupon, now};
    use super::*;
    use crate::entities::coupon::CouponType;
    use crate::entities::IdSet;
    use chrono::Duration;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    fn code_of(result: Result<(), CouponRejection>) -> Option<&'static str> {
        result.err().map(|r| r.code())
    }

    #[test]
    fn eligible_coupon_passes_every_check() {
        let user = UserContext::signed_in(Uuid::new_v4(), 0);
        assert!(evaluate(&coupon(), &user, &cart(dec!(300000)), now()).is_ok());
    }

    #[test]
    fn inactive_wins_over_expiry() {
        let mut c = coupon();
        c.is_active = false;
        c.end_date = now() - Duration::days(3);
        assert_eq!(
            code_of(evaluate(&c, &UserContext::anonymous(), &cart(dec!(1)), now())),
            Some("COUPON_INACTIVE")
        );
    }

    #[rstest]
    #[case::before_start(Duration::hours(1), Duration::days(2), true)]
    #[case::after_end(-Duration::days(2), -Duration::hours(1), false)]
    fn outside_window_is_expired(
        #[case] start_offset: Duration,
        #[case] end_offset: Duration,
        #[case] before_start: bool,
    ) {
        let mut c = coupon();
        c.start_date = now() + start_offset;
        c.end_date = now() + end_offset;
        assert_eq!(
            evaluate(&c, &UserContext::anonymous(), &cart(dec!(1)), now()),
            Err(CouponRejection::Expired { before_start })
        );
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let mut c = coupon();
        c.start_date = now();
        c.end_date = now();
        assert!(evaluate(&c, &UserContext::anonymous(), &cart(dec!(1)), now()).is_ok());
    }

    #[test]
    fn exhausted_global_limit_is_rejected() {
        let mut c = coupon();
        c.usage_limit = Some(10);
        c.used_count = 10;
        assert_eq!(
            code_of(evaluate(&c, &UserContext::anonymous(), &cart(dec!(1)), now())),
            Some("COUPON_USAGE_LIMIT_REACHED")
        );
    }

    #[test]
    fn private_coupon_requires_sign_in() {
        let mut c = coupon();
        c.coupon_type = CouponType::Private;
        assert_eq!(
            code_of(evaluate(&c, &UserContext::anonymous(), &cart(dec!(1)), now())),
            Some("AUTH_REQUIRED_FOR_PRIVATE_COUPON")
        );
    }

    #[test]
    fn private_coupon_with_empty_assignment_is_open_to_any_user() {
        let mut c = coupon();
        c.coupon_type = CouponType::Private;
        let user = UserContext::signed_in(Uuid::new_v4(), 0);
        assert!(evaluate(&c, &user, &cart(dec!(1)), now()).is_ok());
    }

    #[test]
    fn private_coupon_rejects_unassigned_user() {
        let mut c = coupon();
        c.coupon_type = CouponType::Private;
        c.assigned_users = IdSet::from(vec![Uuid::new_v4()]);
        let user = UserContext::signed_in(Uuid::new_v4(), 0);
        assert_eq!(
            code_of(evaluate(&c, &user, &cart(dec!(1)), now())),
            Some("COUPON_NOT_AVAILABLE_FOR_USER")
        );
    }

    #[test]
    fn per_user_limit_counts_previous_redemptions() {
        let mut c = coupon();
        c.usage_limit_per_user = 2;
        let id = Uuid::new_v4();
        assert!(evaluate(&c, &UserContext::signed_in(id, 1), &cart(dec!(1)), now()).is_ok());
        assert_eq!(
            evaluate(&c, &UserContext::signed_in(id, 2), &cart(dec!(1)), now()),
            Err(CouponRejection::UserUsageLimitReached { limit: 2 })
        );
    }

    #[test]
    fn min_order_reports_threshold_and_shortfall() {
        let mut c = coupon();
        c.min_order_value = dec!(500000);
        let err = evaluate(&c, &UserContext::anonymous(), &cart(dec!(400000)), now()).unwrap_err();
        assert_eq!(err.code(), "MIN_ORDER_NOT_MET");
        assert_eq!(
            err,
            CouponRejection::MinOrderNotMet {
                min_order_value: dec!(500000),
                shortfall: dec!(100000),
            }
        );
    }

    #[test]
    fn category_scope_needs_a_matching_line() {
        let mut c = coupon();
        let category_a = Uuid::new_v4();
        c.apply_type = ApplyType::Category;
        c.applicable_categories = IdSet::from(vec![category_a]);

        // every line is in some other category
        assert_eq!(
            code_of(evaluate(&c, &UserContext::anonymous(), &cart(dec!(1)), now())),
            Some("COUPON_SCOPE_MISMATCH")
        );

        let mut matching = cart(dec!(1));
        matching.category_ids.push(category_a);
        assert!(evaluate(&c, &UserContext::anonymous(), &matching, now()).is_ok());
    }

    #[test]
    fn mixed_scope_accepts_product_or_category() {
        let product = Uuid::new_v4();
        let mut c = coupon();
        c.apply_type = ApplyType::Mixed;
        c.applicable_categories = IdSet::from(vec![Uuid::new_v4()]);
        c.applicable_products = IdSet::from(vec![product]);

        let cart = CartContext::from_lines(
            dec!(1),
            &[CartLine {
                product_id: product,
                category_id: Uuid::new_v4(),
            }],
        );
        assert!(matches_scope(&c, &cart));

        c.apply_type = ApplyType::Category;
        assert!(!matches_scope(&c, &cart));
    }

    #[test]
    fn anonymous_callers_skip_the_per_user_limit() {
        let mut c = coupon();
        c.usage_limit_per_user = 1;
        let anon = UserContext {
            user_id: None,
            user_redemptions: 99,
        };
        assert!(evaluate_without_cart(&c, &anon, now()).is_ok());
    }

    #[test]
    fn codes_are_trimmed_and_uppercased() {
        assert_eq!(normalize_code("  summer20 \n"), "SUMMER20");
    }
}
