//! Usage ledger: the append-only record of coupon redemptions and the only
//! writer of `coupons.used_count`.

use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait,
    PaginatorTrait, QueryFilter, Set, SqlErr,
};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::entities::{coupon, coupon_usage};
use crate::errors::{CouponRejection, ServiceError};

/// A redemption about to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redemption {
    pub coupon_id: Uuid,
    pub user_id: Uuid,
    pub order_id: Uuid,
    pub discount_amount: Decimal,
    pub applied_at: DateTime<Utc>,
}

/// Stateless; every method takes the connection or transaction to run on.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageLedger;

impl UsageLedger {
    /// How many times `user_id` has redeemed `coupon_id`.
    pub async fn count_user_redemptions<C: ConnectionTrait>(
        db: &C,
        coupon_id: Uuid,
        user_id: Uuid,
    ) -> Result<u64, ServiceError> {
        let count = coupon_usage::Entity::find()
            .filter(coupon_usage::Column::CouponId.eq(coupon_id))
            .filter(coupon_usage::Column::UserId.eq(user_id))
            .count(db)
            .await?;
        Ok(count)
    }

    pub async fn find_for_order<C: ConnectionTrait>(
        db: &C,
        coupon_id: Uuid,
        order_id: Uuid,
    ) -> Result<Option<coupon_usage::Model>, ServiceError> {
        Ok(coupon_usage::Entity::find()
            .filter(coupon_usage::Column::CouponId.eq(coupon_id))
            .filter(coupon_usage::Column::OrderId.eq(order_id))
            .one(db)
            .await?)
    }

    /// Record a redemption inside the caller's transaction.
    ///
    /// The global cap is enforced by a single conditional UPDATE, which also
    /// takes the coupon's row lock for the rest of the transaction. The
    /// per-user cap is re-counted after that lock is held. Any error leaves
    /// the transaction for the caller to roll back.
    #[instrument(skip(txn), fields(coupon_id = %redemption.coupon_id, order_id = %redemption.order_id))]
    pub async fn record_redemption<C: ConnectionTrait>(
        txn: &C,
        redemption: Redemption,
    ) -> Result<coupon_usage::Model, ServiceError> {
        let updated = coupon::Entity::update_many()
            .col_expr(
                coupon::Column::UsedCount,
                Expr::col(coupon::Column::UsedCount).add(1),
            )
            .col_expr(coupon::Column::UpdatedAt, Expr::value(redemption.applied_at))
            .filter(coupon::Column::Id.eq(redemption.coupon_id))
            .filter(
                Condition::any()
                    .add(coupon::Column::UsageLimit.is_null())
                    .add(
                        Expr::col(coupon::Column::UsedCount)
                            .lt(Expr::col(coupon::Column::UsageLimit)),
                    ),
            )
            .exec(txn)
            .await?;

        let coupon = coupon::Entity::find_by_id(redemption.coupon_id)
            .one(txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Coupon {} not found", redemption.coupon_id))
            })?;

        if updated.rows_affected == 0 {
            warn!(code = %coupon.code, "global usage limit hit at commit time");
            counter!("fashion_store.coupons.redemption_rejected", 1, "code" => "COUPON_USAGE_LIMIT_REACHED");
            return Err(CouponRejection::UsageLimitReached.into());
        }

        let previous =
            Self::count_user_redemptions(txn, redemption.coupon_id, redemption.user_id).await?;
        if previous >= coupon.usage_limit_per_user.max(0) as u64 {
            warn!(code = %coupon.code, user_id = %redemption.user_id, "per-user limit hit at commit time");
            counter!("fashion_store.coupons.redemption_rejected", 1, "code" => "USER_USAGE_LIMIT_REACHED");
            return Err(CouponRejection::UserUsageLimitReached {
                limit: coupon.usage_limit_per_user,
            }
            .into());
        }

        let entry = coupon_usage::ActiveModel {
            id: Set(Uuid::new_v4()),
            coupon_id: Set(coupon.id),
            coupon_code: Set(coupon.code.clone()),
            user_id: Set(redemption.user_id),
            order_id: Set(redemption.order_id),
            discount_amount: Set(redemption.discount_amount),
            applied_at: Set(redemption.applied_at),
        }
        .insert(txn)
        .await
        .map_err(|e| match e.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => ServiceError::Conflict(format!(
                "Coupon {} is already recorded for order {}",
                coupon.code, redemption.order_id
            )),
            _ => ServiceError::DatabaseError(e),
        })?;

        counter!("fashion_store.coupons.redeemed", 1);
        info!(
            code = %coupon.code,
            used_count = coupon.used_count,
            discount = %entry.discount_amount,
            "coupon redemption recorded"
        );
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, DbConfig, DbPool};
    use crate::services::coupons::rules::{self, fixtures, UserContext};
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;
    use sea_orm::TransactionTrait;

    async fn memory_db() -> DbPool {
        let pool = db::establish_connection_with_config(&DbConfig {
            url: "sqlite::memory:".into(),
            max_connections: 1,
            sqlx_logging: false,
            ..Default::default()
        })
        .await
        .unwrap();
        db::run_migrations(&pool).await.unwrap();
        pool
    }

    async fn store(db: &DbPool, model: coupon::Model) -> coupon::Model {
        coupon::ActiveModel::from(model)
            .reset_all()
            .insert(db)
            .await
            .unwrap()
    }

    async fn used_count(db: &DbPool, id: Uuid) -> i32 {
        coupon::Entity::find_by_id(id)
            .one(db)
            .await
            .unwrap()
            .unwrap()
            .used_count
    }

    fn redemption(coupon_id: Uuid, user_id: Uuid) -> Redemption {
        Redemption {
            coupon_id,
            user_id,
            order_id: Uuid::new_v4(),
            discount_amount: dec!(20000),
            applied_at: fixtures::now(),
        }
    }

    #[tokio::test]
    async fn exhausted_coupon_is_rejected_without_touching_the_counter() {
        let db = memory_db().await;
        let mut model = fixtures::coupon();
        model.usage_limit = Some(1);
        model.used_count = 1;
        let coupon = store(&db, model).await;

        let txn = db.begin().await.unwrap();
        let result = UsageLedger::record_redemption(&txn, redemption(coupon.id, Uuid::new_v4())).await;
        assert_matches!(
            result,
            Err(ServiceError::CouponRejected(CouponRejection::UsageLimitReached))
        );
        txn.rollback().await.unwrap();

        assert_eq!(used_count(&db, coupon.id).await, 1);
        let usages = coupon_usage::Entity::find().count(&db).await.unwrap();
        assert_eq!(usages, 0);
    }

    #[tokio::test]
    async fn per_user_cap_is_rechecked_and_rolled_back() {
        let db = memory_db().await;
        let coupon = store(&db, fixtures::coupon()).await;
        let user = Uuid::new_v4();

        let txn = db.begin().await.unwrap();
        UsageLedger::record_redemption(&txn, redemption(coupon.id, user))
            .await
            .unwrap();
        txn.commit().await.unwrap();
        assert_eq!(used_count(&db, coupon.id).await, 1);

        let txn = db.begin().await.unwrap();
        let result = UsageLedger::record_redemption(&txn, redemption(coupon.id, user)).await;
        assert_matches!(
            result,
            Err(ServiceError::CouponRejected(
                CouponRejection::UserUsageLimitReached { limit: 1 }
            ))
        );
        txn.rollback().await.unwrap();

        assert_eq!(used_count(&db, coupon.id).await, 1);
        assert_eq!(
            UsageLedger::count_user_redemptions(&db, coupon.id, user)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn stale_evaluation_loses_to_a_redemption_committed_in_between() {
        let db = memory_db().await;
        let mut model = fixtures::coupon();
        model.usage_limit = Some(1);
        let coupon = store(&db, model).await;
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

        // both shoppers see a coupon with one use left
        let snapshot = coupon::Entity::find_by_id(coupon.id)
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        let cart = fixtures::cart(dec!(300000));
        for user in [first, second] {
            assert!(rules::evaluate(
                &snapshot,
                &UserContext::signed_in(user, 0),
                &cart,
                fixtures::now()
            )
            .is_ok());
        }

        let txn = db.begin().await.unwrap();
        UsageLedger::record_redemption(&txn, redemption(coupon.id, second))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let txn = db.begin().await.unwrap();
        let result = UsageLedger::record_redemption(&txn, redemption(coupon.id, first)).await;
        assert_matches!(
            result,
            Err(ServiceError::CouponRejected(CouponRejection::UsageLimitReached))
        );
        txn.rollback().await.unwrap();

        assert_eq!(used_count(&db, coupon.id).await, 1);
        assert_eq!(
            UsageLedger::count_user_redemptions(&db, coupon.id, first)
                .await
                .unwrap(),
            0
        );
    }
}
