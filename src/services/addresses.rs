use crate::{entities::address, errors::ServiceError};
use chrono::Utc;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

/// Vietnamese phone numbers: 10 digits starting with 0, or +84 followed by 9.
fn validate_phone(phone: &str) -> Result<(), ValidationError> {
    let digits = phone.strip_prefix("+84").map(|rest| format!("0{rest}"));
    let local = digits.as_deref().unwrap_or(phone);
    if local.len() == 10 && local.starts_with('0') && local.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(ValidationError::new("phone"))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate, ToSchema)]
pub struct AddressInput {
    #[validate(length(min = 1, max = 100))]
    pub recipient_name: String,
    #[validate(custom = "validate_phone")]
    pub phone: String,
    #[validate(length(min = 1, max = 100))]
    pub province: String,
    #[validate(length(min = 1, max = 100))]
    pub ward: String,
    #[validate(length(min = 1, max = 255))]
    pub street: String,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AddressView {
    pub id: Uuid,
    pub recipient_name: String,
    pub phone: String,
    pub province: String,
    pub ward: String,
    pub street: String,
    pub is_default: bool,
}

impl From<address::Model> for AddressView {
    fn from(a: address::Model) -> Self {
        Self {
            id: a.id,
            recipient_name: a.recipient_name,
            phone: a.phone,
            province: a.province,
            ward: a.ward,
            street: a.street,
            is_default: a.is_default,
        }
    }
}

/// Saved delivery addresses
#[derive(Clone)]
pub struct AddressService {
    db: Arc<DatabaseConnection>,
}

impl AddressService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Default address first, then newest.
    pub async fn list(&self, user_id: Uuid) -> Result<Vec<address::Model>, ServiceError> {
        Ok(address::Entity::find()
            .filter(address::Column::UserId.eq(user_id))
            .order_by_desc(address::Column::IsDefault)
            .order_by_desc(address::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }

    /// A user's first address becomes the default; a new default replaces
    /// the previous one.
    #[instrument(skip(self, input))]
    pub async fn create(
        &self,
        user_id: Uuid,
        input: AddressInput,
    ) -> Result<address::Model, ServiceError> {
        input.validate()?;
        let txn = self.db.begin().await?;

        let existing = address::Entity::find()
            .filter(address::Column::UserId.eq(user_id))
            .count(&txn)
            .await?;
        let is_default = input.is_default || existing == 0;

        if is_default {
            address::Entity::update_many()
                .col_expr(address::Column::IsDefault, Expr::value(false))
                .filter(address::Column::UserId.eq(user_id))
                .exec(&txn)
                .await?;
        }

        let created = address::ActiveModel {
            id: Set(Uuid::new_v4()),
            user_id: Set(user_id),
            recipient_name: Set(input.recipient_name.trim().to_string()),
            phone: Set(input.phone.trim().to_string()),
            province: Set(input.province.trim().to_string()),
            ward: Set(input.ward.trim().to_string()),
            street: Set(input.street.trim().to_string()),
            is_default: Set(is_default),
            created_at: Set(Utc::now()),
        }
        .insert(&txn)
        .await?;

        txn.commit().await?;
        Ok(created)
    }

    pub async fn delete(&self, user_id: Uuid, id: Uuid) -> Result<(), ServiceError> {
        let result = address::Entity::delete_many()
            .filter(address::Column::Id.eq(id))
            .filter(address::Column::UserId.eq(user_id))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!("Address {id} not found")));
        }
        Ok(())
    }

    /// One of the user's addresses; other users' ids read as not found.
    pub async fn find_owned<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
        id: Uuid,
    ) -> Result<address::Model, ServiceError> {
        address::Entity::find_by_id(id)
            .filter(address::Column::UserId.eq(user_id))
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Address {id} not found")))
    }

    pub async fn find_default<C: ConnectionTrait>(
        db: &C,
        user_id: Uuid,
    ) -> Result<Option<address::Model>, ServiceError> {
        Ok(address::Entity::find()
            .filter(address::Column::UserId.eq(user_id))
            .filter(address::Column::IsDefault.eq(true))
            .one(db)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_local_and_international_numbers() {
        assert!(validate_phone("0912345678").is_ok());
        assert!(validate_phone("+84912345678").is_ok());
    }

    #[test]
    fn rejects_short_or_lettered_numbers() {
        assert!(validate_phone("091234").is_err());
        assert!(validate_phone("09123a5678").is_err());
        assert!(validate_phone("1912345678").is_err());
    }
}
