//! Sepay: VietQR bank-transfer payments.
//!
//! A QR code is a static image URL carrying account, amount and transfer
//! content; there is no server-side session to open or close. Payment is
//! confirmed by finding an incoming transaction whose content contains our
//! transfer code, either through the transaction list API or a webhook.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};
use url::Url;
use utoipa::ToSchema;

use crate::config::SepayConfig;
use crate::errors::ServiceError;
use crate::services::coupons::round_vnd;

/// Sepay reports local times without an offset.
const VIETNAM_UTC_OFFSET_SECS: i32 = 7 * 3600;

/// Receiving account shown next to the QR code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BankInfo {
    pub bank_code: String,
    pub account_number: String,
    pub account_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrCode {
    pub qr_url: String,
    pub transfer_content: String,
    pub bank: BankInfo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayStatus {
    Pending,
    Completed {
        transaction_id: String,
        paid_at: Option<DateTime<Utc>>,
    },
}

/// Payment provider seam
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> &'static str;

    fn bank_info(&self) -> BankInfo;

    async fn create_qr(
        &self,
        order_number: &str,
        amount: Decimal,
        info: &str,
    ) -> Result<QrCode, ServiceError>;

    /// Look for a transfer with `transfer_content` of at least `amount`
    /// made after `since`.
    async fn check_status(
        &self,
        transfer_content: &str,
        amount: Decimal,
        since: DateTime<Utc>,
    ) -> Result<GatewayStatus, ServiceError>;

    async fn cancel(&self, order_number: &str) -> Result<(), ServiceError>;
}

/// Transfer content for an order: the order number without separators, so
/// banks that strip punctuation keep it intact.
pub fn transfer_content_for(order_number: &str) -> String {
    normalize_content(order_number)
}

/// Upper-case alphanumerics only.
pub fn normalize_content(raw: &str) -> String {
    raw.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Pull our transfer code (`ORD` + 8 digit date + 6 characters) out of
/// free-form bank content.
pub fn extract_transfer_code(content: &str) -> Option<String> {
    let normalized = normalize_content(content);
    let bytes = normalized.as_bytes();
    let mut start = 0;
    while let Some(pos) = normalized[start..].find("ORD") {
        let begin = start + pos;
        let end = begin + 3 + 8 + 6;
        if end <= bytes.len() && bytes[begin + 3..begin + 11].iter().all(u8::is_ascii_digit) {
            return Some(normalized[begin..end].to_string());
        }
        start = begin + 3;
    }
    None
}

pub fn parse_sepay_time(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").ok()?;
    let offset = chrono::FixedOffset::east_opt(VIETNAM_UTC_OFFSET_SECS)?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

fn decimal_from_str_or_number<'de, D>(deserializer: D) -> Result<Decimal, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    let text = match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    };
    text.trim().parse().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize)]
struct TransactionListResponse {
    #[serde(default)]
    transactions: Vec<SepayTransaction>,
}

#[derive(Debug, Deserialize)]
struct SepayTransaction {
    id: serde_json::Value,
    transaction_date: String,
    #[serde(deserialize_with = "decimal_from_str_or_number")]
    amount_in: Decimal,
    #[serde(default)]
    transaction_content: String,
}

impl SepayTransaction {
    fn id_string(&self) -> String {
        match &self.id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Webhook body posted by Sepay for every account movement
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SepayWebhookPayload {
    #[schema(value_type = String)]
    pub id: serde_json::Value,
    #[serde(default)]
    pub gateway: Option<String>,
    pub transaction_date: String,
    #[serde(default)]
    pub account_number: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub content: String,
    /// `in` or `out`
    pub transfer_type: String,
    #[serde(deserialize_with = "decimal_from_str_or_number")]
    #[schema(value_type = f64)]
    pub transfer_amount: Decimal,
    #[serde(default)]
    pub reference_code: Option<String>,
}

impl SepayWebhookPayload {
    pub fn transaction_id(&self) -> String {
        match &self.id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    pub fn is_incoming(&self) -> bool {
        self.transfer_type.eq_ignore_ascii_case("in")
    }
}

#[derive(Clone)]
pub struct SepayGateway {
    client: reqwest::Client,
    config: SepayConfig,
}

impl SepayGateway {
    pub fn new(config: SepayConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, config })
    }

    fn qr_url(&self, amount: Decimal, content: &str) -> Result<String, ServiceError> {
        let amount = round_vnd(amount).to_string();
        let url = Url::parse_with_params(
            &self.config.qr_base_url,
            &[
                ("acc", self.config.account_number.as_str()),
                ("bank", self.config.bank_code.as_str()),
                ("amount", amount.as_str()),
                ("des", content),
            ],
        )
        .map_err(|e| ServiceError::InternalError(format!("invalid Sepay QR base URL: {e}")))?;
        Ok(url.into())
    }
}

#[async_trait]
impl PaymentGateway for SepayGateway {
    fn provider(&self) -> &'static str {
        "sepay"
    }

    fn bank_info(&self) -> BankInfo {
        BankInfo {
            bank_code: self.config.bank_code.clone(),
            account_number: self.config.account_number.clone(),
            account_name: self.config.account_name.clone(),
        }
    }

    async fn create_qr(
        &self,
        order_number: &str,
        amount: Decimal,
        _info: &str,
    ) -> Result<QrCode, ServiceError> {
        let transfer_content = transfer_content_for(order_number);
        Ok(QrCode {
            qr_url: self.qr_url(amount, &transfer_content)?,
            transfer_content,
            bank: self.bank_info(),
        })
    }

    #[instrument(skip(self))]
    async fn check_status(
        &self,
        transfer_content: &str,
        amount: Decimal,
        since: DateTime<Utc>,
    ) -> Result<GatewayStatus, ServiceError> {
        let token = self.config.api_token.as_deref().ok_or_else(|| {
            ServiceError::ExternalServiceError("Sepay API token is not configured".to_string())
        })?;

        let since_local = since
            .with_timezone(&chrono::FixedOffset::east_opt(VIETNAM_UTC_OFFSET_SECS).ok_or_else(
                || ServiceError::InternalError("invalid timezone offset".to_string()),
            )?)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        let url = format!(
            "{}/transactions/list",
            self.config.api_base_url.trim_end_matches('/')
        );

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .query(&[
                ("account_number", self.config.account_number.as_str()),
                ("transaction_date_min", since_local.as_str()),
                ("limit", "100"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "Sepay transaction lookup failed");
            return Err(ServiceError::ExternalServiceError(format!(
                "Sepay returned {}",
                response.status()
            )));
        }

        let body: TransactionListResponse = response.json().await?;
        let wanted = normalize_content(transfer_content);
        debug!(count = body.transactions.len(), "Sepay transactions fetched");

        let found = body.transactions.iter().find(|tx| {
            tx.amount_in >= amount && normalize_content(&tx.transaction_content).contains(&wanted)
        });

        Ok(match found {
            Some(tx) => GatewayStatus::Completed {
                transaction_id: tx.id_string(),
                paid_at: parse_sepay_time(&tx.transaction_date),
            },
            None => GatewayStatus::Pending,
        })
    }

    async fn cancel(&self, _order_number: &str) -> Result<(), ServiceError> {
        // Static QR: nothing to revoke on Sepay's side.
        Ok(())
    }
}
