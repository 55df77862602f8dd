//! QR bank-transfer payments for Sepay orders.
//!
//! A session is a `payments` row with a fixed expiry. Its state moves
//! `pending -> completed | expired | cancelled` and never back; a new
//! session can be started for the same order once the previous one is
//! closed.

pub mod monitor;
pub mod sepay;

pub use monitor::{
    MonitorEvent, MonitorHandle, MonitorOutcome, MonitorSettings, PaymentMonitor, StatusProbe,
};
pub use sepay::{
    extract_transfer_code, BankInfo, GatewayStatus, PaymentGateway, QrCode, SepayGateway,
    SepayWebhookPayload,
};

use crate::{
    entities::{
        order::{self, OrderStatus, PaymentMethod, PaymentStatus},
        payment::{self, PaymentRecordStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Prefix Sepay puts in front of the key in the `Authorization` header
const WEBHOOK_AUTH_SCHEME: &str = "Apikey";

/// Buffered monitor events per watcher
const MONITOR_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Completed,
    Expired,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        self != SessionStatus::Pending
    }

    fn label(self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Completed => "completed",
            SessionStatus::Expired => "expired",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl From<PaymentRecordStatus> for SessionStatus {
    fn from(status: PaymentRecordStatus) -> Self {
        match status {
            PaymentRecordStatus::Pending => SessionStatus::Pending,
            PaymentRecordStatus::Completed => SessionStatus::Completed,
            PaymentRecordStatus::Expired => SessionStatus::Expired,
            PaymentRecordStatus::Cancelled => SessionStatus::Cancelled,
        }
    }
}

/// What the shopper needs to pay: QR image, bank details and countdown
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentSessionView {
    pub payment_id: Uuid,
    pub order_id: Uuid,
    pub order_number: String,
    pub amount: Decimal,
    pub qr_url: String,
    pub transfer_content: String,
    pub bank: BankInfo,
    pub status: SessionStatus,
    pub expires_at: DateTime<Utc>,
    pub remaining_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentStatusView {
    pub order_id: Uuid,
    pub status: SessionStatus,
    pub payment_status: PaymentStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub remaining_secs: u64,
    pub transaction_id: Option<String>,
}

/// Reply to Sepay. Anything but a 2xx makes Sepay retry, so unmatched
/// transfers are acknowledged too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct WebhookAck {
    pub success: bool,
    pub matched: bool,
    pub message: String,
}

impl WebhookAck {
    fn matched(message: impl Into<String>) -> Self {
        Self {
            success: true,
            matched: true,
            message: message.into(),
        }
    }

    fn ignored(message: impl Into<String>) -> Self {
        Self {
            success: true,
            matched: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaymentSettings {
    pub window: Duration,
    pub poll_interval: Duration,
    pub webhook_api_key: Option<String>,
}

impl Default for PaymentSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(900),
            poll_interval: Duration::from_secs(5),
            webhook_api_key: None,
        }
    }
}

/// A running watch on one session
pub struct PaymentWatch {
    /// `None` when the session was already settled
    pub handle: Option<MonitorHandle>,
    pub events: mpsc::Receiver<MonitorEvent>,
}

fn remaining_secs(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (expires_at - now).num_seconds().max(0) as u64
}

#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    gateway: Arc<dyn PaymentGateway>,
    settings: PaymentSettings,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        gateway: Arc<dyn PaymentGateway>,
        settings: PaymentSettings,
    ) -> Self {
        Self {
            db,
            event_sender,
            gateway,
            settings,
        }
    }

    pub fn bank_info(&self) -> BankInfo {
        self.gateway.bank_info()
    }

    async fn find_order<C: ConnectionTrait>(
        conn: &C,
        user_id: Uuid,
        order_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .filter(order::Column::UserId.eq(user_id))
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} not found")))
    }

    async fn latest_session<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<Option<payment::Model>, ServiceError> {
        Ok(payment::Entity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .order_by_desc(payment::Column::CreatedAt)
            .one(conn)
            .await?)
    }

    fn session_view(
        &self,
        order: &order::Model,
        session: payment::Model,
        now: DateTime<Utc>,
    ) -> PaymentSessionView {
        PaymentSessionView {
            payment_id: session.id,
            order_id: order.id,
            order_number: order.order_number.clone(),
            amount: session.amount,
            remaining_secs: remaining_secs(session.expires_at, now),
            status: session.status.into(),
            expires_at: session.expires_at,
            qr_url: session.qr_url,
            transfer_content: session.transfer_content,
            bank: self.gateway.bank_info(),
        }
    }

    /// Open a QR session for an unpaid Sepay order, or return the one that
    /// is still live.
    #[instrument(skip(self))]
    pub async fn start(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PaymentSessionView, ServiceError> {
        let order = Self::find_order(&*self.db, user_id, order_id).await?;

        if order.payment_method != PaymentMethod::Sepay {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} is not paid by bank transfer",
                order.order_number
            )));
        }
        if order.status == OrderStatus::Cancelled {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} is cancelled",
                order.order_number
            )));
        }
        if order.payment_status == PaymentStatus::Paid {
            return Err(ServiceError::Conflict(format!(
                "Order {} is already paid",
                order.order_number
            )));
        }

        if let Some(session) = Self::latest_session(&*self.db, order.id).await? {
            if session.is_open() && session.expires_at > now {
                return Ok(self.session_view(&order, session, now));
            }
        }

        let qr = self
            .gateway
            .create_qr(
                &order.order_number,
                order.total,
                &format!("Thanh toan don hang {}", order.order_number),
            )
            .await?;

        let txn = self.db.begin().await?;

        // Whatever is still open here has run out of time.
        payment::Entity::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentRecordStatus::Expired))
            .col_expr(payment::Column::UpdatedAt, Expr::value(now))
            .filter(payment::Column::OrderId.eq(order.id))
            .filter(payment::Column::Status.eq(PaymentRecordStatus::Pending))
            .exec(&txn)
            .await?;

        let window = chrono::Duration::from_std(self.settings.window)
            .map_err(|e| ServiceError::InternalError(format!("payment window: {e}")))?;
        let session = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            provider: Set(self.gateway.provider().to_string()),
            amount: Set(order.total),
            transfer_content: Set(qr.transfer_content),
            qr_url: Set(qr.qr_url),
            status: Set(PaymentRecordStatus::Pending),
            provider_transaction_id: Set(None),
            expires_at: Set(now + window),
            completed_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        order::Entity::update_many()
            .col_expr(order::Column::PaymentStatus, Expr::value(PaymentStatus::Unpaid))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::PaymentStatus.ne(PaymentStatus::Paid))
            .exec(&txn)
            .await?;

        txn.commit().await?;

        counter!("fashion_store.payments.sessions_started", 1, "provider" => self.gateway.provider());
        info!(order_number = %order.order_number, payment_id = %session.id, expires_at = %session.expires_at, "payment session started");
        self.event_sender
            .send_or_log(Event::PaymentStarted {
                order_id: order.id,
                payment_id: session.id,
            })
            .await;

        Ok(self.session_view(&order, session, now))
    }

    /// Current state of the order's latest session. A pending session is
    /// closed here once it runs out of time; otherwise the gateway is asked.
    #[instrument(skip(self))]
    pub async fn status(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PaymentStatusView, ServiceError> {
        let order = Self::find_order(&*self.db, user_id, order_id).await?;
        let session = Self::latest_session(&*self.db, order.id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "No payment session for order {}",
                    order.order_number
                ))
            })?;

        if order.payment_status == PaymentStatus::Paid || !session.is_open() {
            return Ok(Self::status_view(&order, &session, now));
        }

        if now >= session.expires_at {
            self.expire(&order, &session, now).await?;
            return self.reload_status(user_id, order_id, now).await;
        }

        match self
            .gateway
            .check_status(&session.transfer_content, session.amount, session.created_at)
            .await?
        {
            GatewayStatus::Pending => Ok(Self::status_view(&order, &session, now)),
            GatewayStatus::Completed {
                transaction_id,
                paid_at,
            } => {
                let txn = self.db.begin().await?;
                let settled = Self::mark_paid(
                    &txn,
                    &session,
                    Some(transaction_id.clone()),
                    paid_at.unwrap_or(now),
                )
                .await?;
                txn.commit().await?;
                if settled {
                    self.announce_paid(&order, Some(transaction_id)).await;
                }
                self.reload_status(user_id, order_id, now).await
            }
        }
    }

    async fn reload_status(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PaymentStatusView, ServiceError> {
        let order = Self::find_order(&*self.db, user_id, order_id).await?;
        let session = Self::latest_session(&*self.db, order.id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {order_id} has no payment")))?;
        Ok(Self::status_view(&order, &session, now))
    }

    fn status_view(
        order: &order::Model,
        session: &payment::Model,
        now: DateTime<Utc>,
    ) -> PaymentStatusView {
        let status = if order.payment_status == PaymentStatus::Paid {
            SessionStatus::Completed
        } else {
            session.status.into()
        };
        PaymentStatusView {
            order_id: order.id,
            status,
            payment_status: order.payment_status,
            expires_at: Some(session.expires_at),
            remaining_secs: if status.is_terminal() {
                0
            } else {
                remaining_secs(session.expires_at, now)
            },
            transaction_id: session.provider_transaction_id.clone(),
        }
    }

    async fn expire(
        &self,
        order: &order::Model,
        session: &payment::Model,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        let closed = payment::Entity::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentRecordStatus::Expired))
            .col_expr(payment::Column::UpdatedAt, Expr::value(now))
            .filter(payment::Column::Id.eq(session.id))
            .filter(payment::Column::Status.eq(PaymentRecordStatus::Pending))
            .exec(&txn)
            .await?;
        order::Entity::update_many()
            .col_expr(order::Column::PaymentStatus, Expr::value(PaymentStatus::Expired))
            .col_expr(order::Column::UpdatedAt, Expr::value(now))
            .filter(order::Column::Id.eq(order.id))
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Unpaid))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        if closed.rows_affected > 0 {
            counter!("fashion_store.payments.outcomes", 1, "outcome" => SessionStatus::Expired.label());
            info!(order_number = %order.order_number, "payment session expired");
            self.event_sender
                .send_or_log(Event::PaymentExpired { order_id: order.id })
                .await;
        }
        Ok(())
    }

    /// Close the open session at the shopper's request. The order stays
    /// unpaid so a new session can be started later.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        user_id: Uuid,
        order_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<PaymentStatusView, ServiceError> {
        let order = Self::find_order(&*self.db, user_id, order_id).await?;
        if order.payment_status == PaymentStatus::Paid {
            return Err(ServiceError::Conflict(format!(
                "Order {} is already paid",
                order.order_number
            )));
        }

        let closed = payment::Entity::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentRecordStatus::Cancelled))
            .col_expr(payment::Column::UpdatedAt, Expr::value(now))
            .filter(payment::Column::OrderId.eq(order.id))
            .filter(payment::Column::Status.eq(PaymentRecordStatus::Pending))
            .exec(&*self.db)
            .await?;
        if closed.rows_affected == 0 {
            return Err(ServiceError::InvalidOperation(format!(
                "Order {} has no open payment session",
                order.order_number
            )));
        }

        if let Err(e) = self.gateway.cancel(&order.order_number).await {
            warn!(error = %e, order_number = %order.order_number, "gateway cancel failed");
        }

        counter!("fashion_store.payments.outcomes", 1, "outcome" => SessionStatus::Cancelled.label());
        info!(order_number = %order.order_number, "payment session cancelled");
        self.event_sender
            .send_or_log(Event::PaymentCancelled { order_id: order.id })
            .await;

        self.reload_status(user_id, order_id, now).await
    }

    /// Ingest a Sepay webhook. `authorization` is the raw header value.
    #[instrument(skip(self, authorization, payload), fields(sepay_id = %payload.transaction_id()))]
    pub async fn webhook(
        &self,
        authorization: Option<&str>,
        payload: &SepayWebhookPayload,
        now: DateTime<Utc>,
    ) -> Result<WebhookAck, ServiceError> {
        self.check_webhook_key(authorization)?;

        if !payload.is_incoming() {
            return Ok(WebhookAck::ignored("outgoing transfer"));
        }

        let code = payload
            .code
            .as_deref()
            .and_then(extract_transfer_code)
            .or_else(|| extract_transfer_code(&payload.content));
        let Some(code) = code else {
            info!("webhook transfer carries no order code");
            return Ok(WebhookAck::ignored("no order code in transfer content"));
        };
        let order_number = format!("{}-{}-{}", &code[..3], &code[3..11], &code[11..]);
        let transaction_id = payload.transaction_id();

        let txn = self.db.begin().await?;

        let seen = payment::Entity::find()
            .filter(payment::Column::ProviderTransactionId.eq(transaction_id.clone()))
            .one(&txn)
            .await?;
        if seen.is_some() {
            return Ok(WebhookAck::matched("transaction already processed"));
        }

        let Some(order) = order::Entity::find()
            .filter(order::Column::OrderNumber.eq(order_number.clone()))
            .one(&txn)
            .await?
        else {
            warn!(%order_number, "webhook references unknown order");
            return Ok(WebhookAck::ignored("unknown order"));
        };

        if order.payment_status == PaymentStatus::Paid {
            return Ok(WebhookAck::matched("order already paid"));
        }
        if payload.transfer_amount < order.total {
            warn!(
                %order_number,
                received = %payload.transfer_amount,
                expected = %order.total,
                "transfer amount below order total"
            );
            return Ok(WebhookAck::ignored("amount below order total"));
        }

        let Some(session) = Self::latest_session(&txn, order.id).await? else {
            return Ok(WebhookAck::ignored("order has no payment session"));
        };
        if session.status == PaymentRecordStatus::Completed {
            return Ok(WebhookAck::matched("session already completed"));
        }

        let paid_at = sepay::parse_sepay_time(&payload.transaction_date).unwrap_or(now);
        let settled = Self::mark_paid(&txn, &session, Some(transaction_id.clone()), paid_at).await?;
        txn.commit().await?;

        if settled {
            self.announce_paid(&order, Some(transaction_id)).await;
        }
        Ok(WebhookAck::matched(format!("order {order_number} paid")))
    }

    fn check_webhook_key(&self, authorization: Option<&str>) -> Result<(), ServiceError> {
        let Some(expected) = self.settings.webhook_api_key.as_deref() else {
            return Ok(());
        };
        let presented = authorization
            .map(str::trim)
            .and_then(|value| value.split_once(' '))
            .filter(|(scheme, _)| scheme.eq_ignore_ascii_case(WEBHOOK_AUTH_SCHEME))
            .map(|(_, key)| key.trim());
        if presented == Some(expected) {
            Ok(())
        } else {
            Err(ServiceError::Unauthorized(
                "Invalid webhook credentials".to_string(),
            ))
        }
    }

    /// Settle a session and its order. Returns `false` when another path
    /// got there first.
    pub async fn mark_paid<C: ConnectionTrait>(
        conn: &C,
        session: &payment::Model,
        transaction_id: Option<String>,
        paid_at: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let settled = payment::Entity::update_many()
            .col_expr(payment::Column::Status, Expr::value(PaymentRecordStatus::Completed))
            .col_expr(
                payment::Column::ProviderTransactionId,
                Expr::value(transaction_id),
            )
            .col_expr(payment::Column::CompletedAt, Expr::value(Some(paid_at)))
            .col_expr(payment::Column::UpdatedAt, Expr::value(paid_at))
            .filter(payment::Column::Id.eq(session.id))
            .filter(payment::Column::Status.ne(PaymentRecordStatus::Completed))
            .exec(conn)
            .await?;
        if settled.rows_affected == 0 {
            return Ok(false);
        }

        order::Entity::update_many()
            .col_expr(order::Column::PaymentStatus, Expr::value(PaymentStatus::Paid))
            .col_expr(order::Column::UpdatedAt, Expr::value(paid_at))
            .filter(order::Column::Id.eq(session.order_id))
            .exec(conn)
            .await?;
        order::Entity::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Confirmed))
            .filter(order::Column::Id.eq(session.order_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(conn)
            .await?;
        Ok(true)
    }

    async fn announce_paid(&self, order: &order::Model, transaction_id: Option<String>) {
        counter!("fashion_store.payments.outcomes", 1, "outcome" => SessionStatus::Completed.label());
        info!(order_number = %order.order_number, ?transaction_id, "order paid");
        self.event_sender
            .send_or_log(Event::PaymentCompleted {
                order_id: order.id,
                transaction_id,
            })
            .await;
    }

    /// Follow a session until it settles. The returned handle must be kept
    /// alive for as long as events are wanted.
    pub async fn watch(&self, user_id: Uuid, order_id: Uuid) -> Result<PaymentWatch, ServiceError> {
        let now = Utc::now();
        let current = self.status(user_id, order_id, now).await?;
        let (tx, rx) = mpsc::channel(MONITOR_CHANNEL_CAPACITY);

        let terminal = match current.status {
            SessionStatus::Pending => None,
            SessionStatus::Completed => Some(MonitorEvent::Completed),
            SessionStatus::Expired => Some(MonitorEvent::Expired),
            SessionStatus::Cancelled => Some(MonitorEvent::Cancelled),
        };
        if let Some(event) = terminal {
            // capacity is never zero, so this cannot block
            let _ = tx.try_send(event);
            return Ok(PaymentWatch {
                handle: None,
                events: rx,
            });
        }

        let probe = Arc::new(SessionProbe {
            service: self.clone(),
            user_id,
            order_id,
        });
        let settings = MonitorSettings::new(
            Duration::from_secs(current.remaining_secs),
            self.settings.poll_interval,
        );
        let handle = PaymentMonitor::spawn(probe, settings, tx);
        Ok(PaymentWatch {
            handle: Some(handle),
            events: rx,
        })
    }
}

/// Polls through [`PaymentService::status`] so expiry and settlement are
/// persisted by the same code the status endpoint uses.
struct SessionProbe {
    service: PaymentService,
    user_id: Uuid,
    order_id: Uuid,
}

#[async_trait]
impl StatusProbe for SessionProbe {
    async fn probe(&self) -> Result<SessionStatus, ServiceError> {
        self.service
            .status(self.user_id, self.order_id, Utc::now())
            .await
            .map(|view| view.status)
    }
}
