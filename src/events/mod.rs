use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Send after a commit; a closed channel only costs us the log line.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!(error = %e, "event dropped");
        }
    }
}

/// Domain events emitted after a state change has been committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: Uuid,
        order_number: String,
        user_id: Uuid,
        total: Decimal,
    },
    OrderCancelled {
        order_id: Uuid,
        /// Set when the order had used a coupon; the redemption stays spent.
        coupon_id: Option<Uuid>,
    },

    CouponCreated(Uuid),
    CouponUpdated(Uuid),
    CouponDeleted(Uuid),
    CouponRedeemed {
        coupon_id: Uuid,
        order_id: Uuid,
        user_id: Uuid,
        discount_amount: Decimal,
    },

    PaymentStarted {
        order_id: Uuid,
        payment_id: Uuid,
    },
    PaymentCompleted {
        order_id: Uuid,
        transaction_id: Option<String>,
    },
    PaymentExpired {
        order_id: Uuid,
    },
    PaymentCancelled {
        order_id: Uuid,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::OrderCancelled { .. } => "order_cancelled",
            Event::CouponCreated(_) => "coupon_created",
            Event::CouponUpdated(_) => "coupon_updated",
            Event::CouponDeleted(_) => "coupon_deleted",
            Event::CouponRedeemed { .. } => "coupon_redeemed",
            Event::PaymentStarted { .. } => "payment_started",
            Event::PaymentCompleted { .. } => "payment_completed",
            Event::PaymentExpired { .. } => "payment_expired",
            Event::PaymentCancelled { .. } => "payment_cancelled",
        }
    }
}

/// Drains the event channel until every sender is gone.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        counter!("fashion_store.events", 1, "event" => event.name());

        match &event {
            Event::OrderCancelled {
                order_id,
                coupon_id: Some(coupon_id),
            } => {
                // Redemptions are not reversed; surface it for follow-up.
                warn!(
                    %order_id,
                    %coupon_id,
                    "order cancelled after coupon redemption; usage not restored"
                );
            }
            Event::CouponRedeemed {
                coupon_id,
                order_id,
                discount_amount,
                ..
            } => {
                info!(%coupon_id, %order_id, %discount_amount, "coupon redeemed");
            }
            other => info!(event = ?other, "event"),
        }
    }

    info!("Event processing loop stopped");
}
