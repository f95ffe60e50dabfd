//! Notification fanout.
//!
//! Translates settlement/finalization outcomes into pushes on a generic
//! sink: per-user channels and a per-auction channel for watchers. The
//! sink is an injected port; the engine never knows the transport.
//!
//! Delivery is best-effort and fire-and-forget. Events are dispatched
//! only after the originating state change committed, and a failed push
//! never surfaces to the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::types::{AuctionId, BidId, UserId};

/// Delivery target. Per-user channels carry personal events (you were
/// outbid, you won); the auction channel carries everything watchers of
/// that auction should see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    User(UserId),
    Auction(AuctionId),
}

impl Channel {
    /// Topic string for sinks that route by name.
    pub fn topic(&self) -> String {
        match self {
            Channel::User(user_id) => format!("user.{}", user_id),
            Channel::Auction(auction_id) => format!("auction.{}", auction_id),
        }
    }
}

/// Domain events emitted by the settlement engine and finalizer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuctionEvent {
    BidAccepted {
        auction_id: AuctionId,
        bid_id: BidId,
        amount: Decimal,
        end_time: DateTime<Utc>,
    },
    Outbid {
        auction_id: AuctionId,
        bid_id: BidId,
        new_amount: Decimal,
    },
    NewBidReceived {
        auction_id: AuctionId,
        amount: Decimal,
    },
    AuctionStarted {
        auction_id: AuctionId,
        end_time: DateTime<Utc>,
    },
    AuctionExtended {
        auction_id: AuctionId,
        new_end_time: DateTime<Utc>,
    },
    AuctionEnded {
        auction_id: AuctionId,
        winner: Option<UserId>,
        winning_amount: Option<Decimal>,
        reserve_met: bool,
    },
    AuctionWon {
        auction_id: AuctionId,
        bid_id: BidId,
        amount: Decimal,
    },
    AuctionCancelled {
        auction_id: AuctionId,
    },
}

impl AuctionEvent {
    /// Event name as it appears on the wire and in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AuctionEvent::BidAccepted { .. } => "bid_accepted",
            AuctionEvent::Outbid { .. } => "outbid",
            AuctionEvent::NewBidReceived { .. } => "new_bid_received",
            AuctionEvent::AuctionStarted { .. } => "auction_started",
            AuctionEvent::AuctionExtended { .. } => "auction_extended",
            AuctionEvent::AuctionEnded { .. } => "auction_ended",
            AuctionEvent::AuctionWon { .. } => "auction_won",
            AuctionEvent::AuctionCancelled { .. } => "auction_cancelled",
        }
    }
}

/// Generic notification sink: `(channel, event)` in, best effort out.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, channel: Channel, event: AuctionEvent) -> anyhow::Result<()>;
}

/// Fans events out to the sink without ever blocking the caller.
#[derive(Clone)]
pub struct NotificationFanout {
    sink: Arc<dyn NotificationSink>,
}

impl NotificationFanout {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Dispatch one event. Spawned; failures are logged and dropped.
    pub fn publish(&self, channel: Channel, event: AuctionEvent) {
        let sink = Arc::clone(&self.sink);
        let kind = event.kind();
        tokio::spawn(async move {
            if let Err(e) = sink.publish(channel, event).await {
                warn!(event = kind, topic = %channel.topic(), error = %e, "Notification push failed");
            }
        });
    }

    /// Dispatch a batch (one settlement commonly produces two or three
    /// events for different channels).
    pub fn publish_all(&self, batch: Vec<(Channel, AuctionEvent)>) {
        for (channel, event) in batch {
            self.publish(channel, event);
        }
    }
}

/// Default sink: structured log lines. Useful standalone and as the
/// fallback when no push transport is wired in.
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn publish(&self, channel: Channel, event: AuctionEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&event)?;
        debug!(target: "gavel::notify", topic = %channel.topic(), %payload, "event");
        Ok(())
    }
}

/// Sink that remembers everything it was asked to deliver. Used by the
/// engine's own tests and by embedders asserting on event flow.
#[derive(Default)]
pub struct RecordingSink {
    delivered: std::sync::Mutex<Vec<(Channel, AuctionEvent)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<(Channel, AuctionEvent)> {
        self.delivered.lock().unwrap().clone()
    }

    /// Event kinds pushed to the given channel, in delivery order.
    pub fn kinds_for(&self, channel: Channel) -> Vec<&'static str> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == channel)
            .map(|(_, e)| e.kind())
            .collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn publish(&self, channel: Channel, event: AuctionEvent) -> anyhow::Result<()> {
        self.delivered.lock().unwrap().push((channel, event));
        Ok(())
    }
}
