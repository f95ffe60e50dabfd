//! Auction and bid data model.
//!
//! Status IDs are designed for PostgreSQL storage as SMALLINT.
//! Auction terminal states: ENDED (30), CANCELLED (-10).

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AuctionError;
use crate::types::{AuctionId, BidId, ProductId, UserId};

/// Auction lifecycle states
///
/// Exactly one holds at any time. Transitions:
/// `Draft -> Scheduled -> Active -> Ended`, with `Cancelled` reachable
/// only before `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum AuctionStatus {
    /// Created by the catalog collaborator, not yet visible to bidders
    Draft = 0,

    /// Start/end timers registered, bidding not yet open
    Scheduled = 10,

    /// Bidding window open - the only state that accepts bids
    Active = 20,

    /// Terminal: closed by the finalizer, winner resolved
    Ended = 30,

    /// Terminal: withdrawn by the seller before going active
    Cancelled = -10,
}

impl AuctionStatus {
    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuctionStatus::Ended | AuctionStatus::Cancelled)
    }

    /// Check if the auction is accepting bids
    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self, AuctionStatus::Active)
    }

    /// Get the numeric state ID for PostgreSQL storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from PostgreSQL state ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(AuctionStatus::Draft),
            10 => Some(AuctionStatus::Scheduled),
            20 => Some(AuctionStatus::Active),
            30 => Some(AuctionStatus::Ended),
            -10 => Some(AuctionStatus::Cancelled),
            _ => None,
        }
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            AuctionStatus::Draft => "DRAFT",
            AuctionStatus::Scheduled => "SCHEDULED",
            AuctionStatus::Active => "ACTIVE",
            AuctionStatus::Ended => "ENDED",
            AuctionStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for AuctionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Bid lifecycle states
///
/// Bid records are an append-only audit trail; only the status mutates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i16)]
pub enum BidStatus {
    /// Standing offer - at most one per bidder per auction
    Active = 0,

    /// Demoted because a higher bid was accepted afterward
    Outbid = 10,

    /// Terminal: resolved winner at close - at most one per auction
    Won = 20,

    /// Terminal: resolved loser at close
    Lost = 30,

    /// Withdrawn by the bidder, or superseded by the bidder's own higher bid
    Cancelled = -10,
}

impl BidStatus {
    /// Check if the bid was resolved by auction close
    #[inline]
    pub fn is_settled(&self) -> bool {
        matches!(self, BidStatus::Won | BidStatus::Lost)
    }

    /// Get the numeric state ID for PostgreSQL storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from PostgreSQL state ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(BidStatus::Active),
            10 => Some(BidStatus::Outbid),
            20 => Some(BidStatus::Won),
            30 => Some(BidStatus::Lost),
            -10 => Some(BidStatus::Cancelled),
            _ => None,
        }
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            BidStatus::Active => "ACTIVE",
            BidStatus::Outbid => "OUTBID",
            BidStatus::Won => "WON",
            BidStatus::Lost => "LOST",
            BidStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for BidStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Auto-extend policy: a bid landing within `threshold_secs` of the end
/// pushes `end_time` out by `extension_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoExtendPolicy {
    pub threshold_secs: i64,
    pub extension_secs: i64,
}

impl AutoExtendPolicy {
    pub fn threshold(&self) -> Duration {
        Duration::seconds(self.threshold_secs)
    }

    pub fn extension(&self) -> Duration {
        Duration::seconds(self.extension_secs)
    }
}

/// Configuration supplied by the catalog collaborator when an auction
/// is scheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionConfig {
    pub product_id: ProductId,
    pub seller_id: UserId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub start_price: Decimal,
    pub min_increment: Decimal,
    pub reserve_price: Option<Decimal>,
    pub auto_extend: Option<AutoExtendPolicy>,
}

impl AuctionConfig {
    /// Validate config invariants before any record is created.
    pub fn validate(&self) -> Result<(), AuctionError> {
        if self.end_time <= self.start_time {
            return Err(AuctionError::Validation(
                "end_time must be after start_time".to_string(),
            ));
        }
        if self.start_price <= Decimal::ZERO {
            return Err(AuctionError::Validation(
                "start_price must be positive".to_string(),
            ));
        }
        if self.min_increment <= Decimal::ZERO {
            return Err(AuctionError::Validation(
                "min_increment must be positive".to_string(),
            ));
        }
        if let Some(reserve) = self.reserve_price {
            if reserve < self.start_price {
                return Err(AuctionError::Validation(
                    "reserve_price must not be below start_price".to_string(),
                ));
            }
        }
        if let Some(policy) = &self.auto_extend {
            if policy.threshold_secs <= 0 || policy.extension_secs <= 0 {
                return Err(AuctionError::Validation(
                    "auto_extend threshold and extension must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Persisted auction record: config plus live bidding state.
///
/// The leader pair (`current_bid`, `current_winner`) is the sole
/// contended field; it is only ever written through the store's
/// conditional-update primitives. `version` is bumped by every write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auction {
    pub auction_id: AuctionId,
    pub product_id: ProductId,
    pub seller_id: UserId,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub start_price: Decimal,
    pub min_increment: Decimal,
    pub reserve_price: Option<Decimal>,
    pub auto_extend: Option<AutoExtendPolicy>,
    pub enabled: bool,
    pub current_bid: Option<Decimal>,
    pub current_winner: Option<UserId>,
    pub winner_bid_id: Option<BidId>,
    pub status: AuctionStatus,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Auction {
    /// Build a fresh record from validated config.
    ///
    /// Status is `Scheduled`; the scheduler flips it to `Active` when
    /// the start time arrives (or immediately, if already past).
    pub fn from_config(auction_id: AuctionId, config: &AuctionConfig, now: DateTime<Utc>) -> Self {
        Self {
            auction_id,
            product_id: config.product_id,
            seller_id: config.seller_id,
            start_time: config.start_time,
            end_time: config.end_time,
            start_price: config.start_price,
            min_increment: config.min_increment,
            reserve_price: config.reserve_price,
            auto_extend: config.auto_extend,
            enabled: true,
            current_bid: None,
            current_winner: None,
            winner_bid_id: None,
            status: AuctionStatus::Scheduled,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Lowest amount the next bid must reach:
    /// `current_bid + min_increment` once a leader exists, else the
    /// start price.
    pub fn minimum_acceptable(&self) -> Decimal {
        match self.current_bid {
            Some(leading) => leading + self.min_increment,
            None => self.start_price,
        }
    }

    /// Check whether a bid can be accepted at `now`.
    pub fn is_biddable(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open() && self.enabled && now < self.end_time
    }

    /// Whether the current leading amount satisfies the reserve.
    /// True when no reserve is set.
    pub fn reserve_met(&self) -> bool {
        match (self.reserve_price, self.current_bid) {
            (Some(reserve), Some(leading)) => leading >= reserve,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

/// Persisted bid record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bid {
    pub bid_id: BidId,
    pub auction_id: AuctionId,
    pub bidder_id: UserId,
    pub amount: Decimal,
    pub message: Option<String>,
    /// Ceiling for an auto-bidding agent. Stored for the audit trail;
    /// the engine itself never bids on the bidder's behalf.
    pub max_auto_bid: Option<Decimal>,
    pub status: BidStatus,
    pub placed_at: DateTime<Utc>,
}

/// Read-model returned by `auction_status`.
#[derive(Debug, Clone, Serialize)]
pub struct AuctionStatusView {
    pub auction_id: AuctionId,
    pub status: AuctionStatus,
    pub current_bid: Option<Decimal>,
    pub end_time: DateTime<Utc>,
    pub winner: Option<UserId>,
    /// Callers that time out should re-read and compare versions before
    /// retrying a bid with the same amount.
    pub version: i64,
}

impl From<&Auction> for AuctionStatusView {
    fn from(a: &Auction) -> Self {
        Self {
            auction_id: a.auction_id,
            status: a.status,
            current_bid: a.current_bid,
            end_time: a.end_time,
            winner: a.current_winner,
            version: a.version,
        }
    }
}
