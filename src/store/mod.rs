//! Persistence seams for the auction store and the bid ledger.
//!
//! Both traits are intentionally narrow: the leader pair on an auction
//! row can only be written through `try_set_leader` (amount-conditional)
//! or `replace_leader` (version-conditional), so every caller inherits
//! the compare-and-set discipline instead of re-implementing it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::error::AuctionError;
use crate::model::{Auction, AuctionStatus, Bid, BidStatus};
use crate::types::{AuctionId, BidId, UserId};

pub mod memory;
pub mod postgres;
pub mod schema;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Leader pair written to an auction row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Leader {
    pub amount: Decimal,
    pub bidder_id: UserId,
}

/// Winner recorded when an auction is closed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosedWinner {
    pub bidder_id: UserId,
    pub bid_id: BidId,
    pub amount: Decimal,
}

/// Auction record persistence.
#[async_trait]
pub trait AuctionStore: Send + Sync {
    async fn insert_auction(&self, auction: &Auction) -> Result<(), AuctionError>;

    async fn get_auction(&self, auction_id: AuctionId) -> Result<Option<Auction>, AuctionError>;

    /// THE conditional write behind bid settlement.
    ///
    /// Succeeds only while the auction is `Active` and the stored
    /// leading amount is still strictly below `leader.amount` (or no
    /// leader exists). Bumps `version`. Returns false when a concurrent
    /// writer got there first.
    async fn try_set_leader(
        &self,
        auction_id: AuctionId,
        leader: Leader,
    ) -> Result<bool, AuctionError>;

    /// Version-checked leader write, used when the leader must be
    /// recomputed (bid cancellation) and may go backward or away.
    ///
    /// Succeeds only if the row's `version` still equals
    /// `expected_version`; `None` clears the leader pair.
    async fn replace_leader(
        &self,
        auction_id: AuctionId,
        expected_version: i64,
        leader: Option<Leader>,
    ) -> Result<bool, AuctionError>;

    /// Atomic CAS on the lifecycle status.
    ///
    /// Returns false when the stored status no longer matches
    /// `expected` (another worker already made the transition).
    async fn update_status_if(
        &self,
        auction_id: AuctionId,
        expected: AuctionStatus,
        new: AuctionStatus,
    ) -> Result<bool, AuctionError>;

    /// Push the end time out; conditional on the auction still being
    /// open (`Scheduled` or `Active`). Used by auto-extend and manual
    /// reschedule.
    async fn extend_end_time(
        &self,
        auction_id: AuctionId,
        new_end: DateTime<Utc>,
    ) -> Result<bool, AuctionError>;

    /// Close the auction exactly once.
    ///
    /// Conditional on `status IN (Scheduled, Active)` AND
    /// `version = expected_version`; sets `status = Ended`,
    /// `enabled = false`, and the winner fields (cleared when `winner`
    /// is `None`). The version check means a bid that committed after
    /// the finalizer picked its winner forces a re-read instead of
    /// being silently dropped. The boolean result is the finalizer's
    /// exactly-once gate.
    async fn finalize_auction(
        &self,
        auction_id: AuctionId,
        expected_version: i64,
        winner: Option<ClosedWinner>,
    ) -> Result<bool, AuctionError>;

    /// Auctions whose end time has passed but which are not yet closed.
    /// The periodic sweep's query.
    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Auction>, AuctionError>;

    /// Scheduled auctions whose start time has passed. Lets the sweep
    /// heal missed start timers the same way it heals missed ends.
    async fn find_startable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Auction>, AuctionError>;

    /// Every auction that still needs timers (Scheduled or Active).
    /// Startup reconciliation reads this.
    async fn find_open(&self) -> Result<Vec<Auction>, AuctionError>;
}

/// Bid ledger persistence. Records are append-only; only `status`
/// mutates, and only through the CAS below.
#[async_trait]
pub trait BidStore: Send + Sync {
    async fn insert_bid(&self, bid: &Bid) -> Result<(), AuctionError>;

    async fn get_bid(&self, bid_id: BidId) -> Result<Option<Bid>, AuctionError>;

    /// Full history for an auction, ordered amount DESC then
    /// placed_at ASC. The same ordering resolves finalizer ties.
    async fn find_by_auction(&self, auction_id: AuctionId) -> Result<Vec<Bid>, AuctionError>;

    /// Active bids only, same ordering.
    async fn find_active_by_auction(
        &self,
        auction_id: AuctionId,
    ) -> Result<Vec<Bid>, AuctionError>;

    /// The bidder's standing offer on this auction, if any.
    async fn find_active_for_bidder(
        &self,
        auction_id: AuctionId,
        bidder_id: UserId,
    ) -> Result<Option<Bid>, AuctionError>;

    /// Atomic CAS on a bid's status; false when the stored status no
    /// longer matches `expected`.
    async fn set_bid_status_if(
        &self,
        bid_id: BidId,
        expected: BidStatus,
        new: BidStatus,
    ) -> Result<bool, AuctionError>;

    /// Bulk close-out: every `Active` or `Outbid` record on the
    /// auction except the winner goes to `Lost`. Returns the number of
    /// bids demoted.
    async fn settle_losers(
        &self,
        auction_id: AuctionId,
        winner: Option<BidId>,
    ) -> Result<u64, AuctionError>;
}
