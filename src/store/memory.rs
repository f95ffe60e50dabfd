//! In-memory store.
//!
//! Backs tests and DB-less standalone mode. DashMap gives per-entry
//! exclusive access, so the conditional writes here have the same
//! atomicity as the Postgres store's conditional UPDATEs: the check and
//! the mutation happen under one entry lock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::{AuctionStore, BidStore, ClosedWinner, Leader};
use crate::error::AuctionError;
use crate::model::{Auction, AuctionStatus, Bid, BidStatus};
use crate::types::{AuctionId, BidId, UserId};

#[derive(Default)]
pub struct MemoryStore {
    auctions: DashMap<AuctionId, Auction>,
    bids: DashMap<BidId, Bid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sort_history(bids: &mut [Bid]) {
        // Amount DESC, then placed_at ASC - the tie-break order the
        // finalizer relies on.
        bids.sort_by(|a, b| {
            b.amount
                .cmp(&a.amount)
                .then_with(|| a.placed_at.cmp(&b.placed_at))
        });
    }
}

#[async_trait]
impl AuctionStore for MemoryStore {
    async fn insert_auction(&self, auction: &Auction) -> Result<(), AuctionError> {
        self.auctions.insert(auction.auction_id, auction.clone());
        Ok(())
    }

    async fn get_auction(&self, auction_id: AuctionId) -> Result<Option<Auction>, AuctionError> {
        Ok(self.auctions.get(&auction_id).map(|a| a.clone()))
    }

    async fn try_set_leader(
        &self,
        auction_id: AuctionId,
        leader: Leader,
    ) -> Result<bool, AuctionError> {
        let Some(mut entry) = self.auctions.get_mut(&auction_id) else {
            return Ok(false);
        };

        if !entry.status.is_open() {
            return Ok(false);
        }
        if let Some(current) = entry.current_bid {
            if current >= leader.amount {
                return Ok(false);
            }
        }

        entry.current_bid = Some(leader.amount);
        entry.current_winner = Some(leader.bidder_id);
        entry.version += 1;
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn replace_leader(
        &self,
        auction_id: AuctionId,
        expected_version: i64,
        leader: Option<Leader>,
    ) -> Result<bool, AuctionError> {
        let Some(mut entry) = self.auctions.get_mut(&auction_id) else {
            return Ok(false);
        };

        if entry.version != expected_version || !entry.status.is_open() {
            return Ok(false);
        }

        match leader {
            Some(l) => {
                entry.current_bid = Some(l.amount);
                entry.current_winner = Some(l.bidder_id);
            }
            None => {
                entry.current_bid = None;
                entry.current_winner = None;
            }
        }
        entry.version += 1;
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn update_status_if(
        &self,
        auction_id: AuctionId,
        expected: AuctionStatus,
        new: AuctionStatus,
    ) -> Result<bool, AuctionError> {
        let Some(mut entry) = self.auctions.get_mut(&auction_id) else {
            return Ok(false);
        };

        if entry.status != expected {
            return Ok(false);
        }
        entry.status = new;
        entry.version += 1;
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn extend_end_time(
        &self,
        auction_id: AuctionId,
        new_end: DateTime<Utc>,
    ) -> Result<bool, AuctionError> {
        let Some(mut entry) = self.auctions.get_mut(&auction_id) else {
            return Ok(false);
        };

        if !matches!(
            entry.status,
            AuctionStatus::Scheduled | AuctionStatus::Active
        ) {
            return Ok(false);
        }
        entry.end_time = new_end;
        entry.version += 1;
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn finalize_auction(
        &self,
        auction_id: AuctionId,
        expected_version: i64,
        winner: Option<ClosedWinner>,
    ) -> Result<bool, AuctionError> {
        let Some(mut entry) = self.auctions.get_mut(&auction_id) else {
            return Ok(false);
        };

        if entry.version != expected_version
            || !matches!(
                entry.status,
                AuctionStatus::Scheduled | AuctionStatus::Active
            )
        {
            return Ok(false);
        }

        entry.status = AuctionStatus::Ended;
        entry.enabled = false;
        match winner {
            Some(w) => {
                entry.current_bid = Some(w.amount);
                entry.current_winner = Some(w.bidder_id);
                entry.winner_bid_id = Some(w.bid_id);
            }
            None => {
                entry.current_winner = None;
                entry.winner_bid_id = None;
            }
        }
        entry.version += 1;
        entry.updated_at = Utc::now();
        Ok(true)
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Auction>, AuctionError> {
        let mut due: Vec<Auction> = self
            .auctions
            .iter()
            .filter(|a| {
                a.end_time <= now
                    && matches!(a.status, AuctionStatus::Scheduled | AuctionStatus::Active)
            })
            .map(|a| a.clone())
            .collect();
        due.sort_by_key(|a| a.end_time);
        due.truncate(limit);
        Ok(due)
    }

    async fn find_startable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Auction>, AuctionError> {
        let mut startable: Vec<Auction> = self
            .auctions
            .iter()
            .filter(|a| a.start_time <= now && a.status == AuctionStatus::Scheduled)
            .map(|a| a.clone())
            .collect();
        startable.sort_by_key(|a| a.start_time);
        startable.truncate(limit);
        Ok(startable)
    }

    async fn find_open(&self) -> Result<Vec<Auction>, AuctionError> {
        Ok(self
            .auctions
            .iter()
            .filter(|a| matches!(a.status, AuctionStatus::Scheduled | AuctionStatus::Active))
            .map(|a| a.clone())
            .collect())
    }
}

#[async_trait]
impl BidStore for MemoryStore {
    async fn insert_bid(&self, bid: &Bid) -> Result<(), AuctionError> {
        self.bids.insert(bid.bid_id, bid.clone());
        Ok(())
    }

    async fn get_bid(&self, bid_id: BidId) -> Result<Option<Bid>, AuctionError> {
        Ok(self.bids.get(&bid_id).map(|b| b.clone()))
    }

    async fn find_by_auction(&self, auction_id: AuctionId) -> Result<Vec<Bid>, AuctionError> {
        let mut bids: Vec<Bid> = self
            .bids
            .iter()
            .filter(|b| b.auction_id == auction_id)
            .map(|b| b.clone())
            .collect();
        Self::sort_history(&mut bids);
        Ok(bids)
    }

    async fn find_active_by_auction(
        &self,
        auction_id: AuctionId,
    ) -> Result<Vec<Bid>, AuctionError> {
        let mut bids: Vec<Bid> = self
            .bids
            .iter()
            .filter(|b| b.auction_id == auction_id && b.status == BidStatus::Active)
            .map(|b| b.clone())
            .collect();
        Self::sort_history(&mut bids);
        Ok(bids)
    }

    async fn find_active_for_bidder(
        &self,
        auction_id: AuctionId,
        bidder_id: UserId,
    ) -> Result<Option<Bid>, AuctionError> {
        Ok(self
            .bids
            .iter()
            .find(|b| {
                b.auction_id == auction_id
                    && b.bidder_id == bidder_id
                    && b.status == BidStatus::Active
            })
            .map(|b| b.clone()))
    }

    async fn set_bid_status_if(
        &self,
        bid_id: BidId,
        expected: BidStatus,
        new: BidStatus,
    ) -> Result<bool, AuctionError> {
        let Some(mut entry) = self.bids.get_mut(&bid_id) else {
            return Ok(false);
        };

        if entry.status != expected {
            return Ok(false);
        }
        entry.status = new;
        Ok(true)
    }

    async fn settle_losers(
        &self,
        auction_id: AuctionId,
        winner: Option<BidId>,
    ) -> Result<u64, AuctionError> {
        let mut demoted = 0u64;
        for mut entry in self.bids.iter_mut() {
            if entry.auction_id == auction_id
                && matches!(entry.status, BidStatus::Active | BidStatus::Outbid)
                && Some(entry.bid_id) != winner
            {
                entry.status = BidStatus::Lost;
                demoted += 1;
            }
        }
        Ok(demoted)
    }
}
