//! Bid settlement engine.
//!
//! Accepts or rejects bids and commits accepted ones with no
//! possibility of two bids being inconsistently recorded as leading.
//! There is no in-memory lock around an auction's leader field;
//! correctness rests entirely on the store's conditional write
//! (`try_set_leader`) plus a bounded re-read-and-retry loop.

use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::Audit;
use crate::error::AuctionError;
use crate::model::{Auction, AuctionStatusView, Bid, BidStatus};
use crate::notify::{AuctionEvent, Channel, NotificationFanout};
use crate::scheduler::AuctionScheduler;
use crate::store::{AuctionStore, BidStore, Leader};
use crate::types::{AuctionId, BidId, UserId};

/// Bounded internal retries for a commit that lost a write race but is
/// still a valid bid against the fresh state.
const DEFAULT_MAX_COMMIT_RETRIES: u32 = 3;

/// A bid as submitted by the caller.
#[derive(Debug, Clone)]
pub struct BidRequest {
    pub auction_id: AuctionId,
    pub bidder_id: UserId,
    pub amount: Decimal,
    pub message: Option<String>,
    pub max_auto_bid: Option<Decimal>,
}

impl BidRequest {
    pub fn new(auction_id: AuctionId, bidder_id: UserId, amount: Decimal) -> Self {
        Self {
            auction_id,
            bidder_id,
            amount,
            message: None,
            max_auto_bid: None,
        }
    }
}

pub struct SettlementEngine {
    auctions: Arc<dyn AuctionStore>,
    bids: Arc<dyn BidStore>,
    fanout: NotificationFanout,
    audit: Audit,
    /// Back-reference for auto-extend retiming; absent in unit tests
    /// and in deployments that rely on the sweep alone.
    scheduler: std::sync::RwLock<Option<Arc<AuctionScheduler>>>,
    max_commit_retries: u32,
}

impl SettlementEngine {
    pub fn new(
        auctions: Arc<dyn AuctionStore>,
        bids: Arc<dyn BidStore>,
        fanout: NotificationFanout,
        audit: Audit,
    ) -> Self {
        Self {
            auctions,
            bids,
            fanout,
            audit,
            scheduler: std::sync::RwLock::new(None),
            max_commit_retries: DEFAULT_MAX_COMMIT_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_commit_retries = retries;
        self
    }

    /// Wire the scheduler in after construction (the scheduler itself
    /// has no reference back here, so the dependency graph stays a DAG).
    pub fn attach_scheduler(&self, scheduler: Arc<AuctionScheduler>) {
        *self.scheduler.write().unwrap() = Some(scheduler);
    }

    /// Place a bid. See the module docs for the commit discipline.
    ///
    /// Preconditions are validated in order, first failure wins:
    /// auction exists; active; window open; not a self-bid; amount
    /// well-formed; amount reaches the minimum acceptable.
    pub async fn place_bid(&self, req: BidRequest) -> Result<Bid, AuctionError> {
        let mut attempt = 0u32;

        let auction = loop {
            let auction = self
                .auctions
                .get_auction(req.auction_id)
                .await?
                .ok_or_else(|| AuctionError::AuctionNotFound(req.auction_id.to_string()))?;

            let now = Utc::now();
            if !auction.status.is_open() || !auction.enabled {
                return Err(AuctionError::State(format!(
                    "auction is {}, not accepting bids",
                    auction.status
                )));
            }
            if now >= auction.end_time {
                return Err(AuctionError::State(
                    "bidding window has closed".to_string(),
                ));
            }
            if req.bidder_id == auction.seller_id {
                return Err(AuctionError::State(
                    "seller cannot bid on own auction".to_string(),
                ));
            }
            if req.amount <= Decimal::ZERO {
                return Err(AuctionError::Validation(
                    "bid amount must be positive".to_string(),
                ));
            }
            let minimum = auction.minimum_acceptable();
            if req.amount < minimum {
                return Err(AuctionError::BidTooLow { minimum });
            }

            // The conditional write: only succeeds if the stored leading
            // amount is still below ours.
            if self
                .auctions
                .try_set_leader(
                    req.auction_id,
                    Leader {
                        amount: req.amount,
                        bidder_id: req.bidder_id,
                    },
                )
                .await?
            {
                break auction;
            }

            // Lost the write race. Re-read and either surface BidTooLow
            // (next iteration's minimum check) or retry against the
            // fresh value, up to the bound.
            attempt += 1;
            if attempt > self.max_commit_retries {
                warn!(
                    auction_id = %req.auction_id,
                    bidder_id = req.bidder_id,
                    amount = %req.amount,
                    "Bid commit retries exhausted"
                );
                return Err(AuctionError::Conflict { retries: attempt - 1 });
            }
            debug!(
                auction_id = %req.auction_id,
                attempt,
                "Leader write raced, re-validating against fresh state"
            );
        };

        // --- Committed. Everything below happens after the leader pair
        // is durably ours; none of it can roll the commit back. ---

        // A bidder raising their own bid supersedes the prior record,
        // keeping at most one active bid per bidder.
        if let Some(prior) = self
            .bids
            .find_active_for_bidder(req.auction_id, req.bidder_id)
            .await?
        {
            self.bids
                .set_bid_status_if(prior.bid_id, BidStatus::Active, BidStatus::Cancelled)
                .await?;
        }

        let bid = Bid {
            bid_id: Uuid::new_v4(),
            auction_id: req.auction_id,
            bidder_id: req.bidder_id,
            amount: req.amount,
            message: req.message.clone(),
            max_auto_bid: req.max_auto_bid,
            status: BidStatus::Active,
            placed_at: Utc::now(),
        };
        self.bids.insert_bid(&bid).await?;

        // Demote whatever was leading before us. Only strictly lower
        // actives: a concurrently-committed HIGHER bid is the new
        // leader, not our victim. The per-bid CAS keeps this safe when
        // two settlements scan at once.
        let mut outbid_leader: Option<Bid> = None;
        for other in self.bids.find_active_by_auction(req.auction_id).await? {
            if other.bid_id == bid.bid_id
                || other.bidder_id == req.bidder_id
                || other.amount >= req.amount
            {
                continue;
            }
            if self
                .bids
                .set_bid_status_if(other.bid_id, BidStatus::Active, BidStatus::Outbid)
                .await?
                && outbid_leader
                    .as_ref()
                    .map(|b| other.amount > b.amount)
                    .unwrap_or(true)
            {
                outbid_leader = Some(other);
            }
        }

        // Fresh read for the post-commit end time (a concurrent bid may
        // already have extended it).
        let fresh = self
            .auctions
            .get_auction(req.auction_id)
            .await?
            .unwrap_or(auction);

        // A higher bid may have overtaken us between our commit and our
        // ledger insert, in which case its demotion scan could not see
        // our record yet. Settle our own status here so at most one
        // active bid ever matches the stored leading amount.
        let mut bid = bid;
        if fresh.current_bid.map_or(false, |c| c > req.amount)
            && self
                .bids
                .set_bid_status_if(bid.bid_id, BidStatus::Active, BidStatus::Outbid)
                .await?
        {
            bid.status = BidStatus::Outbid;
        }

        let end_time = self.maybe_auto_extend(&fresh).await?;

        info!(
            auction_id = %req.auction_id,
            bid_id = %bid.bid_id,
            bidder_id = req.bidder_id,
            amount = %req.amount,
            "Bid accepted"
        );
        self.audit.record(
            Some(req.bidder_id),
            "bid.place",
            format!("auction={} bid={}", req.auction_id, bid.bid_id),
        );

        let mut events = vec![
            (
                Channel::User(req.bidder_id),
                AuctionEvent::BidAccepted {
                    auction_id: req.auction_id,
                    bid_id: bid.bid_id,
                    amount: req.amount,
                    end_time,
                },
            ),
            (
                Channel::Auction(req.auction_id),
                AuctionEvent::NewBidReceived {
                    auction_id: req.auction_id,
                    amount: req.amount,
                },
            ),
            (
                Channel::User(fresh.seller_id),
                AuctionEvent::NewBidReceived {
                    auction_id: req.auction_id,
                    amount: req.amount,
                },
            ),
        ];
        if let Some(prev) = outbid_leader {
            events.push((
                Channel::User(prev.bidder_id),
                AuctionEvent::Outbid {
                    auction_id: req.auction_id,
                    bid_id: prev.bid_id,
                    new_amount: req.amount,
                },
            ));
        }
        self.fanout.publish_all(events);

        Ok(bid)
    }

    /// Apply the auto-extend policy if this commit landed inside the
    /// threshold. Returns the end time in force afterward.
    ///
    /// Runs strictly after the bid committed, so a rejected bid can
    /// never extend the auction.
    async fn maybe_auto_extend(
        &self,
        auction: &Auction,
    ) -> Result<chrono::DateTime<Utc>, AuctionError> {
        let Some(policy) = auction.auto_extend else {
            return Ok(auction.end_time);
        };

        let now = Utc::now();
        if auction.end_time - now >= policy.threshold() {
            return Ok(auction.end_time);
        }

        let new_end = auction.end_time + policy.extension();
        if !self
            .auctions
            .extend_end_time(auction.auction_id, new_end)
            .await?
        {
            // Already closed or concurrently extended; the stored value
            // wins either way.
            return Ok(auction.end_time);
        }

        info!(
            auction_id = %auction.auction_id,
            %new_end,
            "Auto-extended auction end time"
        );
        // Clone out of the lock before awaiting; the guard must not
        // live across a suspension point.
        let scheduler = self.scheduler.read().unwrap().clone();
        if let Some(scheduler) = scheduler {
            scheduler.reschedule(auction.auction_id, new_end).await;
        }
        self.fanout.publish(
            Channel::Auction(auction.auction_id),
            AuctionEvent::AuctionExtended {
                auction_id: auction.auction_id,
                new_end_time: new_end,
            },
        );

        Ok(new_end)
    }

    /// Withdraw a standing bid.
    ///
    /// The previous leading bid is not resurrected: the new leader is
    /// recomputed from whatever active bids remain, explicitly, through
    /// a version-checked write.
    pub async fn cancel_bid(&self, bid_id: BidId, requester_id: UserId) -> Result<Bid, AuctionError> {
        let bid = self
            .bids
            .get_bid(bid_id)
            .await?
            .ok_or_else(|| AuctionError::BidNotFound(bid_id.to_string()))?;

        if bid.bidder_id != requester_id {
            return Err(AuctionError::Unauthorized(
                "only the bidder may cancel their bid".to_string(),
            ));
        }
        if bid.status != BidStatus::Active {
            return Err(AuctionError::State(format!(
                "bid is {}, only active bids can be cancelled",
                bid.status
            )));
        }

        let auction = self
            .auctions
            .get_auction(bid.auction_id)
            .await?
            .ok_or_else(|| AuctionError::AuctionNotFound(bid.auction_id.to_string()))?;
        if auction.status.is_terminal() {
            return Err(AuctionError::State(format!(
                "auction is {}, bids can no longer be cancelled",
                auction.status
            )));
        }

        if !self
            .bids
            .set_bid_status_if(bid_id, BidStatus::Active, BidStatus::Cancelled)
            .await?
        {
            // Raced with settlement or finalization; whoever won owns
            // the bid's status now.
            return Err(AuctionError::State(
                "bid status changed concurrently".to_string(),
            ));
        }

        self.recompute_leader(bid.auction_id).await?;

        info!(bid_id = %bid_id, auction_id = %bid.auction_id, "Bid cancelled");
        self.audit.record(
            Some(requester_id),
            "bid.cancel",
            format!("auction={} bid={}", bid.auction_id, bid_id),
        );

        let mut cancelled = bid;
        cancelled.status = BidStatus::Cancelled;
        Ok(cancelled)
    }

    /// Re-derive the leader pair from the remaining active bids.
    ///
    /// Version-checked so a concurrent `place_bid` cannot be clobbered:
    /// if the row moved between our read and our write, re-read and try
    /// again up to the usual bound, then give up quietly (the row that
    /// beat us necessarily wrote a valid leader).
    async fn recompute_leader(&self, auction_id: AuctionId) -> Result<(), AuctionError> {
        for _ in 0..=self.max_commit_retries {
            let Some(auction) = self.auctions.get_auction(auction_id).await? else {
                return Ok(());
            };
            if !auction.status.is_open() {
                return Ok(());
            }

            let actives = self.bids.find_active_by_auction(auction_id).await?;
            let leader = actives.first().map(|top| Leader {
                amount: top.amount,
                bidder_id: top.bidder_id,
            });

            if self
                .auctions
                .replace_leader(auction_id, auction.version, leader)
                .await?
            {
                return Ok(());
            }
        }

        debug!(auction_id = %auction_id, "Leader recompute raced out; concurrent writer owns the row");
        Ok(())
    }

    /// Full bid history, highest amount first.
    pub async fn bid_history(&self, auction_id: AuctionId) -> Result<Vec<Bid>, AuctionError> {
        if self.auctions.get_auction(auction_id).await?.is_none() {
            return Err(AuctionError::AuctionNotFound(auction_id.to_string()));
        }
        self.bids.find_by_auction(auction_id).await
    }

    /// Current state read-model for status polls.
    pub async fn auction_status(
        &self,
        auction_id: AuctionId,
    ) -> Result<AuctionStatusView, AuctionError> {
        let auction = self
            .auctions
            .get_auction(auction_id)
            .await?
            .ok_or_else(|| AuctionError::AuctionNotFound(auction_id.to_string()))?;
        Ok(AuctionStatusView::from(&auction))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TracingActivityLog;
    use crate::model::{AuctionConfig, AuctionStatus};
    use crate::notify::RecordingSink;
    use crate::store::MemoryStore;
    use chrono::Duration;

    struct Harness {
        engine: SettlementEngine,
        store: Arc<MemoryStore>,
        sink: Arc<RecordingSink>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(RecordingSink::new());
        let engine = SettlementEngine::new(
            store.clone(),
            store.clone(),
            NotificationFanout::new(sink.clone()),
            Audit::new(Arc::new(TracingActivityLog)),
        );
        Harness {
            engine,
            store,
            sink,
        }
    }

    async fn seed_active_auction(store: &MemoryStore) -> Auction {
        let now = Utc::now();
        let config = AuctionConfig {
            product_id: Uuid::new_v4(),
            seller_id: 1,
            start_time: now,
            end_time: now + Duration::hours(1),
            start_price: Decimal::new(100, 0),
            min_increment: Decimal::new(10, 0),
            reserve_price: None,
            auto_extend: None,
        };
        let mut auction = Auction::from_config(Uuid::new_v4(), &config, now);
        auction.status = AuctionStatus::Active;
        store.insert_auction(&auction).await.unwrap();
        auction
    }

    #[tokio::test]
    async fn test_sequential_bidding_scenario() {
        let h = harness();
        let auction = seed_active_auction(&h.store).await;
        let id = auction.auction_id;

        // Bid A = 110 accepted
        let bid_a = h
            .engine
            .place_bid(BidRequest::new(id, 2, Decimal::new(110, 0)))
            .await
            .unwrap();
        let view = h.engine.auction_status(id).await.unwrap();
        assert_eq!(view.current_bid, Some(Decimal::new(110, 0)));

        // Bid B = 105 rejected BidTooLow with minimum 120
        let err = h
            .engine
            .place_bid(BidRequest::new(id, 3, Decimal::new(105, 0)))
            .await
            .unwrap_err();
        match err {
            AuctionError::BidTooLow { minimum } => {
                assert_eq!(minimum, Decimal::new(120, 0));
            }
            other => panic!("expected BidTooLow, got {:?}", other),
        }

        // Bid C = 120 accepted; A becomes outbid
        h.engine
            .place_bid(BidRequest::new(id, 3, Decimal::new(120, 0)))
            .await
            .unwrap();
        let view = h.engine.auction_status(id).await.unwrap();
        assert_eq!(view.current_bid, Some(Decimal::new(120, 0)));
        assert_eq!(view.winner, Some(3));

        let stored_a = h.store.get_bid(bid_a.bid_id).await.unwrap().unwrap();
        assert_eq!(stored_a.status, BidStatus::Outbid);
    }

    #[tokio::test]
    async fn test_self_bid_rejected_regardless_of_amount() {
        let h = harness();
        let auction = seed_active_auction(&h.store).await;

        let err = h
            .engine
            .place_bid(BidRequest::new(
                auction.auction_id,
                auction.seller_id,
                Decimal::new(1_000_000, 0),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STATE_ERROR");
    }

    #[tokio::test]
    async fn test_bid_on_scheduled_auction_rejected() {
        let h = harness();
        let now = Utc::now();
        let config = AuctionConfig {
            product_id: Uuid::new_v4(),
            seller_id: 1,
            start_time: now + Duration::hours(1),
            end_time: now + Duration::hours(2),
            start_price: Decimal::new(100, 0),
            min_increment: Decimal::new(10, 0),
            reserve_price: None,
            auto_extend: None,
        };
        let auction = Auction::from_config(Uuid::new_v4(), &config, now);
        h.store.insert_auction(&auction).await.unwrap();

        let err = h
            .engine
            .place_bid(BidRequest::new(
                auction.auction_id,
                2,
                Decimal::new(150, 0),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STATE_ERROR");
    }

    #[tokio::test]
    async fn test_unknown_auction_is_not_found() {
        let h = harness();
        let err = h
            .engine
            .place_bid(BidRequest::new(Uuid::new_v4(), 2, Decimal::new(150, 0)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AUCTION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_own_raise_supersedes_prior_bid() {
        let h = harness();
        let auction = seed_active_auction(&h.store).await;
        let id = auction.auction_id;

        let first = h
            .engine
            .place_bid(BidRequest::new(id, 2, Decimal::new(110, 0)))
            .await
            .unwrap();
        let second = h
            .engine
            .place_bid(BidRequest::new(id, 2, Decimal::new(130, 0)))
            .await
            .unwrap();

        // Prior record superseded, not outbid; exactly one active bid
        // per bidder remains.
        let stored_first = h.store.get_bid(first.bid_id).await.unwrap().unwrap();
        assert_eq!(stored_first.status, BidStatus::Cancelled);
        let actives = h.store.find_active_by_auction(id).await.unwrap();
        assert_eq!(actives.len(), 1);
        assert_eq!(actives[0].bid_id, second.bid_id);
    }

    #[tokio::test]
    async fn test_cancel_leading_bid_recomputes_leader() {
        let h = harness();
        let auction = seed_active_auction(&h.store).await;
        let id = auction.auction_id;

        h.engine
            .place_bid(BidRequest::new(id, 2, Decimal::new(110, 0)))
            .await
            .unwrap();
        let leading = h
            .engine
            .place_bid(BidRequest::new(id, 3, Decimal::new(120, 0)))
            .await
            .unwrap();

        let cancelled = h.engine.cancel_bid(leading.bid_id, 3).await.unwrap();
        assert_eq!(cancelled.status, BidStatus::Cancelled);

        // Bidder 2's record was outbid (not active), so no active bids
        // remain and the auction reverts to no leader.
        let view = h.engine.auction_status(id).await.unwrap();
        assert_eq!(view.current_bid, None);
        assert_eq!(view.winner, None);
    }

    #[tokio::test]
    async fn test_cancel_requires_ownership() {
        let h = harness();
        let auction = seed_active_auction(&h.store).await;

        let bid = h
            .engine
            .place_bid(BidRequest::new(
                auction.auction_id,
                2,
                Decimal::new(110, 0),
            ))
            .await
            .unwrap();

        let err = h.engine.cancel_bid(bid.bid_id, 99).await.unwrap_err();
        assert_eq!(err.code(), "AUTHORIZATION_ERROR");
    }

    #[tokio::test]
    async fn test_outbid_notification_targets_previous_leader() {
        let h = harness();
        let auction = seed_active_auction(&h.store).await;
        let id = auction.auction_id;

        h.engine
            .place_bid(BidRequest::new(id, 2, Decimal::new(110, 0)))
            .await
            .unwrap();
        h.engine
            .place_bid(BidRequest::new(id, 3, Decimal::new(120, 0)))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert!(h.sink.kinds_for(Channel::User(2)).contains(&"outbid"));
        assert!(h
            .sink
            .kinds_for(Channel::User(3))
            .contains(&"bid_accepted"));
        assert_eq!(
            h.sink
                .kinds_for(Channel::Auction(id))
                .iter()
                .filter(|k| **k == "new_bid_received")
                .count(),
            2
        );
    }
}
