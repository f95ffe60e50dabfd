//! Auction finalizer.
//!
//! Closes an auction exactly once with a deterministic winner. Every
//! trigger converges here: the end timer, the periodic sweep, and the
//! manual "end now" action all call `end_auction`, and the store's
//! version-gated conditional close makes redundant calls harmless.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::audit::Audit;
use crate::error::AuctionError;
use crate::model::{Auction, AuctionStatus, Bid, BidStatus};
use crate::notify::{AuctionEvent, Channel, NotificationFanout};
use crate::store::{AuctionStore, BidStore, ClosedWinner};
use crate::types::AuctionId;

/// The close loop re-reads when a late bid bumped the row version.
/// Once the window is past no new bids validate, so this converges.
const MAX_CLOSE_ATTEMPTS: u32 = 5;

pub struct Finalizer {
    auctions: Arc<dyn AuctionStore>,
    bids: Arc<dyn BidStore>,
    fanout: NotificationFanout,
    audit: Audit,
}

impl Finalizer {
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
        }
    }

    /// End an auction. Idempotent: a second call returns the stored
    /// result unchanged and performs no mutation.
    pub async fn end_auction(&self, auction_id: AuctionId) -> Result<Auction, AuctionError> {
        for attempt in 0..MAX_CLOSE_ATTEMPTS {
            let auction = self
                .auctions
                .get_auction(auction_id)
                .await?
                .ok_or_else(|| AuctionError::AuctionNotFound(auction_id.to_string()))?;

            match auction.status {
                // Duplicate fire (timer + sweep, or another process):
                // return the stored result, touch nothing.
                AuctionStatus::Ended => {
                    debug!(auction_id = %auction_id, "Auction already ended, idempotent no-op");
                    return Ok(auction);
                }
                AuctionStatus::Cancelled => {
                    return Err(AuctionError::State(
                        "auction was cancelled, nothing to finalize".to_string(),
                    ));
                }
                AuctionStatus::Draft => {
                    return Err(AuctionError::State(
                        "auction was never scheduled".to_string(),
                    ));
                }
                AuctionStatus::Scheduled | AuctionStatus::Active => {}
            }

            // Deterministic winner: highest active amount, ties broken
            // by earliest placement (the store's history ordering).
            let actives = self.bids.find_active_by_auction(auction_id).await?;
            let winning_bid = actives.first().cloned();

            let reserve_met = match (&auction.reserve_price, &winning_bid) {
                (Some(reserve), Some(bid)) => bid.amount >= *reserve,
                (Some(_), None) => false,
                (None, _) => true,
            };
            let winner = winning_bid.as_ref().filter(|_| reserve_met).map(|bid| {
                ClosedWinner {
                    bidder_id: bid.bidder_id,
                    bid_id: bid.bid_id,
                    amount: bid.amount,
                }
            });

            if !self
                .auctions
                .finalize_auction(auction_id, auction.version, winner)
                .await?
            {
                // Either someone else closed it (next read returns the
                // stored result) or a late bid moved the version and we
                // must pick the winner again.
                debug!(auction_id = %auction_id, attempt, "Close gate missed, re-reading");
                continue;
            }

            self.settle_bids(auction_id, &winning_bid, reserve_met)
                .await?;

            let closed = self
                .auctions
                .get_auction(auction_id)
                .await?
                .ok_or_else(|| AuctionError::AuctionNotFound(auction_id.to_string()))?;

            info!(
                auction_id = %auction_id,
                winner = ?closed.current_winner,
                winning_amount = ?closed.current_bid.filter(|_| closed.current_winner.is_some()),
                reserve_met,
                "Auction ended"
            );
            self.audit
                .record(None, "auction.end", format!("auction={}", auction_id));
            self.emit_events(&closed, &winning_bid, reserve_met);

            return Ok(closed);
        }

        warn!(auction_id = %auction_id, "Close kept racing with late writes");
        Err(AuctionError::Conflict {
            retries: MAX_CLOSE_ATTEMPTS,
        })
    }

    /// Resolve bid statuses after the close gate: exactly one `Won`
    /// (when the reserve was met); every other standing or outbid
    /// record goes `Lost`. Cancelled records keep their status.
    async fn settle_bids(
        &self,
        auction_id: AuctionId,
        winning_bid: &Option<Bid>,
        reserve_met: bool,
    ) -> Result<(), AuctionError> {
        let winner_id = match winning_bid {
            Some(bid) if reserve_met => {
                self.bids
                    .set_bid_status_if(bid.bid_id, BidStatus::Active, BidStatus::Won)
                    .await?;
                Some(bid.bid_id)
            }
            // Reserve not met: the leading bid loses with the rest.
            _ => None,
        };

        let demoted = self.bids.settle_losers(auction_id, winner_id).await?;
        if demoted > 0 {
            debug!(auction_id = %auction_id, demoted, "Losing bids settled");
        }
        Ok(())
    }

    fn emit_events(&self, closed: &Auction, winning_bid: &Option<Bid>, reserve_met: bool) {
        let auction_id = closed.auction_id;
        let ended = AuctionEvent::AuctionEnded {
            auction_id,
            winner: closed.current_winner,
            winning_amount: closed.current_bid.filter(|_| closed.current_winner.is_some()),
            reserve_met,
        };

        let mut events = vec![
            (Channel::Auction(auction_id), ended.clone()),
            (Channel::User(closed.seller_id), ended),
        ];
        if let (Some(winner), Some(bid)) = (closed.current_winner, winning_bid) {
            events.push((
                Channel::User(winner),
                AuctionEvent::AuctionWon {
                    auction_id,
                    bid_id: bid.bid_id,
                    amount: bid.amount,
                },
            ));
        }
        self.fanout.publish_all(events);
    }
}
