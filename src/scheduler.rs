//! Auction scheduler.
//!
//! Two cooperating mechanisms guarantee every auction starts and ends
//! exactly once:
//!
//! - a fast in-process timer map (one spawned task per transition), and
//! - an authoritative periodic sweep over the store.
//!
//! Timers do not survive a restart and are not exclusive across
//! processes, so a firing is only ever a trigger, never an authority:
//! the status CAS (start) and the finalizer's close gate (end)
//! re-validate before acting, which makes duplicate fires harmless and
//! lost timers recoverable by the next sweep or by startup
//! reconciliation.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::Audit;
use crate::error::AuctionError;
use crate::finalizer::Finalizer;
use crate::model::{Auction, AuctionConfig, AuctionStatus};
use crate::notify::{AuctionEvent, Channel, NotificationFanout};
use crate::store::AuctionStore;
use crate::types::{AuctionId, UserId};

/// Configuration for the scheduler and its sweep worker.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the safety-net sweep scans for missed transitions
    pub sweep_interval: Duration,
    /// Maximum auctions to transition per sweep cycle
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

/// In-process timer handles for one auction.
#[derive(Default)]
struct AuctionTimers {
    start: Option<JoinHandle<()>>,
    end: Option<JoinHandle<()>>,
}

impl AuctionTimers {
    fn abort_all(&self) {
        if let Some(handle) = &self.start {
            handle.abort();
        }
        if let Some(handle) = &self.end {
            handle.abort();
        }
    }
}

fn delay_until(t: DateTime<Utc>) -> Duration {
    (t - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

pub struct AuctionScheduler {
    auctions: Arc<dyn AuctionStore>,
    finalizer: Arc<Finalizer>,
    fanout: NotificationFanout,
    audit: Audit,
    timers: Arc<Mutex<HashMap<AuctionId, AuctionTimers>>>,
    config: SchedulerConfig,
}

impl AuctionScheduler {
    pub fn new(
        auctions: Arc<dyn AuctionStore>,
        finalizer: Arc<Finalizer>,
        fanout: NotificationFanout,
        audit: Audit,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            auctions,
            finalizer,
            fanout,
            audit,
            timers: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    /// Create an auction from catalog config and arm its timers.
    ///
    /// An end time already in the past goes straight to the finalizer;
    /// a start time already in the past opens bidding immediately.
    pub async fn schedule_auction(&self, config: AuctionConfig) -> Result<Auction, AuctionError> {
        config.validate()?;

        let now = Utc::now();
        let mut auction = Auction::from_config(Uuid::new_v4(), &config, now);

        if auction.end_time <= now {
            self.auctions.insert_auction(&auction).await?;
            warn!(
                auction_id = %auction.auction_id,
                "Scheduled with end time in the past, finalizing immediately"
            );
            return self.finalizer.end_auction(auction.auction_id).await;
        }

        let started = auction.start_time <= now;
        if started {
            auction.status = AuctionStatus::Active;
        }
        self.auctions.insert_auction(&auction).await?;
        self.register_timers(&auction).await;

        info!(
            auction_id = %auction.auction_id,
            seller_id = auction.seller_id,
            status = %auction.status,
            start = %auction.start_time,
            end = %auction.end_time,
            "Auction scheduled"
        );
        self.audit.record(
            Some(auction.seller_id),
            "auction.schedule",
            format!("auction={}", auction.auction_id),
        );
        if started {
            self.fanout.publish(
                Channel::Auction(auction.auction_id),
                AuctionEvent::AuctionStarted {
                    auction_id: auction.auction_id,
                    end_time: auction.end_time,
                },
            );
        }

        Ok(auction)
    }

    /// Register in-process timers for an auction. Replaces (and aborts)
    /// any existing handles for the same auction.
    async fn register_timers(&self, auction: &Auction) {
        let start = (auction.status == AuctionStatus::Scheduled)
            .then(|| self.spawn_start_timer(auction.auction_id, auction.start_time));
        let end = Some(self.spawn_end_timer(auction.auction_id, auction.end_time));

        let mut timers = self.timers.lock().await;
        if let Some(old) = timers.insert(auction.auction_id, AuctionTimers { start, end }) {
            old.abort_all();
        }
    }

    fn spawn_start_timer(&self, auction_id: AuctionId, start_time: DateTime<Utc>) -> JoinHandle<()> {
        let auctions = Arc::clone(&self.auctions);
        let fanout = self.fanout.clone();
        let audit = self.audit.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay_until(start_time)).await;
            Self::activate(&auctions, &fanout, &audit, auction_id).await;
        })
    }

    fn spawn_end_timer(&self, auction_id: AuctionId, end_time: DateTime<Utc>) -> JoinHandle<()> {
        let finalizer = Arc::clone(&self.finalizer);
        let timers = Arc::clone(&self.timers);
        tokio::spawn(async move {
            tokio::time::sleep(delay_until(end_time)).await;
            match finalizer.end_auction(auction_id).await {
                Ok(_) => {}
                // Cancelled mid-flight or similar; the timer was stale
                Err(AuctionError::State(reason)) => {
                    debug!(auction_id = %auction_id, %reason, "End timer fired on settled auction");
                }
                Err(e) => {
                    // Not fatal: the sweep is the safety net
                    error!(auction_id = %auction_id, error = %e, "End timer failed to finalize");
                }
            }
            timers.lock().await.remove(&auction_id);
        })
    }

    /// Flip Scheduled -> Active. The CAS makes a duplicate fire (timer
    /// plus sweep, or two processes) a logged no-op.
    async fn activate(
        auctions: &Arc<dyn AuctionStore>,
        fanout: &NotificationFanout,
        audit: &Audit,
        auction_id: AuctionId,
    ) {
        match auctions
            .update_status_if(auction_id, AuctionStatus::Scheduled, AuctionStatus::Active)
            .await
        {
            Ok(true) => {
                info!(auction_id = %auction_id, "Auction activated, bidding open");
                audit.record(None, "auction.start", format!("auction={}", auction_id));
                let end_time = match auctions.get_auction(auction_id).await {
                    Ok(Some(a)) => a.end_time,
                    _ => return,
                };
                fanout.publish(
                    Channel::Auction(auction_id),
                    AuctionEvent::AuctionStarted {
                        auction_id,
                        end_time,
                    },
                );
            }
            Ok(false) => {
                debug!(auction_id = %auction_id, "Start fire was a duplicate, no-op");
            }
            Err(e) => {
                error!(auction_id = %auction_id, error = %e, "Failed to activate auction");
            }
        }
    }

    /// Re-arm the end timer at a new deadline. Timer-only: callers that
    /// move the persisted end time (auto-extend, manual edit) write the
    /// store first, then call this.
    pub async fn reschedule(&self, auction_id: AuctionId, new_end: DateTime<Utc>) {
        let handle = self.spawn_end_timer(auction_id, new_end);
        let mut timers = self.timers.lock().await;
        let entry = timers.entry(auction_id).or_default();
        if let Some(old) = entry.end.replace(handle) {
            old.abort();
        }
        debug!(auction_id = %auction_id, %new_end, "End timer rescheduled");
    }

    /// Manual end-time edit (seller/admin surface).
    pub async fn reschedule_auction(
        &self,
        auction_id: AuctionId,
        new_end: DateTime<Utc>,
    ) -> Result<(), AuctionError> {
        if new_end <= Utc::now() {
            return Err(AuctionError::Validation(
                "new end time must be in the future".to_string(),
            ));
        }

        if !self.auctions.extend_end_time(auction_id, new_end).await? {
            // Missing row and closed row are different errors
            return match self.auctions.get_auction(auction_id).await? {
                None => Err(AuctionError::AuctionNotFound(auction_id.to_string())),
                Some(auction) => Err(AuctionError::State(format!(
                    "auction is {}, end time can no longer change",
                    auction.status
                ))),
            };
        }

        self.reschedule(auction_id, new_end).await;
        self.audit.record(
            None,
            "auction.reschedule",
            format!("auction={} new_end={}", auction_id, new_end),
        );
        self.fanout.publish(
            Channel::Auction(auction_id),
            AuctionEvent::AuctionExtended {
                auction_id,
                new_end_time: new_end,
            },
        );
        Ok(())
    }

    /// Seller withdraws an auction that has not gone active yet.
    pub async fn cancel_auction(
        &self,
        auction_id: AuctionId,
        requester_id: UserId,
    ) -> Result<Auction, AuctionError> {
        let auction = self
            .auctions
            .get_auction(auction_id)
            .await?
            .ok_or_else(|| AuctionError::AuctionNotFound(auction_id.to_string()))?;

        if auction.seller_id != requester_id {
            return Err(AuctionError::Unauthorized(
                "only the seller may cancel the auction".to_string(),
            ));
        }

        let cancelled = self
            .auctions
            .update_status_if(auction_id, AuctionStatus::Scheduled, AuctionStatus::Cancelled)
            .await?
            || self
                .auctions
                .update_status_if(auction_id, AuctionStatus::Draft, AuctionStatus::Cancelled)
                .await?;
        if !cancelled {
            return Err(AuctionError::State(format!(
                "auction is {}, only draft or scheduled auctions can be cancelled",
                auction.status
            )));
        }

        if let Some(timers) = self.timers.lock().await.remove(&auction_id) {
            timers.abort_all();
        }

        info!(auction_id = %auction_id, "Auction cancelled");
        self.audit.record(
            Some(requester_id),
            "auction.cancel",
            format!("auction={}", auction_id),
        );
        self.fanout.publish(
            Channel::Auction(auction_id),
            AuctionEvent::AuctionCancelled { auction_id },
        );

        self.auctions
            .get_auction(auction_id)
            .await?
            .ok_or_else(|| AuctionError::AuctionNotFound(auction_id.to_string()))
    }

    /// Startup reconciliation: in-process timers died with the last
    /// process, so re-register them from the store. Overdue auctions go
    /// straight to the finalizer.
    pub async fn reconcile(&self) -> Result<usize, AuctionError> {
        let open = self.auctions.find_open().await?;
        let now = Utc::now();
        let count = open.len();

        for auction in open {
            if auction.end_time <= now {
                if let Err(e) = self.finalizer.end_auction(auction.auction_id).await {
                    error!(
                        auction_id = %auction.auction_id,
                        error = %e,
                        "Reconcile failed to finalize overdue auction"
                    );
                }
            } else {
                self.register_timers(&auction).await;
            }
        }

        info!(count, "Startup reconciliation complete");
        Ok(count)
    }

    /// One sweep cycle: activate due Scheduled auctions, close due
    /// open ones. Returns the number of auctions closed.
    pub async fn sweep_once(&self) -> Result<usize, AuctionError> {
        let now = Utc::now();

        for auction in self
            .auctions
            .find_startable(now, self.config.batch_size)
            .await?
        {
            Self::activate(&self.auctions, &self.fanout, &self.audit, auction.auction_id).await;
        }

        let due = self.auctions.find_due(now, self.config.batch_size).await?;
        let mut closed = 0usize;
        for auction in due {
            match self.finalizer.end_auction(auction.auction_id).await {
                Ok(_) => closed += 1,
                Err(AuctionError::State(reason)) => {
                    debug!(auction_id = %auction.auction_id, %reason, "Sweep skipped auction");
                }
                Err(e) => {
                    error!(
                        auction_id = %auction.auction_id,
                        error = %e,
                        "Sweep failed to finalize auction"
                    );
                }
            }
        }

        if closed > 0 {
            info!(closed, "Sweep closed overdue auctions");
        }
        Ok(closed)
    }

    /// Run the sweep loop forever. Timer loss is never surfaced as an
    /// error anywhere; this loop is what silently heals it.
    pub async fn run_sweep(&self) -> ! {
        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting scheduler sweep"
        );

        loop {
            if let Err(e) = self.sweep_once().await {
                error!(error = %e, "Sweep cycle failed");
            }
            tokio::time::sleep(self.config.sweep_interval).await;
        }
    }
}
