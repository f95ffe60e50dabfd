//! gavel - Auction Lifecycle & Bid Settlement Engine
//!
//! Closes each auction at the right moment with exactly one consistent
//! winner, even with bids and lifecycle transitions arriving
//! concurrently from many callers.
//!
//! # Modules
//!
//! - [`types`] - Core id definitions (AuctionId, BidId, UserId)
//! - [`model`] - Auction and Bid records, status state machines
//! - [`error`] - Engine error taxonomy
//! - [`store`] - Auction store + bid ledger traits, Postgres and
//!   in-memory implementations, conditional-update primitives
//! - [`settlement`] - Bid placement and cancellation (the
//!   concurrency-critical path)
//! - [`finalizer`] - Idempotent auction close with deterministic winner
//! - [`scheduler`] - Start/end timers, startup reconciliation, sweep
//! - [`notify`] - Best-effort domain event fanout
//! - [`audit`] - Fire-and-forget activity trail
//! - [`config`] - YAML application config
//! - [`logging`] - tracing subscriber setup

pub mod types;

pub mod audit;
pub mod config;
pub mod error;
pub mod finalizer;
pub mod logging;
pub mod model;
pub mod notify;
pub mod scheduler;
pub mod settlement;
pub mod store;

// Convenient re-exports at crate root
pub use error::AuctionError;
pub use model::{
    Auction, AuctionConfig, AuctionStatus, AuctionStatusView, AutoExtendPolicy, Bid, BidStatus,
};
pub use types::{AuctionId, BidId, ProductId, UserId};

pub use finalizer::Finalizer;
pub use notify::{AuctionEvent, Channel, NotificationFanout, NotificationSink, TracingSink};
pub use scheduler::{AuctionScheduler, SchedulerConfig};
pub use settlement::{BidRequest, SettlementEngine};
pub use store::{AuctionStore, BidStore, MemoryStore, PgStore};

pub use audit::{ActivityLog, Audit, TracingActivityLog};
