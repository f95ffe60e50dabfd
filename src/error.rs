//! Engine error types.
//!
//! One taxonomy for the whole engine; error codes are stable strings for
//! API-facing callers.

use rust_decimal::Decimal;
use thiserror::Error;

/// Auction engine error types
#[derive(Error, Debug, Clone)]
pub enum AuctionError {
    // === Validation ===
    #[error("Invalid input: {0}")]
    Validation(String),

    // === Lifecycle / state ===
    #[error("Invalid auction state: {0}")]
    State(String),

    #[error("Bid too low: minimum acceptable is {minimum}")]
    BidTooLow { minimum: Decimal },

    // === Concurrency ===
    #[error("Concurrent bid conflict: lost the race after {retries} retries")]
    Conflict { retries: u32 },

    // === Lookup ===
    #[error("Auction not found: {0}")]
    AuctionNotFound(String),

    #[error("Bid not found: {0}")]
    BidNotFound(String),

    // === Authorization ===
    #[error("Not permitted: {0}")]
    Unauthorized(String),

    // === System ===
    #[error("Database error: {0}")]
    Database(String),
}

impl AuctionError {
    /// Stable error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            AuctionError::Validation(_) => "VALIDATION_ERROR",
            AuctionError::State(_) => "STATE_ERROR",
            AuctionError::BidTooLow { .. } => "BID_TOO_LOW",
            AuctionError::Conflict { .. } => "CONFLICT_ERROR",
            AuctionError::AuctionNotFound(_) => "AUCTION_NOT_FOUND",
            AuctionError::BidNotFound(_) => "BID_NOT_FOUND",
            AuctionError::Unauthorized(_) => "AUTHORIZATION_ERROR",
            AuctionError::Database(_) => "DATABASE_ERROR",
        }
    }

    /// True when a synchronous caller may retry after re-reading state.
    ///
    /// Validation and state errors are final for the submitted request;
    /// a conflict means the world moved and a fresh read may still win.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuctionError::Conflict { .. })
    }
}

impl From<sqlx::Error> for AuctionError {
    fn from(e: sqlx::Error) -> Self {
        AuctionError::Database(e.to_string())
    }
}
