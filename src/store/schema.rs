//! PostgreSQL schema for the auction store and bid ledger.

use sqlx::PgPool;

use crate::error::AuctionError;

pub const CREATE_AUCTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS auctions_tb (
    auction_id            UUID PRIMARY KEY,
    product_id            UUID NOT NULL,
    seller_id             BIGINT NOT NULL,
    start_time            TIMESTAMPTZ NOT NULL,
    end_time              TIMESTAMPTZ NOT NULL,
    start_price           NUMERIC(20, 8) NOT NULL,
    min_increment         NUMERIC(20, 8) NOT NULL,
    reserve_price         NUMERIC(20, 8),
    extend_threshold_secs BIGINT,
    extend_extension_secs BIGINT,
    enabled               BOOLEAN NOT NULL DEFAULT TRUE,
    current_bid           NUMERIC(20, 8),
    current_winner        BIGINT,
    winner_bid_id         UUID,
    status                SMALLINT NOT NULL,
    version               BIGINT NOT NULL DEFAULT 0,
    created_at            TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at            TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// The sweep scans by (status, end_time); reconciliation by status.
pub const CREATE_AUCTIONS_DUE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_auctions_status_end_time
    ON auctions_tb (status, end_time)
"#;

pub const CREATE_AUCTIONS_START_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_auctions_status_start_time
    ON auctions_tb (status, start_time)
"#;

pub const CREATE_BIDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS bids_tb (
    bid_id       UUID PRIMARY KEY,
    auction_id   UUID NOT NULL,
    bidder_id    BIGINT NOT NULL,
    amount       NUMERIC(20, 8) NOT NULL,
    message      TEXT,
    max_auto_bid NUMERIC(20, 8),
    status       SMALLINT NOT NULL,
    placed_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// History reads and finalizer winner-pick order by amount/placed_at.
pub const CREATE_BIDS_HISTORY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_bids_auction_amount
    ON bids_tb (auction_id, amount DESC, placed_at ASC)
"#;

pub const CREATE_BIDS_STATUS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_bids_auction_status
    ON bids_tb (auction_id, status)
"#;

/// Initialize the auction engine schema.
///
/// Idempotent; safe to run on every startup.
pub async fn init_schema(pool: &PgPool) -> Result<(), AuctionError> {
    tracing::info!("Initializing auction schema...");

    for ddl in [
        CREATE_AUCTIONS_TABLE,
        CREATE_AUCTIONS_DUE_INDEX,
        CREATE_AUCTIONS_START_INDEX,
        CREATE_BIDS_TABLE,
        CREATE_BIDS_HISTORY_INDEX,
        CREATE_BIDS_STATUS_INDEX,
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }

    tracing::info!("Auction schema ready");
    Ok(())
}
