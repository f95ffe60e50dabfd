//! PostgreSQL store.
//!
//! All leader and lifecycle writes are atomic conditional UPDATEs; the
//! database serializes them per row, which is the whole concurrency
//! story for bid settlement. `rows_affected() > 0` is the CAS verdict.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use async_trait::async_trait;

use super::{AuctionStore, BidStore, ClosedWinner, Leader};
use crate::error::AuctionError;
use crate::model::{Auction, AuctionStatus, AutoExtendPolicy, Bid, BidStatus};
use crate::types::{AuctionId, BidId, UserId};

/// Base SELECT for auction rows; WHERE clauses are appended per query.
const SELECT_AUCTION: &str = r#"
SELECT auction_id, product_id, seller_id, start_time, end_time,
       start_price, min_increment, reserve_price,
       extend_threshold_secs, extend_extension_secs, enabled,
       current_bid, current_winner, winner_bid_id, status, version,
       created_at, updated_at
FROM auctions_tb
"#;

const SELECT_BID: &str = r#"
SELECT bid_id, auction_id, bidder_id, amount, message, max_auto_bid,
       status, placed_at
FROM bids_tb
"#;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_auction(row: &sqlx::postgres::PgRow) -> Result<Auction, AuctionError> {
        let status_id: i16 = row.get("status");
        let status = AuctionStatus::from_id(status_id).ok_or_else(|| {
            AuctionError::Database(format!("Invalid auction status ID: {}", status_id))
        })?;

        let threshold: Option<i64> = row.get("extend_threshold_secs");
        let extension: Option<i64> = row.get("extend_extension_secs");
        let auto_extend = match (threshold, extension) {
            (Some(threshold_secs), Some(extension_secs)) => Some(AutoExtendPolicy {
                threshold_secs,
                extension_secs,
            }),
            _ => None,
        };

        Ok(Auction {
            auction_id: row.get("auction_id"),
            product_id: row.get("product_id"),
            seller_id: row.get("seller_id"),
            start_time: row.get("start_time"),
            end_time: row.get("end_time"),
            start_price: row.get("start_price"),
            min_increment: row.get("min_increment"),
            reserve_price: row.get("reserve_price"),
            auto_extend,
            enabled: row.get("enabled"),
            current_bid: row.get("current_bid"),
            current_winner: row.get("current_winner"),
            winner_bid_id: row.get("winner_bid_id"),
            status,
            version: row.get("version"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn row_to_bid(row: &sqlx::postgres::PgRow) -> Result<Bid, AuctionError> {
        let status_id: i16 = row.get("status");
        let status = BidStatus::from_id(status_id).ok_or_else(|| {
            AuctionError::Database(format!("Invalid bid status ID: {}", status_id))
        })?;

        Ok(Bid {
            bid_id: row.get("bid_id"),
            auction_id: row.get("auction_id"),
            bidder_id: row.get("bidder_id"),
            amount: row.get("amount"),
            message: row.get("message"),
            max_auto_bid: row.get("max_auto_bid"),
            status,
            placed_at: row.get("placed_at"),
        })
    }
}

#[async_trait]
impl AuctionStore for PgStore {
    async fn insert_auction(&self, auction: &Auction) -> Result<(), AuctionError> {
        sqlx::query(
            r#"
            INSERT INTO auctions_tb
                (auction_id, product_id, seller_id, start_time, end_time,
                 start_price, min_increment, reserve_price,
                 extend_threshold_secs, extend_extension_secs, enabled,
                 current_bid, current_winner, winner_bid_id, status, version,
                 created_at, updated_at)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                 $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(auction.auction_id)
        .bind(auction.product_id)
        .bind(auction.seller_id)
        .bind(auction.start_time)
        .bind(auction.end_time)
        .bind(auction.start_price)
        .bind(auction.min_increment)
        .bind(auction.reserve_price)
        .bind(auction.auto_extend.map(|p| p.threshold_secs))
        .bind(auction.auto_extend.map(|p| p.extension_secs))
        .bind(auction.enabled)
        .bind(auction.current_bid)
        .bind(auction.current_winner)
        .bind(auction.winner_bid_id)
        .bind(auction.status.id())
        .bind(auction.version)
        .bind(auction.created_at)
        .bind(auction.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_auction(&self, auction_id: AuctionId) -> Result<Option<Auction>, AuctionError> {
        let sql = format!("{} WHERE auction_id = $1", SELECT_AUCTION);
        let row = sqlx::query(&sql)
            .bind(auction_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_auction(&row)?)),
            None => Ok(None),
        }
    }

    async fn try_set_leader(
        &self,
        auction_id: AuctionId,
        leader: Leader,
    ) -> Result<bool, AuctionError> {
        // Of two concurrent bids, only the one whose amount still beats
        // the latest stored value passes the WHERE clause.
        let result = sqlx::query(
            r#"
            UPDATE auctions_tb
            SET current_bid = $1, current_winner = $2,
                version = version + 1, updated_at = NOW()
            WHERE auction_id = $3
              AND status = $4
              AND (current_bid IS NULL OR current_bid < $1)
            "#,
        )
        .bind(leader.amount)
        .bind(leader.bidder_id)
        .bind(auction_id)
        .bind(AuctionStatus::Active.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn replace_leader(
        &self,
        auction_id: AuctionId,
        expected_version: i64,
        leader: Option<Leader>,
    ) -> Result<bool, AuctionError> {
        let result = sqlx::query(
            r#"
            UPDATE auctions_tb
            SET current_bid = $1, current_winner = $2,
                version = version + 1, updated_at = NOW()
            WHERE auction_id = $3 AND version = $4 AND status = $5
            "#,
        )
        .bind(leader.map(|l| l.amount))
        .bind(leader.map(|l| l.bidder_id))
        .bind(auction_id)
        .bind(expected_version)
        .bind(AuctionStatus::Active.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_status_if(
        &self,
        auction_id: AuctionId,
        expected: AuctionStatus,
        new: AuctionStatus,
    ) -> Result<bool, AuctionError> {
        let result = sqlx::query(
            r#"
            UPDATE auctions_tb
            SET status = $1, version = version + 1, updated_at = NOW()
            WHERE auction_id = $2 AND status = $3
            "#,
        )
        .bind(new.id())
        .bind(auction_id)
        .bind(expected.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn extend_end_time(
        &self,
        auction_id: AuctionId,
        new_end: DateTime<Utc>,
    ) -> Result<bool, AuctionError> {
        let result = sqlx::query(
            r#"
            UPDATE auctions_tb
            SET end_time = $1, version = version + 1, updated_at = NOW()
            WHERE auction_id = $2 AND status IN ($3, $4)
            "#,
        )
        .bind(new_end)
        .bind(auction_id)
        .bind(AuctionStatus::Scheduled.id())
        .bind(AuctionStatus::Active.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finalize_auction(
        &self,
        auction_id: AuctionId,
        expected_version: i64,
        winner: Option<ClosedWinner>,
    ) -> Result<bool, AuctionError> {
        // Single conditional write; the row transitions to ENDED at
        // most once no matter how many closers race here. The version
        // check forces a re-read when a bid slipped in after the
        // caller picked its winner.
        let result = sqlx::query(
            r#"
            UPDATE auctions_tb
            SET status = $1, enabled = FALSE,
                current_bid = COALESCE($2, current_bid),
                current_winner = $3, winner_bid_id = $4,
                version = version + 1, updated_at = NOW()
            WHERE auction_id = $5 AND version = $6 AND status IN ($7, $8)
            "#,
        )
        .bind(AuctionStatus::Ended.id())
        .bind(winner.map(|w| w.amount))
        .bind(winner.map(|w| w.bidder_id))
        .bind(winner.map(|w| w.bid_id))
        .bind(auction_id)
        .bind(expected_version)
        .bind(AuctionStatus::Scheduled.id())
        .bind(AuctionStatus::Active.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Auction>, AuctionError> {
        let sql = format!(
            "{} WHERE end_time <= $1 AND status IN ($2, $3) ORDER BY end_time ASC LIMIT $4",
            SELECT_AUCTION
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(AuctionStatus::Scheduled.id())
            .bind(AuctionStatus::Active.id())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut auctions = Vec::with_capacity(rows.len());
        for row in rows {
            auctions.push(Self::row_to_auction(&row)?);
        }
        Ok(auctions)
    }

    async fn find_startable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Auction>, AuctionError> {
        let sql = format!(
            "{} WHERE start_time <= $1 AND status = $2 ORDER BY start_time ASC LIMIT $3",
            SELECT_AUCTION
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(AuctionStatus::Scheduled.id())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut auctions = Vec::with_capacity(rows.len());
        for row in rows {
            auctions.push(Self::row_to_auction(&row)?);
        }
        Ok(auctions)
    }

    async fn find_open(&self) -> Result<Vec<Auction>, AuctionError> {
        let sql = format!("{} WHERE status IN ($1, $2)", SELECT_AUCTION);
        let rows = sqlx::query(&sql)
            .bind(AuctionStatus::Scheduled.id())
            .bind(AuctionStatus::Active.id())
            .fetch_all(&self.pool)
            .await?;

        let mut auctions = Vec::with_capacity(rows.len());
        for row in rows {
            auctions.push(Self::row_to_auction(&row)?);
        }
        Ok(auctions)
    }
}

#[async_trait]
impl BidStore for PgStore {
    async fn insert_bid(&self, bid: &Bid) -> Result<(), AuctionError> {
        sqlx::query(
            r#"
            INSERT INTO bids_tb
                (bid_id, auction_id, bidder_id, amount, message,
                 max_auto_bid, status, placed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(bid.bid_id)
        .bind(bid.auction_id)
        .bind(bid.bidder_id)
        .bind(bid.amount)
        .bind(&bid.message)
        .bind(bid.max_auto_bid)
        .bind(bid.status.id())
        .bind(bid.placed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_bid(&self, bid_id: BidId) -> Result<Option<Bid>, AuctionError> {
        let sql = format!("{} WHERE bid_id = $1", SELECT_BID);
        let row = sqlx::query(&sql)
            .bind(bid_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_bid(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_by_auction(&self, auction_id: AuctionId) -> Result<Vec<Bid>, AuctionError> {
        let sql = format!(
            "{} WHERE auction_id = $1 ORDER BY amount DESC, placed_at ASC",
            SELECT_BID
        );
        let rows = sqlx::query(&sql)
            .bind(auction_id)
            .fetch_all(&self.pool)
            .await?;

        let mut bids = Vec::with_capacity(rows.len());
        for row in rows {
            bids.push(Self::row_to_bid(&row)?);
        }
        Ok(bids)
    }

    async fn find_active_by_auction(
        &self,
        auction_id: AuctionId,
    ) -> Result<Vec<Bid>, AuctionError> {
        let sql = format!(
            "{} WHERE auction_id = $1 AND status = $2 ORDER BY amount DESC, placed_at ASC",
            SELECT_BID
        );
        let rows = sqlx::query(&sql)
            .bind(auction_id)
            .bind(BidStatus::Active.id())
            .fetch_all(&self.pool)
            .await?;

        let mut bids = Vec::with_capacity(rows.len());
        for row in rows {
            bids.push(Self::row_to_bid(&row)?);
        }
        Ok(bids)
    }

    async fn find_active_for_bidder(
        &self,
        auction_id: AuctionId,
        bidder_id: UserId,
    ) -> Result<Option<Bid>, AuctionError> {
        let sql = format!(
            "{} WHERE auction_id = $1 AND bidder_id = $2 AND status = $3",
            SELECT_BID
        );
        let row = sqlx::query(&sql)
            .bind(auction_id)
            .bind(bidder_id)
            .bind(BidStatus::Active.id())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(Self::row_to_bid(&row)?)),
            None => Ok(None),
        }
    }

    async fn set_bid_status_if(
        &self,
        bid_id: BidId,
        expected: BidStatus,
        new: BidStatus,
    ) -> Result<bool, AuctionError> {
        let result = sqlx::query(
            r#"
            UPDATE bids_tb
            SET status = $1
            WHERE bid_id = $2 AND status = $3
            "#,
        )
        .bind(new.id())
        .bind(bid_id)
        .bind(expected.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn settle_losers(
        &self,
        auction_id: AuctionId,
        winner: Option<BidId>,
    ) -> Result<u64, AuctionError> {
        let result = sqlx::query(
            r#"
            UPDATE bids_tb
            SET status = $1
            WHERE auction_id = $2 AND status IN ($3, $4)
              AND ($5::UUID IS NULL OR bid_id <> $5)
            "#,
        )
        .bind(BidStatus::Lost.id())
        .bind(auction_id)
        .bind(BidStatus::Active.id())
        .bind(BidStatus::Outbid.id())
        .bind(winner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
