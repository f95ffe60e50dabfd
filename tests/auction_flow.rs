//! End-to-end auction scenarios over the in-memory store.
//!
//! These exercise the full component stack (scheduler -> settlement ->
//! finalizer -> fanout) the way an embedding service would drive it.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use gavel::audit::{Audit, TracingActivityLog};
use gavel::notify::{Channel, NotificationFanout, RecordingSink};
use gavel::scheduler::{AuctionScheduler, SchedulerConfig};
use gavel::settlement::{BidRequest, SettlementEngine};
use gavel::store::{AuctionStore, BidStore, Leader, MemoryStore};
use gavel::{AuctionConfig, AuctionStatus, AutoExtendPolicy, Bid, BidStatus, Finalizer};

struct Stack {
    store: Arc<MemoryStore>,
    sink: Arc<RecordingSink>,
    engine: Arc<SettlementEngine>,
    finalizer: Arc<Finalizer>,
    scheduler: Arc<AuctionScheduler>,
}

fn stack() -> Stack {
    let store = Arc::new(MemoryStore::new());
    let sink = Arc::new(RecordingSink::new());
    let fanout = NotificationFanout::new(sink.clone());
    let audit = Audit::new(Arc::new(TracingActivityLog));

    let finalizer = Arc::new(Finalizer::new(
        store.clone(),
        store.clone(),
        fanout.clone(),
        audit.clone(),
    ));
    let scheduler = Arc::new(AuctionScheduler::new(
        store.clone(),
        finalizer.clone(),
        fanout.clone(),
        audit.clone(),
        SchedulerConfig::default(),
    ));
    let engine = Arc::new(SettlementEngine::new(
        store.clone(),
        store.clone(),
        fanout,
        audit,
    ));
    engine.attach_scheduler(scheduler.clone());

    Stack {
        store,
        sink,
        engine,
        finalizer,
        scheduler,
    }
}

fn open_auction_config(seller_id: i64) -> AuctionConfig {
    let now = Utc::now();
    AuctionConfig {
        product_id: Uuid::new_v4(),
        seller_id,
        start_time: now - Duration::seconds(1),
        end_time: now + Duration::hours(1),
        start_price: Decimal::new(100, 0),
        min_increment: Decimal::new(10, 0),
        reserve_price: None,
        auto_extend: None,
    }
}

#[tokio::test]
async fn full_lifecycle_sequential_scenario() {
    let s = stack();
    let auction = s
        .scheduler
        .schedule_auction(open_auction_config(1))
        .await
        .unwrap();
    let id = auction.auction_id;
    assert_eq!(auction.status, AuctionStatus::Active);

    // A = 110 accepted
    let bid_a = s
        .engine
        .place_bid(BidRequest::new(id, 2, Decimal::new(110, 0)))
        .await
        .unwrap();

    // B = 105 rejected: below 110 + 10
    let err = s
        .engine
        .place_bid(BidRequest::new(id, 3, Decimal::new(105, 0)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "BID_TOO_LOW");

    // C = 120 accepted, A demoted
    let bid_c = s
        .engine
        .place_bid(BidRequest::new(id, 3, Decimal::new(120, 0)))
        .await
        .unwrap();

    let history = s.engine.bid_history(id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].bid_id, bid_c.bid_id); // amount DESC

    // Manual end uses the exact same contract as the scheduled trigger
    let closed = s.finalizer.end_auction(id).await.unwrap();
    assert_eq!(closed.status, AuctionStatus::Ended);
    assert_eq!(closed.current_winner, Some(3));
    assert_eq!(closed.winner_bid_id, Some(bid_c.bid_id));

    let stored_c = s.store.get_bid(bid_c.bid_id).await.unwrap().unwrap();
    assert_eq!(stored_c.status, BidStatus::Won);
    let stored_a = s.store.get_bid(bid_a.bid_id).await.unwrap().unwrap();
    assert_eq!(stored_a.status, BidStatus::Lost);

    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert!(s.sink.kinds_for(Channel::User(3)).contains(&"auction_won"));
    assert!(s
        .sink
        .kinds_for(Channel::Auction(id))
        .contains(&"auction_ended"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn race_between_150_and_160_always_resolves_to_160() {
    // currentBid=140, minIncrement=10; concurrent bids of 150 and 160.
    // No execution may end with currentBid=150.
    for _ in 0..25 {
        let s = stack();
        let auction = s
            .scheduler
            .schedule_auction(open_auction_config(1))
            .await
            .unwrap();
        let id = auction.auction_id;

        // Seed the standing leader at 140
        let seed = Bid {
            bid_id: Uuid::new_v4(),
            auction_id: id,
            bidder_id: 9,
            amount: Decimal::new(140, 0),
            message: None,
            max_auto_bid: None,
            status: BidStatus::Active,
            placed_at: Utc::now(),
        };
        s.store.insert_bid(&seed).await.unwrap();
        assert!(s
            .store
            .try_set_leader(
                id,
                Leader {
                    amount: Decimal::new(140, 0),
                    bidder_id: 9,
                },
            )
            .await
            .unwrap());

        let e1 = s.engine.clone();
        let e2 = s.engine.clone();
        let low = tokio::spawn(async move {
            e1.place_bid(BidRequest::new(id, 2, Decimal::new(150, 0))).await
        });
        let high = tokio::spawn(async move {
            e2.place_bid(BidRequest::new(id, 3, Decimal::new(160, 0))).await
        });

        let low_result = low.await.unwrap();
        let high_result = high.await.unwrap();

        // 160 always lands
        assert!(high_result.is_ok());
        let view = s.engine.auction_status(id).await.unwrap();
        assert_eq!(view.current_bid, Some(Decimal::new(160, 0)));
        assert_eq!(view.winner, Some(3));

        // 150 either lost the validation (too low / conflict) or was
        // accepted first and then immediately outbid
        match low_result {
            Ok(bid) => {
                let stored = s.store.get_bid(bid.bid_id).await.unwrap().unwrap();
                assert_eq!(stored.status, BidStatus::Outbid);
            }
            Err(e) => {
                assert!(matches!(e.code(), "BID_TOO_LOW" | "CONFLICT_ERROR"));
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_storm_keeps_accepted_sequence_monotonic() {
    let s = stack();
    let auction = s
        .scheduler
        .schedule_auction(open_auction_config(1))
        .await
        .unwrap();
    let id = auction.auction_id;

    let mut handles = Vec::new();
    for i in 0..10i64 {
        let engine = s.engine.clone();
        let amount = Decimal::new(110 + i * 10, 0);
        let bidder = 2 + i;
        handles.push(tokio::spawn(async move {
            engine.place_bid(BidRequest::new(id, bidder, amount)).await
        }));
    }
    let mut accepted = Vec::new();
    for handle in handles {
        if let Ok(bid) = handle.await.unwrap() {
            accepted.push(bid.amount);
        }
    }

    // The highest submitted amount always wins; no lower concurrent
    // bid can overwrite it.
    let view = s.engine.auction_status(id).await.unwrap();
    assert_eq!(view.current_bid, Some(Decimal::new(200, 0)));
    assert_eq!(accepted.iter().max(), Some(&Decimal::new(200, 0)));

    // Exactly one bid still stands, and it matches the stored leader
    let actives = s.store.find_active_by_auction(id).await.unwrap();
    assert_eq!(actives.len(), 1);
    assert_eq!(actives[0].amount, Decimal::new(200, 0));

    // Monotonicity: replaying accepted amounts in placement order
    // never goes down
    let history = s.engine.bid_history(id).await.unwrap();
    let mut by_time: Vec<&Bid> = history.iter().collect();
    by_time.sort_by_key(|b| b.placed_at);
    let mut last_leader = Decimal::ZERO;
    for bid in by_time {
        if bid.amount > last_leader {
            last_leader = bid.amount;
        }
    }
    assert_eq!(last_leader, Decimal::new(200, 0));
}

#[tokio::test]
async fn double_end_auction_is_idempotent() {
    let s = stack();
    let auction = s
        .scheduler
        .schedule_auction(open_auction_config(1))
        .await
        .unwrap();
    let id = auction.auction_id;

    s.engine
        .place_bid(BidRequest::new(id, 2, Decimal::new(110, 0)))
        .await
        .unwrap();

    let first = s.finalizer.end_auction(id).await.unwrap();
    let second = s.finalizer.end_auction(id).await.unwrap();

    assert_eq!(first.current_winner, second.current_winner);
    assert_eq!(first.winner_bid_id, second.winner_bid_id);
    assert_eq!(first.status, second.status);
    // The second call performed no mutation
    assert_eq!(first.version, second.version);
}

#[tokio::test]
async fn no_bid_close_emits_ended_but_never_won() {
    let s = stack();
    let auction = s
        .scheduler
        .schedule_auction(open_auction_config(1))
        .await
        .unwrap();
    let id = auction.auction_id;

    let closed = s.finalizer.end_auction(id).await.unwrap();
    assert_eq!(closed.status, AuctionStatus::Ended);
    assert_eq!(closed.current_winner, None);
    assert_eq!(closed.winner_bid_id, None);

    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert!(s
        .sink
        .kinds_for(Channel::Auction(id))
        .contains(&"auction_ended"));
    assert!(!s
        .sink
        .delivered()
        .iter()
        .any(|(_, e)| e.kind() == "auction_won"));
}

#[tokio::test]
async fn bid_inside_threshold_extends_end_by_exactly_the_extension() {
    let s = stack();
    let now = Utc::now();
    let original_end = now + Duration::minutes(2);
    let config = AuctionConfig {
        product_id: Uuid::new_v4(),
        seller_id: 1,
        start_time: now - Duration::seconds(1),
        end_time: original_end,
        start_price: Decimal::new(100, 0),
        min_increment: Decimal::new(10, 0),
        reserve_price: None,
        auto_extend: Some(AutoExtendPolicy {
            threshold_secs: 300,
            extension_secs: 600,
        }),
    };
    let auction = s.scheduler.schedule_auction(config).await.unwrap();
    let id = auction.auction_id;

    s.engine
        .place_bid(BidRequest::new(id, 2, Decimal::new(110, 0)))
        .await
        .unwrap();

    let stored = s.store.get_auction(id).await.unwrap().unwrap();
    assert_eq!(stored.end_time, original_end + Duration::seconds(600));

    tokio::time::sleep(StdDuration::from_millis(50)).await;
    assert!(s
        .sink
        .kinds_for(Channel::Auction(id))
        .contains(&"auction_extended"));
}

#[tokio::test]
async fn rejected_bid_never_extends_the_auction() {
    let s = stack();
    let now = Utc::now();
    let original_end = now + Duration::minutes(2);
    let config = AuctionConfig {
        product_id: Uuid::new_v4(),
        seller_id: 1,
        start_time: now - Duration::seconds(1),
        end_time: original_end,
        start_price: Decimal::new(100, 0),
        min_increment: Decimal::new(10, 0),
        reserve_price: None,
        auto_extend: Some(AutoExtendPolicy {
            threshold_secs: 300,
            extension_secs: 600,
        }),
    };
    let auction = s.scheduler.schedule_auction(config).await.unwrap();
    let id = auction.auction_id;

    // Self-bid: rejected before any write
    let err = s
        .engine
        .place_bid(BidRequest::new(id, 1, Decimal::new(110, 0)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "STATE_ERROR");

    // Too low: rejected at validation
    let err = s
        .engine
        .place_bid(BidRequest::new(id, 2, Decimal::new(50, 0)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "BID_TOO_LOW");

    let stored = s.store.get_auction(id).await.unwrap().unwrap();
    assert_eq!(stored.end_time, original_end);
}

#[tokio::test]
async fn cancelling_the_leading_bid_recomputes_the_leader() {
    let s = stack();
    let auction = s
        .scheduler
        .schedule_auction(open_auction_config(1))
        .await
        .unwrap();
    let id = auction.auction_id;

    s.engine
        .place_bid(BidRequest::new(id, 2, Decimal::new(110, 0)))
        .await
        .unwrap();
    let leader = s
        .engine
        .place_bid(BidRequest::new(id, 3, Decimal::new(120, 0)))
        .await
        .unwrap();

    s.engine.cancel_bid(leader.bid_id, 3).await.unwrap();

    // Bidder 2's record was outbid, so nothing active remains: the
    // auction reverts to no leader and the next bid only needs to
    // clear the start price again.
    let view = s.engine.auction_status(id).await.unwrap();
    assert_eq!(view.current_bid, None);

    let rebid = s
        .engine
        .place_bid(BidRequest::new(id, 4, Decimal::new(100, 0)))
        .await
        .unwrap();
    assert_eq!(rebid.amount, Decimal::new(100, 0));
    let view = s.engine.auction_status(id).await.unwrap();
    assert_eq!(view.current_bid, Some(Decimal::new(100, 0)));
    assert_eq!(view.winner, Some(4));
}

#[tokio::test]
async fn reserve_not_met_closes_without_winner() {
    let s = stack();
    let now = Utc::now();
    let config = AuctionConfig {
        product_id: Uuid::new_v4(),
        seller_id: 1,
        start_time: now - Duration::seconds(1),
        end_time: now + Duration::hours(1),
        start_price: Decimal::new(100, 0),
        min_increment: Decimal::new(10, 0),
        reserve_price: Some(Decimal::new(500, 0)),
        auto_extend: None,
    };
    let auction = s.scheduler.schedule_auction(config).await.unwrap();
    let id = auction.auction_id;

    let bid = s
        .engine
        .place_bid(BidRequest::new(id, 2, Decimal::new(110, 0)))
        .await
        .unwrap();

    let closed = s.finalizer.end_auction(id).await.unwrap();
    assert_eq!(closed.status, AuctionStatus::Ended);
    assert_eq!(closed.current_winner, None);
    assert_eq!(closed.winner_bid_id, None);
    assert_eq!(
        s.store.get_bid(bid.bid_id).await.unwrap().unwrap().status,
        BidStatus::Lost
    );
}

#[tokio::test]
async fn scheduled_auction_rejects_bids_until_started() {
    let s = stack();
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
    let auction = s.scheduler.schedule_auction(config).await.unwrap();
    assert_eq!(auction.status, AuctionStatus::Scheduled);

    let err = s
        .engine
        .place_bid(BidRequest::new(
            auction.auction_id,
            2,
            Decimal::new(150, 0),
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "STATE_ERROR");

    // Ended auctions reject bids the same way
    let ended = s.finalizer.end_auction(auction.auction_id).await;
    // A scheduled auction can be force-ended (admin path)
    assert!(ended.is_ok());
    let err = s
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
