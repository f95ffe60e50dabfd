//! Core identifier types used throughout the engine.
//!
//! Semantic aliases over the raw representations so call sites read as
//! domain code and the representation can evolve in one place.

use uuid::Uuid;

/// User ID - assigned by the identity collaborator, immutable.
///
/// Sellers and bidders share the same id space.
pub type UserId = i64;

/// Auction ID - 1:1 with the listed item it sells.
pub type AuctionId = Uuid;

/// Bid ID - unique per bid attempt; bid records are never deleted.
pub type BidId = Uuid;

/// Product ID - the catalog item an auction is attached to.
/// Owned by the catalog collaborator; opaque here.
pub type ProductId = Uuid;
