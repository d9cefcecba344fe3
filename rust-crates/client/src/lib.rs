//! Client-side synchronization for the lottery contract: wallet sessions, a
//! typed contract facade, a polling synchronizer and a live purchase feed.

pub mod chain;
pub mod contract;
pub mod controller;
pub mod display;
pub mod error;
pub mod feed;
pub mod session;
pub mod sync;
pub mod wallets;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use contract::{
    ChainSnapshot,
    LotteryContract,
    PendingPurchase,
    PurchaseReceipt,
    TicketPricing,
};
pub use controller::{
    AppController,
    AppView,
};
pub use error::{
    ChainError,
    LotteryError,
    Result,
    WalletError,
};
pub use feed::{
    FEED_CAPACITY,
    Feed,
    FeedEntry,
};
pub use session::{
    ConnectionState,
    SessionManager,
    SessionState,
};
pub use sync::POLL_INTERVAL;
