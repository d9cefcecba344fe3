#![allow(non_snake_case)]

mod purchase_flow;
mod sync_flow;

use lottery_client::{
    AppController,
    ChainSnapshot,
    LotteryContract,
    SessionManager,
    TicketPricing,
    controller::ControllerChannels,
    feed::FeedEvent,
    session::WalletProvider,
    sync::SyncEvent,
    test_helpers::{
        FakeLottery,
        FakeWallet,
    },
};
use std::{
    sync::Arc,
    time::Duration,
};

const WAIT: Duration = Duration::from_secs(5);

pub struct TestContext {
    pub lottery: FakeLottery,
    pub wallet: FakeWallet,
    pub controller: AppController,
    pub channels: ControllerChannels,
}

impl TestContext {
    /// Started controller with a wallet available but not connected.
    pub async fn new() -> Self {
        Self::build(true, FakeLottery::new()).await
    }

    /// Started controller with no wallet provider at all.
    pub async fn read_only() -> Self {
        Self::build(false, FakeLottery::new()).await
    }

    /// Read-only controller whose first feed attach failed.
    pub async fn feed_unavailable() -> Self {
        let lottery = FakeLottery::new();
        lottery.fail_listener_attach();
        Self::build(false, lottery).await
    }

    async fn build(with_wallet: bool, lottery: FakeLottery) -> Self {
        let wallet = FakeWallet::new(&lottery);
        let provider = with_wallet.then(|| Arc::new(wallet.clone()) as Arc<dyn WalletProvider>);
        let contract = LotteryContract::new(
            lottery.address(),
            Arc::new(lottery.clone()),
            TicketPricing::OnChain,
        );
        let (mut controller, channels) = AppController::new(
            SessionManager::new(provider),
            contract,
            Arc::new(lottery.clone()),
            Duration::from_secs(3600),
        );
        controller.start().await;
        Self {
            lottery,
            wallet,
            controller,
            channels,
        }
    }

    /// Next sync event, applied to the controller the way the terminal
    /// loop applies it.
    pub async fn next_sync(&mut self) -> SyncEvent {
        let event = tokio::time::timeout(WAIT, self.channels.sync_rx.recv())
            .await
            .expect("timed out waiting for a sync event")
            .expect("synchronizer stopped");
        self.controller.ingest_sync_event(event.clone());
        self.controller.reattach_feed_if_needed().await;
        event
    }

    pub async fn next_snapshot(&mut self) -> ChainSnapshot {
        loop {
            if let SyncEvent::Snapshot(snapshot) = self.next_sync().await {
                return snapshot;
            }
        }
    }

    pub async fn next_feed_event(&mut self) -> FeedEvent {
        let event = tokio::time::timeout(WAIT, self.channels.feed_rx.recv())
            .await
            .expect("timed out waiting for a feed event")
            .expect("feed stopped");
        self.controller.ingest_feed_event(event.clone());
        event
    }
}
