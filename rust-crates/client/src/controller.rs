use crate::{
    contract::{
        ChainSnapshot,
        LotteryContract,
        PendingPurchase,
        PurchaseReceipt,
        TicketPricing,
    },
    error::{
        LotteryError,
        Result,
    },
    feed::{
        Feed,
        FeedEntry,
        FeedEvent,
        FeedSubscriber,
        PurchaseEvents,
    },
    session::{
        ConnectionState,
        NO_WALLET_MESSAGE,
        SessionManager,
        SessionReader,
        SessionState,
    },
    sync::{
        SyncEvent,
        Synchronizer,
    },
};
use alloy::primitives::{
    Address,
    TxHash,
    U256,
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{
    error,
    info,
    warn,
};

pub const CONNECT_WALLET_MESSAGE: &str = "Connect wallet";
pub const AWAITING_CONFIRMATION_MESSAGE: &str = "Waiting for confirmation...";
pub const TICKET_BOUGHT_MESSAGE: &str = "Ticket bought!";
pub const DISCONNECTED_MESSAGE: &str = "Disconnected locally; the wallet still authorizes this app";

/// Receivers the shell drains and feeds back through `ingest_*`.
pub struct ControllerChannels {
    pub sync_rx: mpsc::UnboundedReceiver<SyncEvent>,
    pub feed_rx: mpsc::UnboundedReceiver<FeedEvent>,
}

/// Everything the UI needs to draw one frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppView {
    pub connection: ConnectionState,
    pub account: Option<Address>,
    pub wallet_available: bool,
    pub contract: Address,
    pub snapshot: Option<ChainSnapshot>,
    /// Only present when the snapshot was read for the connected account.
    pub caller_ticket_count: Option<u64>,
    pub read_error: Option<String>,
    pub feed: Vec<FeedEntry>,
    pub status: String,
    pub feed_notice: Option<String>,
    pub purchase_pending: Option<TxHash>,
}

pub struct AppController {
    sessions: SessionManager,
    contract: LotteryContract,
    events: Arc<dyn PurchaseEvents>,
    synchronizer: Synchronizer,
    feed_subscriber: FeedSubscriber,
    sync_tx: mpsc::UnboundedSender<SyncEvent>,
    snapshot: Option<ChainSnapshot>,
    read_error: Option<String>,
    feed: Feed,
    status: String,
    feed_notice: Option<String>,
    feed_needs_attach: bool,
    /// A session opened by `connect` is live.
    connected: bool,
    purchase_pending: Option<TxHash>,
}

impl AppController {
    pub fn new(
        sessions: SessionManager,
        contract: LotteryContract,
        events: Arc<dyn PurchaseEvents>,
        poll_interval: Duration,
    ) -> (Self, ControllerChannels) {
        let (sync_tx, sync_rx) = mpsc::unbounded_channel();
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();
        let synchronizer = Synchronizer::new(contract.clone(), sessions.reader(), poll_interval);
        let controller = Self {
            sessions,
            contract,
            events,
            synchronizer,
            feed_subscriber: FeedSubscriber::new(feed_tx),
            sync_tx,
            snapshot: None,
            read_error: None,
            feed: Feed::new(),
            status: String::new(),
            feed_notice: None,
            feed_needs_attach: false,
            connected: false,
            purchase_pending: None,
        };
        (controller, ControllerChannels { sync_rx, feed_rx })
    }

    /// Start polling and attach the purchase feed. A feed that cannot attach
    /// leaves a notice and is retried by `reattach_feed_if_needed`; polling
    /// runs regardless.
    pub async fn start(&mut self) {
        self.synchronizer.start(self.sync_tx.clone());
        self.attach_feed().await;
        if !self.sessions.has_provider() {
            info!("no wallet configured; running read-only");
        }
    }

    /// Attach the feed again if it failed to attach or its stream ended.
    /// Meant to run once per sync event, so retries follow the poll cadence.
    pub async fn reattach_feed_if_needed(&mut self) -> bool {
        if !self.feed_needs_attach {
            return false;
        }
        info!("reattaching purchase feed");
        self.attach_feed().await
    }

    async fn attach_feed(&mut self) -> bool {
        let events = Arc::clone(&self.events);
        match self
            .feed_subscriber
            .attach(events.as_ref(), self.contract.address())
            .await
        {
            Ok(()) => {
                self.feed_needs_attach = false;
                self.feed_notice = None;
                true
            }
            Err(err) => {
                self.feed_needs_attach = true;
                self.feed_notice = Some(err.to_string());
                false
            }
        }
    }

    pub fn session_reader(&self) -> SessionReader {
        self.sessions.reader()
    }

    pub fn session_state(&self) -> SessionState {
        self.sessions.state()
    }

    pub fn snapshot(&self) -> Option<&ChainSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn feed(&self) -> &Feed {
        &self.feed
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = status.into();
    }

    pub fn is_purchase_pending(&self) -> bool {
        self.purchase_pending.is_some()
    }

    pub async fn connect(&mut self) -> Result<()> {
        self.connected = false;
        match self.sessions.connect().await {
            Ok(_) => {
                self.connected = true;
                self.status.clear();
                self.synchronizer.refresh_now();
                Ok(())
            }
            Err(LotteryError::WalletUnavailable) => {
                self.status = NO_WALLET_MESSAGE.to_string();
                Err(LotteryError::WalletUnavailable)
            }
            Err(err) => {
                self.status = format!("Connection failed: {err}");
                Err(err)
            }
        }
    }

    /// Poll now instead of waiting for the next tick.
    pub fn refresh(&self) -> bool {
        self.synchronizer.refresh_now()
    }

    pub fn disconnect(&mut self) {
        self.connected = false;
        self.sessions.disconnect();
        self.status = DISCONNECTED_MESSAGE.to_string();
        self.synchronizer.refresh_now();
    }

    /// Submit a purchase and return without waiting for inclusion.
    pub async fn submit_purchase(&mut self) -> Result<PendingPurchase> {
        if self.sessions.state().session().is_none() {
            self.status = CONNECT_WALLET_MESSAGE.to_string();
            return Err(LotteryError::NoSigner);
        }
        match self.contract.submit_purchase(&self.sessions.reader()).await {
            Ok(pending) => {
                self.status = AWAITING_CONFIRMATION_MESSAGE.to_string();
                self.purchase_pending = Some(pending.tx_hash());
                Ok(pending)
            }
            Err(err) => {
                error!(error = %err, "ticket purchase was not submitted");
                self.status = format!("Purchase failed: {err}");
                Err(err)
            }
        }
    }

    /// Record the outcome of a confirmation started by `submit_purchase`.
    pub fn finish_purchase(
        &mut self,
        outcome: Result<PurchaseReceipt>,
    ) -> Result<PurchaseReceipt> {
        self.purchase_pending = None;
        match outcome {
            Ok(receipt) => {
                self.status = TICKET_BOUGHT_MESSAGE.to_string();
                self.synchronizer.refresh_now();
                Ok(receipt)
            }
            Err(err) => {
                error!(error = %err, "ticket purchase failed");
                self.status = format!("Purchase failed: {err}");
                Err(err)
            }
        }
    }

    /// Submit, wait for confirmation, then trigger a sync.
    pub async fn buy_ticket(&mut self) -> Result<PurchaseReceipt> {
        let pending = self.submit_purchase().await?;
        let outcome = pending.confirmed().await;
        self.finish_purchase(outcome)
    }

    pub fn ingest_sync_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Snapshot(snapshot) => {
                self.snapshot = Some(snapshot);
                self.read_error = None;
            }
            SyncEvent::ReadFailed(message) => {
                self.read_error = Some(message);
            }
        }
    }

    pub fn ingest_feed_event(&mut self, event: FeedEvent) {
        match event {
            FeedEvent::Purchase { event, observed_at } => {
                let price = self.ticket_price();
                self.feed
                    .push(FeedEntry::for_purchase(&event, price, observed_at));
            }
            FeedEvent::ListenerFailed(message) => {
                warn!(%message, "purchase feed stopped");
                self.feed_notice = Some(message);
                self.feed_needs_attach = true;
            }
        }
    }

    fn ticket_price(&self) -> Option<U256> {
        match self.contract.pricing() {
            TicketPricing::Fixed(price) => Some(price),
            TicketPricing::OnChain => self
                .snapshot
                .as_ref()
                .and_then(|snapshot| snapshot.ticket_price),
        }
    }

    /// Session state moved without us asking, e.g. the wallet switched
    /// accounts. Failures of our own `connect` are already reported there.
    pub fn on_session_changed(&mut self) {
        let SessionState::Error(message) = self.sessions.state() else {
            return;
        };
        if std::mem::take(&mut self.connected) {
            self.status = message;
            self.synchronizer.refresh_now();
        }
    }

    pub fn view(&self) -> AppView {
        let state = self.sessions.state();
        let account = state.address();
        let caller_ticket_count = self.snapshot.as_ref().and_then(|snapshot| {
            (account.is_some() && snapshot.caller == account)
                .then_some(snapshot.caller_ticket_count)
        });
        AppView {
            connection: state.connection(),
            account,
            wallet_available: self.sessions.has_provider(),
            contract: self.contract.address(),
            snapshot: self.snapshot.clone(),
            caller_ticket_count,
            read_error: self.read_error.clone(),
            feed: self.feed.iter().cloned().collect(),
            status: self.status.clone(),
            feed_notice: self.feed_notice.clone(),
            purchase_pending: self.purchase_pending,
        }
    }

    pub fn shutdown(&mut self) {
        self.synchronizer.stop();
        self.feed_subscriber.detach();
        self.sessions.teardown();
        info!("controller shut down");
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        error::ChainError,
        feed::{
            FEED_STOPPED_MESSAGE,
            PurchaseEvent,
            PurchaseStream,
        },
        session::WalletProvider,
        sync::POLL_INTERVAL,
        test_helpers::{
            FakeLottery,
            FakeWallet,
        },
    };
    use chrono::Utc;
    use futures::{
        FutureExt,
        StreamExt,
        future::BoxFuture,
        stream,
    };
    use proptest::prelude::*;
    use std::sync::atomic::{
        AtomicUsize,
        Ordering,
    };

    /// Event source whose streams end as soon as they are attached.
    #[derive(Default)]
    struct EndingEvents {
        attaches: AtomicUsize,
    }

    impl PurchaseEvents for EndingEvents {
        fn attach(&self, _contract: Address) -> BoxFuture<'_, Result<PurchaseStream, ChainError>> {
            self.attaches.fetch_add(1, Ordering::SeqCst);
            let events: PurchaseStream = stream::empty().boxed();
            futures::future::ready(Ok(events)).boxed()
        }
    }

    fn controller_for(
        lottery: &FakeLottery,
        wallet: Option<&FakeWallet>,
    ) -> (AppController, ControllerChannels) {
        controller_with_events(lottery, wallet, Arc::new(lottery.clone()))
    }

    fn controller_with_events(
        lottery: &FakeLottery,
        wallet: Option<&FakeWallet>,
        events: Arc<dyn PurchaseEvents>,
    ) -> (AppController, ControllerChannels) {
        let provider = wallet.map(|w| Arc::new(w.clone()) as Arc<dyn WalletProvider>);
        let contract = LotteryContract::new(
            lottery.address(),
            Arc::new(lottery.clone()),
            TicketPricing::OnChain,
        );
        AppController::new(SessionManager::new(provider), contract, events, POLL_INTERVAL)
    }

    fn snapshot(tickets: u64) -> ChainSnapshot {
        ChainSnapshot {
            pool_balance: U256::from(tickets),
            ticket_count: tickets,
            ticket_price: None,
            caller_ticket_count: 0,
            round: 1,
            caller: None,
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn submit_purchase__without_session_asks_to_connect() {
        // given
        let lottery = FakeLottery::new();
        let (mut controller, _channels) = controller_for(&lottery, None);

        // when
        let result = controller.submit_purchase().await;

        // then
        assert_eq!(result.unwrap_err(), LotteryError::NoSigner);
        assert_eq!(controller.status(), CONNECT_WALLET_MESSAGE);
    }

    #[tokio::test]
    async fn connect__without_wallet_reports_no_wallet_configured() {
        // given
        let lottery = FakeLottery::new();
        let (mut controller, _channels) = controller_for(&lottery, None);

        // when
        let result = controller.connect().await;

        // then
        assert_eq!(result.unwrap_err(), LotteryError::WalletUnavailable);
        assert_eq!(controller.view().status, NO_WALLET_MESSAGE);
        assert!(!controller.view().wallet_available);
    }

    #[tokio::test]
    async fn buy_ticket__reports_success_and_requests_sync() {
        // given
        let lottery = FakeLottery::new();
        let wallet = FakeWallet::new(&lottery);
        let (mut controller, mut channels) = controller_for(&lottery, Some(&wallet));
        controller.start().await;
        controller.connect().await.unwrap();

        // when
        let receipt = controller.buy_ticket().await.unwrap();

        // then
        assert_eq!(receipt.value, lottery.price());
        assert_eq!(controller.status(), TICKET_BOUGHT_MESSAGE);
        assert!(!controller.is_purchase_pending());
        let mut latest = None;
        while latest.as_ref().is_none_or(|s: &ChainSnapshot| s.ticket_count == 0) {
            match channels.sync_rx.recv().await {
                Some(SyncEvent::Snapshot(s)) => latest = Some(s),
                Some(SyncEvent::ReadFailed(msg)) => panic!("unexpected read failure: {msg}"),
                None => panic!("synchronizer stopped"),
            }
        }
        let latest = latest.unwrap();
        assert_eq!(latest.ticket_count, 1);
        controller.shutdown();
    }

    #[tokio::test]
    async fn buy_ticket__revert_reports_purchase_failed() {
        // given
        let lottery = FakeLottery::new();
        let wallet = FakeWallet::new(&lottery);
        let (mut controller, _channels) = controller_for(&lottery, Some(&wallet));
        controller.connect().await.unwrap();
        lottery.revert_next_purchase();

        // when
        let result = controller.buy_ticket().await;

        // then
        assert!(matches!(result, Err(LotteryError::TransactionReverted(_))));
        assert!(controller.status().starts_with("Purchase failed"));
    }

    #[tokio::test]
    async fn view__hides_caller_count_read_for_another_account() {
        // given
        let lottery = FakeLottery::new();
        let wallet = FakeWallet::new(&lottery);
        let (mut controller, _channels) = controller_for(&lottery, Some(&wallet));
        controller.connect().await.unwrap();
        let mut foreign = snapshot(3);
        foreign.caller = Some(Address::repeat_byte(0xEE));
        foreign.caller_ticket_count = 2;

        // when
        controller.ingest_sync_event(SyncEvent::Snapshot(foreign));

        // then
        assert_eq!(controller.view().caller_ticket_count, None);
    }

    #[tokio::test]
    async fn on_session_changed__surfaces_invalidation_reason() {
        // given
        let lottery = FakeLottery::new();
        let wallet = FakeWallet::new(&lottery);
        let (mut controller, _channels) = controller_for(&lottery, Some(&wallet));
        controller.connect().await.unwrap();
        let mut reader = controller.session_reader();
        reader.mark_unchanged();

        // when
        wallet.switch_chain(1);
        reader.changed().await.unwrap();
        controller.on_session_changed();

        // then
        assert_eq!(controller.status(), crate::session::NETWORK_CHANGED_MESSAGE);
        assert_eq!(
            controller.view().connection,
            ConnectionState::Error(crate::session::NETWORK_CHANGED_MESSAGE.to_string())
        );
    }

    #[tokio::test]
    async fn on_session_changed__keeps_connection_failure_status() {
        // given
        let lottery = FakeLottery::new();
        let wallet = FakeWallet::new(&lottery);
        wallet.decline_access();
        let (mut controller, _channels) = controller_for(&lottery, Some(&wallet));
        let _ = controller.connect().await;

        // when
        controller.on_session_changed();

        // then
        assert!(controller.status().starts_with("Connection failed"));
        assert!(matches!(controller.view().connection, ConnectionState::Error(_)));
    }

    #[tokio::test]
    async fn disconnect__sets_local_only_status() {
        // given
        let lottery = FakeLottery::new();
        let wallet = FakeWallet::new(&lottery);
        let (mut controller, _channels) = controller_for(&lottery, Some(&wallet));
        controller.connect().await.unwrap();

        // when
        controller.disconnect();

        // then
        assert_eq!(controller.status(), DISCONNECTED_MESSAGE);
        assert_eq!(controller.view().account, None);
    }

    #[test]
    fn ingest_feed_event__listener_failure_sets_notice() {
        let lottery = FakeLottery::new();
        let (mut controller, _channels) = controller_for(&lottery, None);

        controller.ingest_feed_event(FeedEvent::ListenerFailed("gone".to_string()));

        assert_eq!(controller.view().feed_notice.as_deref(), Some("gone"));
    }

    #[test]
    fn ingest_feed_event__prices_purchase_from_latest_snapshot() {
        // given
        let lottery = FakeLottery::new();
        let (mut controller, _channels) = controller_for(&lottery, None);
        let mut priced = snapshot(1);
        priced.ticket_price = Some(lottery.price());
        controller.ingest_sync_event(SyncEvent::Snapshot(priced));

        // when
        controller.ingest_feed_event(FeedEvent::Purchase {
            event: PurchaseEvent {
                buyer: Address::repeat_byte(0x11),
                round: U256::from(1),
                tx_hash: None,
            },
            observed_at: Utc::now(),
        });

        // then
        assert_eq!(
            controller.view().feed[0].display_text,
            "0x1111...1111 bought a ticket for 30.00 MATIC (round 1)"
        );
    }

    #[tokio::test]
    async fn reattach_feed_if_needed__reattaches_after_stream_ends() {
        // given
        let lottery = FakeLottery::new();
        let events = Arc::new(EndingEvents::default());
        let (mut controller, mut channels) =
            controller_with_events(&lottery, None, events.clone());
        controller.start().await;
        let stopped = channels.feed_rx.recv().await.unwrap();
        assert_eq!(stopped, FeedEvent::ListenerFailed(FEED_STOPPED_MESSAGE.to_string()));
        controller.ingest_feed_event(stopped);

        // when
        let reattached = controller.reattach_feed_if_needed().await;

        // then
        assert!(reattached);
        assert_eq!(events.attaches.load(Ordering::SeqCst), 2);
        assert_eq!(controller.view().feed_notice, None);
        controller.shutdown();
    }

    #[tokio::test]
    async fn reattach_feed_if_needed__recovers_from_failed_attach() {
        // given
        let lottery = FakeLottery::new();
        lottery.fail_listener_attach();
        let (mut controller, _channels) = controller_for(&lottery, None);
        controller.start().await;
        assert!(controller.view().feed_notice.is_some());

        // when
        let while_failing = controller.reattach_feed_if_needed().await;
        lottery.heal();
        let after_heal = controller.reattach_feed_if_needed().await;

        // then
        assert!(!while_failing);
        assert!(after_heal);
        assert_eq!(controller.view().feed_notice, None);
        assert_eq!(lottery.live_listeners(), 1);
        controller.shutdown();
    }

    #[tokio::test]
    async fn reattach_feed_if_needed__leaves_a_live_feed_alone() {
        // given
        let lottery = FakeLottery::new();
        let (mut controller, _channels) = controller_for(&lottery, None);
        controller.start().await;

        // when
        let reattached = controller.reattach_feed_if_needed().await;

        // then
        assert!(!reattached);
        assert_eq!(lottery.live_listeners(), 1);
        controller.shutdown();
    }

    proptest! {
        #[test]
        fn ingest_sync_event__failures_never_change_snapshot(
            outcomes in proptest::collection::vec(any::<Option<u64>>(), 1..40)
        ) {
            let lottery = FakeLottery::new();
            let (mut controller, _channels) = controller_for(&lottery, None);
            let mut expected: Option<ChainSnapshot> = None;

            for outcome in outcomes {
                match outcome {
                    Some(tickets) => {
                        let fresh = snapshot(tickets);
                        expected = Some(fresh.clone());
                        controller.ingest_sync_event(SyncEvent::Snapshot(fresh));
                        prop_assert_eq!(controller.view().read_error, None);
                    }
                    None => {
                        controller.ingest_sync_event(SyncEvent::ReadFailed("timeout".to_string()));
                        prop_assert!(controller.view().read_error.is_some());
                    }
                }
                prop_assert_eq!(controller.snapshot(), expected.as_ref());
            }
        }
    }
}
