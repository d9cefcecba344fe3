//! In-memory stand-ins for the chain node and the wallet.

use crate::{
    contract::{
        LotteryReader,
        PendingPurchase,
        PurchaseSigner,
        default_ticket_price,
    },
    error::{
        ChainError,
        WalletError,
    },
    feed::{
        PurchaseEvent,
        PurchaseEvents,
        PurchaseStream,
    },
    session::{
        ProviderNotification,
        Session,
        SignerHandle,
        WalletProvider,
    },
};
use alloy::primitives::{
    Address,
    TxHash,
    U256,
};
use futures::{
    FutureExt,
    future::BoxFuture,
    stream::{
        self,
        BoxStream,
        StreamExt,
    },
};
use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
        atomic::{
            AtomicUsize,
            Ordering,
        },
    },
};
use tokio::sync::{
    broadcast,
    watch,
};

pub const FAKE_CHAIN_ID: u64 = 31337;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReadMethod {
    PrizePool,
    TicketsCount,
    TicketPrice,
    TicketsOf,
    Round,
}

impl ReadMethod {
    pub fn name(self) -> &'static str {
        match self {
            ReadMethod::PrizePool => "prizePool",
            ReadMethod::TicketsCount => "ticketsCount",
            ReadMethod::TicketPrice => "ticketPrice",
            ReadMethod::TicketsOf => "ticketsOf",
            ReadMethod::Round => "round",
        }
    }
}

#[derive(Debug)]
struct Ledger {
    pool: U256,
    tickets: u64,
    price: U256,
    round: U256,
    owners: HashMap<Address, u64>,
    failing: HashSet<ReadMethod>,
    calls: HashMap<ReadMethod, usize>,
    reject_next_signature: bool,
    revert_next_purchase: bool,
    fail_listener_attach: bool,
    next_tx: u64,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            pool: U256::ZERO,
            tickets: 0,
            price: default_ticket_price(),
            round: U256::from(1),
            owners: HashMap::new(),
            failing: HashSet::new(),
            calls: HashMap::new(),
            reject_next_signature: false,
            revert_next_purchase: false,
            fail_listener_attach: false,
            next_tx: 0,
        }
    }
}

struct ListenerGuard(Arc<AtomicUsize>);

impl ListenerGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A lottery contract living in memory. Clones share the same ledger.
#[derive(Clone)]
pub struct FakeLottery {
    address: Address,
    ledger: Arc<Mutex<Ledger>>,
    gate: Arc<watch::Sender<bool>>,
    reads_started: Arc<watch::Sender<usize>>,
    purchases: broadcast::Sender<PurchaseEvent>,
    live_listeners: Arc<AtomicUsize>,
}

impl Default for FakeLottery {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLottery {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        let (reads_started, _) = watch::channel(0);
        let (purchases, _) = broadcast::channel(64);
        Self {
            address: Address::repeat_byte(0x42),
            ledger: Arc::new(Mutex::new(Ledger::default())),
            gate: Arc::new(gate),
            reads_started: Arc::new(reads_started),
            purchases,
            live_listeners: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn price(&self) -> U256 {
        self.ledger().price
    }

    pub fn set_price(&self, price: U256) {
        self.ledger().price = price;
    }

    pub fn set_round(&self, round: U256) {
        self.ledger().round = round;
    }

    pub fn tickets_sold(&self) -> u64 {
        self.ledger().tickets
    }

    pub fn pool(&self) -> U256 {
        self.ledger().pool
    }

    /// Record `count` purchases by `owner` without emitting events.
    pub fn seed_tickets(&self, owner: Address, count: u64) {
        let mut ledger = self.ledger();
        let price = ledger.price;
        ledger.tickets += count;
        ledger.pool += price * U256::from(count);
        *ledger.owners.entry(owner).or_default() += count;
    }

    pub fn fail_method(&self, method: ReadMethod) {
        self.ledger().failing.insert(method);
    }

    /// Clear injected read and listener failures.
    pub fn heal(&self) {
        let mut ledger = self.ledger();
        ledger.failing.clear();
        ledger.fail_listener_attach = false;
    }

    pub fn calls_to(&self, method: ReadMethod) -> usize {
        self.ledger().calls.get(&method).copied().unwrap_or(0)
    }

    pub fn reject_next_signature(&self) {
        self.ledger().reject_next_signature = true;
    }

    pub fn revert_next_purchase(&self) {
        self.ledger().revert_next_purchase = true;
    }

    pub fn fail_listener_attach(&self) {
        self.ledger().fail_listener_attach = true;
    }

    /// Reads started from now on block until `resume_reads`.
    pub fn pause_reads(&self) {
        self.gate.send_replace(false);
    }

    pub fn resume_reads(&self) {
        self.gate.send_replace(true);
    }

    pub async fn wait_for_reads(&self, count: usize) {
        let mut started = self.reads_started.subscribe();
        let _ = started.wait_for(|n| *n >= count).await;
    }

    pub fn live_listeners(&self) -> usize {
        self.live_listeners.load(Ordering::SeqCst)
    }

    /// Broadcast a purchase event without touching the ledger.
    pub fn emit_purchase(&self, buyer: Address) {
        let round = self.ledger().round;
        let _ = self.purchases.send(PurchaseEvent {
            buyer,
            round,
            tx_hash: None,
        });
    }

    fn apply_purchase(&self, buyer: Address, value: U256, tx_hash: TxHash) -> bool {
        let round = {
            let mut ledger = self.ledger();
            if value < ledger.price {
                return false;
            }
            ledger.tickets += 1;
            ledger.pool += value;
            *ledger.owners.entry(buyer).or_default() += 1;
            ledger.round
        };
        let _ = self.purchases.send(PurchaseEvent {
            buyer,
            round,
            tx_hash: Some(tx_hash),
        });
        true
    }

    async fn read(
        &self,
        method: ReadMethod,
        value: impl FnOnce(&Ledger) -> U256 + Send,
    ) -> Result<U256, ChainError> {
        self.reads_started.send_modify(|n| *n += 1);
        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let mut ledger = self.ledger();
        *ledger.calls.entry(method).or_default() += 1;
        if ledger.failing.contains(&method) {
            return Err(ChainError::call(method.name(), "injected failure"));
        }
        Ok(value(&ledger))
    }
}

impl LotteryReader for FakeLottery {
    fn prize_pool(&self) -> BoxFuture<'_, Result<U256, ChainError>> {
        self.read(ReadMethod::PrizePool, |ledger| ledger.pool).boxed()
    }

    fn tickets_count(&self) -> BoxFuture<'_, Result<U256, ChainError>> {
        self.read(ReadMethod::TicketsCount, |ledger| U256::from(ledger.tickets))
            .boxed()
    }

    fn ticket_price(&self) -> BoxFuture<'_, Result<U256, ChainError>> {
        self.read(ReadMethod::TicketPrice, |ledger| ledger.price).boxed()
    }

    fn tickets_of(&self, owner: Address) -> BoxFuture<'_, Result<U256, ChainError>> {
        self.read(ReadMethod::TicketsOf, move |ledger| {
            U256::from(ledger.owners.get(&owner).copied().unwrap_or(0))
        })
        .boxed()
    }

    fn round(&self) -> BoxFuture<'_, Result<U256, ChainError>> {
        self.read(ReadMethod::Round, |ledger| ledger.round).boxed()
    }
}

impl PurchaseEvents for FakeLottery {
    fn attach(&self, contract: Address) -> BoxFuture<'_, Result<PurchaseStream, ChainError>> {
        async move {
            if contract != self.address {
                return Err(ChainError::Stream(format!("no contract at {contract}")));
            }
            if self.ledger().fail_listener_attach {
                return Err(ChainError::Stream("injected attach failure".to_string()));
            }
            let guard = ListenerGuard::new(Arc::clone(&self.live_listeners));
            let receiver = self.purchases.subscribe();
            let events = stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) => return Some((Ok(event), (receiver, guard))),
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            });
            Ok(events.boxed())
        }
        .boxed()
    }
}

/// Signs by mutating the fake ledger once the "transaction" is confirmed.
#[derive(Clone)]
pub struct FakeSigner {
    lottery: FakeLottery,
    address: Address,
}

impl FakeSigner {
    pub fn new(lottery: &FakeLottery, address: Address) -> Self {
        Self {
            lottery: lottery.clone(),
            address,
        }
    }
}

impl PurchaseSigner for FakeSigner {
    fn address(&self) -> Address {
        self.address
    }

    fn buy_ticket(
        &self,
        contract: Address,
        value: U256,
    ) -> BoxFuture<'_, Result<PendingPurchase, WalletError>> {
        async move {
            if contract != self.lottery.address {
                return Err(WalletError::Failed(format!("no contract at {contract}")));
            }
            let (tx_hash, reverts) = {
                let mut ledger = self.lottery.ledger();
                if std::mem::take(&mut ledger.reject_next_signature) {
                    return Err(WalletError::Rejected);
                }
                ledger.next_tx += 1;
                let tx_hash = TxHash::left_padding_from(&ledger.next_tx.to_be_bytes());
                (tx_hash, std::mem::take(&mut ledger.revert_next_purchase))
            };

            let lottery = self.lottery.clone();
            let buyer = self.address;
            let confirmation = async move {
                if reverts {
                    return Ok(false);
                }
                Ok(lottery.apply_purchase(buyer, value, tx_hash))
            };
            Ok(PendingPurchase::new(tx_hash, value, confirmation))
        }
        .boxed()
    }
}

#[derive(Debug)]
struct WalletState {
    accounts: Vec<Address>,
    declines: bool,
    chain_id: u64,
}

/// Wallet provider that authorizes without prompting, unless the prompt is
/// held open with `hold_prompt`.
#[derive(Clone)]
pub struct FakeWallet {
    lottery: FakeLottery,
    state: Arc<Mutex<WalletState>>,
    prompt: Arc<watch::Sender<bool>>,
    notifications: broadcast::Sender<ProviderNotification>,
}

impl FakeWallet {
    pub fn new(lottery: &FakeLottery) -> Self {
        let (notifications, _) = broadcast::channel(16);
        let (prompt, _) = watch::channel(true);
        Self {
            lottery: lottery.clone(),
            state: Arc::new(Mutex::new(WalletState {
                accounts: vec![Address::repeat_byte(0xA1)],
                declines: false,
                chain_id: FAKE_CHAIN_ID,
            })),
            prompt: Arc::new(prompt),
            notifications,
        }
    }

    fn state(&self) -> MutexGuard<'_, WalletState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn account(&self) -> Address {
        self.state()
            .accounts
            .first()
            .copied()
            .unwrap_or(Address::ZERO)
    }

    pub fn decline_access(&self) {
        self.state().declines = true;
    }

    /// Account requests from now on wait until `release_prompt`.
    pub fn hold_prompt(&self) {
        self.prompt.send_replace(false);
    }

    pub fn release_prompt(&self) {
        self.prompt.send_replace(true);
    }

    pub fn authorize_nothing(&self) {
        self.state().accounts.clear();
    }

    /// Switch the active account and tell subscribers.
    pub fn switch_account(&self, account: Address) {
        self.state().accounts = vec![account];
        self.notify(ProviderNotification::AccountsChanged(vec![account]));
    }

    /// Switch networks and tell subscribers.
    pub fn switch_chain(&self, chain_id: u64) {
        self.state().chain_id = chain_id;
        self.notify(ProviderNotification::ChainChanged(chain_id));
    }

    pub fn notify(&self, notification: ProviderNotification) {
        let _ = self.notifications.send(notification);
    }
}

impl WalletProvider for FakeWallet {
    fn request_accounts(&self) -> BoxFuture<'_, Result<Vec<Address>, WalletError>> {
        async move {
            let mut prompt = self.prompt.subscribe();
            let _ = prompt.wait_for(|answered| *answered).await;

            let state = self.state();
            if state.declines {
                return Err(WalletError::Rejected);
            }
            Ok(state.accounts.clone())
        }
        .boxed()
    }

    fn chain_id(&self) -> BoxFuture<'_, Result<u64, WalletError>> {
        async move { Ok(self.state().chain_id) }.boxed()
    }

    fn signer_for(&self, account: Address) -> Result<Arc<dyn PurchaseSigner>, WalletError> {
        if !self.state().accounts.contains(&account) {
            return Err(WalletError::Failed(format!("{account} is not authorized")));
        }
        Ok(Arc::new(FakeSigner::new(&self.lottery, account)))
    }

    fn subscribe(&self) -> BoxStream<'static, ProviderNotification> {
        let receiver = self.notifications.subscribe();
        stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(notification) => return Some((notification, receiver)),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .boxed()
    }
}

/// A connected session whose signer buys on `lottery`.
pub fn connected_session(lottery: &FakeLottery) -> Session {
    let address = Address::repeat_byte(0xB2);
    Session {
        address,
        chain_id: FAKE_CHAIN_ID,
        generation: 1,
        signer: SignerHandle::new(Arc::new(FakeSigner::new(lottery, address))),
    }
}
