use crate::{
    contract::{
        PendingPurchase,
        PurchaseSigner,
    },
    error::{
        LotteryError,
        Result,
        WalletError,
    },
};
use alloy::primitives::{
    Address,
    U256,
};
use futures::{
    StreamExt,
    future::BoxFuture,
    stream::BoxStream,
};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
};
use tokio::{
    sync::watch,
    task::JoinHandle,
};
use tracing::{
    debug,
    info,
    warn,
};

pub const ACCOUNT_CHANGED_MESSAGE: &str = "Wallet account changed; reconnect to continue";
pub const NETWORK_CHANGED_MESSAGE: &str = "Wallet network changed; reconnect to continue";
pub const NO_WALLET_MESSAGE: &str = "No wallet configured";

/// Something that can hand out accounts and signers, and tell us when the
/// user changes either underneath us.
pub trait WalletProvider: Send + Sync {
    /// Ask the user to authorize account access. An empty list means the user
    /// authorized nothing.
    fn request_accounts(&self) -> BoxFuture<'_, Result<Vec<Address>, WalletError>>;

    fn chain_id(&self) -> BoxFuture<'_, Result<u64, WalletError>>;

    /// Signer for an account previously returned by `request_accounts`.
    fn signer_for(&self, account: Address) -> Result<Arc<dyn PurchaseSigner>, WalletError>;

    fn subscribe(&self) -> BoxStream<'static, ProviderNotification>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderNotification {
    AccountsChanged(Vec<Address>),
    ChainChanged(u64),
}

/// Signer capability owned by one session. Once revoked it refuses to sign,
/// even if someone kept a clone.
#[derive(Clone)]
pub struct SignerHandle {
    signer: Arc<dyn PurchaseSigner>,
    revoked: Arc<AtomicBool>,
}

impl SignerHandle {
    pub fn new(signer: Arc<dyn PurchaseSigner>) -> Self {
        Self {
            signer,
            revoked: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn revoke(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    pub async fn buy_ticket(&self, contract: Address, value: U256) -> Result<PendingPurchase> {
        if self.is_revoked() {
            return Err(LotteryError::NoSigner);
        }
        self.signer
            .buy_ticket(contract, value)
            .await
            .map_err(WalletError::into_submission_error)
    }
}

#[derive(Clone)]
pub struct Session {
    pub address: Address,
    pub chain_id: u64,
    /// Bumped on every successful connect.
    pub generation: u64,
    pub signer: SignerHandle,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("address", &self.address)
            .field("chain_id", &self.chain_id)
            .field("generation", &self.generation)
            .field("revoked", &self.signer.is_revoked())
            .finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.chain_id == other.chain_id
            && self.generation == other.generation
    }
}

impl Eq for Session {}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected(Session),
    Error(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl SessionState {
    pub fn connection(&self) -> ConnectionState {
        match self {
            SessionState::Disconnected => ConnectionState::Disconnected,
            SessionState::Connecting => ConnectionState::Connecting,
            SessionState::Connected(_) => ConnectionState::Connected,
            SessionState::Error(message) => ConnectionState::Error(message.clone()),
        }
    }

    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionState::Connected(session) => Some(session),
            _ => None,
        }
    }

    pub fn address(&self) -> Option<Address> {
        self.session().map(|session| session.address)
    }
}

/// Read side of the session state. Borrow it at the moment of use.
pub type SessionReader = watch::Receiver<SessionState>;

/// Live subscription to wallet notifications for one session.
pub struct NotificationSubscription {
    live: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl NotificationSubscription {
    fn spawn(
        notifications: BoxStream<'static, ProviderNotification>,
        state: Arc<watch::Sender<SessionState>>,
        session: &Session,
    ) -> Self {
        let live = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(watch_for_changes(
            notifications,
            state,
            session.clone(),
            Arc::clone(&live),
        ));
        Self { live, task }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst) && !self.task.is_finished()
    }

    pub fn dispose(self) {
        // Drop does the work.
    }
}

impl Drop for NotificationSubscription {
    fn drop(&mut self) {
        self.live.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

async fn watch_for_changes(
    mut notifications: BoxStream<'static, ProviderNotification>,
    state: Arc<watch::Sender<SessionState>>,
    session: Session,
    live: Arc<AtomicBool>,
) {
    while let Some(notification) = notifications.next().await {
        if !live.load(Ordering::SeqCst) {
            return;
        }
        let reason = match notification {
            ProviderNotification::AccountsChanged(accounts) => {
                debug!(?accounts, "wallet accounts changed");
                ACCOUNT_CHANGED_MESSAGE
            }
            ProviderNotification::ChainChanged(chain_id) if chain_id != session.chain_id => {
                debug!(chain_id, "wallet network changed");
                NETWORK_CHANGED_MESSAGE
            }
            ProviderNotification::ChainChanged(_) => continue,
        };

        session.signer.revoke();
        let invalidated = state.send_if_modified(|current| {
            let is_ours = matches!(
                current,
                SessionState::Connected(active) if active.generation == session.generation
            );
            if is_ours {
                *current = SessionState::Error(reason.to_string());
            }
            is_ours
        });
        if invalidated {
            warn!(account = %session.address, reason, "session invalidated");
        }
        live.store(false, Ordering::SeqCst);
        return;
    }
}

/// Owns the wallet session. The only writer of `SessionState`.
pub struct SessionManager {
    provider: Option<Arc<dyn WalletProvider>>,
    state: Arc<watch::Sender<SessionState>>,
    subscription: Option<NotificationSubscription>,
    next_generation: u64,
}

impl SessionManager {
    pub fn new(provider: Option<Arc<dyn WalletProvider>>) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        Self {
            provider,
            state: Arc::new(state),
            subscription: None,
            next_generation: 0,
        }
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    pub fn reader(&self) -> SessionReader {
        self.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription
            .as_ref()
            .is_some_and(NotificationSubscription::is_live)
    }

    pub async fn connect(&mut self) -> Result<Session> {
        let Some(provider) = self.provider.clone() else {
            self.state
                .send_replace(SessionState::Error(NO_WALLET_MESSAGE.to_string()));
            return Err(LotteryError::WalletUnavailable);
        };

        self.release();
        self.state.send_replace(SessionState::Connecting);
        match self.open(provider).await {
            Ok(session) => {
                info!(
                    account = %session.address,
                    chain_id = session.chain_id,
                    generation = session.generation,
                    "wallet connected"
                );
                Ok(session)
            }
            Err(err) => {
                warn!(error = %err, "wallet connection failed");
                self.state.send_replace(SessionState::Error(err.to_string()));
                Err(err)
            }
        }
    }

    async fn open(&mut self, provider: Arc<dyn WalletProvider>) -> Result<Session> {
        let accounts = provider
            .request_accounts()
            .await
            .map_err(WalletError::into_access_error)?;
        let address = accounts.first().copied().ok_or(LotteryError::UserRejected)?;
        let chain_id = provider
            .chain_id()
            .await
            .map_err(WalletError::into_access_error)?;
        let signer = provider
            .signer_for(address)
            .map_err(WalletError::into_access_error)?;

        self.next_generation += 1;
        let session = Session {
            address,
            chain_id,
            generation: self.next_generation,
            signer: SignerHandle::new(signer),
        };

        let notifications = provider.subscribe();
        self.state
            .send_replace(SessionState::Connected(session.clone()));
        self.subscription = Some(NotificationSubscription::spawn(
            notifications,
            Arc::clone(&self.state),
            &session,
        ));
        Ok(session)
    }

    /// Forget the session locally. The wallet keeps whatever authorization it
    /// granted; only a new `connect` asks it again.
    pub fn disconnect(&mut self) {
        self.release();
        self.state.send_replace(SessionState::Disconnected);
        info!("wallet disconnected locally");
    }

    pub fn teardown(&mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.dispose();
        }
        if let Some(session) = self.state.borrow().session() {
            session.signer.revoke();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.release();
    }
}
