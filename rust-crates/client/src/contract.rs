use crate::{
    error::{
        ChainError,
        LotteryError,
        Result,
        WalletError,
    },
    session::{
        Session,
        SessionReader,
    },
};
use alloy::primitives::{
    Address,
    TxHash,
    U256,
};
use chrono::{
    DateTime,
    Utc,
};
use futures::future::{
    BoxFuture,
    FutureExt,
};
use std::{
    fmt,
    future::Future,
    sync::Arc,
};
use tracing::{
    debug,
    info,
};

/// Read side of the lottery ABI.
pub trait LotteryReader: Send + Sync {
    fn prize_pool(&self) -> BoxFuture<'_, Result<U256, ChainError>>;
    fn tickets_count(&self) -> BoxFuture<'_, Result<U256, ChainError>>;
    fn ticket_price(&self) -> BoxFuture<'_, Result<U256, ChainError>>;
    fn tickets_of(&self, owner: Address) -> BoxFuture<'_, Result<U256, ChainError>>;
    fn round(&self) -> BoxFuture<'_, Result<U256, ChainError>>;
}

/// Write side of the lottery ABI, bound to one authorized account.
pub trait PurchaseSigner: Send + Sync {
    fn address(&self) -> Address;

    /// Submit a value-bearing `buyTicket()` call.
    fn buy_ticket(
        &self,
        contract: Address,
        value: U256,
    ) -> BoxFuture<'_, Result<PendingPurchase, WalletError>>;
}

/// Where the purchase value comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TicketPricing {
    /// Read `ticketPrice()` right before each purchase.
    OnChain,
    /// The contract does not expose a price; send this many wei.
    Fixed(U256),
}

/// Price the reference deployment charges: 30 whole units of the native token.
pub fn default_ticket_price() -> U256 {
    U256::from(30_000_000_000_000_000_000u128)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainSnapshot {
    pub pool_balance: U256,
    pub ticket_count: u64,
    /// The configured price verbatim when pricing is fixed.
    pub ticket_price: Option<U256>,
    pub caller_ticket_count: u64,
    pub round: u64,
    /// Account `caller_ticket_count` was read for.
    pub caller: Option<Address>,
    pub fetched_at: DateTime<Utc>,
}

/// A submitted purchase whose inclusion has not been observed yet.
pub struct PendingPurchase {
    tx_hash: TxHash,
    value: U256,
    confirmation: BoxFuture<'static, Result<bool, ChainError>>,
}

impl fmt::Debug for PendingPurchase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingPurchase")
            .field("tx_hash", &self.tx_hash)
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PurchaseReceipt {
    pub tx_hash: TxHash,
    pub value: U256,
}

impl PendingPurchase {
    /// `confirmation` resolves to the receipt status: `true` for success.
    pub fn new(
        tx_hash: TxHash,
        value: U256,
        confirmation: impl Future<Output = Result<bool, ChainError>> + Send + 'static,
    ) -> Self {
        Self {
            tx_hash,
            value,
            confirmation: confirmation.boxed(),
        }
    }

    pub fn tx_hash(&self) -> TxHash {
        self.tx_hash
    }

    pub fn value(&self) -> U256 {
        self.value
    }

    pub async fn confirmed(self) -> Result<PurchaseReceipt> {
        let Self {
            tx_hash,
            value,
            confirmation,
        } = self;
        let succeeded = confirmation.await.map_err(|err| {
            LotteryError::ReadFailure(format!(
                "could not confirm transaction {tx_hash}: {err}"
            ))
        })?;
        if !succeeded {
            return Err(LotteryError::TransactionReverted(tx_hash));
        }
        info!(%tx_hash, "ticket purchase confirmed");
        Ok(PurchaseReceipt { tx_hash, value })
    }
}

/// Typed binding to the lottery contract. Reads go through the read-only
/// client; the single write goes through whatever signer the current session
/// holds.
#[derive(Clone)]
pub struct LotteryContract {
    address: Address,
    reader: Arc<dyn LotteryReader>,
    pricing: TicketPricing,
}

impl fmt::Debug for LotteryContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LotteryContract")
            .field("address", &self.address)
            .field("pricing", &self.pricing)
            .finish_non_exhaustive()
    }
}

impl LotteryContract {
    pub fn new(
        address: Address,
        reader: Arc<dyn LotteryReader>,
        pricing: TicketPricing,
    ) -> Self {
        Self {
            address,
            reader,
            pricing,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn pricing(&self) -> TicketPricing {
        self.pricing
    }

    /// One consistent read of the aggregate state. Any failing call fails the
    /// whole read.
    pub async fn read_aggregate(&self, caller: Option<Address>) -> Result<ChainSnapshot> {
        let reader = self.reader.as_ref();
        let price = async {
            match self.pricing {
                TicketPricing::OnChain => reader.ticket_price().await.map(Some),
                TicketPricing::Fixed(price) => Ok(Some(price)),
            }
        };
        let caller_count = async {
            match caller {
                Some(owner) => reader.tickets_of(owner).await,
                None => Ok(U256::ZERO),
            }
        };

        let (pool_balance, ticket_count, round, ticket_price, caller_count) = futures::try_join!(
            reader.prize_pool(),
            reader.tickets_count(),
            reader.round(),
            price,
            caller_count,
        )
        .map_err(|err| LotteryError::ReadFailure(err.to_string()))?;

        let snapshot = ChainSnapshot {
            pool_balance,
            ticket_count: to_u64("ticketsCount", ticket_count)?,
            ticket_price,
            caller_ticket_count: to_u64("ticketsOf", caller_count)?,
            round: to_u64("round", round)?,
            caller,
            fetched_at: Utc::now(),
        };
        debug!(?snapshot, "aggregate read complete");
        Ok(snapshot)
    }

    /// Price to send with the next purchase.
    pub async fn resolve_ticket_price(&self) -> Result<U256> {
        match self.pricing {
            TicketPricing::Fixed(price) => Ok(price),
            TicketPricing::OnChain => self
                .reader
                .ticket_price()
                .await
                .map_err(|err| LotteryError::ReadFailure(err.to_string())),
        }
    }

    /// Submit one ticket purchase for the connected account.
    ///
    /// The price is resolved once, before the transaction is built. The
    /// session is looked up again after that read and must be the same one.
    pub async fn submit_purchase(&self, sessions: &SessionReader) -> Result<PendingPurchase> {
        let generation = connected_session(sessions)?.generation;
        let value = self.resolve_ticket_price().await?;

        let session = connected_session(sessions)?;
        if session.generation != generation {
            return Err(LotteryError::NoSigner);
        }
        info!(
            account = %session.address,
            contract = %self.address,
            %value,
            "submitting ticket purchase"
        );
        let pending = session.signer.buy_ticket(self.address, value).await?;
        info!(tx_hash = %pending.tx_hash(), "ticket purchase submitted");
        Ok(pending)
    }
}

fn connected_session(sessions: &SessionReader) -> Result<Session> {
    sessions
        .borrow()
        .session()
        .cloned()
        .ok_or(LotteryError::NoSigner)
}

fn to_u64(method: &'static str, value: U256) -> Result<u64> {
    u64::try_from(value).map_err(|_| {
        LotteryError::ReadFailure(
            ChainError::OutOfRange {
                method,
                value: value.to_string(),
            }
            .to_string(),
        )
    })
}
