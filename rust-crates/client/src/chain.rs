use crate::{
    contract::{
        LotteryReader,
        PendingPurchase,
        PurchaseSigner,
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
};
use alloy::{
    network::EthereumWallet,
    primitives::{
        Address,
        U256,
    },
    providers::{
        DynProvider,
        Provider,
        ProviderBuilder,
    },
    signers::local::PrivateKeySigner,
    transports::http::reqwest::Url,
};
use futures::{
    FutureExt,
    StreamExt,
    future::BoxFuture,
};
use generated_abi::ImprovedLottery;
use tracing::debug;

/// Public JSON-RPC endpoint. Needs no wallet.
#[derive(Clone)]
pub struct ChainClient {
    url: Url,
    provider: DynProvider,
}

impl ChainClient {
    pub fn connect(rpc_url: &str) -> Result<Self, ChainError> {
        let url = rpc_url
            .parse::<Url>()
            .map_err(|err| ChainError::InvalidUrl {
                url: rpc_url.to_string(),
                message: err.to_string(),
            })?;
        let provider = ProviderBuilder::new().connect_http(url.clone()).erased();
        debug!(%url, "read-only chain client ready");
        Ok(Self { url, provider })
    }

    pub async fn chain_id(&self) -> Result<u64, ChainError> {
        self.provider
            .get_chain_id()
            .await
            .map_err(|err| ChainError::call("eth_chainId", err))
    }

    pub fn lottery(&self, address: Address) -> RpcLottery {
        RpcLottery {
            address,
            provider: self.provider.clone(),
        }
    }

    /// Signer that submits through this endpoint with `key`.
    pub fn signer(&self, key: PrivateKeySigner) -> RpcSigner {
        let address = key.address();
        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(key))
            .connect_http(self.url.clone())
            .erased();
        RpcSigner { address, provider }
    }
}

/// The lottery contract as seen through the read-only client.
#[derive(Clone)]
pub struct RpcLottery {
    address: Address,
    provider: DynProvider,
}

impl RpcLottery {
    pub fn address(&self) -> Address {
        self.address
    }

    fn instance(&self) -> ImprovedLottery::ImprovedLotteryInstance<DynProvider> {
        ImprovedLottery::new(self.address, self.provider.clone())
    }
}

impl LotteryReader for RpcLottery {
    fn prize_pool(&self) -> BoxFuture<'_, Result<U256, ChainError>> {
        async move {
            self.instance()
                .prizePool()
                .call()
                .await
                .map_err(|err| ChainError::call("prizePool", err))
        }
        .boxed()
    }

    fn tickets_count(&self) -> BoxFuture<'_, Result<U256, ChainError>> {
        async move {
            self.instance()
                .ticketsCount()
                .call()
                .await
                .map_err(|err| ChainError::call("ticketsCount", err))
        }
        .boxed()
    }

    fn ticket_price(&self) -> BoxFuture<'_, Result<U256, ChainError>> {
        async move {
            self.instance()
                .ticketPrice()
                .call()
                .await
                .map_err(|err| ChainError::call("ticketPrice", err))
        }
        .boxed()
    }

    fn tickets_of(&self, owner: Address) -> BoxFuture<'_, Result<U256, ChainError>> {
        async move {
            self.instance()
                .ticketsOf(owner)
                .call()
                .await
                .map_err(|err| ChainError::call("ticketsOf", err))
        }
        .boxed()
    }

    fn round(&self) -> BoxFuture<'_, Result<U256, ChainError>> {
        async move {
            self.instance()
                .round()
                .call()
                .await
                .map_err(|err| ChainError::call("round", err))
        }
        .boxed()
    }
}

impl PurchaseEvents for RpcLottery {
    fn attach(&self, contract: Address) -> BoxFuture<'_, Result<PurchaseStream, ChainError>> {
        async move {
            let poller = ImprovedLottery::new(contract, self.provider.clone())
                .TicketBought_filter()
                .watch()
                .await
                .map_err(|err| ChainError::Stream(err.to_string()))?;
            let events = poller.into_stream().map(|item| {
                item.map(|(event, log)| PurchaseEvent {
                    buyer: event.buyer,
                    round: event.round,
                    tx_hash: log.transaction_hash,
                })
                .map_err(|err| ChainError::Stream(err.to_string()))
            });
            Ok(events.boxed())
        }
        .boxed()
    }
}

/// Submits `buyTicket()` from a local key.
#[derive(Clone)]
pub struct RpcSigner {
    address: Address,
    provider: DynProvider,
}

impl PurchaseSigner for RpcSigner {
    fn address(&self) -> Address {
        self.address
    }

    fn buy_ticket(
        &self,
        contract: Address,
        value: U256,
    ) -> BoxFuture<'_, Result<PendingPurchase, WalletError>> {
        async move {
            let pending = ImprovedLottery::new(contract, self.provider.clone())
                .buyTicket()
                .from(self.address)
                .value(value)
                .send()
                .await
                .map_err(|err| WalletError::Failed(err.to_string()))?;
            let tx_hash = *pending.tx_hash();
            let confirmation = async move {
                pending
                    .get_receipt()
                    .await
                    .map(|receipt| receipt.status())
                    .map_err(|err| ChainError::call("eth_getTransactionReceipt", err))
            };
            Ok(PendingPurchase::new(tx_hash, value, confirmation))
        }
        .boxed()
    }
}
