use crate::{
    display::{
        NATIVE_SYMBOL,
        format_units,
        short_address,
    },
    error::{
        ChainError,
        LotteryError,
        Result,
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
use futures::{
    StreamExt,
    future::BoxFuture,
    stream::BoxStream,
};
use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{
    debug,
    info,
    warn,
};

pub const FEED_CAPACITY: usize = 30;
pub const FEED_STOPPED_MESSAGE: &str = "Live feed interrupted; reconnecting on next sync";

/// A decoded `TicketBought` log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PurchaseEvent {
    pub buyer: Address,
    pub round: U256,
    pub tx_hash: Option<TxHash>,
}

pub type PurchaseStream = BoxStream<'static, Result<PurchaseEvent, ChainError>>;

/// Source of live purchase notifications for a contract.
pub trait PurchaseEvents: Send + Sync {
    fn attach(&self, contract: Address) -> BoxFuture<'_, Result<PurchaseStream, ChainError>>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedEntry {
    pub display_text: String,
    pub observed_at: DateTime<Utc>,
}

impl FeedEntry {
    /// `price` is what a ticket costs right now; the log itself carries no
    /// amount.
    pub fn for_purchase(
        event: &PurchaseEvent,
        price: Option<U256>,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let buyer = short_address(&event.buyer);
        let display_text = match price {
            Some(price) => format!(
                "{buyer} bought a ticket for {} {NATIVE_SYMBOL} (round {})",
                format_units(price, 2),
                event.round
            ),
            None => format!("{buyer} bought a ticket (round {})", event.round),
        };
        Self {
            display_text,
            observed_at,
        }
    }
}

/// Recent activity, newest first, never longer than `FEED_CAPACITY`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Feed {
    entries: VecDeque<FeedEntry>,
}

impl Feed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: FeedEntry) {
        self.entries.push_front(entry);
        self.entries.truncate(FEED_CAPACITY);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn latest(&self) -> Option<&FeedEntry> {
        self.entries.front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeedEntry> {
        self.entries.iter()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedEvent {
    Purchase {
        event: PurchaseEvent,
        observed_at: DateTime<Utc>,
    },
    ListenerFailed(String),
}

struct Listener {
    contract: Address,
    live: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Keeps at most one live purchase subscription and forwards observed
/// purchases to the controller.
pub struct FeedSubscriber {
    events_tx: mpsc::UnboundedSender<FeedEvent>,
    listener: Option<Listener>,
}

impl FeedSubscriber {
    pub fn new(events_tx: mpsc::UnboundedSender<FeedEvent>) -> Self {
        Self {
            events_tx,
            listener: None,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.listener
            .as_ref()
            .is_some_and(|listener| !listener.task.is_finished())
    }

    pub async fn attach(&mut self, source: &dyn PurchaseEvents, contract: Address) -> Result<()> {
        self.detach();

        let stream = source.attach(contract).await.map_err(|err| {
            warn!(%contract, error = %err, "failed to attach purchase listener");
            LotteryError::ListenerAttachError(err.to_string())
        })?;

        let live = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(forward_events(
            stream,
            self.events_tx.clone(),
            Arc::clone(&live),
        ));
        self.listener = Some(Listener {
            contract,
            live,
            task,
        });
        info!(%contract, "purchase feed attached");
        Ok(())
    }

    pub fn detach(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.live.store(false, Ordering::SeqCst);
            listener.task.abort();
            debug!(contract = %listener.contract, "purchase feed detached");
        }
    }
}

impl Drop for FeedSubscriber {
    fn drop(&mut self) {
        self.detach();
    }
}

async fn forward_events(
    mut stream: PurchaseStream,
    events_tx: mpsc::UnboundedSender<FeedEvent>,
    live: Arc<AtomicBool>,
) {
    while let Some(next) = stream.next().await {
        if !live.load(Ordering::SeqCst) {
            return;
        }
        match next {
            Ok(event) => {
                debug!(buyer = %event.buyer, round = %event.round, "ticket purchase observed");
                let observed = FeedEvent::Purchase {
                    event,
                    observed_at: Utc::now(),
                };
                if events_tx.send(observed).is_err() {
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "skipping undecodable purchase event");
            }
        }
    }

    if live.load(Ordering::SeqCst) {
        warn!("purchase event stream ended");
        let _ = events_tx.send(FeedEvent::ListenerFailed(
            FEED_STOPPED_MESSAGE.to_string(),
        ));
    }
}
