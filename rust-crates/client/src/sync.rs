use crate::{
    contract::{
        ChainSnapshot,
        LotteryContract,
    },
    session::SessionReader,
};
use std::{
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    time::Duration,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{
        self,
        MissedTickBehavior,
    },
};
use tracing::{
    debug,
    info,
    warn,
};

pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    Snapshot(ChainSnapshot),
    /// The previous snapshot stays authoritative.
    ReadFailed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Polling,
}

enum SyncCommand {
    FetchNow,
    Shutdown,
}

struct Worker {
    live: Arc<AtomicBool>,
    cmd_tx: mpsc::UnboundedSender<SyncCommand>,
    task: JoinHandle<()>,
}

/// Re-reads the aggregate contract state on a timer and on demand.
pub struct Synchronizer {
    contract: LotteryContract,
    sessions: SessionReader,
    poll_interval: Duration,
    worker: Option<Worker>,
}

impl Synchronizer {
    pub fn new(
        contract: LotteryContract,
        sessions: SessionReader,
        poll_interval: Duration,
    ) -> Self {
        Self {
            contract,
            sessions,
            poll_interval,
            worker: None,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        match &self.worker {
            Some(worker) if !worker.task.is_finished() => SyncPhase::Polling,
            _ => SyncPhase::Idle,
        }
    }

    /// Read once immediately, then every poll interval, until `stop`.
    pub fn start(&mut self, events_tx: mpsc::UnboundedSender<SyncEvent>) {
        self.stop();

        let live = Arc::new(AtomicBool::new(true));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(sync_worker(
            self.contract.clone(),
            self.sessions.clone(),
            self.poll_interval,
            Arc::clone(&live),
            cmd_rx,
            events_tx,
        ));
        self.worker = Some(Worker { live, cmd_tx, task });
        info!(
            contract = %self.contract.address(),
            interval_secs = self.poll_interval.as_secs(),
            "synchronizer started"
        );
    }

    /// Ask for one extra pass right away. Returns false when not polling.
    pub fn refresh_now(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| worker.cmd_tx.send(SyncCommand::FetchNow).is_ok())
    }

    /// Anything still in flight finishes in the background and is dropped.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.live.store(false, Ordering::SeqCst);
            let _ = worker.cmd_tx.send(SyncCommand::Shutdown);
            debug!("synchronizer stopping");
        }
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sync_worker(
    contract: LotteryContract,
    sessions: SessionReader,
    poll_interval: Duration,
    live: Arc<AtomicBool>,
    mut cmd_rx: mpsc::UnboundedReceiver<SyncCommand>,
    events_tx: mpsc::UnboundedSender<SyncEvent>,
) {
    let mut ticker = time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SyncCommand::FetchNow) => {}
                    Some(SyncCommand::Shutdown) | None => break,
                }
            }
        }
        if !live.load(Ordering::SeqCst) {
            break;
        }
        if !poll_once(&contract, &sessions, &live, &events_tx).await {
            break;
        }
    }
    debug!("synchronizer stopped");
}

async fn poll_once(
    contract: &LotteryContract,
    sessions: &SessionReader,
    live: &AtomicBool,
    events_tx: &mpsc::UnboundedSender<SyncEvent>,
) -> bool {
    let caller = sessions.borrow().address();
    debug!(?caller, "polling contract state");
    let event = match contract.read_aggregate(caller).await {
        Ok(snapshot) => SyncEvent::Snapshot(snapshot),
        Err(err) => {
            warn!(error = %err, "poll failed; keeping previous snapshot");
            SyncEvent::ReadFailed(err.to_string())
        }
    };
    if !live.load(Ordering::SeqCst) {
        debug!("discarding poll result that finished after shutdown");
        return false;
    }
    events_tx.send(event).is_ok()
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::{
        contract::TicketPricing,
        session::SessionState,
        test_helpers::{
            FakeLottery,
            ReadMethod,
        },
    };
    use alloy::primitives::Address;
    use tokio::{
        sync::watch,
        time::Instant,
    };

    fn synchronizer_for(lottery: &FakeLottery) -> (Synchronizer, watch::Sender<SessionState>) {
        let contract = LotteryContract::new(
            lottery.address(),
            Arc::new(lottery.clone()),
            TicketPricing::OnChain,
        );
        let (sessions_tx, sessions) = watch::channel(SessionState::Disconnected);
        (
            Synchronizer::new(contract, sessions, POLL_INTERVAL),
            sessions_tx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn start__publishes_immediately_then_on_interval() {
        // given
        let lottery = FakeLottery::new();
        let (mut sync, _sessions) = synchronizer_for(&lottery);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let started = Instant::now();

        // when
        sync.start(tx);
        let first = rx.recv().await;
        let first_at = started.elapsed();
        let second = rx.recv().await;

        // then
        assert!(matches!(first, Some(SyncEvent::Snapshot(_))));
        assert!(matches!(second, Some(SyncEvent::Snapshot(_))));
        assert!(first_at < POLL_INTERVAL);
        assert!(started.elapsed() >= POLL_INTERVAL);
        assert_eq!(sync.phase(), SyncPhase::Polling);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll__reports_and_keeps_timer_running() {
        // given
        let lottery = FakeLottery::new();
        lottery.fail_method(ReadMethod::PrizePool);
        let (mut sync, _sessions) = synchronizer_for(&lottery);
        let (tx, mut rx) = mpsc::unbounded_channel();

        // when
        sync.start(tx);
        let failed = rx.recv().await;
        lottery.heal();
        let recovered = rx.recv().await;

        // then
        assert!(matches!(failed, Some(SyncEvent::ReadFailed(_))));
        assert!(matches!(recovered, Some(SyncEvent::Snapshot(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_now__runs_an_extra_pass_before_the_next_tick() {
        // given
        let lottery = FakeLottery::new();
        let (mut sync, _sessions) = synchronizer_for(&lottery);
        let (tx, mut rx) = mpsc::unbounded_channel();
        sync.start(tx);
        let _ = rx.recv().await;
        lottery.seed_tickets(Address::repeat_byte(1), 2);
        let requested_at = Instant::now();

        // when
        assert!(sync.refresh_now());
        let refreshed = rx.recv().await;

        // then
        let Some(SyncEvent::Snapshot(snapshot)) = refreshed else {
            panic!("expected a snapshot, got {refreshed:?}");
        };
        assert_eq!(snapshot.ticket_count, 2);
        assert!(requested_at.elapsed() < POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn poll__reads_caller_count_for_current_session() {
        // given
        let lottery = FakeLottery::new();
        let (mut sync, sessions) = synchronizer_for(&lottery);
        let (tx, mut rx) = mpsc::unbounded_channel();
        sync.start(tx);
        let Some(SyncEvent::Snapshot(anonymous)) = rx.recv().await else {
            panic!("expected a snapshot");
        };

        // when
        let session = crate::test_helpers::connected_session(&lottery);
        let account = session.address;
        lottery.seed_tickets(account, 1);
        sessions.send_replace(SessionState::Connected(session));
        sync.refresh_now();
        let Some(SyncEvent::Snapshot(personal)) = rx.recv().await else {
            panic!("expected a snapshot");
        };

        // then
        assert_eq!(anonymous.caller, None);
        assert_eq!(personal.caller, Some(account));
        assert_eq!(personal.caller_ticket_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop__discards_result_of_in_flight_poll() {
        // given
        let lottery = FakeLottery::new();
        lottery.pause_reads();
        let (mut sync, _sessions) = synchronizer_for(&lottery);
        let (tx, mut rx) = mpsc::unbounded_channel();
        sync.start(tx);
        lottery.wait_for_reads(1).await;

        // when
        sync.stop();
        lottery.resume_reads();

        // then
        assert_eq!(rx.recv().await, None);
        assert_eq!(sync.phase(), SyncPhase::Idle);
    }
}
