use super::TestContext;
use lottery_client::{
    LotteryContract,
    TicketPricing,
    sync::{
        SyncEvent,
        Synchronizer,
    },
    test_helpers::{
        FakeLottery,
        ReadMethod,
    },
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::sync::{
    mpsc,
    watch,
};

#[tokio::test]
async fn failed_poll__keeps_previous_snapshot() {
    let mut ctx = TestContext::new().await;
    // given
    let before = ctx.next_snapshot().await;

    // when
    ctx.lottery.fail_method(ReadMethod::TicketsCount);
    ctx.lottery.seed_tickets(ctx.wallet.account(), 4);
    ctx.controller.refresh();
    let event = ctx.next_sync().await;

    // then
    assert!(matches!(event, SyncEvent::ReadFailed(_)));
    let view = ctx.controller.view();
    assert_eq!(view.snapshot, Some(before));
    assert!(view.read_error.is_some());
}

#[tokio::test]
async fn failed_poll__heals_on_next_pass() {
    let mut ctx = TestContext::new().await;
    // given
    ctx.lottery.fail_method(ReadMethod::PrizePool);
    ctx.controller.refresh();
    let _ = ctx.next_sync().await;

    // when
    ctx.lottery.heal();
    ctx.controller.refresh();
    let healed = ctx.next_snapshot().await;

    // then
    assert_eq!(ctx.controller.view().snapshot, Some(healed));
    assert_eq!(ctx.controller.view().read_error, None);
}

#[tokio::test]
async fn teardown__discards_poll_in_flight() {
    // given
    let lottery = FakeLottery::new();
    let contract = LotteryContract::new(
        lottery.address(),
        Arc::new(lottery.clone()),
        TicketPricing::OnChain,
    );
    let (_sessions_tx, sessions) = watch::channel(Default::default());
    let mut synchronizer = Synchronizer::new(contract, sessions, Duration::from_secs(3600));
    let (tx, mut rx) = mpsc::unbounded_channel();
    lottery.pause_reads();
    synchronizer.start(tx);
    lottery.wait_for_reads(1).await;

    // when
    drop(synchronizer);
    lottery.resume_reads();

    // then
    let outcome = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("worker did not exit");
    assert_eq!(outcome, None);
}
