use super::TestContext;
use alloy::primitives::U256;
use lottery_client::{
    LotteryError,
    controller::TICKET_BOUGHT_MESSAGE,
};

#[tokio::test]
async fn buy_ticket__next_poll_shows_one_more_ticket_for_caller() {
    let mut ctx = TestContext::new().await;
    // given
    ctx.controller.connect().await.unwrap();
    let account = ctx.wallet.account();
    let before = loop {
        let snapshot = ctx.next_snapshot().await;
        if snapshot.caller == Some(account) {
            break snapshot;
        }
    };

    // when
    ctx.controller.buy_ticket().await.unwrap();
    let after = loop {
        let snapshot = ctx.next_snapshot().await;
        if snapshot.ticket_count != before.ticket_count {
            break snapshot;
        }
    };

    // then
    assert_eq!(after.ticket_count, before.ticket_count + 1);
    assert_eq!(after.caller_ticket_count, before.caller_ticket_count + 1);
    assert_eq!(after.pool_balance, before.pool_balance + ctx.lottery.price());
    assert_eq!(ctx.controller.view().caller_ticket_count, Some(1));
    assert_eq!(ctx.controller.status(), TICKET_BOUGHT_MESSAGE);
}

#[tokio::test]
async fn buy_ticket__uses_price_read_at_submission() {
    let mut ctx = TestContext::new().await;
    // given
    ctx.controller.connect().await.unwrap();
    let raised = ctx.lottery.price() * U256::from(2);
    ctx.lottery.set_price(raised);

    // when
    let receipt = ctx.controller.buy_ticket().await.unwrap();

    // then
    assert_eq!(receipt.value, raised);
    assert_eq!(ctx.lottery.pool(), raised);
}

#[tokio::test]
async fn buy_ticket__declined_signature_is_not_retried() {
    let mut ctx = TestContext::new().await;
    // given
    ctx.controller.connect().await.unwrap();
    ctx.lottery.reject_next_signature();

    // when
    let first = ctx.controller.buy_ticket().await;

    // then
    assert!(matches!(first, Err(LotteryError::SubmissionRejected(_))));
    assert_eq!(ctx.lottery.tickets_sold(), 0);
    assert!(ctx.controller.status().starts_with("Purchase failed"));
}
