#![allow(non_snake_case)]

use std::time::Duration;
use tokio::sync::mpsc;
use uruk_client::{
    allowance::MAX_ALLOWANCE,
    orchestrator::{
        PurchaseError,
        TransactionOrchestrator,
        TransactionStep,
    },
    test_helpers::{
        ConfirmBehavior,
        TestContext,
    },
};

const FAR_FUTURE: u64 = 4_102_444_800; // 2100-01-01

fn observed_orchestrator(
    ctx: &TestContext,
) -> (
    TransactionOrchestrator<uruk_client::test_helpers::FakeGateway>,
    mpsc::UnboundedReceiver<TransactionStep>,
) {
    let (step_tx, step_rx) = mpsc::unbounded_channel();
    (ctx.orchestrator().with_step_events(step_tx), step_rx)
}

fn drain_steps(rx: &mut mpsc::UnboundedReceiver<TransactionStep>) -> Vec<TransactionStep> {
    let mut steps = Vec::new();
    while let Ok(step) = rx.try_recv() {
        steps.push(step);
    }
    steps
}

#[tokio::test]
async fn submit_purchase__invalid_quantity__never_reads_allowance() {
    let ctx = TestContext::new();
    ctx.gateway.set_active_round(1, FAR_FUTURE);
    let orchestrator = ctx.orchestrator();

    for input in ["", "0", "000", "-3", "1.5", "ten", "1e3"] {
        // when
        let result = orchestrator.submit_purchase(input).await;

        // then
        let failure = result.unwrap_err();
        assert!(
            matches!(failure.error, PurchaseError::Validation(_)),
            "{input:?} should fail validation"
        );
        assert_eq!(orchestrator.current_step(), TransactionStep::Idle);
    }
    assert_eq!(ctx.gateway.allowance_read_count(), 0);
    assert!(ctx.gateway.submissions().is_empty());
}

#[tokio::test]
async fn submit_purchase__leading_zeros__normalize_to_plain_count() {
    let ctx = TestContext::new();
    ctx.gateway.set_active_round(1, FAR_FUTURE);
    ctx.gateway.set_allowance(MAX_ALLOWANCE);
    let orchestrator = ctx.orchestrator();

    // when
    let outcome = orchestrator.submit_purchase("007").await.unwrap();

    // then
    assert_eq!(outcome.intent.quantity, 7);
    assert_eq!(ctx.gateway.submissions()[0].quantity, 7);
}

#[tokio::test]
async fn submit_purchase__sufficient_allowance__skips_approval_entirely() {
    let ctx = TestContext::new();
    ctx.gateway.set_active_round(3, FAR_FUTURE);
    ctx.gateway.set_allowance(MAX_ALLOWANCE);
    let (orchestrator, mut step_rx) = observed_orchestrator(&ctx);

    // when
    let outcome = orchestrator.submit_purchase("2").await.unwrap();

    // then
    let steps = drain_steps(&mut step_rx);
    let expected = vec![
        TransactionStep::Preparing,
        TransactionStep::CheckingAllowance,
        TransactionStep::SimulatingPurchase,
        TransactionStep::Buying,
        TransactionStep::ConfirmingPurchase,
        TransactionStep::Completed,
    ];
    assert_eq!(steps, expected);
    assert!(ctx.gateway.approvals().is_empty());
    assert_eq!(outcome.intent.round_id, 3);
    assert_eq!(orchestrator.current_step(), TransactionStep::Completed);
    assert!(orchestrator.last_error().is_none());
}

#[tokio::test]
async fn submit_purchase__insufficient_allowance__approves_the_maximum_amount() {
    let ctx = TestContext::new();
    ctx.gateway.set_active_round(1, FAR_FUTURE);
    ctx.gateway.set_allowance(0);
    let (orchestrator, mut step_rx) = observed_orchestrator(&ctx);

    // when: 10 tickets at 1 token each, 18 decimals
    let outcome = orchestrator.submit_purchase("10").await.unwrap();

    // then: the approval is for the maximum, not the exact cost
    assert_eq!(ctx.gateway.approvals(), vec![(TestContext::lottery(), MAX_ALLOWANCE)]);
    assert_eq!(outcome.total_cost, 10 * 10u128.pow(18));

    let steps = drain_steps(&mut step_rx);
    let expected = vec![
        TransactionStep::Preparing,
        TransactionStep::CheckingAllowance,
        TransactionStep::Approving,
        TransactionStep::ConfirmingApproval,
        TransactionStep::SimulatingPurchase,
        TransactionStep::Buying,
        TransactionStep::ConfirmingPurchase,
        TransactionStep::Completed,
    ];
    assert_eq!(steps, expected);
}

#[tokio::test]
async fn submit_purchase__simulation_revert__surfaces_contract_reason() {
    let ctx = TestContext::new();
    ctx.gateway.set_active_round(1, FAR_FUTURE);
    ctx.gateway.set_allowance(MAX_ALLOWANCE);
    ctx.gateway.script_simulation_revert("RoundClosed");
    let orchestrator = ctx.orchestrator();

    // when
    let failure = orchestrator.submit_purchase("1").await.unwrap_err();

    // then
    assert_eq!(failure.step, TransactionStep::SimulatingPurchase);
    assert!(failure.error.to_string().contains("RoundClosed"));
    assert_eq!(orchestrator.current_step(), TransactionStep::Error);
    assert_eq!(orchestrator.last_error(), Some(failure));
    assert!(ctx.gateway.submissions().is_empty());
}

#[tokio::test]
async fn submit_purchase__allowance_read_failure__aborts_at_that_step() {
    let ctx = TestContext::new();
    ctx.gateway.set_active_round(1, FAR_FUTURE);
    ctx.gateway.script_allowance_read_failure("rpc disconnected");
    let orchestrator = ctx.orchestrator();

    // when
    let failure = orchestrator.submit_purchase("1").await.unwrap_err();

    // then
    assert_eq!(failure.step, TransactionStep::CheckingAllowance);
    assert!(matches!(failure.error, PurchaseError::Read(_)));
    assert!(ctx.gateway.submissions().is_empty());
}

#[tokio::test]
async fn submit_purchase__round_read_failure__aborts_while_preparing() {
    let ctx = TestContext::new();
    ctx.gateway.script_read_failure("node down");
    let orchestrator = ctx.orchestrator();

    // when
    let failure = orchestrator.submit_purchase("1").await.unwrap_err();

    // then
    assert_eq!(failure.step, TransactionStep::Preparing);
    assert!(matches!(failure.error, PurchaseError::Read(_)));
}

#[tokio::test]
async fn submit_purchase__approval_confirmation_timeout__is_terminal() {
    let ctx = TestContext::new();
    ctx.gateway.set_active_round(1, FAR_FUTURE);
    ctx.gateway.set_allowance(0);
    ctx.gateway.script_confirmation(ConfirmBehavior::Timeout);
    let orchestrator = ctx.orchestrator();

    // when
    let failure = orchestrator.submit_purchase("1").await.unwrap_err();

    // then
    assert_eq!(failure.step, TransactionStep::ConfirmingApproval);
    assert!(matches!(
        failure.error,
        PurchaseError::ConfirmationTimeout { .. }
    ));
    // The purchase never went out.
    assert!(ctx.gateway.submissions().is_empty());
}

#[tokio::test]
async fn submit_purchase__purchase_confirmation_timeout__notes_it_may_still_land() {
    let ctx = TestContext::new();
    ctx.gateway.set_active_round(1, FAR_FUTURE);
    ctx.gateway.set_allowance(MAX_ALLOWANCE);
    ctx.gateway.script_confirmation(ConfirmBehavior::Timeout);
    let orchestrator = ctx.orchestrator();

    // when
    let failure = orchestrator.submit_purchase("1").await.unwrap_err();

    // then
    assert_eq!(failure.step, TransactionStep::ConfirmingPurchase);
    assert!(matches!(
        failure.error,
        PurchaseError::ConfirmationTimeout { .. }
    ));
    assert!(failure.error.to_string().contains("may still land"));
}

#[tokio::test]
async fn submit_purchase__wrong_network__rejected_before_any_chain_call() {
    let ctx = TestContext::new();
    ctx.gateway.set_active_round(1, FAR_FUTURE);
    ctx.gateway.set_chain_id(1);
    let orchestrator = ctx.orchestrator();

    // when
    let failure = orchestrator.submit_purchase("1").await.unwrap_err();

    // then
    assert!(matches!(failure.error, PurchaseError::Validation(_)));
    assert!(failure.error.to_string().contains("wrong network"));
    assert_eq!(orchestrator.current_step(), TransactionStep::Idle);
    assert_eq!(ctx.gateway.allowance_read_count(), 0);
}

#[tokio::test]
async fn submit_purchase__wallet_not_connected__rejected() {
    let mut ctx = TestContext::new();
    ctx.config.wallet_address = None;
    ctx.gateway.set_active_round(1, FAR_FUTURE);
    let orchestrator = ctx.orchestrator();

    // when
    let failure = orchestrator.submit_purchase("1").await.unwrap_err();

    // then
    assert!(failure.error.to_string().contains("wallet not connected"));
    assert_eq!(ctx.gateway.allowance_read_count(), 0);
}

#[tokio::test]
async fn submit_purchase__decimals_unknown__rejected() {
    let ctx = TestContext::new();
    ctx.gateway.set_active_round(1, FAR_FUTURE);
    // Raw construction, without the startup priming the helper does.
    let orchestrator = TransactionOrchestrator::new(ctx.gateway.clone(), &ctx.config);

    // when
    let failure = orchestrator.submit_purchase("1").await.unwrap_err();

    // then
    assert!(failure.error.to_string().contains("decimals"));
    assert_eq!(ctx.gateway.allowance_read_count(), 0);
}

#[tokio::test]
async fn submit_purchase__allowance_is_read_fresh_on_every_attempt() {
    let ctx = TestContext::new();
    ctx.gateway.set_active_round(1, FAR_FUTURE);
    ctx.gateway.set_allowance(MAX_ALLOWANCE);
    let orchestrator = ctx.orchestrator();

    // when
    orchestrator.submit_purchase("1").await.unwrap();
    orchestrator.submit_purchase("2").await.unwrap();

    // then: no cached value was reused
    assert_eq!(ctx.gateway.allowance_read_count(), 2);
}

#[tokio::test]
async fn submit_purchase__stale_simulation__is_never_broadcast() {
    let ctx = TestContext::new();
    ctx.gateway.set_active_round(5, FAR_FUTURE);
    ctx.gateway.set_allowance(MAX_ALLOWANCE);
    // Simulation claims it ran under an older round.
    ctx.gateway.script_simulated_round(4);
    let orchestrator = ctx.orchestrator();

    // when
    let failure = orchestrator.submit_purchase("1").await.unwrap_err();

    // then
    assert_eq!(failure.step, TransactionStep::SimulatingPurchase);
    assert!(failure.error.to_string().contains("stale simulation"));
    assert!(ctx.gateway.submissions().is_empty());
}

#[tokio::test]
async fn submit_purchase__second_intent_rejected_while_first_in_flight() {
    let ctx = TestContext::new();
    ctx.gateway.set_active_round(1, FAR_FUTURE);
    ctx.gateway.set_allowance(MAX_ALLOWANCE);
    ctx.gateway.hold_confirmations();
    let orchestrator = ctx.orchestrator();

    // given: a purchase parked at the confirmation wait
    let in_flight = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.submit_purchase("2").await })
    };
    for _ in 0..1000 {
        if orchestrator.current_step() == TransactionStep::ConfirmingPurchase {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(
        orchestrator.current_step(),
        TransactionStep::ConfirmingPurchase
    );

    // when
    let second = orchestrator.submit_purchase("3").await;

    // then: no second simulation or submission happened
    let failure = second.unwrap_err();
    assert!(
        failure
            .error
            .to_string()
            .contains("transaction is already in progress")
    );
    assert_eq!(ctx.gateway.submissions().len(), 1);

    ctx.gateway.release_confirmation();
    let outcome = in_flight.await.unwrap().unwrap();
    assert_eq!(outcome.intent.quantity, 2);
    assert_eq!(ctx.gateway.submissions().len(), 1);
}

#[tokio::test]
async fn submit_purchase__allowed_again_after_an_error() {
    let ctx = TestContext::new();
    ctx.gateway.set_active_round(1, FAR_FUTURE);
    ctx.gateway.set_allowance(MAX_ALLOWANCE);
    ctx.gateway.script_simulation_revert("RoundClosed");
    let orchestrator = ctx.orchestrator();

    // given
    orchestrator.submit_purchase("1").await.unwrap_err();
    assert_eq!(orchestrator.current_step(), TransactionStep::Error);

    // when: the condition clears and the user retries
    ctx.gateway.script_confirmation(ConfirmBehavior::Confirm);
    let ctx_retry = {
        ctx.gateway.clear_simulation_revert();
        orchestrator.submit_purchase("1").await
    };

    // then
    assert!(ctx_retry.is_ok());
    assert_eq!(orchestrator.current_step(), TransactionStep::Completed);
}

#[tokio::test]
async fn submit_purchase__confirmed_purchase_updates_owned_tickets() {
    let ctx = TestContext::new();
    ctx.gateway.set_active_round(9, FAR_FUTURE);
    ctx.gateway.set_allowance(MAX_ALLOWANCE);
    ctx.gateway
        .set_balance(TestContext::wallet(), 100 * 10u128.pow(18));
    let orchestrator = ctx.orchestrator();

    // when
    let outcome = orchestrator.submit_purchase("4").await.unwrap();

    // then
    assert_eq!(ctx.gateway.owned_tickets(TestContext::wallet(), 9), 4);
    assert_eq!(outcome.intent.round_id, 9);
    assert_eq!(ctx.gateway.submissions().len(), 1);
}
