//! End-to-end loan lifecycle tests.
//!
//! Each test builds a pool with in-process collaborators (collection filter,
//! bundle wrapper, fixed oracle, queueing liquidator) and drives deposits,
//! loans and redemptions through to final settlement, checking that the
//! pool's cash stays fully accounted for along the way.

use strata_core::constants::{SECONDS_PER_DAY, UNIT};
use strata_core::error::{LiquidityError, LoanError, StrataError};
use strata_core::tick::Tick;
use strata_pool::{LoanStatus, PoolEvent, RefinanceRequest};
use strata_tests::helpers::*;

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[test]
fn lenders_earn_interest_over_a_full_cycle() {
    let (mut pool, _) = test_pool();
    let a = abs_tick(10, 2, 1);
    let b = abs_tick(20, 2, 1);
    let alice = account("alice");
    let bob = account("bob");

    let alice_shares = pool.deposit(&alice, a, 10 * UNIT, 0, T0).unwrap();
    let bob_shares = pool.deposit(&bob, b, 20 * UNIT, 0, T0).unwrap();

    let loan = pool.borrow(&borrow_request("carol", 18 * UNIT, vec![a, b]), T0).unwrap();
    let used: Vec<u64> = loan.receipt.node_receipts.iter().map(|n| n.used).collect();
    assert_eq!(used, vec![10 * UNIT, 8 * UNIT]);
    assert_eq!(pool.cash(), 12 * UNIT);
    assert_conserved(&pool);

    let paid = pool.repay(&account("carol"), &loan.encoded_receipt, T0 + DAYS_30).unwrap();
    assert_eq!(paid, loan.receipt.repayment);
    assert_eq!(pool.loan_status(&loan.receipt_hash), Some(LoanStatus::Repaid));
    assert!(pool.admin_fee_balance() > 0);
    assert_conserved(&pool);

    let now = T0 + DAYS_30;
    pool.redeem(&alice, a, alice_shares, now).unwrap();
    pool.redeem(&bob, b, bob_shares, now).unwrap();
    let (_, alice_out) = pool.withdraw(&alice, a).unwrap();
    let (_, bob_out) = pool.withdraw(&bob, b).unwrap();
    assert!(alice_out > 10 * UNIT, "alice got {alice_out}");
    assert!(bob_out > 20 * UNIT, "bob got {bob_out}");
    // Everything but rounding dust left in the nodes has been paid out.
    let paid_out = alice_out + bob_out + pool.admin_fee_balance();
    assert!((30 * UNIT + paid - 18 * UNIT) - paid_out <= 2);
    assert_conserved(&pool);
}

#[test]
fn interest_accrues_into_share_price() {
    let (mut pool, _) = test_pool();
    let a = abs_tick(10, 2, 2);
    pool.deposit(&account("alice"), a, 10 * UNIT, 0, T0).unwrap();
    pool.borrow(&borrow_request("carol", 10 * UNIT, vec![a]), T0).unwrap();

    let halfway = T0 + 15 * SECONDS_PER_DAY;
    let accrual = pool.accrual(a, halfway);
    assert!(accrual.accrued > 0);
    assert!(accrual.rate > 0);

    // Late depositors pay for interest already earned.
    let shares = pool.deposit(&account("bob"), a, 10 * UNIT, 0, halfway).unwrap();
    assert!(shares < 10 * UNIT);
    assert_conserved(&pool);
}

#[test]
fn queued_redemptions_resolve_on_repayment() {
    let (mut pool, _) = test_pool();
    let a = abs_tick(10, 2, 0);
    let alice = account("alice");
    let bob = account("bob");
    pool.deposit(&alice, a, 5 * UNIT, 0, T0).unwrap();
    pool.deposit(&bob, a, 5 * UNIT, 0, T0).unwrap();
    let loan = pool.borrow(&borrow_request("carol", 10 * UNIT, vec![a]), T0).unwrap();

    let first = pool.redeem(&alice, a, 5 * UNIT, T0 + 1).unwrap();
    let second = pool.redeem(&bob, a, 5 * UNIT, T0 + 2).unwrap();
    assert_eq!((first.index, first.target), (0, 0));
    assert_eq!((second.index, second.target), (0, 5 * UNIT));
    assert_eq!(pool.redemption_available(&alice, a).unwrap(), (0, 0));
    assert_eq!(pool.withdraw(&alice, a).unwrap(), (0, 0));

    let paid = pool.repay(&account("carol"), &loan.encoded_receipt, T0 + 10 * SECONDS_PER_DAY).unwrap();
    assert_eq!(paid, 10 * UNIT);
    assert_eq!(pool.redemption_available(&alice, a).unwrap(), (5 * UNIT, 5 * UNIT));
    assert_eq!(pool.withdraw(&alice, a).unwrap(), (5 * UNIT, 5 * UNIT));
    assert_eq!(pool.withdraw(&bob, a).unwrap(), (5 * UNIT, 5 * UNIT));
    assert!(pool.deposit_position(&alice, a).is_none());
    assert_eq!(pool.liquidity_node(a).unwrap().shares, 0);
    assert_conserved(&pool);
}

// ---------------------------------------------------------------------------
// Default and liquidation
// ---------------------------------------------------------------------------

#[test]
fn default_impairs_the_top_node() {
    let (mut pool, liquidator) = test_pool();
    let a = abs_tick(10, 2, 0);
    let b = abs_tick(100, 2, 0);
    let carol = account("carol");
    let dave = account("dave");
    pool.deposit(&carol, a, 10 * UNIT, 0, T0).unwrap();
    pool.deposit(&dave, b, 10 * UNIT, 0, T0).unwrap();

    let loan = pool.borrow(&borrow_request("erin", 20 * UNIT, vec![a, b]), T0).unwrap();
    let expired = T0 + DAYS_30 + 1;
    pool.liquidate(&loan.encoded_receipt, expired).unwrap();
    assert_eq!(liquidator.seized.lock().len(), 1);
    assert_eq!(liquidator.seized.lock()[0].0, loan.receipt_hash);

    pool.on_collateral_liquidated(&liquidator_id(), &loan.encoded_receipt, 103 * UNIT / 10, expired + 60)
        .unwrap();
    assert_eq!(pool.loan_status(&loan.receipt_hash), Some(LoanStatus::Liquidated));
    assert!(pool.events().contains(&PoolEvent::NodeImpaired { tick: b }));
    assert_conserved(&pool);

    // The lower node is made whole, the upper one is impaired and delinked.
    assert_eq!(pool.liquidity_node(a).unwrap().value, 10 * UNIT);
    let impaired = pool.liquidity_node(b).unwrap();
    assert_eq!(impaired.value, 3 * UNIT / 10);
    assert_eq!(impaired.shares, 10 * UNIT);
    assert!(!impaired.is_linked());
    assert_eq!(pool.liquidity_nodes(Tick::HEAD, Tick::TAIL).len(), 1);
    assert_eq!(
        pool.deposit(&account("frank"), b, UNIT, 0, expired + 60),
        Err(StrataError::Liquidity(LiquidityError::InactiveLiquidity(b)))
    );
    assert!(matches!(
        pool.quote(&borrow_request("erin", UNIT, vec![b])),
        Err(StrataError::Liquidity(LiquidityError::InsufficientLiquidity { .. }))
    ));

    // Surviving shares redeem at the reduced price and the node is collected.
    pool.redeem(&dave, b, 10 * UNIT, expired + 120).unwrap();
    assert_eq!(pool.withdraw(&dave, b).unwrap(), (10 * UNIT, 3 * UNIT / 10));
    assert!(pool.liquidity_node(b).is_none());

    // The tick is fresh again.
    assert_eq!(pool.deposit(&account("frank"), b, 5 * UNIT, 0, expired + 180).unwrap(), 5 * UNIT);

    pool.redeem(&carol, a, 10 * UNIT, expired + 180).unwrap();
    assert_eq!(pool.withdraw(&carol, a).unwrap(), (10 * UNIT, 10 * UNIT));
    assert_conserved(&pool);
}

#[test]
fn liquidation_guards() {
    let (mut pool, _) = test_pool();
    let a = abs_tick(10, 2, 1);
    pool.deposit(&account("alice"), a, 10 * UNIT, 0, T0).unwrap();
    let loan = pool.borrow(&borrow_request("carol", 5 * UNIT, vec![a]), T0).unwrap();

    assert!(matches!(
        pool.on_collateral_liquidated(&liquidator_id(), &loan.encoded_receipt, UNIT, T0 + 1),
        Err(StrataError::Loan(LoanError::InvalidLoanReceipt(_)))
    ));
    assert!(matches!(
        pool.liquidate(&loan.encoded_receipt, T0 + DAYS_30),
        Err(StrataError::Loan(LoanError::LoanNotExpired(_)))
    ));

    let expired = T0 + DAYS_30 + 1;
    pool.liquidate(&loan.encoded_receipt, expired).unwrap();
    assert!(pool.liquidate(&loan.encoded_receipt, expired).is_err());
    assert!(matches!(
        pool.repay(&account("carol"), &loan.encoded_receipt, expired),
        Err(StrataError::Loan(LoanError::InvalidLoanReceipt(_)))
    ));

    pool.on_collateral_liquidated(&liquidator_id(), &loan.encoded_receipt, 6 * UNIT, expired).unwrap();
    assert!(pool
        .on_collateral_liquidated(&liquidator_id(), &loan.encoded_receipt, 6 * UNIT, expired)
        .is_err());
    assert_conserved(&pool);
}

// ---------------------------------------------------------------------------
// Collateral
// ---------------------------------------------------------------------------

#[test]
fn bundles_scale_tick_caps() {
    let (mut pool, _) = test_pool();
    let a = abs_tick(10, 2, 1);
    pool.deposit(&account("alice"), a, 100 * UNIT, 0, T0).unwrap();

    let mut request = borrow_request("carol", 31 * UNIT, vec![a]);
    request.collateral_token = bundle_token();
    request.collateral_wrapper_context = bundle_context(&[1, 2, 3]);
    assert_eq!(
        pool.borrow(&request, T0),
        Err(StrataError::Liquidity(LiquidityError::InsufficientLiquidity {
            sourced: 30 * UNIT,
            needed: 31 * UNIT,
        }))
    );

    request.principal = 30 * UNIT;
    let loan = pool.borrow(&request, T0).unwrap();
    assert_eq!(loan.receipt.collateral_token, bundle_token());
    assert_eq!(loan.receipt.collateral_wrapper_context, bundle_context(&[1, 2, 3]));
}

#[test]
fn unsupported_collateral_is_rejected() {
    let (mut pool, _) = test_pool();
    let a = abs_tick(10, 2, 1);
    pool.deposit(&account("alice"), a, 100 * UNIT, 0, T0).unwrap();

    let mut request = borrow_request("carol", UNIT, vec![a]);
    request.collateral_token = account("other");
    assert!(matches!(
        pool.borrow(&request, T0),
        Err(StrataError::Loan(LoanError::UnsupportedCollateral(_)))
    ));

    let mut empty = borrow_request("carol", UNIT, vec![a]);
    empty.collateral_token = bundle_token();
    assert!(matches!(
        pool.borrow(&empty, T0),
        Err(StrataError::Loan(LoanError::UnsupportedCollateral(_)))
    ));
}

#[test]
fn ratio_ticks_follow_the_oracle() {
    let (mut pool, _) = test_pool();
    // 25% of the 100 unit oracle price.
    let quarter = ratio_tick(25, 2, 2, 1);
    pool.deposit(&account("alice"), quarter, 50 * UNIT, 0, T0).unwrap();

    assert!(pool.quote(&borrow_request("carol", 26 * UNIT, vec![quarter])).is_err());
    let quote = pool.quote(&borrow_request("carol", 25 * UNIT, vec![quarter])).unwrap();
    assert_eq!(quote.plan[0].used, 25 * UNIT);
    pool.borrow(&borrow_request("carol", 25 * UNIT, vec![quarter]), T0).unwrap();
}

#[test]
fn rate_floor_filters_cheap_ticks() {
    let (mut pool, _) = test_pool();
    let cheap = abs_tick(10, 2, 0);
    let pricey = abs_tick(20, 2, 2);
    pool.deposit(&account("alice"), cheap, 50 * UNIT, 0, T0).unwrap();
    pool.deposit(&account("bob"), pricey, 50 * UNIT, 0, T0).unwrap();

    let mut request = borrow_request("carol", 5 * UNIT, vec![cheap, pricey]);
    request.min_rate_class = Some(1);
    assert!(matches!(
        pool.borrow(&request, T0),
        Err(StrataError::Liquidity(LiquidityError::InvalidTick { .. }))
    ));
    request.ticks = vec![pricey];
    let loan = pool.borrow(&request, T0).unwrap();
    assert_eq!(loan.receipt.node_receipts[0].tick, pricey);
}

// ---------------------------------------------------------------------------
// Refinance and persistence
// ---------------------------------------------------------------------------

#[test]
fn refinance_rolls_the_loan_forward() {
    let (mut pool, _) = test_pool();
    let a = abs_tick(10, 2, 1);
    pool.deposit(&account("alice"), a, 50 * UNIT, 0, T0).unwrap();
    let carol = account("carol");
    let loan = pool.borrow(&borrow_request("carol", 5 * UNIT, vec![a]), T0).unwrap();

    let later = T0 + 15 * SECONDS_PER_DAY;
    let terms = RefinanceRequest {
        principal: 7 * UNIT,
        duration: DAYS_30,
        ticks: vec![a],
        max_repayment: u64::MAX,
        min_rate_class: None,
    };
    assert!(matches!(
        pool.refinance(&account("mallory"), &loan.encoded_receipt, &terms, later),
        Err(StrataError::Loan(LoanError::InvalidCaller(_)))
    ));
    let renewed = pool.refinance(&carol, &loan.encoded_receipt, &terms, later).unwrap();
    assert_eq!(pool.loan_status(&loan.receipt_hash), Some(LoanStatus::Refinanced));
    assert_eq!(renewed.receipt.maturity, later + DAYS_30);
    assert_eq!(renewed.receipt.collateral_token_id, loan.receipt.collateral_token_id);
    assert_conserved(&pool);

    pool.repay(&carol, &renewed.encoded_receipt, later + DAYS_30).unwrap();
    assert_eq!(pool.liquidity_node(a).unwrap().pending, 0);
    assert_conserved(&pool);
}

#[test]
fn snapshot_resumes_mid_loan() {
    let (mut pool, _) = test_pool();
    let a = abs_tick(10, 2, 1);
    pool.deposit(&account("alice"), a, 50 * UNIT, 0, T0).unwrap();
    let loan = pool.borrow(&borrow_request("carol", 5 * UNIT, vec![a]), T0).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool.bin");
    pool.save_snapshot(&path).unwrap();

    let (mut resumed, _) = test_pool();
    resumed.load_snapshot(&path).unwrap();
    assert_eq!(resumed.loan_status(&loan.receipt_hash), Some(LoanStatus::Active));
    resumed.repay(&account("carol"), &loan.encoded_receipt, T0 + DAYS_30).unwrap();
    assert_eq!(resumed.cash(), pool.cash() + loan.receipt.repayment);
    assert_conserved(&resumed);
}

#[test]
fn events_trace_the_lifecycle() {
    let (mut pool, _) = test_pool();
    let a = abs_tick(10, 2, 1);
    let alice = account("alice");
    let shares = pool.deposit(&alice, a, 10 * UNIT, 0, T0).unwrap();
    let loan = pool.borrow(&borrow_request("carol", 5 * UNIT, vec![a]), T0).unwrap();
    pool.repay(&account("carol"), &loan.encoded_receipt, T0 + 100).unwrap();
    pool.redeem(&alice, a, shares, T0 + 100).unwrap();
    pool.withdraw(&alice, a).unwrap();

    let names: Vec<&str> = pool.events().iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["deposited", "loan_originated", "loan_repaid", "redeemed", "withdrawn"]);
}
