//! The demo wiring end to end on in-memory stores.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use bank_transfer::{AccountCommand, AccountHandler, BalanceProjection};
use sequent_core::{AggregateId, HandlerError, Version};
use sequent_runtime::{Engine, EngineConfig, EngineError};
use sequent_testing::{InMemoryCheckpointStore, InMemoryEventLog};
use std::sync::Arc;
use std::time::Duration;

struct Bank {
    engine: Engine,
    log: InMemoryEventLog,
    projection: BalanceProjection,
}

fn bank() -> Bank {
    let log = InMemoryEventLog::new();
    let handler = Arc::new(AccountHandler::new(Arc::new(log.clone())));
    let projection = BalanceProjection::new();
    let config = EngineConfig::default()
        .with_processor_name("BalanceProjection")
        .with_refresh_interval(Duration::from_millis(20));
    let engine = Engine::new(
        config,
        Arc::clone(&handler) as _,
        Arc::new(projection.clone()),
        Arc::new(InMemoryCheckpointStore::new()),
    )
    .unwrap();
    handler.attach(engine.committer(Arc::new(log.clone())));
    engine.start();
    Bank {
        engine,
        log,
        projection,
    }
}

async fn execute(
    bank: &Bank,
    account: &AggregateId,
    id: &str,
    command: AccountCommand,
) -> Result<(), EngineError> {
    let receipt = bank
        .engine
        .submit_command(command.into_message(id, account).unwrap())
        .await?;
    receipt.outcome().await
}

async fn wait_for_projection(bank: &Bank, account: &AggregateId) {
    let target = bank.log.current_version(account);
    tokio::time::timeout(Duration::from_secs(5), async {
        while bank.projection.version(account) < target {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("projection did not catch up");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deposits_land_in_order() {
    let bank = bank();
    let alice = AggregateId::new("alice");

    execute(&bank, &alice, "open", AccountCommand::Open { owner: "Alice".to_string() })
        .await
        .unwrap();

    let mut receipts = Vec::new();
    for i in 0..25 {
        let command = AccountCommand::Deposit { amount: 100 }
            .into_message(format!("d{i}"), &alice)
            .unwrap();
        receipts.push(bank.engine.submit_command(command).await.unwrap());
    }
    for receipt in receipts {
        receipt.outcome().await.unwrap();
    }

    wait_for_projection(&bank, &alice).await;
    assert_eq!(bank.log.current_version(&alice), Version::new(26));
    assert_eq!(bank.projection.balance(&alice), Some(2_500));
    bank.engine.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overdraft_is_rejected_without_an_event() {
    let bank = bank();
    let bob = AggregateId::new("bob");

    execute(&bank, &bob, "open", AccountCommand::Open { owner: "Bob".to_string() })
        .await
        .unwrap();
    execute(&bank, &bob, "d1", AccountCommand::Deposit { amount: 500 })
        .await
        .unwrap();

    let result = execute(&bank, &bob, "w1", AccountCommand::Withdraw { amount: 501 }).await;
    assert!(matches!(
        result,
        Err(EngineError::Handler(HandlerError::Rejected(_)))
    ));

    wait_for_projection(&bank, &bob).await;
    assert_eq!(bank.log.current_version(&bob), Version::new(2));
    assert_eq!(bank.projection.balance(&bob), Some(500));
    bank.engine.stop();
}
