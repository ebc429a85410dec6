//! Bank transfer demo.
//!
//! Opens three accounts, moves money between them with concurrent commands,
//! then redelivers an account's history out of order to show that the event
//! processor ignores versions it has already dispatched.
//!
//! # Running
//!
//! ```bash
//! RUST_LOG=info,sequent_runtime=debug cargo run -p bank-transfer
//! ```
//!
//! With `--features postgres`, the event log and checkpoints live in the
//! database named by `DATABASE_URL`.

use bank_transfer::{ACCOUNT_TYPE, AccountCommand, AccountHandler, BalanceProjection};
use sequent_core::{AggregateId, CheckpointStore, EventLog, Version};
use sequent_runtime::metrics::MetricsServer;
use sequent_runtime::{Engine, EngineConfig, EnqueueResult};
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing_subscriber::EnvFilter;

type Stores = (Arc<dyn EventLog>, Arc<dyn CheckpointStore>);

#[cfg(not(feature = "postgres"))]
#[allow(clippy::unused_async)]
async fn stores() -> Result<Stores, Box<dyn Error>> {
    use sequent_testing::{InMemoryCheckpointStore, InMemoryEventLog};

    tracing::info!("Using in-memory event log and checkpoints");
    Ok((
        Arc::new(InMemoryEventLog::new()),
        Arc::new(InMemoryCheckpointStore::new()),
    ))
}

#[cfg(feature = "postgres")]
async fn stores() -> Result<Stores, Box<dyn Error>> {
    use sequent_postgres::{PostgresCheckpointStore, PostgresEventLog, migrate};

    let url = std::env::var("DATABASE_URL")?;
    let log = PostgresEventLog::new(&url).await?;
    migrate(log.pool()).await?;
    let checkpoints = PostgresCheckpointStore::from_pool(log.pool().clone());
    tracing::info!("Using PostgreSQL event log and checkpoints");
    Ok((Arc::new(log), Arc::new(checkpoints)))
}

async fn execute(
    engine: &Engine,
    account: &AggregateId,
    id: String,
    command: AccountCommand,
) -> Result<(), Box<dyn Error>> {
    let receipt = engine
        .submit_command(command.into_message(id, account)?)
        .await?;
    receipt.outcome().await?;
    Ok(())
}

async fn caught_up(
    log: &dyn EventLog,
    projection: &BalanceProjection,
    accounts: &[AggregateId],
) -> Result<(), Box<dyn Error>> {
    for account in accounts {
        let history = log
            .query(account.clone(), ACCOUNT_TYPE.to_string(), Version::FIRST, Version::new(u64::MAX))
            .await?;
        let last = history.last().map_or(Version::INITIAL, |stream| stream.version);
        tokio::time::timeout(Duration::from_secs(10), async {
            while projection.version(account) < last {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
    }
    Ok(())
}

fn print_balances(title: &str, projection: &BalanceProjection) {
    println!("\n{title}:");
    for (id, owner, balance) in projection.snapshot() {
        println!("  {owner:<6} ({id}): ${}.{:02}", balance / 100, balance % 100);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut metrics = MetricsServer::new(SocketAddr::from(([127, 0, 0, 1], 9000)));
    metrics.start()?;

    println!("=== Sequent: Bank Transfers ===");

    let (log, checkpoints) = stores().await?;
    let handler = Arc::new(AccountHandler::new(Arc::clone(&log)));
    let projection = BalanceProjection::new();
    let config = EngineConfig::from_env()?.with_processor_name("BalanceProjection");
    let engine = Engine::new(
        config,
        Arc::clone(&handler) as _,
        Arc::new(projection.clone()),
        checkpoints,
    )?;
    handler.attach(engine.committer(Arc::clone(&log)));
    engine.start();

    let run = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis());
    let accounts: Vec<AggregateId> = ["alice", "bob", "carol"]
        .iter()
        .map(|name| AggregateId::new(format!("{name}-{run}")))
        .collect();

    for (account, (owner, opening)) in accounts
        .iter()
        .zip([("Alice", 100_000), ("Bob", 50_000), ("Carol", 0)])
    {
        execute(
            &engine,
            account,
            format!("{account}-open"),
            AccountCommand::Open { owner: owner.to_string() },
        )
        .await?;
        if opening > 0 {
            execute(
                &engine,
                account,
                format!("{account}-opening-deposit"),
                AccountCommand::Deposit { amount: opening },
            )
            .await?;
        }
    }
    caught_up(log.as_ref(), &projection, &accounts).await?;
    print_balances("Opening balances", &projection);

    println!("\nTransferring $10 from Alice to Carol 20 times, with Bob depositing alongside...");
    let mut receipts = Vec::new();
    for i in 0..20 {
        let withdraw = AccountCommand::Withdraw { amount: 1_000 }
            .into_message(format!("t{i}-out"), &accounts[0])?;
        let deposit = AccountCommand::Deposit { amount: 1_000 }
            .into_message(format!("t{i}-in"), &accounts[2])?;
        let bob = AccountCommand::Deposit { amount: 100 }
            .into_message(format!("bob-{i}"), &accounts[1])?;
        for command in [withdraw, deposit, bob] {
            receipts.push(engine.submit_command(command).await?);
        }
    }
    for receipt in receipts {
        receipt.outcome().await?;
    }
    caught_up(log.as_ref(), &projection, &accounts).await?;
    print_balances("After transfers", &projection);

    println!("\nBob tries to withdraw $1,000,000...");
    if let Err(error) = execute(
        &engine,
        &accounts[1],
        "bob-overdraw".to_string(),
        AccountCommand::Withdraw { amount: 100_000_000 },
    )
    .await
    {
        println!("  rejected: {error}");
    }

    println!("\nRedelivering Alice's history in reverse order...");
    let mut history = log
        .query(accounts[0].clone(), ACCOUNT_TYPE.to_string(), Version::FIRST, Version::new(u64::MAX))
        .await?;
    history.reverse();
    let mut ignored = 0;
    let total = history.len();
    for stream in history {
        if engine.submit_event_stream(stream).await?.result() == EnqueueResult::Ignored {
            ignored += 1;
        }
    }
    println!("  {ignored} of {total} records ignored as already dispatched");
    print_balances("Final balances", &projection);

    if let Some(rendered) = metrics.render() {
        let series = rendered
            .lines()
            .filter(|line| line.starts_with("sequent_"))
            .count();
        println!("\n{series} sequent_* metric series recorded");
    }

    engine.stop();
    Ok(())
}
