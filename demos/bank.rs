//! Self-contained demo of units of work over an in-memory log store: two
//! concurrent units of work race on one account and the strong resolver
//! merges them.
//!
//! Run with: `cargo run --example bank`

use std::sync::Arc;

use eventfold_uow::{
    ChannelDispatcher, CommitContext, ConflictError, ConflictStrategy, EngineBuilder, MemoryStore,
    Route, State,
};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Account state
// ---------------------------------------------------------------------------

/// A bank account balance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Account {
    balance: i64,
    frozen: bool,
}

/// Events of the [`Account`] state.
///
/// Adjacently tagged, like every domain event stored by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum AccountEvent {
    Deposited { amount: i64 },
    Withdrawn { amount: i64 },
    Frozen,
    StatementRequested { month: String },
}

impl State for Account {
    const ENTITY_TYPE: &'static str = "account";
    type Event = AccountEvent;

    fn apply(&mut self, event: &AccountEvent) -> Route {
        match event {
            AccountEvent::Deposited { amount } => self.balance += amount,
            AccountEvent::Withdrawn { amount } => self.balance -= amount,
            AccountEvent::Frozen => self.frozen = true,
            AccountEvent::StatementRequested { .. } => return Route::Unhandled,
        }
        Route::Handled
    }

    fn conflict(&self, event: &AccountEvent) -> Result<(), ConflictError> {
        match event {
            AccountEvent::Deposited { .. } => Ok(()),
            AccountEvent::Withdrawn { .. } if self.frozen => Err(ConflictError::Discard),
            AccountEvent::Withdrawn { amount } if *amount > self.balance => {
                Err(ConflictError::Abandon {
                    reason: format!("balance {} cannot cover {amount}", self.balance),
                })
            }
            AccountEvent::Withdrawn { .. } => Ok(()),
            _ => Err(ConflictError::Unhandled),
        }
    }

    fn should_snapshot(&self, version: u64, last_snapshot: Option<u64>) -> bool {
        version >= last_snapshot.unwrap_or(0) + 3
    }

    fn conflict_strategy() -> ConflictStrategy {
        ConflictStrategy::ResolveStrongly
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    let (dispatcher, mut published) = ChannelDispatcher::new();
    let engine = EngineBuilder::new(store.clone())
        .dispatcher(Arc::new(dispatcher))
        .open();

    // Open the account.
    let mut repo = engine.repository::<Account>();
    let account = repo.create("retail", "acc-1")?;
    account.apply(AccountEvent::Deposited { amount: 100 });
    repo.commit(&CommitContext::new().with_actor("teller")).await?;

    // Two units of work load the same version.
    let mut atm = engine.repository::<Account>();
    atm.get("retail", "acc-1")
        .await?
        .apply(AccountEvent::Withdrawn { amount: 40 });

    let mut payroll = engine.repository::<Account>();
    let account = payroll.get("retail", "acc-1").await?;
    account.apply(AccountEvent::Deposited { amount: 250 });
    account.raise(
        AccountEvent::StatementRequested { month: "2026-10".into() },
        "statements",
        false,
        Some(90),
    );

    // Payroll wins the race; the ATM commit conflicts and is merged.
    let report = payroll.commit(&CommitContext::new().with_actor("payroll")).await?;
    println!("payroll: {:?}", report.outcomes);
    let report = atm.commit(&CommitContext::new().with_actor("atm")).await?;
    println!("atm:     {:?}", report.outcomes);

    let mut reader = engine.repository::<Account>();
    let account = reader.get("retail", "acc-1").await?;
    println!(
        "balance = {} at version {}",
        account.state().balance,
        account.committed_version()
    );

    let snapshot = engine
        .snapshots()
        .get_snapshot::<Account>("retail", account.id(), &[])
        .await?;
    println!("snapshot version = {:?}", snapshot.as_ref().map(|s| s.version));

    let mut dispatched = 0;
    while let Ok((stream, event)) = published.try_recv() {
        println!("published {} on {stream}", event.event_type);
        dispatched += 1;
    }

    assert_eq!(account.state().balance, 310);
    assert_eq!(account.committed_version(), 3);
    assert_eq!(snapshot.map(|s| s.version), Some(3));
    assert_eq!(dispatched, 4);

    engine.shutdown().await;
    println!("all assertions passed");
    Ok(())
}
