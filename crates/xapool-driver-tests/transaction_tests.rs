//! Transaction tests
//!
//! Global transactions across in-memory engines: one-phase and two-phase
//! commit, prepare failures, heuristic outcomes, local transactions, last
//! participant support and transaction timeouts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use pretty_assertions::assert_eq;
use rstest::rstest;
use xapool_connection::{BranchStatus, FaultInjector, FaultPoint, ResourceInterceptor, ScopeKind};
use xapool_core::{ConnectionRequest, HeuristicKind, TransactionConfig, XaErrorCode, XaPoolError};

use crate::fixtures::{Journal, MemoryEngine, eventually, pool_config, registry_with};

// =============================================================================
// Commit protocol
// =============================================================================

/// A single participant commits in one phase without preparing
#[tokio::test]
async fn test_single_resource_commits_one_phase() -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let registry = registry_with(TransactionConfig::new(), [(&orders, pool_config(2))])?;
    let session = registry.session();

    let branch = session.begin().await?;
    let conn = session.acquire("orders", ConnectionRequest::new()).await?;
    conn.execute("PUT order-1 pending").await?;
    assert_eq!(orders.get("order-1"), None, "uncommitted work is not visible");
    session.commit().await?;

    assert_eq!(orders.get("order-1").as_deref(), Some("pending"));
    assert!(!orders.journal().contains_call("prepare"));
    assert!(orders.journal().contains_call("commit"));
    assert_eq!(branch.status(), BranchStatus::Committed);
    assert!(registry.transaction_manager().log().entries().await?.is_empty());
    Ok(())
}

/// With two resource managers every prepare precedes the first commit
#[tokio::test]
async fn test_two_resources_prepare_before_commit() -> Result<()> {
    let journal = Journal::new();
    let orders = MemoryEngine::with_journal("orders", &journal);
    let billing = MemoryEngine::with_journal("billing", &journal);
    let registry = registry_with(
        TransactionConfig::new(),
        [(&orders, pool_config(2)), (&billing, pool_config(2))],
    )?;
    let session = registry.session();

    session.begin().await?;
    let o = session.acquire("orders", ConnectionRequest::new()).await?;
    let b = session.acquire("billing", ConnectionRequest::new()).await?;
    o.execute("PUT order-1 placed").await?;
    b.execute("PUT invoice-1 issued").await?;
    session.commit().await?;

    assert_eq!(orders.get("order-1").as_deref(), Some("placed"));
    assert_eq!(billing.get("invoice-1").as_deref(), Some("issued"));

    let first_commit = journal
        .position("orders:commit")
        .min(journal.position("billing:commit"))
        .expect("both committed");
    for prepare in ["orders:prepare", "billing:prepare"] {
        let at = journal.position(prepare).expect("both prepared");
        assert!(at < first_commit, "{} after first commit: {:?}", prepare, journal.events());
    }
    assert!(registry.transaction_manager().log().entries().await?.is_empty());
    Ok(())
}

/// A participant that did no work votes read-only and is not committed
#[tokio::test]
async fn test_read_only_participant_skips_phase_two() -> Result<()> {
    let journal = Journal::new();
    let orders = MemoryEngine::with_journal("orders", &journal);
    let audit = MemoryEngine::with_journal("audit", &journal);
    let registry = registry_with(
        TransactionConfig::new(),
        [(&orders, pool_config(2)), (&audit, pool_config(2))],
    )?;
    let session = registry.session();

    session.begin().await?;
    let o = session.acquire("orders", ConnectionRequest::new()).await?;
    let a = session.acquire("audit", ConnectionRequest::new()).await?;
    o.execute("PUT order-1 placed").await?;
    a.execute("GET order-1").await?;
    session.commit().await?;

    assert_eq!(orders.get("order-1").as_deref(), Some("placed"));
    assert!(journal.position("audit:prepare").is_some());
    assert_eq!(journal.position("audit:commit"), None);
    Ok(())
}

/// Rollback discards the work of every participant
#[tokio::test]
async fn test_rollback_discards_work() -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let billing = MemoryEngine::new("billing");
    let registry = registry_with(
        TransactionConfig::new(),
        [(&orders, pool_config(2)), (&billing, pool_config(2))],
    )?;
    let session = registry.session();

    let branch = session.begin().await?;
    let o = session.acquire("orders", ConnectionRequest::new()).await?;
    let b = session.acquire("billing", ConnectionRequest::new()).await?;
    o.execute("PUT order-1 placed").await?;
    b.execute("PUT invoice-1 issued").await?;
    session.rollback().await?;

    assert!(orders.is_empty());
    assert!(billing.is_empty());
    assert_eq!(branch.status(), BranchStatus::RolledBack);
    assert_eq!(registry.stats("orders")?.in_use(), 0);
    assert_eq!(registry.stats("billing")?.in_use(), 0);
    Ok(())
}

/// A refused prepare rolls the whole transaction back
#[rstest]
#[case::first_refuses("orders")]
#[case::second_refuses("billing")]
#[tokio::test]
async fn test_prepare_failure_rolls_back(#[case] refusing: &str) -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let billing = MemoryEngine::new("billing");
    let registry = registry_with(
        TransactionConfig::new(),
        [(&orders, pool_config(2)), (&billing, pool_config(2))],
    )?;
    let engine = if refusing == "orders" { &orders } else { &billing };
    engine.set_fail_prepare(true);
    let session = registry.session();

    session.begin().await?;
    session
        .acquire("orders", ConnectionRequest::new())
        .await?
        .execute("PUT order-1 placed")
        .await?;
    session
        .acquire("billing", ConnectionRequest::new())
        .await?
        .execute("PUT invoice-1 issued")
        .await?;

    let err = session.commit().await.expect_err("prepare was refused");
    assert!(matches!(err, XaPoolError::RolledBack { .. }), "{:?}", err);
    assert!(orders.is_empty());
    assert!(billing.is_empty());
    assert!(orders.prepared().is_empty());
    assert!(billing.prepared().is_empty());
    Ok(())
}

/// A phase-two failure reports a mixed outcome and recovery completes it
#[tokio::test]
async fn test_phase_two_failure_is_recovered() -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let billing = MemoryEngine::new("billing");
    let registry = registry_with(
        TransactionConfig::new(),
        [(&orders, pool_config(2)), (&billing, pool_config(2))],
    )?;
    let faults = FaultInjector::new();
    faults.fail("billing", FaultPoint::Commit, XaErrorCode::ResourceFailed, 1);
    registry.set_resource_interceptor(Some(Arc::clone(&faults) as Arc<dyn ResourceInterceptor>));
    let session = registry.session();

    let branch = session.begin().await?;
    session
        .acquire("orders", ConnectionRequest::new())
        .await?
        .execute("PUT order-1 placed")
        .await?;
    session
        .acquire("billing", ConnectionRequest::new())
        .await?
        .execute("PUT invoice-1 issued")
        .await?;

    match session.commit().await {
        Err(XaPoolError::Heuristic {
            kind,
            committed,
            failed,
            ..
        }) => {
            assert_eq!(kind, HeuristicKind::Mixed);
            assert_eq!(committed, vec!["orders".to_string()]);
            assert_eq!(failed, vec!["billing".to_string()]);
        }
        other => panic!("expected a heuristic outcome, got {:?}", other),
    }
    assert_eq!(branch.status(), BranchStatus::InDoubt);
    assert_eq!(orders.get("order-1").as_deref(), Some("placed"));
    assert_eq!(billing.get("invoice-1"), None);
    assert_eq!(billing.prepared().len(), 1);

    let entries = registry.transaction_manager().log().entries().await?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].global_id, branch.id());
    assert!(entries[0].pending.contains("billing"));

    let unresolved = registry.recover().await?;
    assert!(unresolved.is_empty(), "unresolved: {:?}", unresolved);
    assert_eq!(billing.get("invoice-1").as_deref(), Some("issued"));
    assert!(billing.prepared().is_empty());
    assert!(registry.transaction_manager().log().entries().await?.is_empty());
    assert_eq!(faults.injected(), 1);
    Ok(())
}

/// The background recovery task reacts to a heuristic outcome without waiting an interval
#[tokio::test]
async fn test_heuristic_outcome_wakes_recovery_task() -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let billing = MemoryEngine::new("billing");
    let registry = registry_with(
        TransactionConfig::new().with_recovery_interval_ms(60_000),
        [(&orders, pool_config(2)), (&billing, pool_config(2))],
    )?;
    let faults = FaultInjector::new();
    faults.fail("billing", FaultPoint::Commit, XaErrorCode::ResourceFailed, 1);
    registry.set_resource_interceptor(Some(faults as Arc<dyn ResourceInterceptor>));
    registry.start().await?;
    let session = registry.session();

    session.begin().await?;
    session
        .acquire("orders", ConnectionRequest::new())
        .await?
        .execute("PUT order-1 placed")
        .await?;
    session
        .acquire("billing", ConnectionRequest::new())
        .await?
        .execute("PUT invoice-1 issued")
        .await?;
    let err = session.commit().await.expect_err("billing commit fails");
    assert!(err.is_heuristic());

    let recovered = eventually(Duration::from_secs(2), || billing.get("invoice-1").is_some()).await;
    assert!(recovered, "recovery task should commit the in-doubt branch");
    registry.shutdown().await;
    Ok(())
}

/// A one-phase failure of the only participant leaves the outcome unknown
#[tokio::test]
async fn test_one_phase_failure_is_hazard() -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let registry = registry_with(TransactionConfig::new(), [(&orders, pool_config(2))])?;
    let faults = FaultInjector::new();
    faults.fail("orders", FaultPoint::Commit, XaErrorCode::ResourceFailed, 1);
    registry.set_resource_interceptor(Some(faults as Arc<dyn ResourceInterceptor>));
    let session = registry.session();

    session.begin().await?;
    session
        .acquire("orders", ConnectionRequest::new())
        .await?
        .execute("PUT order-1 placed")
        .await?;
    let err = session.commit().await.expect_err("commit fails");

    assert!(
        matches!(
            err,
            XaPoolError::Heuristic {
                kind: HeuristicKind::Hazard,
                ..
            }
        ),
        "{:?}",
        err
    );
    Ok(())
}

// =============================================================================
// Local transactions and last participant support
// =============================================================================

/// A local scope commits through the connection's own transaction
#[tokio::test]
async fn test_local_transaction_commit() -> Result<()> {
    let ledger = MemoryEngine::without_xa("ledger");
    let registry = registry_with(TransactionConfig::new(), [(&ledger, pool_config(2))])?;
    let session = registry.session();

    let branch = session.begin_local().await?;
    assert_eq!(branch.kind(), ScopeKind::Local);
    let conn = session.acquire("ledger", ConnectionRequest::new()).await?;
    conn.execute("PUT entry-1 10").await?;
    assert_eq!(branch.resource_managers(), vec!["ledger:local".to_string()]);
    assert_eq!(ledger.get("entry-1"), None);
    session.commit().await?;

    assert_eq!(ledger.get("entry-1").as_deref(), Some("10"));
    conn.execute("PUT entry-2 20").await?;
    assert_eq!(
        ledger.get("entry-2").as_deref(),
        Some("20"),
        "autocommit is restored after the scope"
    );
    Ok(())
}

/// A one-phase-only resource joins a global transaction only as the last participant
#[rstest]
#[case::with_support(true)]
#[case::without_support(false)]
#[tokio::test]
async fn test_last_participant_support(#[case] enabled: bool) -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let ledger = MemoryEngine::without_xa("ledger");
    let registry = registry_with(
        TransactionConfig::new().with_last_participant_support(enabled),
        [(&orders, pool_config(2)), (&ledger, pool_config(2))],
    )?;
    let session = registry.session();

    session.begin().await?;
    session
        .acquire("orders", ConnectionRequest::new())
        .await?
        .execute("PUT order-1 placed")
        .await?;
    let ledger_conn = session.acquire("ledger", ConnectionRequest::new()).await?;
    let enlisted = ledger_conn.execute("PUT entry-1 10").await;

    if enabled {
        enlisted?;
        session.commit().await?;
        assert_eq!(orders.get("order-1").as_deref(), Some("placed"));
        assert_eq!(ledger.get("entry-1").as_deref(), Some("10"));
    } else {
        let err = enlisted.expect_err("mixing needs last participant support");
        assert!(matches!(err, XaPoolError::InvalidState(_)), "{:?}", err);
        session.rollback().await?;
        assert!(orders.is_empty());
    }
    Ok(())
}

/// A failed last participant rolls back the prepared participants
#[tokio::test]
async fn test_last_participant_failure_rolls_back() -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let ledger = MemoryEngine::without_xa("ledger");
    let registry = registry_with(
        TransactionConfig::new().with_last_participant_support(true),
        [(&orders, pool_config(2)), (&ledger, pool_config(2))],
    )?;
    let faults = FaultInjector::new();
    faults.fail("ledger:local", FaultPoint::Commit, XaErrorCode::ResourceError, 1);
    registry.set_resource_interceptor(Some(faults as Arc<dyn ResourceInterceptor>));
    let session = registry.session();

    session.begin().await?;
    session
        .acquire("orders", ConnectionRequest::new())
        .await?
        .execute("PUT order-1 placed")
        .await?;
    session
        .acquire("ledger", ConnectionRequest::new())
        .await?
        .execute("PUT entry-1 10")
        .await?;
    let err = session.commit().await.expect_err("last participant fails");

    assert!(matches!(err, XaPoolError::RolledBack { .. }), "{:?}", err);
    assert!(orders.is_empty());
    assert!(orders.prepared().is_empty());
    assert!(registry.transaction_manager().log().entries().await?.is_empty());
    Ok(())
}

/// Work on a non-transactional data source is never enlisted
#[tokio::test]
async fn test_non_transactional_source_survives_rollback() -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let cache = MemoryEngine::new("cache");
    let registry = registry_with(
        TransactionConfig::new(),
        [
            (&orders, pool_config(2)),
            (&cache, pool_config(2).with_transactional(false)),
        ],
    )?;
    let session = registry.session();

    let branch = session.begin().await?;
    session
        .acquire("orders", ConnectionRequest::new())
        .await?
        .execute("PUT order-1 placed")
        .await?;
    session
        .acquire("cache", ConnectionRequest::new())
        .await?
        .execute("PUT order-1 cached")
        .await?;
    assert_eq!(branch.resource_managers(), vec!["orders".to_string()]);
    session.rollback().await?;

    assert!(orders.is_empty());
    assert_eq!(cache.get("order-1").as_deref(), Some("cached"));
    assert!(!cache.journal().contains_call("start"));
    Ok(())
}

/// Local commit is refused while the connection is enlisted
#[tokio::test]
async fn test_local_commit_refused_while_enlisted() -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let registry = registry_with(TransactionConfig::new(), [(&orders, pool_config(2))])?;
    let session = registry.session();

    session.begin().await?;
    let conn = session.acquire("orders", ConnectionRequest::new()).await?;
    conn.execute("PUT order-1 placed").await?;

    assert!(matches!(conn.commit().await, Err(XaPoolError::InvalidState(_))));
    assert!(matches!(
        conn.set_auto_commit(true).await,
        Err(XaPoolError::InvalidState(_))
    ));
    session.rollback().await?;
    Ok(())
}

/// A session cannot nest scopes and cannot complete one it never began
#[tokio::test]
async fn test_scope_demarcation_errors() -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let registry = registry_with(TransactionConfig::new(), [(&orders, pool_config(1))])?;
    let session = registry.session();

    assert!(matches!(session.commit().await, Err(XaPoolError::InvalidState(_))));
    session.begin().await?;
    assert!(matches!(session.begin().await, Err(XaPoolError::InvalidState(_))));
    assert!(session.in_transaction());
    session.rollback().await?;
    assert!(!session.in_transaction());
    Ok(())
}

// =============================================================================
// Timeouts
// =============================================================================

/// Work after the deadline fails and commit rolls back with the timeout reason
#[tokio::test]
async fn test_expired_transaction_rolls_back() -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let registry = registry_with(TransactionConfig::new(), [(&orders, pool_config(2))])?;
    let session = registry.session();

    let branch = session.begin_with_timeout(Duration::from_millis(50)).await?;
    let conn = session.acquire("orders", ConnectionRequest::new()).await?;
    conn.execute("PUT order-1 placed").await?;
    tokio::time::sleep(Duration::from_millis(80)).await;

    let err = conn.execute("PUT order-2 placed").await.expect_err("expired");
    assert!(matches!(err, XaPoolError::TransactionTimedOut(_)), "{:?}", err);
    assert!(branch.is_rollback_only());

    match session.commit().await {
        Err(XaPoolError::RolledBack { reason, .. }) => {
            assert_eq!(reason, "transaction timed out");
        }
        other => panic!("expected a rollback, got {:?}", other),
    }
    assert!(orders.is_empty());
    assert_eq!(registry.stats("orders")?.in_use(), 0);
    Ok(())
}

/// The configured default timeout applies to transactions begun without one
#[tokio::test]
async fn test_default_transaction_timeout() -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let registry = registry_with(
        TransactionConfig::new().with_default_timeout_ms(30),
        [(&orders, pool_config(2))],
    )?;
    let session = registry.session();

    let branch = session.begin().await?;
    assert_eq!(branch.timeout(), Some(Duration::from_millis(30)));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = session.commit().await.expect_err("timed out");
    assert!(matches!(err, XaPoolError::RolledBack { .. }));
    Ok(())
}
