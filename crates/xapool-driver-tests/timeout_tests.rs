//! Statement timeout tests
//!
//! Checks the timeout each statement reaches the driver with: the data source
//! default, the remaining transaction time when synchronization is on, and
//! explicit per-statement overrides.

use std::time::Duration;

use anyhow::Result;
use pretty_assertions::assert_eq;
use rstest::rstest;
use xapool_core::{ConnectionFactoryConfig, ConnectionRequest, TransactionConfig, XaPoolError};

use crate::fixtures::{MemoryEngine, pool_config, registry_with};

const DEFAULT: Duration = Duration::from_secs(5);

fn synced(sync: bool) -> ConnectionFactoryConfig {
    pool_config(2)
        .with_query_timeout_ms(Some(DEFAULT.as_millis() as u64))
        .with_sync_query_timeout(sync)
}

/// Outside a transaction the default applies whether or not sync is enabled
#[rstest]
#[case::sync_on(true)]
#[case::sync_off(false)]
#[tokio::test]
async fn test_default_outside_transaction(#[case] sync: bool) -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let registry = registry_with(TransactionConfig::new(), [(&orders, synced(sync))])?;
    let conn = registry
        .session()
        .acquire("orders", ConnectionRequest::new())
        .await?;

    conn.execute("SELECT 1").await?;
    assert_eq!(orders.last_timeout(), Some(DEFAULT));
    Ok(())
}

/// No default and no transaction leaves statements unbounded
#[tokio::test]
async fn test_no_timeout_configured() -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let registry = registry_with(TransactionConfig::new(), [(&orders, pool_config(2))])?;
    let conn = registry
        .session()
        .acquire("orders", ConnectionRequest::new())
        .await?;

    conn.execute("SELECT 1").await?;
    assert_eq!(orders.statement_timeouts(), vec![None]);
    Ok(())
}

/// With sync on, statements never outlive the transaction and the bound only shrinks
#[tokio::test]
async fn test_synced_timeout_tracks_transaction() -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let registry = registry_with(TransactionConfig::new(), [(&orders, synced(true))])?;
    let session = registry.session();
    let conn = session.acquire("orders", ConnectionRequest::new()).await?;

    session.begin_with_timeout(Duration::from_secs(1)).await?;
    conn.execute("PUT a 1").await?;
    let first = orders.last_timeout().expect("bounded");
    tokio::time::sleep(Duration::from_millis(20)).await;
    conn.execute("PUT b 2").await?;
    let second = orders.last_timeout().expect("bounded");

    assert!(first <= Duration::from_secs(1), "{:?}", first);
    assert!(second < first, "{:?} then {:?}", first, second);
    session.commit().await?;

    conn.execute("SELECT 1").await?;
    assert_eq!(orders.last_timeout(), Some(DEFAULT), "default is restored after commit");
    Ok(())
}

/// A transaction deadline beyond the default leaves the default in place
#[tokio::test]
async fn test_synced_timeout_keeps_shorter_default() -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let registry = registry_with(TransactionConfig::new(), [(&orders, synced(true))])?;
    let session = registry.session();

    session.begin_with_timeout(Duration::from_secs(60)).await?;
    let conn = session.acquire("orders", ConnectionRequest::new()).await?;
    conn.execute("PUT a 1").await?;

    assert_eq!(orders.last_timeout(), Some(DEFAULT));
    session.rollback().await?;
    Ok(())
}

/// With sync off the transaction deadline is ignored
#[tokio::test]
async fn test_unsynced_timeout_ignores_transaction() -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let registry = registry_with(TransactionConfig::new(), [(&orders, synced(false))])?;
    let session = registry.session();

    session.begin_with_timeout(Duration::from_secs(1)).await?;
    let conn = session.acquire("orders", ConnectionRequest::new()).await?;
    conn.execute("PUT a 1").await?;

    assert_eq!(orders.last_timeout(), Some(DEFAULT));
    session.rollback().await?;
    Ok(())
}

/// An explicit statement timeout wins over both the default and the deadline
#[tokio::test]
async fn test_explicit_timeout_overrides() -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let registry = registry_with(TransactionConfig::new(), [(&orders, synced(true))])?;
    let session = registry.session();
    session.begin_with_timeout(Duration::from_secs(1)).await?;
    let conn = session.acquire("orders", ConnectionRequest::new()).await?;

    let explicit = Duration::from_secs(30);
    conn.execute_with_timeout("PUT a 1", explicit).await?;
    assert_eq!(orders.last_timeout(), Some(explicit));

    let statement = conn.prepare("PUT b 2")?;
    statement.set_query_timeout(Some(explicit));
    statement.execute().await?;
    assert_eq!(orders.last_timeout(), Some(explicit));

    session.commit().await?;
    assert_eq!(orders.get("b").as_deref(), Some("2"));
    Ok(())
}

/// A statement that runs past its timeout fails without losing the connection
#[tokio::test]
async fn test_statement_timeout_keeps_connection() -> Result<()> {
    let orders = MemoryEngine::new("orders");
    let registry = registry_with(
        TransactionConfig::new(),
        [(&orders, pool_config(2).with_query_timeout_ms(Some(20)))],
    )?;
    let conn = registry
        .session()
        .acquire("orders", ConnectionRequest::new())
        .await?;
    let before = conn.managed_connection_id().await;

    let err = conn.execute("SLEEP 500").await.expect_err("times out");
    assert!(matches!(err, XaPoolError::Driver(_)), "{:?}", err);

    assert!(conn.is_associated().await);
    assert_eq!(conn.managed_connection_id().await, before);
    assert_eq!(conn.execute("SELECT 1").await?, 1);
    assert_eq!(orders.connects(), 1);
    Ok(())
}
