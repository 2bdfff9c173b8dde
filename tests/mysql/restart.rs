use super::super::common::MockConnector;
use qan_agent::mysql::{Connector, RestartMonitor};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const NAME: &str = "db1:3306";

#[tokio::test(start_paused = true)]
async fn test_falling_uptime_notifies_listeners() {
    let mut monitor = RestartMonitor::spawn(Duration::from_secs(1));
    let handle = monitor.handle();

    // 100 -> 5 and 5 -> 1 are both restarts.
    let conn: Arc<dyn Connector> = Arc::new(MockConnector::new().with_uptimes(&[100, 5, 1]));
    let (instance_tx, mut instance_rx) = mpsc::channel(1);
    let (global_tx, mut global_rx) = mpsc::channel(4);
    handle.subscribe(global_tx).await.unwrap();
    handle.add(NAME, conn, instance_tx).await.unwrap();

    for _ in 0..2 {
        let name = timeout(Duration::from_secs(10), global_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, NAME);
    }

    // The instance listener was never drained, so the second notice was dropped.
    assert!(instance_rx.try_recv().is_ok());
    assert!(instance_rx.try_recv().is_err());

    // A steady uptime afterwards is not a restart.
    assert!(timeout(Duration::from_secs(5), global_rx.recv()).await.is_err());

    monitor.stop().await;
    monitor.stop().await;
    assert!(handle.subscribe(mpsc::channel(1).0).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_growing_uptime_is_not_a_restart() {
    let mut monitor = RestartMonitor::spawn(Duration::from_secs(1));
    let handle = monitor.handle();

    let conn: Arc<dyn Connector> = Arc::new(MockConnector::new().with_uptimes(&[100, 101, 102, 103]));
    let (tx, mut rx) = mpsc::channel(1);
    handle.add(NAME, conn, tx).await.unwrap();

    assert!(timeout(Duration::from_secs(5), rx.recv()).await.is_err());
    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_instance_is_skipped() {
    let mut monitor = RestartMonitor::spawn(Duration::from_secs(1));
    let handle = monitor.handle();

    let mock = Arc::new(MockConnector::new().with_uptimes(&[100, 5]));
    mock.fail_connect.store(true, Ordering::SeqCst);
    let conn: Arc<dyn Connector> = mock.clone();
    let (tx, mut rx) = mpsc::channel(1);
    handle.add(NAME, conn, tx).await.unwrap();

    assert!(timeout(Duration::from_secs(3), rx.recv()).await.is_err());
    // Uptime was never read.
    assert_eq!(mock.uptimes.lock().unwrap().len(), 2);

    monitor.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_removed_instance_is_not_polled() {
    let mut monitor = RestartMonitor::spawn(Duration::from_secs(1));
    let handle = monitor.handle();

    let mock = Arc::new(MockConnector::new().with_uptimes(&[100, 5]));
    let conn: Arc<dyn Connector> = mock.clone();
    let (tx, mut rx) = mpsc::channel(1);
    handle.add(NAME, conn, tx).await.unwrap();
    handle.remove(NAME).await;

    assert!(timeout(Duration::from_secs(3), rx.recv()).await.is_err());
    monitor.stop().await;
}
