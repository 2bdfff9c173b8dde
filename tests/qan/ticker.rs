use qan_agent::ticker::{Clock, Tick};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[tokio::test(start_paused = true)]
async fn test_sync_subscribers_share_ticks() {
    let mut clock = Clock::spawn();
    let handle = clock.handle();

    let (tx1, mut rx1) = mpsc::channel::<Tick>(1);
    let (tx2, mut rx2) = mpsc::channel::<Tick>(1);
    handle.add(tx1, Duration::from_secs(2), true).await.unwrap();
    handle.add(tx2, Duration::from_secs(2), true).await.unwrap();

    let first = timeout(Duration::from_secs(3), rx1.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(3), rx2.recv()).await.unwrap().unwrap();
    assert_eq!(first, second);

    clock.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_sync_ticks_repeat_every_interval() {
    let mut clock = Clock::spawn();
    let handle = clock.handle();

    let (tx, mut rx) = mpsc::channel::<Tick>(1);
    handle.add(tx, Duration::from_secs(5), true).await.unwrap();

    for _ in 0..3 {
        assert!(timeout(Duration::from_secs(6), rx.recv()).await.unwrap().is_some());
    }

    clock.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_wait_subscriber_ticks_immediately() {
    let mut clock = Clock::spawn();
    let handle = clock.handle();

    let (tx, mut rx) = mpsc::channel::<Tick>(1);
    handle.add(tx.clone(), Duration::from_secs(60), false).await.unwrap();

    assert!(timeout(Duration::from_millis(10), rx.recv()).await.unwrap().is_some());

    let eta = handle.eta(&tx).await.unwrap();
    assert!(eta > 59.0 && eta <= 60.0, "eta {eta}");

    clock.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_removed_subscriber_gets_no_ticks() {
    let mut clock = Clock::spawn();
    let handle = clock.handle();

    let (tx, mut rx) = mpsc::channel::<Tick>(1);
    handle.add(tx.clone(), Duration::from_secs(1), false).await.unwrap();
    assert!(handle.eta(&tx).await.is_some());

    handle.remove(&tx).await;
    assert!(handle.eta(&tx).await.is_none());

    while rx.try_recv().is_ok() {}
    assert!(timeout(Duration::from_secs(5), rx.recv()).await.is_err());

    clock.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_closed_subscriber_is_dropped() {
    let mut clock = Clock::spawn();
    let handle = clock.handle();

    let (tx, rx) = mpsc::channel::<Tick>(1);
    handle.add(tx.clone(), Duration::from_secs(1), false).await.unwrap();
    drop(rx);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(handle.eta(&tx).await.is_none());

    clock.stop().await;
}

#[tokio::test]
async fn test_stop_twice() {
    let mut clock = Clock::spawn();
    let handle = clock.handle();

    clock.stop().await;
    clock.stop().await;

    let (tx, _rx) = mpsc::channel::<Tick>(1);
    assert!(handle.add(tx, Duration::from_secs(1), true).await.is_err());
}
