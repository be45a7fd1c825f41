//! Tests for background lock renewal.

use super::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

fn counting_renewal(count: &Arc<AtomicU32>, lock_duration: Duration) -> LockRenewal {
    let count = count.clone();
    LockRenewal::start("lock-1".to_string(), lock_duration, move || {
        let count = count.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

#[test]
fn test_interval_is_eighty_percent_of_lock_duration() {
    assert_eq!(
        renewal_interval(Duration::from_secs(10)),
        Duration::from_secs(8)
    );
    assert_eq!(
        renewal_interval(Duration::from_secs(3)),
        Duration::from_millis(2400)
    );
}

#[tokio::test(start_paused = true)]
async fn test_renews_periodically_until_stopped() {
    let count = Arc::new(AtomicU32::new(0));
    let renewal = counting_renewal(&count, Duration::from_secs(10));
    assert!(renewal.is_active());

    // Ticks at 8s, 16s and 24s.
    tokio::time::sleep(Duration::from_secs(25)).await;
    assert_eq!(count.load(Ordering::SeqCst), 3);

    renewal.stop();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_drop_stops_renewal() {
    let count = Arc::new(AtomicU32::new(0));
    {
        let _renewal = counting_renewal(&count, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(900)).await;
    }

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_swallowed() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let renewal = LockRenewal::start("lock-1".to_string(), Duration::from_secs(1), move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(BusError::ConnectionFailed {
                message: "broker unavailable".to_string(),
            })
        }
    });

    tokio::time::sleep(Duration::from_millis(3300)).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert!(renewal.is_active());
}

#[tokio::test(start_paused = true)]
async fn test_lost_lock_ends_renewal() {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let renewal = LockRenewal::start("lock-1".to_string(), Duration::from_secs(1), move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(BusError::LockLost {
                lock_token: "lock-1".to_string(),
            })
        }
    });

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(!renewal.is_active());
}

#[test]
fn test_disabled_renewal_is_inert() {
    let renewal = LockRenewal::Disabled;
    assert!(!renewal.is_active());
    renewal.stop();
}

#[tokio::test(start_paused = true)]
async fn test_stop_abandons_in_flight_renewal() {
    let started = Arc::new(AtomicU32::new(0));
    let finished = Arc::new(AtomicU32::new(0));
    let (s, f) = (started.clone(), finished.clone());
    let renewal = LockRenewal::start("lock-1".to_string(), Duration::from_secs(1), move || {
        let (s, f) = (s.clone(), f.clone());
        async move {
            s.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            f.fetch_add(1, Ordering::SeqCst);
            Err(BusError::LockLost {
                lock_token: "lock-1".to_string(),
            })
        }
    });

    // First renewal starts at 800ms and is still running at 1s.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(started.load(Ordering::SeqCst), 1);

    renewal.stop();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(finished.load(Ordering::SeqCst), 0);
    assert!(!renewal.is_active());
}
