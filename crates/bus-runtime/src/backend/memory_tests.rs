//! Tests for the in-memory brokers.

use super::*;

fn queue(name: &str) -> QueueAddress {
    QueueAddress::new(name).unwrap()
}

fn message(body: &'static str) -> TransportMessage {
    TransportMessage::from_body(body)
}

const LOCK: Duration = Duration::from_secs(30);
const WINDOW: Duration = Duration::from_millis(100);

// ============================================================================
// Locking Broker: Send and Receive
// ============================================================================

mod locking_receive {
    use super::*;

    /// Verify that messages come out in the order they went in.
    #[tokio::test(start_paused = true)]
    async fn test_fifo_delivery() {
        let broker = InMemoryLockingBroker::new();
        let client = broker.connect(&queue("orders")).await.unwrap();
        let cancel = CancellationToken::new();

        client.send(message("first")).await.unwrap();
        client.send(message("second")).await.unwrap();

        let first = client.receive(LOCK, WINDOW, &cancel).await.unwrap().unwrap();
        let second = client.receive(LOCK, WINDOW, &cancel).await.unwrap().unwrap();

        assert_eq!(first.message.body().as_ref(), b"first");
        assert_eq!(second.message.body().as_ref(), b"second");
        assert_eq!(first.delivery_count, 1);
        assert_eq!(first.message.headers().len(), 2);
    }

    /// Verify that an empty queue reports a receive timeout after the window.
    #[tokio::test(start_paused = true)]
    async fn test_empty_queue_times_out() {
        let broker = InMemoryLockingBroker::new();
        let client = broker.connect(&queue("orders")).await.unwrap();

        let started = Instant::now();
        let result = client
            .receive(LOCK, WINDOW, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ref e) if e.is_empty_poll()));
        assert!(started.elapsed() >= WINDOW);
    }

    /// Verify that a cancelled receive leaves the message in the queue.
    #[tokio::test(start_paused = true)]
    async fn test_cancelled_receive_consumes_nothing() {
        let broker = InMemoryLockingBroker::new();
        let address = queue("orders");
        let client = broker.connect(&address).await.unwrap();
        client.send(message("payload")).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = client.receive(LOCK, WINDOW, &cancel).await.unwrap();

        assert!(result.is_none());
        assert_eq!(broker.locked_count(&address), 0);
        assert_eq!(broker.message_count(&address), 1);
    }

    /// Verify that a deferred message stays hidden until it is due.
    #[tokio::test(start_paused = true)]
    async fn test_deferred_message_is_hidden_until_due() {
        let broker = InMemoryLockingBroker::new();
        let client = broker.connect(&queue("orders")).await.unwrap();
        let cancel = CancellationToken::new();

        let due = Utc::now() + chrono::Duration::seconds(5);
        client
            .send(message("later").with_deferred_until(due))
            .await
            .unwrap();

        let early = client.receive(LOCK, WINDOW, &cancel).await;
        assert!(matches!(early, Err(BusError::ReceiveTimeout { .. })));

        tokio::time::sleep(Duration::from_secs(6)).await;
        let due_now = client.receive(LOCK, WINDOW, &cancel).await.unwrap();
        assert!(due_now.is_some());
    }

    /// Verify that queues are isolated from each other.
    #[tokio::test(start_paused = true)]
    async fn test_queues_are_isolated() {
        let broker = InMemoryLockingBroker::new();
        let orders = broker.connect(&queue("orders")).await.unwrap();
        let invoices = broker.connect(&queue("invoices")).await.unwrap();

        orders.send(message("order")).await.unwrap();

        let result = invoices
            .receive(LOCK, WINDOW, &CancellationToken::new())
            .await;
        assert!(result.is_err());
        assert_eq!(broker.connections(), 2);
    }
}

// ============================================================================
// Locking Broker: Lock Lifecycle
// ============================================================================

mod locking_settlement {
    use super::*;

    /// Verify that complete removes the message for good.
    #[tokio::test(start_paused = true)]
    async fn test_complete_removes_message() {
        let broker = InMemoryLockingBroker::new();
        let address = queue("orders");
        let client = broker.connect(&address).await.unwrap();
        client.send(message("payload")).await.unwrap();

        let locked = client
            .receive(LOCK, WINDOW, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        client.complete(&locked.lock_token).await.unwrap();

        assert_eq!(broker.message_count(&address), 0);
        assert!(matches!(
            client.complete(&locked.lock_token).await,
            Err(BusError::MessageNotFound { .. })
        ));
    }

    /// Verify that abandon makes the message visible again at the head.
    #[tokio::test(start_paused = true)]
    async fn test_abandon_redelivers_immediately() {
        let broker = InMemoryLockingBroker::new();
        let client = broker.connect(&queue("orders")).await.unwrap();
        let cancel = CancellationToken::new();
        client.send(message("first")).await.unwrap();
        client.send(message("second")).await.unwrap();

        let locked = client.receive(LOCK, WINDOW, &cancel).await.unwrap().unwrap();
        client.abandon(&locked.lock_token).await.unwrap();

        let again = client.receive(LOCK, WINDOW, &cancel).await.unwrap().unwrap();
        assert_eq!(again.message.body().as_ref(), b"first");
        assert_eq!(again.delivery_count, 2);
    }

    /// Verify that an expired lock makes the message visible to others.
    #[tokio::test(start_paused = true)]
    async fn test_expired_lock_releases_message() {
        let broker = InMemoryLockingBroker::new();
        let client = broker.connect(&queue("orders")).await.unwrap();
        let cancel = CancellationToken::new();
        client.send(message("payload")).await.unwrap();

        let locked = client
            .receive(Duration::from_secs(2), WINDOW, &cancel)
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;

        let other = client.receive(LOCK, WINDOW, &cancel).await.unwrap();
        assert!(other.is_some());
        assert!(client.complete(&locked.lock_token).await.is_err());
    }

    /// Verify that settling a lapsed lock reports the lock as lost.
    #[tokio::test(start_paused = true)]
    async fn test_lapsed_lock_is_reported_lost() {
        let broker = InMemoryLockingBroker::new();
        let client = broker.connect(&queue("orders")).await.unwrap();
        client.send(message("payload")).await.unwrap();

        let locked = client
            .receive(Duration::from_secs(1), WINDOW, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let result = client.complete(&locked.lock_token).await;
        assert!(matches!(result, Err(BusError::LockLost { .. })));
    }

    /// Verify that renewing a lock keeps the message hidden past its first expiry.
    #[tokio::test(start_paused = true)]
    async fn test_renewal_extends_lock() {
        let broker = InMemoryLockingBroker::new();
        let address = queue("orders");
        let client = broker.connect(&address).await.unwrap();
        client.send(message("payload")).await.unwrap();

        let lock = Duration::from_secs(2);
        let locked = client
            .receive(lock, WINDOW, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        client.renew_lock(&locked.lock_token, lock).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(broker.locked_count(&address), 1);
        client.complete(&locked.lock_token).await.unwrap();
    }

    /// Verify that purge removes waiting messages but not locked ones.
    #[tokio::test(start_paused = true)]
    async fn test_purge_leaves_locked_messages() {
        let broker = InMemoryLockingBroker::new();
        let address = queue("orders");
        let client = broker.connect(&address).await.unwrap();
        for body in ["a", "b", "c"] {
            client.send(message(body)).await.unwrap();
        }
        let _locked = client
            .receive(LOCK, WINDOW, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(broker.purge(&address).await.unwrap(), 2);
        assert_eq!(broker.purge(&address).await.unwrap(), 0);
        assert_eq!(broker.message_count(&address), 1);
    }
}

// ============================================================================
// Fault Injection
// ============================================================================

mod fault_injection {
    use super::*;

    /// Verify that injected faults fail exactly the requested number of calls.
    #[tokio::test(start_paused = true)]
    async fn test_injected_send_faults_are_consumed() {
        let broker = InMemoryLockingBroker::new();
        let client = broker.connect(&queue("orders")).await.unwrap();
        broker.fail_next_sends(2);

        let first = client.send(message("a")).await;
        let second = client.send(message("b")).await;
        let third = client.send(message("c")).await;

        assert!(matches!(first, Err(BusError::ConnectionFailed { .. })));
        assert!(second.is_err());
        assert!(third.is_ok());
        assert!(first.unwrap_err().should_evict_client());
    }

    /// Verify that injected receive and renewal faults surface as errors.
    #[tokio::test(start_paused = true)]
    async fn test_injected_receive_and_renewal_faults() {
        let broker = InMemoryLockingBroker::new();
        let client = broker.connect(&queue("orders")).await.unwrap();
        client.send(message("payload")).await.unwrap();
        let cancel = CancellationToken::new();

        broker.fail_next_receives(1);
        assert!(client.receive(LOCK, WINDOW, &cancel).await.is_err());

        let locked = client.receive(LOCK, WINDOW, &cancel).await.unwrap().unwrap();
        broker.fail_next_renewals(1);
        assert!(client.renew_lock(&locked.lock_token, LOCK).await.is_err());
        assert!(client.renew_lock(&locked.lock_token, LOCK).await.is_ok());
    }
}

// ============================================================================
// Acknowledgment Broker
// ============================================================================

mod ack_broker {
    use super::*;

    /// Verify that an acknowledged delivery is gone.
    #[tokio::test(start_paused = true)]
    async fn test_ack_removes_delivery() {
        let broker = InMemoryAckBroker::new();
        let address = queue("orders");
        let client = broker.connect(&address).await.unwrap();
        client.send(message("payload")).await.unwrap();

        let delivery = client
            .receive(WINDOW, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked_count(&address), 1);

        client.ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(broker.message_count(&address), 0);
        assert!(client.ack(delivery.delivery_tag).await.is_err());
    }

    /// Verify that a requeued delivery comes back flagged as redelivered.
    #[tokio::test(start_paused = true)]
    async fn test_nack_with_requeue_redelivers() {
        let broker = InMemoryAckBroker::new();
        let client = broker.connect(&queue("orders")).await.unwrap();
        let cancel = CancellationToken::new();
        client.send(message("payload")).await.unwrap();

        let first = client.receive(WINDOW, &cancel).await.unwrap().unwrap();
        client.nack(first.delivery_tag, true).await.unwrap();

        let second = client.receive(WINDOW, &cancel).await.unwrap().unwrap();
        assert!(second.redelivered);
        assert_ne!(first.delivery_tag, second.delivery_tag);
        assert_eq!(second.message, first.message);
    }

    /// Verify that a nack without requeue drops the message.
    #[tokio::test(start_paused = true)]
    async fn test_nack_without_requeue_drops() {
        let broker = InMemoryAckBroker::new();
        let address = queue("orders");
        let client = broker.connect(&address).await.unwrap();
        client.send(message("payload")).await.unwrap();

        let delivery = client
            .receive(WINDOW, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        client.nack(delivery.delivery_tag, false).await.unwrap();

        assert_eq!(broker.message_count(&address), 0);
    }

    /// Verify that unacknowledged deliveries never expire on their own.
    #[tokio::test(start_paused = true)]
    async fn test_unacked_delivery_is_not_redelivered() {
        let broker = InMemoryAckBroker::new();
        let client = broker.connect(&queue("orders")).await.unwrap();
        let cancel = CancellationToken::new();
        client.send(message("payload")).await.unwrap();

        let _held = client.receive(WINDOW, &cancel).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(600)).await;

        assert!(client.receive(WINDOW, &cancel).await.is_err());
    }
}
