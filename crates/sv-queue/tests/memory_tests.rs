//! In-memory queue backend tests
//!
//! Tests for:
//! - Visibility timeout and redelivery
//! - Receive counts
//! - Batch delete with stale receipt handles
//! - FIFO group ordering and blocking
//! - Delayed sends

use std::time::Duration;

use sv_common::{MessageAttributeValue, OutgoingMessage, WORKER_CLASS_ATTRIBUTE};
use sv_queue::{delete_entries, InMemoryQueueClient, QueueClient, QueueError, ReceiveRequest};

#[tokio::test(start_paused = true)]
async fn test_message_redelivered_after_visibility_timeout() {
    let client = InMemoryQueueClient::new();
    client.create_queue("default", 30);
    client.send_message("default", OutgoingMessage::new("hello")).await.unwrap();

    let first = client.receive_messages("default", ReceiveRequest::new(10)).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].receive_count(), 1);

    let hidden = client.receive_messages("default", ReceiveRequest::new(10)).await.unwrap();
    assert!(hidden.is_empty());

    tokio::time::advance(Duration::from_secs(31)).await;

    let again = client.receive_messages("default", ReceiveRequest::new(10)).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].message_id, first[0].message_id);
    assert_eq!(again[0].receive_count(), 2);
    assert_ne!(again[0].receipt_handle, first[0].receipt_handle);
}

#[tokio::test]
async fn test_receive_respects_max_messages() {
    let client = InMemoryQueueClient::new();
    client.create_queue("default", 30);
    for i in 0..15 {
        client.send_message("default", OutgoingMessage::new(format!("m{i}"))).await.unwrap();
    }

    let batch = client.receive_messages("default", ReceiveRequest::new(25)).await.unwrap();
    assert_eq!(batch.len(), 10);
    assert_eq!(batch[0].body, "m0");

    let rest = client.receive_messages("default", ReceiveRequest::new(10)).await.unwrap();
    assert_eq!(rest.len(), 5);
}

#[tokio::test]
async fn test_delete_reports_stale_receipt_handles() {
    let client = InMemoryQueueClient::new();
    client.create_queue("default", 0);
    client.send_message("default", OutgoingMessage::new("a")).await.unwrap();

    // Zero visibility: the second receive issues a fresh handle
    let first = client.receive_messages("default", ReceiveRequest::new(1)).await.unwrap();
    let second = client.receive_messages("default", ReceiveRequest::new(1)).await.unwrap();

    let failures = client.delete_messages("default", delete_entries(&first)).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].id, "0");
    assert_eq!(failures[0].code, "ReceiptHandleIsInvalid");

    let failures = client.delete_messages("default", delete_entries(&second)).await.unwrap();
    assert!(failures.is_empty());
    assert!(client.is_empty("default"));
    assert_eq!(client.deleted_ids(), vec![second[0].message_id.clone()]);
}

#[tokio::test]
async fn test_fifo_group_blocked_while_in_flight() {
    let client = InMemoryQueueClient::new();
    client.create_queue("orders.fifo", 30);
    for body in ["a1", "a2", "b1"] {
        let group = &body[..1];
        client
            .send_message("orders.fifo", OutgoingMessage::new(body).with_group(group))
            .await
            .unwrap();
    }

    let first = client.receive_messages("orders.fifo", ReceiveRequest::new(10)).await.unwrap();
    let bodies: Vec<_> = first.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["a1", "b1"]);
    assert_eq!(first[0].message_group_id(), Some("a"));

    // Group "a" still has a1 in flight
    let blocked = client.receive_messages("orders.fifo", ReceiveRequest::new(10)).await.unwrap();
    assert!(blocked.is_empty());

    client.delete_messages("orders.fifo", delete_entries(&first)).await.unwrap();
    let next = client.receive_messages("orders.fifo", ReceiveRequest::new(10)).await.unwrap();
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].body, "a2");
}

#[tokio::test]
async fn test_fifo_requires_group_id() {
    let client = InMemoryQueueClient::new();
    client.create_queue("orders.fifo", 30);
    let err = client.send_message("orders.fifo", OutgoingMessage::new("x")).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidParameter(_)));

    let attrs = client.get_attributes("orders.fifo").await.unwrap();
    assert!(attrs.fifo);
    assert_eq!(attrs.visibility_timeout, 30);
}

#[tokio::test(start_paused = true)]
async fn test_delayed_message_becomes_visible() {
    let client = InMemoryQueueClient::new();
    client.create_queue("default", 30);
    client
        .send_message("default", OutgoingMessage::new("later").with_delay(60))
        .await
        .unwrap();

    assert!(client.receive_messages("default", ReceiveRequest::new(10)).await.unwrap().is_empty());
    tokio::time::advance(Duration::from_secs(61)).await;
    assert_eq!(client.receive_messages("default", ReceiveRequest::new(10)).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_message_attributes_and_system_attributes() {
    let client = InMemoryQueueClient::new();
    client.create_queue("default", 30);
    let message = OutgoingMessage::new(serde_json::json!({"id": 7}).to_string())
        .with_attribute(WORKER_CLASS_ATTRIBUTE, MessageAttributeValue::string("ReportWorker"));
    client.send_message("default", message).await.unwrap();

    let received = client.receive_messages("default", ReceiveRequest::new(1)).await.unwrap();
    assert_eq!(received[0].worker_class(), Some("ReportWorker"));
    assert!(received[0].sent_at().is_some());
    assert_eq!(received[0].queue_name, "default");
}

#[tokio::test(start_paused = true)]
async fn test_change_visibility() {
    let client = InMemoryQueueClient::new();
    client.create_queue("default", 30);
    client.send_message("default", OutgoingMessage::new("x")).await.unwrap();
    let received = client.receive_messages("default", ReceiveRequest::new(1)).await.unwrap();
    let handle = &received[0].receipt_handle;

    let err = client.change_visibility("default", handle, 43_201).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidParameter(_)));

    client.change_visibility("default", handle, 0).await.unwrap();
    assert_eq!(client.visibility_changes()[0].seconds, 0);
    assert_eq!(client.receive_messages("default", ReceiveRequest::new(1)).await.unwrap().len(), 1);

    let err = client.change_visibility("default", "bogus", 10).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidReceiptHandle(_)));
}

#[tokio::test]
async fn test_unknown_queue_and_unavailable_backend() {
    let client = InMemoryQueueClient::new();
    let err = client.get_attributes("missing").await.unwrap_err();
    assert!(matches!(err, QueueError::QueueNotFound(_)));
    assert!(!err.is_transient());

    client.create_queue("default", 30);
    client.set_unavailable(true);
    let err = client.receive_messages("default", ReceiveRequest::new(1)).await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_queue_url_references_resolve_to_names() {
    let client = InMemoryQueueClient::new();
    client.create_queue("default", 30);
    client
        .send_message("https://sqs.us-east-1.amazonaws.com/000000000000/default", OutgoingMessage::new("x"))
        .await
        .unwrap();
    assert_eq!(client.len("default"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_long_poll_waits_for_a_message() {
    let client = std::sync::Arc::new(InMemoryQueueClient::new().with_wait_time_seconds(5));
    client.create_queue("default", 30);

    let started = tokio::time::Instant::now();
    assert!(client.receive_messages("default", ReceiveRequest::new(1)).await.unwrap().is_empty());
    assert!(started.elapsed() >= Duration::from_secs(5));

    let sender = client.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        sender.send_message("default", OutgoingMessage::new("late")).await.unwrap();
    });
    let started = tokio::time::Instant::now();
    let received = client.receive_messages("default", ReceiveRequest::new(1)).await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(started.elapsed() < Duration::from_secs(2));

    // An explicit zero wait returns immediately
    let mut request = ReceiveRequest::new(1);
    request.wait_time_seconds = Some(0);
    let started = tokio::time::Instant::now();
    assert!(client.receive_messages("default", request).await.unwrap().is_empty());
    assert_eq!(started.elapsed(), Duration::ZERO);
}
