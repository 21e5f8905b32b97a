use bulk_dispatch::repository::{InMemoryQueueRepository, QueueRepository};
use bulk_dispatch::types::{DeliveryStatus, MessagePayload, QueueEntry};
use bulk_dispatch::webhook::{
    on_provider_status_update, parse_whatsapp_statuses, ProviderStatusUpdate, StatusUpdateOutcome,
};
use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

fn webhook_body(statuses: serde_json::Value) -> serde_json::Value {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "102290129340398",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "metadata": {"phone_number_id": "106540352242922"},
                    "statuses": statuses
                }
            }]
        }]
    })
}

#[test]
fn test_parse_statuses() {
    let body = webhook_body(json!([
        {"id": "wamid.A", "status": "delivered", "timestamp": "1700000000", "recipient_id": "2250701020304"},
        {"id": "wamid.B", "status": "failed", "timestamp": "1700000005",
         "errors": [{"code": 131026, "title": "Message undeliverable"}]}
    ]));
    let updates = parse_whatsapp_statuses(&body).unwrap();
    assert_eq!(updates.len(), 2);

    assert_eq!(updates[0].provider_message_id, "wamid.A");
    assert_eq!(updates[0].status, DeliveryStatus::Delivered);
    assert_eq!(updates[0].timestamp, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
    assert!(updates[0].error.is_none());

    let error = updates[1].error.as_ref().unwrap();
    assert_eq!(updates[1].status, DeliveryStatus::Failed);
    assert_eq!(error.code.as_deref(), Some("131026"));
    assert_eq!(error.title, "Message undeliverable");
}

#[test]
fn test_parse_skips_untracked_statuses_and_bad_timestamps() {
    let body = webhook_body(json!([
        {"id": "wamid.A", "status": "deleted", "timestamp": "1700000000"},
        {"id": "wamid.B", "status": "read"},
        {"id": "wamid.C", "status": "read", "timestamp": "1700000009"}
    ]));
    let updates = parse_whatsapp_statuses(&body).unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].provider_message_id, "wamid.C");
}

#[test]
fn test_parse_message_webhook_without_statuses() {
    let body = json!({"object": "whatsapp_business_account", "entry": [{"changes": [{"value": {"messages": []}}]}]});
    assert!(parse_whatsapp_statuses(&body).unwrap().is_empty());
}

async fn sent_entry(repo: &InMemoryQueueRepository, provider_message_id: &str) {
    let now = Utc::now();
    let entry = QueueEntry::new_pending(
        "tenant-1",
        "+2250701020304".to_string(),
        MessagePayload::Text {
            body: "hi".to_string(),
        },
        0,
        3,
        now,
        now,
    );
    let id = entry.id;
    repo.enqueue(entry).await.unwrap();
    repo.claim_next(now).await.unwrap().unwrap();
    repo.mark_sent(id, now, provider_message_id, now).await.unwrap();
}

fn update(id: &str, status: DeliveryStatus, offset_seconds: i64) -> ProviderStatusUpdate {
    ProviderStatusUpdate {
        provider_message_id: id.to_string(),
        status,
        timestamp: Utc::now() + Duration::seconds(offset_seconds),
        error: None,
    }
}

#[tokio::test]
async fn test_status_progression_is_forward_only() {
    let repo = InMemoryQueueRepository::new();
    sent_entry(&repo, "wamid.X").await;

    let delivered = on_provider_status_update(&repo, &update("wamid.X", DeliveryStatus::Delivered, 1))
        .await
        .unwrap();
    assert_eq!(delivered, StatusUpdateOutcome::Applied);

    let read = on_provider_status_update(&repo, &update("wamid.X", DeliveryStatus::Read, 2))
        .await
        .unwrap();
    assert_eq!(read, StatusUpdateOutcome::Applied);

    // a late "delivered" after "read" is ignored
    let late = on_provider_status_update(&repo, &update("wamid.X", DeliveryStatus::Delivered, 3))
        .await
        .unwrap();
    assert_eq!(late, StatusUpdateOutcome::Ignored);

    let failed = on_provider_status_update(&repo, &update("wamid.X", DeliveryStatus::Failed, 4))
        .await
        .unwrap();
    assert_eq!(failed, StatusUpdateOutcome::Ignored);
}

#[tokio::test]
async fn test_failed_report_does_not_touch_dispatch_status() {
    let repo = InMemoryQueueRepository::new();
    sent_entry(&repo, "wamid.Y").await;

    let outcome = on_provider_status_update(&repo, &update("wamid.Y", DeliveryStatus::Failed, 1))
        .await
        .unwrap();
    assert_eq!(outcome, StatusUpdateOutcome::Applied);

    let counts = repo.counts().await.unwrap();
    assert_eq!(counts.sent, 1);
    assert_eq!(counts.failed, 0);
}

#[tokio::test]
async fn test_unknown_message_id_is_ignored() {
    let repo = InMemoryQueueRepository::new();
    let outcome = on_provider_status_update(&repo, &update("wamid.nope", DeliveryStatus::Read, 0))
        .await
        .unwrap();
    assert_eq!(outcome, StatusUpdateOutcome::Ignored);
}

#[test]
fn test_can_advance_to() {
    use DeliveryStatus::*;
    assert!(DeliveryStatus::can_advance_to(None, Sent));
    assert!(DeliveryStatus::can_advance_to(Some(Sent), Delivered));
    assert!(DeliveryStatus::can_advance_to(Some(Sent), Read));
    assert!(DeliveryStatus::can_advance_to(Some(Delivered), Read));
    assert!(!DeliveryStatus::can_advance_to(Some(Read), Delivered));
    assert!(!DeliveryStatus::can_advance_to(Some(Delivered), Failed));
    assert!(!DeliveryStatus::can_advance_to(Some(Sent), Sent));
}
