use async_trait::async_trait;
use bulk_dispatch::error::PreparationError;
use bulk_dispatch::phone::PhoneNormalizer;
use bulk_dispatch::prepare::{
    enqueue_batch, BulkSendPreparer, BulkSendRequest, ContactDirectory, ContactRecord,
    MessageSpec, RecipientRef, SkipReason, TemplateCatalog,
};
use bulk_dispatch::repository::{InMemoryQueueRepository, QueueRepository};
use bulk_dispatch::template::{
    BoundComponent, Component, Template, TemplateParameters, TemplateStatus,
};
use bulk_dispatch::types::{MessagePayload, QueueStatus};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct StaticDirectory {
    members: HashMap<RecipientRef, Vec<ContactRecord>>,
}

#[async_trait]
impl ContactDirectory for StaticDirectory {
    async fn resolve(&self, refs: &[RecipientRef]) -> anyhow::Result<Vec<ContactRecord>> {
        let mut out = Vec::new();
        for r in refs {
            match self.members.get(r) {
                Some(records) => out.extend(records.iter().cloned()),
                None => anyhow::bail!("unknown reference {r:?}"),
            }
        }
        Ok(out)
    }
}

struct StaticCatalog {
    templates: Vec<Template>,
}

#[async_trait]
impl TemplateCatalog for StaticCatalog {
    async fn get(&self, name: &str, language: &str) -> anyhow::Result<Option<Template>> {
        Ok(self
            .templates
            .iter()
            .find(|t| t.name == name && t.language == language)
            .cloned())
    }
}

fn greeting(status: TemplateStatus) -> Template {
    Template {
        name: "greeting".to_string(),
        language: "fr".to_string(),
        status,
        components: vec![Component::Body {
            text: "Bonjour {{1}}, votre solde est {{2}}".to_string(),
        }],
    }
}

fn preparer(directory: StaticDirectory, templates: Vec<Template>) -> BulkSendPreparer {
    BulkSendPreparer::new(
        PhoneNormalizer::new("225"),
        Arc::new(directory),
        Arc::new(StaticCatalog { templates }),
        3,
    )
}

fn template_message(values: &[&str]) -> MessageSpec {
    MessageSpec::Template {
        name: "greeting".to_string(),
        language: "fr".to_string(),
        parameters: TemplateParameters::body(values),
    }
}

fn request(phone_numbers: &[&str], recipients: Vec<RecipientRef>, message: MessageSpec) -> BulkSendRequest {
    BulkSendRequest {
        tenant_id: "tenant-1".to_string(),
        phone_numbers: phone_numbers.iter().map(|p| p.to_string()).collect(),
        recipients,
        message,
        priority: 5,
        delay_seconds: None,
        max_attempts: None,
        dedupe_scope: None,
    }
}

fn body_text(payload: &MessagePayload) -> String {
    match payload {
        MessagePayload::Template(bound) => bound
            .components
            .iter()
            .find_map(|c| match c {
                BoundComponent::Body { text, .. } => Some(text.clone()),
                _ => None,
            })
            .unwrap_or_default(),
        MessagePayload::Text { body } => body.clone(),
    }
}

#[tokio::test]
async fn test_malformed_number_is_skipped_not_fatal() {
    let preparer = preparer(StaticDirectory::default(), vec![greeting(TemplateStatus::Approved)]);
    let req = request(
        &["0701020304", "05 44 33 22 11", "07-AB-CD"],
        Vec::new(),
        template_message(&["client", "0 FCFA"]),
    );

    let batch = preparer.prepare(&req, Utc::now()).await.unwrap();
    assert_eq!(batch.entries.len(), 2);
    assert_eq!(batch.skipped.len(), 1);
    assert_eq!(batch.skipped[0].raw, "07-AB-CD");
    assert_eq!(batch.skipped[0].reason_code(), "invalid_characters");
    assert!(matches!(batch.skipped[0].reason, SkipReason::Normalization { .. }));

    let phones: Vec<&str> = batch.entries.iter().map(|e| e.recipient_phone.as_str()).collect();
    assert_eq!(phones, vec!["+2250701020304", "+2250544332211"]);
    for entry in &batch.entries {
        assert_eq!(entry.status, QueueStatus::Pending);
        assert_eq!(entry.attempts, 0);
        assert_eq!(entry.max_attempts, 3);
        assert_eq!(entry.priority, 5);
        assert_eq!(entry.tenant_id, "tenant-1");
    }
}

#[tokio::test]
async fn test_same_number_from_two_sources_yields_one_entry() {
    let group = RecipientRef::Group("vip".to_string());
    let mut directory = StaticDirectory::default();
    directory.members.insert(
        group.clone(),
        vec![
            ContactRecord::new("+225 07 01 02 03 04").with_field("name", "Awa"),
            ContactRecord::new("0544332211").with_field("name", "Koffi"),
        ],
    );
    let preparer = preparer(directory, vec![greeting(TemplateStatus::Approved)]);
    let req = request(
        &["0701020304"],
        vec![group],
        template_message(&["{name}", "1000 FCFA"]),
    );

    let batch = preparer.prepare(&req, Utc::now()).await.unwrap();
    assert_eq!(batch.entries.len(), 2);
    assert_eq!(batch.duplicates, 1);

    let awa = batch
        .entries
        .iter()
        .find(|e| e.recipient_phone == "+2250701020304")
        .unwrap();
    // the direct number had no fields; the group record filled in the name
    assert_eq!(body_text(&awa.payload), "Bonjour Awa, votre solde est 1000 FCFA");
}

#[tokio::test]
async fn test_per_recipient_tokens() {
    let group = RecipientRef::Segment("active".to_string());
    let mut directory = StaticDirectory::default();
    directory.members.insert(
        group.clone(),
        vec![
            ContactRecord::new("0701020304").with_field("name", "Awa"),
            ContactRecord::new("0544332211"),
        ],
    );
    let preparer = preparer(directory, Vec::new());
    let req = request(
        &[],
        vec![group],
        MessageSpec::Text {
            body: "Salut {name}, ton numero: {phone}".to_string(),
        },
    );

    let batch = preparer.prepare(&req, Utc::now()).await.unwrap();
    let bodies: Vec<String> = batch.entries.iter().map(|e| body_text(&e.payload)).collect();
    assert_eq!(
        bodies,
        vec![
            "Salut Awa, ton numero: +2250701020304".to_string(),
            "Salut , ton numero: +2250544332211".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_delay_priority_and_dedupe_scope() {
    let preparer = preparer(StaticDirectory::default(), vec![greeting(TemplateStatus::Approved)]);
    let mut req = request(&["0701020304"], Vec::new(), template_message(&["a", "b"]));
    req.delay_seconds = Some(120);
    req.max_attempts = Some(5);
    req.dedupe_scope = Some("campaign-7".to_string());

    let now = Utc::now();
    let batch = preparer.prepare(&req, now).await.unwrap();
    let entry = &batch.entries[0];
    assert_eq!(entry.scheduled_at, now + Duration::seconds(120));
    assert_eq!(entry.created_at, now);
    assert_eq!(entry.max_attempts, 5);
    assert_eq!(entry.dedupe_key.as_deref(), Some("campaign-7:+2250701020304"));
}

#[tokio::test]
async fn test_out_of_range_delay_is_rejected() {
    let preparer = preparer(StaticDirectory::default(), vec![greeting(TemplateStatus::Approved)]);
    let now = Utc::now();

    // u64::MAX does not fit an i64; 2e16 seconds fits but overflows the calendar
    for seconds in [u64::MAX, 20_000_000_000_000_000] {
        let mut req = request(&["0701020304"], Vec::new(), template_message(&["a", "b"]));
        req.delay_seconds = Some(seconds);
        assert!(matches!(
            preparer.prepare(&req, now).await,
            Err(PreparationError::InvalidDelay { seconds: s }) if s == seconds
        ));
    }

    let mut req = request(&["0701020304"], Vec::new(), template_message(&["a", "b"]));
    req.delay_seconds = Some(0);
    let batch = preparer.prepare(&req, now).await.unwrap();
    assert_eq!(batch.entries[0].scheduled_at, now);
}

#[tokio::test]
async fn test_binding_failure_is_per_recipient_skip() {
    let preparer = preparer(StaticDirectory::default(), vec![greeting(TemplateStatus::Approved)]);
    let req = request(&["0701020304"], Vec::new(), template_message(&["only one"]));

    let batch = preparer.prepare(&req, Utc::now()).await.unwrap();
    assert!(batch.entries.is_empty());
    assert_eq!(batch.skipped.len(), 1);
    assert_eq!(batch.skipped[0].reason_code(), "parameter_count_mismatch");
}

#[tokio::test]
async fn test_whole_request_failures() {
    let preparer = preparer(StaticDirectory::default(), vec![greeting(TemplateStatus::Pending)]);

    let empty = request(&[], Vec::new(), template_message(&["a", "b"]));
    assert!(matches!(
        preparer.prepare(&empty, Utc::now()).await,
        Err(PreparationError::NoRecipients)
    ));

    let unapproved = request(&["0701020304"], Vec::new(), template_message(&["a", "b"]));
    assert!(matches!(
        preparer.prepare(&unapproved, Utc::now()).await,
        Err(PreparationError::TemplateNotApproved { .. })
    ));

    let mut missing = request(&["0701020304"], Vec::new(), template_message(&["a", "b"]));
    missing.message = MessageSpec::Template {
        name: "nope".to_string(),
        language: "fr".to_string(),
        parameters: TemplateParameters::default(),
    };
    assert!(matches!(
        preparer.prepare(&missing, Utc::now()).await,
        Err(PreparationError::TemplateNotFound { .. })
    ));

    let unknown_group = request(
        &["0701020304"],
        vec![RecipientRef::Group("ghost".to_string())],
        MessageSpec::Text {
            body: "hi".to_string(),
        },
    );
    assert!(matches!(
        preparer.prepare(&unknown_group, Utc::now()).await,
        Err(PreparationError::Directory(_))
    ));
}

#[tokio::test]
async fn test_enqueue_batch_reports_duplicates() {
    let repo = InMemoryQueueRepository::new();
    let preparer = preparer(StaticDirectory::default(), vec![greeting(TemplateStatus::Approved)]);
    let mut req = request(
        &["0701020304", "0544332211"],
        Vec::new(),
        template_message(&["a", "b"]),
    );
    req.dedupe_scope = Some("campaign-7".to_string());

    let first = preparer.prepare(&req, Utc::now()).await.unwrap();
    let report = enqueue_batch(&repo, first.entries).await.unwrap();
    assert_eq!(report.inserted.len(), 2);
    assert!(report.duplicates.is_empty());

    let again = preparer.prepare(&req, Utc::now()).await.unwrap();
    let report = enqueue_batch(&repo, again.entries).await.unwrap();
    assert!(report.inserted.is_empty());
    assert_eq!(report.duplicates.len(), 2);
    assert_eq!(repo.counts().await.unwrap().pending, 2);
}

#[test]
fn test_request_deserializes_from_json() {
    let raw = r#"{
        "tenantId": "t-9",
        "phoneNumbers": ["0701020304"],
        "recipients": [{"type": "group", "id": "vip"}],
        "message": {"kind": "template", "name": "greeting", "language": "fr",
                    "parameters": {"body": ["{name}", "100"]}},
        "priority": 10,
        "delaySeconds": 60
    }"#;
    let req: BulkSendRequest = serde_json::from_str(raw).unwrap();
    assert_eq!(req.tenant_id, "t-9");
    assert_eq!(req.recipients, vec![RecipientRef::Group("vip".to_string())]);
    assert_eq!(req.priority, 10);
    assert_eq!(req.delay_seconds, Some(60));
    assert!(req.dedupe_scope.is_none());
}
