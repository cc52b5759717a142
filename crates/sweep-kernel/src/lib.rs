//! Deletion reconciliation kernel.
//!
//! A change event announcing that a row was deleted flows through the
//! [`AccessGuard`], is parsed once into a [`ChangeEvent`], has its object key
//! extracted, and drives one removal on the [`ObjectStoreClient`]. The outcome
//! is then written to the audit trail through [`AuditLogStore`] by moving the
//! newest `pending` row for the reference to `success` or `failed`.
//!
//! Removal is idempotent and the audit update is conditional on `pending`, so
//! redelivering the same event is harmless.

mod guard;
mod key;
mod store;

use std::{fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Deserializer};
use serde_json::Value;
use sweep_db::{AuditLogStore, DeletionStatus};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

pub use guard::{AccessGuard, Rejection, ACCEPTED_METHOD, DEFAULT_SECRET_HEADER};
pub use key::extract_key;
pub use store::{BucketStore, ObjectStoreClient, RemovalInfo, StoreError, StoreSettings};

/// Bucket holding the profile assets unless configured otherwise.
pub const DEFAULT_BUCKET: &str = "alfa_assets";

/// What to do when the audit update finds no `pending` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingPendingPolicy {
    /// Debug log only.
    Ignore,
    /// Warn log.
    #[default]
    Warn,
    /// Warn log and a warning echoed in the response.
    Report,
}

impl FromStr for MissingPendingPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "warn" => Ok(Self::Warn),
            "report" => Ok(Self::Report),
            other => Err(format!(
                "unknown missing-pending policy '{other}' (expected ignore, warn or report)"
            )),
        }
    }
}

/// Logical configuration driving the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub bucket: String,
    pub missing_pending: MissingPendingPolicy,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            bucket: DEFAULT_BUCKET.to_string(),
            missing_pending: MissingPendingPolicy::default(),
        }
    }
}

/// Kind of row change announced by the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(ChangeKind::Insert),
            "UPDATE" => Ok(ChangeKind::Update),
            "DELETE" => Ok(ChangeKind::Delete),
            other => Err(format!("unknown change type '{other}'")),
        }
    }
}

impl<'de> Deserialize<'de> for ChangeKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Row image before the change.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PriorRecord {
    #[serde(rename = "image_url", default)]
    pub object_reference: Option<String>,
}

/// Inbound change notification.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type", default)]
    kind: Option<ChangeKind>,
    #[serde(rename = "old_record", default)]
    prior_record: Option<PriorRecord>,
}

impl ChangeEvent {
    /// Missing `type` means delete: the transport is only wired for deletes.
    pub fn kind(&self) -> ChangeKind {
        self.kind.unwrap_or(ChangeKind::Delete)
    }

    /// The stored reference, if present and non-empty.
    pub fn object_reference(&self) -> Option<&str> {
        self.prior_record
            .as_ref()
            .and_then(|record| record.object_reference.as_deref())
            .filter(|reference| !reference.is_empty())
    }

    /// Parses a request body exactly once.
    ///
    /// On failure the error carries whatever reference could be recovered from
    /// the already decoded JSON, so the audit row can still be marked failed.
    pub fn parse(body: &[u8]) -> Result<Self, MalformedPayload> {
        let value: Value = serde_json::from_slice(body).map_err(|err| MalformedPayload {
            message: format!("invalid JSON body: {err}"),
            salvaged_reference: None,
        })?;

        ChangeEvent::deserialize(&value).map_err(|err| MalformedPayload {
            message: format!("invalid change event: {err}"),
            salvaged_reference: value
                .pointer("/old_record/image_url")
                .and_then(Value::as_str)
                .filter(|reference| !reference.is_empty())
                .map(str::to_owned),
        })
    }
}

/// Body that could not be turned into a [`ChangeEvent`].
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct MalformedPayload {
    pub message: String,
    pub salvaged_reference: Option<String>,
}

/// Failures surfaced to the caller as a failed reconciliation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    MalformedPayload(#[from] MalformedPayload),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why an event needed no work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The prior row had no object reference.
    NoReference,
    /// The reference contained no usable key (e.g. only slashes).
    EmptyKey,
    /// Not a delete event.
    IgnoredKind(ChangeKind),
}

/// Result of the audit bookkeeping step. Never changes the response status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogUpdate {
    Applied,
    NoPendingEntry,
    Failed(String),
    NotAttempted,
}

/// Terminal state of one reconciliation.
#[derive(Debug)]
pub enum ReconcileOutcome {
    Skipped(SkipReason),
    Completed {
        removal: RemovalInfo,
        log: LogUpdate,
        warning: Option<String>,
    },
    Failed {
        error: ReconcileError,
        log: LogUpdate,
        warning: Option<String>,
    },
}

impl ReconcileOutcome {
    pub fn log_update(&self) -> Option<&LogUpdate> {
        match self {
            ReconcileOutcome::Skipped(_) => None,
            ReconcileOutcome::Completed { log, .. } | ReconcileOutcome::Failed { log, .. } => {
                Some(log)
            }
        }
    }
}

/// Raw request as seen by the hosting boundary.
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub method: &'a str,
    pub credential: Option<&'a str>,
    pub body: &'a [u8],
}

/// Deletion reconciler. Stateless between invocations; holds only the
/// injected capabilities.
#[derive(Clone)]
pub struct Reconciler {
    guard: AccessGuard,
    store: Arc<dyn ObjectStoreClient>,
    audit: Arc<dyn AuditLogStore>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        guard: AccessGuard,
        store: Arc<dyn ObjectStoreClient>,
        audit: Arc<dyn AuditLogStore>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            guard,
            store,
            audit,
            config,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    pub fn guard(&self) -> &AccessGuard {
        &self.guard
    }

    /// Admits the request and runs the state machine. Rejected requests never
    /// touch the store or the audit log.
    pub async fn handle(&self, request: InboundRequest<'_>) -> Result<ReconcileOutcome, Rejection> {
        self.guard.check(request.method, request.credential)?;
        Ok(self.reconcile(request.body).await)
    }

    /// Runs the state machine for an already admitted request body.
    #[instrument(skip_all, fields(bucket = %self.config.bucket))]
    pub async fn reconcile(&self, body: &[u8]) -> ReconcileOutcome {
        let event = match ChangeEvent::parse(body) {
            Ok(event) => event,
            Err(malformed) => {
                warn!(error = %malformed, "malformed change event");
                let reference = malformed.salvaged_reference.clone();
                return self
                    .fail(reference.as_deref(), ReconcileError::MalformedPayload(malformed))
                    .await;
            }
        };

        let kind = event.kind();
        if kind != ChangeKind::Delete {
            debug!(%kind, "ignoring non-delete change event");
            return ReconcileOutcome::Skipped(SkipReason::IgnoredKind(kind));
        }

        let Some(reference) = event.object_reference() else {
            debug!("change event carries no object reference");
            return ReconcileOutcome::Skipped(SkipReason::NoReference);
        };

        let key = extract_key(reference);
        if key.is_empty() {
            warn!(reference, "object reference has no key segment");
            return ReconcileOutcome::Skipped(SkipReason::EmptyKey);
        }

        info!(reference, key, "processing deletion");
        match self.store.remove(&self.config.bucket, &[key.to_string()]).await {
            Ok(removal) => {
                let (log, warning) = self
                    .transition(reference, DeletionStatus::Success, None)
                    .await;
                info!(key, ?log, "object removed");
                ReconcileOutcome::Completed {
                    removal,
                    log,
                    warning,
                }
            }
            Err(err) => self.fail(Some(reference), ReconcileError::Store(err)).await,
        }
    }

    async fn fail(&self, reference: Option<&str>, error: ReconcileError) -> ReconcileOutcome {
        error!(%error, reference, "deletion failed");
        let (log, warning) = match reference {
            Some(reference) => {
                let message = error.to_string();
                self.transition(reference, DeletionStatus::Failed, Some(&message))
                    .await
            }
            None => {
                warn!("no object reference recoverable; audit entry left untouched");
                (LogUpdate::NotAttempted, None)
            }
        };
        ReconcileOutcome::Failed {
            error,
            log,
            warning,
        }
    }

    async fn transition(
        &self,
        file_path: &str,
        to: DeletionStatus,
        error_message: Option<&str>,
    ) -> (LogUpdate, Option<String>) {
        match self
            .audit
            .update_status(file_path, DeletionStatus::Pending, to, error_message)
            .await
        {
            Ok(0) => {
                let warning = format!("no pending audit entry for '{file_path}'");
                match self.config.missing_pending {
                    MissingPendingPolicy::Ignore => {
                        debug!(file_path, "no pending audit entry");
                        (LogUpdate::NoPendingEntry, None)
                    }
                    MissingPendingPolicy::Warn => {
                        warn!(file_path, "no pending audit entry");
                        (LogUpdate::NoPendingEntry, None)
                    }
                    MissingPendingPolicy::Report => {
                        warn!(file_path, "no pending audit entry");
                        (LogUpdate::NoPendingEntry, Some(warning))
                    }
                }
            }
            Ok(_) => (LogUpdate::Applied, None),
            Err(err) => {
                error!(%err, file_path, status = %to, "failed to update audit log");
                (LogUpdate::Failed(err.to_string()), None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use object_store::{memory::InMemory, path::Path, ObjectStore, PutPayload};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use sweep_db::{AuditLogFilter, Database, DbError};

    const SECRET: &str = "trigger-secret";

    struct DeniedStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ObjectStoreClient for DeniedStore {
        async fn remove(&self, _bucket: &str, keys: &[String]) -> Result<RemovalInfo, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Backend {
                key: keys[0].clone(),
                source: object_store::Error::Generic {
                    store: "S3",
                    source: "Access Denied".into(),
                },
            })
        }
    }

    struct BrokenAudit;

    #[async_trait]
    impl AuditLogStore for BrokenAudit {
        async fn update_status(
            &self,
            _file_path: &str,
            _from: DeletionStatus,
            _to: DeletionStatus,
            _error_message: Option<&str>,
        ) -> Result<u64, DbError> {
            Err(DbError::Sqlx(sqlx::Error::PoolClosed))
        }
    }

    struct Harness {
        reconciler: Reconciler,
        db: Database,
        objects: Arc<InMemory>,
    }

    async fn harness(policy: MissingPendingPolicy) -> Harness {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let objects = Arc::new(InMemory::new());
        let store = BucketStore::new(DEFAULT_BUCKET, objects.clone());
        let reconciler = Reconciler::new(
            AccessGuard::new(Some(SECRET)),
            Arc::new(store),
            Arc::new(db.clone()),
            ReconcilerConfig {
                missing_pending: policy,
                ..ReconcilerConfig::default()
            },
        );
        Harness {
            reconciler,
            db,
            objects,
        }
    }

    async fn put(objects: &InMemory, name: &str) {
        objects
            .put(&Path::from(name), PutPayload::from_static(b"png"))
            .await
            .unwrap();
    }

    fn delete_event(reference: &str) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "old_record": { "image_url": reference },
            "type": "DELETE"
        }))
        .unwrap()
    }

    fn request<'a>(credential: Option<&'a str>, body: &'a [u8]) -> InboundRequest<'a> {
        InboundRequest {
            method: "POST",
            credential,
            body,
        }
    }

    #[tokio::test]
    async fn pending_entry_resolves_to_success() {
        let h = harness(MissingPendingPolicy::Warn).await;
        put(&h.objects, "c.png").await;
        let target = h.db.schedule("a/b/c.png").await.unwrap();
        let bystander = h.db.schedule("c.png").await.unwrap();

        let body = delete_event("a/b/c.png");
        let outcome = h
            .reconciler
            .handle(request(Some(SECRET), &body))
            .await
            .unwrap();

        match outcome {
            ReconcileOutcome::Completed { removal, log, .. } => {
                assert_eq!(removal.removed, vec!["c.png".to_string()]);
                assert_eq!(log, LogUpdate::Applied);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(h.objects.head(&Path::from("c.png")).await.is_err());
        let target = h.db.fetch(target.id).await.unwrap().unwrap();
        assert_eq!(target.status, DeletionStatus::Success);
        let bystander = h.db.fetch(bystander.id).await.unwrap().unwrap();
        assert_eq!(bystander.status, DeletionStatus::Pending);
    }

    #[tokio::test]
    async fn redelivery_is_harmless() {
        let h = harness(MissingPendingPolicy::Warn).await;
        put(&h.objects, "john.png").await;
        h.db.schedule("john.png").await.unwrap();
        let body = delete_event("john.png");

        let first = h.reconciler.reconcile(&body).await;
        let second = h.reconciler.reconcile(&body).await;

        assert_eq!(first.log_update(), Some(&LogUpdate::Applied));
        assert!(matches!(
            second,
            ReconcileOutcome::Completed {
                log: LogUpdate::NoPendingEntry,
                warning: None,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn report_policy_echoes_missing_pending_entry() {
        let h = harness(MissingPendingPolicy::Report).await;
        let body = delete_event("orphan.png");
        let outcome = h.reconciler.reconcile(&body).await;
        match outcome {
            ReconcileOutcome::Completed { warning, log, .. } => {
                assert_eq!(log, LogUpdate::NoPendingEntry);
                assert!(warning.unwrap().contains("orphan.png"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn store_failure_marks_entry_failed() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let entry = db.schedule("sub/dir/john.png").await.unwrap();
        let store = Arc::new(DeniedStore {
            calls: AtomicUsize::new(0),
        });
        let reconciler = Reconciler::new(
            AccessGuard::new(Some(SECRET)),
            store.clone(),
            Arc::new(db.clone()),
            ReconcilerConfig::default(),
        );

        let outcome = reconciler
            .reconcile(&delete_event("sub/dir/john.png"))
            .await;
        match outcome {
            ReconcileOutcome::Failed { error, log, .. } => {
                assert!(matches!(error, ReconcileError::Store(_)));
                assert!(error.to_string().contains("Access Denied"));
                assert_eq!(log, LogUpdate::Applied);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);

        let entry = db.fetch(entry.id).await.unwrap().unwrap();
        assert_eq!(entry.status, DeletionStatus::Failed);
        assert!(!entry.error_message.unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn audit_failure_does_not_change_the_outcome() {
        let objects = Arc::new(InMemory::new());
        let reconciler = Reconciler::new(
            AccessGuard::new(Some(SECRET)),
            Arc::new(BucketStore::new(DEFAULT_BUCKET, objects)),
            Arc::new(BrokenAudit),
            ReconcilerConfig::default(),
        );
        let outcome = reconciler.reconcile(&delete_event("jane.png")).await;
        match outcome {
            ReconcileOutcome::Completed { log, .. } => {
                assert!(matches!(log, LogUpdate::Failed(_)));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejected_requests_touch_nothing() {
        let h = harness(MissingPendingPolicy::Warn).await;
        put(&h.objects, "jane.png").await;
        h.db.schedule("jane.png").await.unwrap();
        let body = delete_event("jane.png");

        for credential in [None, Some("wrong")] {
            let rejection = h
                .reconciler
                .handle(request(credential, &body))
                .await
                .unwrap_err();
            assert_eq!(rejection, Rejection::Unauthorized);
        }

        let rejection = h
            .reconciler
            .handle(InboundRequest {
                method: "GET",
                credential: Some(SECRET),
                body: &body,
            })
            .await
            .unwrap_err();
        assert_eq!(rejection, Rejection::MethodNotAllowed);

        assert!(h.objects.head(&Path::from("jane.png")).await.is_ok());
        let pending = h
            .db
            .list(AuditLogFilter {
                status: Some(DeletionStatus::Pending),
                ..AuditLogFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn events_without_reference_are_skipped() {
        let h = harness(MissingPendingPolicy::Warn).await;
        put(&h.objects, "bystander.png").await;
        let slashes = h.db.schedule("///").await.unwrap();
        let bystander = h.db.schedule("bystander.png").await.unwrap();

        for body in [
            br#"{"old_record":{"image_url":""},"type":"DELETE"}"#.as_slice(),
            br#"{"old_record":{"image_url":null},"type":"DELETE"}"#.as_slice(),
            br#"{"old_record":{},"type":"DELETE"}"#.as_slice(),
            br#"{"type":"DELETE"}"#.as_slice(),
        ] {
            let outcome = h.reconciler.reconcile(body).await;
            assert!(matches!(
                outcome,
                ReconcileOutcome::Skipped(SkipReason::NoReference)
            ));
        }

        let outcome = h.reconciler.reconcile(&delete_event("///")).await;
        assert!(matches!(
            outcome,
            ReconcileOutcome::Skipped(SkipReason::EmptyKey)
        ));

        assert!(h.objects.head(&Path::from("bystander.png")).await.is_ok());
        for id in [slashes.id, bystander.id] {
            let entry = h.db.fetch(id).await.unwrap().unwrap();
            assert_eq!(entry.status, DeletionStatus::Pending);
            assert!(entry.error_message.is_none());
        }
    }

    #[tokio::test]
    async fn non_delete_events_are_ignored() {
        let h = harness(MissingPendingPolicy::Warn).await;
        put(&h.objects, "kept.png").await;
        let body = br#"{"old_record":{"image_url":"kept.png"},"type":"update"}"#;
        let outcome = h.reconciler.reconcile(body).await;
        assert!(matches!(
            outcome,
            ReconcileOutcome::Skipped(SkipReason::IgnoredKind(ChangeKind::Update))
        ));
        assert!(h.objects.head(&Path::from("kept.png")).await.is_ok());
    }

    #[tokio::test]
    async fn malformed_payload_salvages_reference() {
        let h = harness(MissingPendingPolicy::Warn).await;
        let entry = h.db.schedule("jane.png").await.unwrap();

        let body = br#"{"old_record":{"image_url":"jane.png"},"type":"TRUNCATE"}"#;
        let outcome = h.reconciler.reconcile(body).await;
        match outcome {
            ReconcileOutcome::Failed { error, log, .. } => {
                assert!(matches!(error, ReconcileError::MalformedPayload(_)));
                assert_eq!(log, LogUpdate::Applied);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let entry = h.db.fetch(entry.id).await.unwrap().unwrap();
        assert_eq!(entry.status, DeletionStatus::Failed);
        assert!(entry.error_message.unwrap().contains("TRUNCATE"));
    }

    #[tokio::test]
    async fn unparsable_body_leaves_audit_untouched() {
        let h = harness(MissingPendingPolicy::Warn).await;
        let outcome = h.reconciler.reconcile(b"{not json").await;
        assert!(matches!(
            outcome,
            ReconcileOutcome::Failed {
                log: LogUpdate::NotAttempted,
                ..
            }
        ));
    }

    #[test]
    fn change_kind_is_case_insensitive() {
        let event = ChangeEvent::parse(br#"{"type":"delete","old_record":{"image_url":"x"}}"#)
            .unwrap();
        assert_eq!(event.kind(), ChangeKind::Delete);
        assert_eq!(event.object_reference(), Some("x"));

        let event = ChangeEvent::parse(br#"{"old_record":{"image_url":"x"}}"#).unwrap();
        assert_eq!(event.kind(), ChangeKind::Delete);
    }

    #[test]
    fn missing_pending_policy_parses() {
        assert_eq!(
            "Report".parse::<MissingPendingPolicy>().unwrap(),
            MissingPendingPolicy::Report
        );
        assert!("loud".parse::<MissingPendingPolicy>().is_err());
    }
}
