//! Append-only audit trail
//!
//! `AuditTrail::record` never fails. Every event goes to the primary
//! `AuditSink`; security and critical events go to the `EscalationChannel`
//! concurrently with that write. A failed primary write is reported to the
//! `FallbackChannel` together with the original event. When archival is
//! enabled, each event is also appended as one JSON line to a daily file.

use crate::config::{ArchivePolicy, PipelineConfig};
use crate::error::{GuardError, Result};
use crate::types::{now_millis, AuditEvent, AuditEventType, Details, SecurityContext};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

/// Durable, append-only store of audit events
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: &AuditEvent) -> Result<()>;

    async fn count(&self) -> Result<usize>;

    /// Most recent events first
    async fn list(&self, limit: usize) -> Result<Vec<AuditEvent>>;

    /// All events recorded for an operation or event id, oldest first
    async fn events_for(&self, reference_id: &str) -> Result<Vec<AuditEvent>>;
}

/// High-priority channel for security and critical events
#[async_trait]
pub trait EscalationChannel: Send + Sync {
    async fn escalate(&self, event: &AuditEvent) -> Result<()>;
}

/// An audit event that could not be written, with the write failure
#[derive(Debug, Clone)]
pub struct EmergencyRecord {
    pub event: AuditEvent,

    /// Rendered `GuardError::AuditWrite`
    pub error: String,

    /// Unix timestamp in milliseconds
    pub recorded_at: u64,
}

impl EmergencyRecord {
    pub fn new(event: AuditEvent, error: &GuardError) -> Self {
        Self {
            event,
            error: error.to_string(),
            recorded_at: now_millis(),
        }
    }
}

/// Last-resort channel for audit write failures
///
/// Implementations must not fail; they are the end of the line.
#[async_trait]
pub trait FallbackChannel: Send + Sync {
    async fn record(&self, record: EmergencyRecord);
}

// ============================================================================
// In-memory implementations
// ============================================================================

/// In-memory audit sink for development and testing
///
/// Clones share the same event log.
#[derive(Clone, Default)]
pub struct MemoryAuditSink {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, event: &AuditEvent) -> Result<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.events.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let events = self.events.read().await;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }

    async fn events_for(&self, reference_id: &str) -> Result<Vec<AuditEvent>> {
        let events = self.events.read().await;
        Ok(events
            .iter()
            .filter(|e| e.reference_id == reference_id)
            .cloned()
            .collect())
    }
}

/// Collects escalated events in memory
#[derive(Clone, Default)]
pub struct MemoryEscalationChannel {
    events: Arc<RwLock<Vec<AuditEvent>>>,
}

impl MemoryEscalationChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }
}

#[async_trait]
impl EscalationChannel for MemoryEscalationChannel {
    async fn escalate(&self, event: &AuditEvent) -> Result<()> {
        self.events.write().await.push(event.clone());
        Ok(())
    }
}

/// Collects emergency records in memory
#[derive(Clone, Default)]
pub struct MemoryFallbackChannel {
    records: Arc<RwLock<Vec<EmergencyRecord>>>,
}

impl MemoryFallbackChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<EmergencyRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl FallbackChannel for MemoryFallbackChannel {
    async fn record(&self, record: EmergencyRecord) {
        self.records.write().await.push(record);
    }
}

// ============================================================================
// Tracing implementations
// ============================================================================

/// Escalates by logging at error level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEscalationChannel;

#[async_trait]
impl EscalationChannel for TracingEscalationChannel {
    async fn escalate(&self, event: &AuditEvent) -> Result<()> {
        tracing::error!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            reference_id = %event.reference_id,
            system_id = %event.system_id,
            user_id = ?event.user_id,
            ip_address = ?event.ip_address,
            details = %serde_json::Value::Object(event.details.clone()),
            "Security audit event escalated"
        );
        Ok(())
    }
}

/// Reports emergency records through the log
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingFallbackChannel;

#[async_trait]
impl FallbackChannel for TracingFallbackChannel {
    async fn record(&self, record: EmergencyRecord) {
        let event = serde_json::to_string(&record.event)
            .unwrap_or_else(|e| format!("<unserializable event {}: {}>", record.event.event_id, e));
        tracing::error!(
            error = %record.error,
            event = %event,
            "Audit write failed, emergency record emitted"
        );
    }
}

// ============================================================================
// Daily archive
// ============================================================================

/// Line-delimited JSON archive partitioned by UTC date
///
/// Writes `<dir>/YYYY-MM-DD_audit.log`. Appends are serialized through an
/// in-process lock and each record is written with a single call.
pub struct FileAuditArchive {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl FileAuditArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Archive file that holds events with the given timestamp
    pub fn path_for(&self, timestamp_ms: u64) -> PathBuf {
        let date = DateTime::<Utc>::from_timestamp_millis(timestamp_ms as i64)
            .unwrap_or_default()
            .format("%Y-%m-%d");
        self.dir.join(format!("{}_audit.log", date))
    }

    pub async fn append(&self, event: &AuditEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let path = self.path_for(event.timestamp);

        let _guard = self.lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

// ============================================================================
// Audit trail
// ============================================================================

/// Records operation lifecycle and security events
pub struct AuditTrail {
    config: PipelineConfig,
    sink: Arc<dyn AuditSink>,
    escalation: Arc<dyn EscalationChannel>,
    fallback: Arc<dyn FallbackChannel>,
    archive: Option<FileAuditArchive>,
}

impl AuditTrail {
    /// Build a trail from config; escalation and fallback default to tracing
    pub fn new(config: &PipelineConfig, sink: Arc<dyn AuditSink>) -> Self {
        Self {
            archive: config
                .enable_archive
                .then(|| FileAuditArchive::new(config.archive_dir.clone())),
            config: config.clone(),
            sink,
            escalation: Arc::new(TracingEscalationChannel),
            fallback: Arc::new(TracingFallbackChannel),
        }
    }

    pub fn with_escalation(mut self, escalation: Arc<dyn EscalationChannel>) -> Self {
        self.escalation = escalation;
        self
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn FallbackChannel>) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn system_id(&self) -> &str {
        &self.config.system_id
    }

    pub fn sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }

    pub fn archive(&self) -> Option<&FileAuditArchive> {
        self.archive.as_ref()
    }

    /// Whether an event of this type/flag goes to the escalation channel
    pub fn requires_escalation(&self, event_type: &AuditEventType, is_security_event: bool) -> bool {
        is_security_event || self.config.is_critical(event_type.as_str())
    }

    /// Record an event; failures are reported, never returned
    pub async fn record(
        &self,
        event_type: AuditEventType,
        reference_id: &str,
        details: Details,
        is_security_event: bool,
        context: Option<&SecurityContext>,
    ) -> AuditEvent {
        let event = AuditEvent::new(
            self.config.system_id.clone(),
            event_type,
            reference_id,
            details,
            is_security_event,
            context,
        );

        let primary = if self.requires_escalation(&event.event_type, is_security_event) {
            let (primary, escalated) =
                futures::future::join(self.sink.append(&event), self.escalation.escalate(&event))
                    .await;
            if let Err(e) = escalated {
                tracing::error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %e,
                    "Failed to escalate audit event"
                );
            }
            primary
        } else {
            self.sink.append(&event).await
        };

        if let Err(e) = primary {
            let err = GuardError::AuditWrite(e.to_string());
            tracing::error!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                error = %err,
                "Primary audit write failed"
            );
            self.fallback
                .record(EmergencyRecord::new(event.clone(), &err))
                .await;
        }

        if let Some(archive) = &self.archive {
            if let Err(e) = archive.append(&event).await {
                tracing::warn!(
                    event_id = %event.event_id,
                    dir = %archive.dir().display(),
                    error = %e,
                    "Failed to archive audit event"
                );
                if self.config.archive_policy == ArchivePolicy::Required {
                    let err = GuardError::AuditWrite(format!("Archive write failed: {}", e));
                    self.fallback
                        .record(EmergencyRecord::new(event.clone(), &err))
                        .await;
                }
            }
        }

        event
    }

    /// Record a security event (always escalated) under a fresh sec-<uuid> id
    ///
    /// Lifecycle names are not valid tags here; see `AuditEventType::security`.
    pub async fn record_security_event(
        &self,
        tag: impl Into<String>,
        details: Details,
        context: Option<&SecurityContext>,
    ) -> AuditEvent {
        let reference_id = format!("sec-{}", uuid::Uuid::new_v4());
        self.record(
            AuditEventType::security(tag),
            &reference_id,
            details,
            true,
            context,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink that rejects every write
    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn append(&self, _event: &AuditEvent) -> Result<()> {
            Err(GuardError::Storage("audit table locked".to_string()))
        }

        async fn count(&self) -> Result<usize> {
            Ok(0)
        }

        async fn list(&self, _limit: usize) -> Result<Vec<AuditEvent>> {
            Ok(Vec::new())
        }

        async fn events_for(&self, _reference_id: &str) -> Result<Vec<AuditEvent>> {
            Ok(Vec::new())
        }
    }

    struct Channels {
        sink: MemoryAuditSink,
        escalation: MemoryEscalationChannel,
        fallback: MemoryFallbackChannel,
    }

    fn trail(config: &PipelineConfig) -> (AuditTrail, Channels) {
        let channels = Channels {
            sink: MemoryAuditSink::new(),
            escalation: MemoryEscalationChannel::new(),
            fallback: MemoryFallbackChannel::new(),
        };
        let trail = AuditTrail::new(config, Arc::new(channels.sink.clone()))
            .with_escalation(Arc::new(channels.escalation.clone()))
            .with_fallback(Arc::new(channels.fallback.clone()));
        (trail, channels)
    }

    fn details(key: &str, value: serde_json::Value) -> Details {
        let mut details = Details::new();
        details.insert(key.to_string(), value);
        details
    }

    #[tokio::test]
    async fn test_record_appends_to_sink() {
        let config = PipelineConfig::default().with_system_id("cms");
        let (trail, channels) = trail(&config);
        let ctx = SecurityContext::for_user("u-1").with_client_ip("10.0.0.1");

        let event = trail
            .record(
                AuditEventType::OperationStart,
                "op-1",
                details("operationType", serde_json::json!("content.create")),
                false,
                Some(&ctx),
            )
            .await;

        assert_eq!(event.system_id, "cms");
        assert_eq!(event.user_id.as_deref(), Some("u-1"));
        assert_eq!(channels.sink.count().await.unwrap(), 1);
        assert_eq!(channels.sink.events_for("op-1").await.unwrap().len(), 1);
        assert!(channels.escalation.events().await.is_empty());
        assert!(channels.fallback.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_security_and_critical_events_escalate() {
        let config = PipelineConfig::default().with_critical_event_type("OPERATION_FAILURE");
        let (trail, channels) = trail(&config);
        assert!(trail.requires_escalation(&AuditEventType::OperationFailure, false));
        assert!(!trail.requires_escalation(&AuditEventType::OperationSuccess, false));
        assert!(trail.requires_escalation(&AuditEventType::OperationSuccess, true));

        trail
            .record_security_event("ACCESS_DENIED", Details::new(), None)
            .await;
        trail
            .record(AuditEventType::OperationFailure, "op-2", Details::new(), false, None)
            .await;
        trail
            .record(AuditEventType::OperationSuccess, "op-3", Details::new(), false, None)
            .await;

        let escalated = channels.escalation.events().await;
        assert_eq!(escalated.len(), 2);
        assert_eq!(escalated[0].event_type.as_str(), "ACCESS_DENIED");
        assert!(escalated[0].is_security_event);
        assert_eq!(escalated[1].event_type, AuditEventType::OperationFailure);
        assert_eq!(channels.sink.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_security_event_with_lifecycle_tag_is_not_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::default().with_archive(dir.path(), ArchivePolicy::Required);
        let (trail, channels) = trail(&config);

        let event = trail
            .record_security_event("OPERATION_FAILURE", Details::new(), None)
            .await;
        assert_eq!(event.event_type.as_str(), "SECURITY_OPERATION_FAILURE");
        assert!(!event.event_type.is_terminal());

        let path = trail.archive().unwrap().path_for(event.timestamp);
        let content = std::fs::read_to_string(path).unwrap();
        let archived: AuditEvent = serde_json::from_str(content.trim_end()).unwrap();
        assert_eq!(archived.event_type, event.event_type);
        assert!(!archived.event_type.is_terminal());
        assert!(channels.fallback.records().await.is_empty());
    }

    #[tokio::test]
    async fn test_primary_failure_goes_to_fallback() {
        let fallback = MemoryFallbackChannel::new();
        let escalation = MemoryEscalationChannel::new();
        let trail = AuditTrail::new(&PipelineConfig::default(), Arc::new(BrokenSink))
            .with_escalation(Arc::new(escalation.clone()))
            .with_fallback(Arc::new(fallback.clone()));

        let event = trail
            .record_security_event("TOKEN_REPLAY", details("token", serde_json::json!("t-1")), None)
            .await;

        let records = fallback.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event.event_id, event.event_id);
        assert!(records[0].error.contains("audit table locked"));
        // Escalation happens regardless of the primary outcome
        assert_eq!(escalation.events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_archive_writes_daily_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::default().with_archive(dir.path(), ArchivePolicy::BestEffort);
        let (trail, _channels) = trail(&config);

        let first = trail
            .record(AuditEventType::OperationStart, "op-9", Details::new(), false, None)
            .await;
        trail
            .record(AuditEventType::OperationSuccess, "op-9", Details::new(), false, None)
            .await;

        let archive = trail.archive().unwrap();
        let path = archive.path_for(first.timestamp);
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("_audit.log"));
        assert_eq!(name.len(), "YYYY-MM-DD_audit.log".len());

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: AuditEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.event_id, first.event_id);
        assert_eq!(parsed.event_type, AuditEventType::OperationStart);
    }

    #[test]
    fn test_archive_path_uses_utc_date() {
        let archive = FileAuditArchive::new("/var/audit");
        // 2024-03-01T00:00:00Z
        let path = archive.path_for(1_709_251_200_000);
        assert_eq!(path, PathBuf::from("/var/audit/2024-03-01_audit.log"));
    }

    #[tokio::test]
    async fn test_archive_failure_policy() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where the archive directory should be
        let blocked = dir.path().join("not-a-dir");
        std::fs::write(&blocked, "x").unwrap();

        let best_effort = PipelineConfig::default().with_archive(&blocked, ArchivePolicy::BestEffort);
        let (trail_a, channels_a) = trail(&best_effort);
        trail_a
            .record(AuditEventType::OperationStart, "op-a", Details::new(), false, None)
            .await;
        assert_eq!(channels_a.sink.count().await.unwrap(), 1);
        assert!(channels_a.fallback.records().await.is_empty());

        let required = PipelineConfig::default().with_archive(&blocked, ArchivePolicy::Required);
        let (trail_b, channels_b) = trail(&required);
        trail_b
            .record(AuditEventType::OperationStart, "op-b", Details::new(), false, None)
            .await;
        assert_eq!(channels_b.sink.count().await.unwrap(), 1);
        let records = channels_b.fallback.records().await;
        assert_eq!(records.len(), 1);
        assert!(records[0].error.contains("Archive write failed"));
    }

    #[tokio::test]
    async fn test_concurrent_archive_appends_do_not_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(FileAuditArchive::new(dir.path()));

        let mut handles = Vec::new();
        for i in 0..20 {
            let archive = archive.clone();
            handles.push(tokio::spawn(async move {
                let event = AuditEvent::new(
                    "cms",
                    AuditEventType::OperationStart,
                    format!("op-{}", i),
                    details("padding", serde_json::json!("x".repeat(2048))),
                    false,
                    None,
                );
                archive.append(&event).await.unwrap();
                event.timestamp
            }));
        }

        let mut paths = std::collections::BTreeSet::new();
        for handle in handles {
            paths.insert(archive.path_for(handle.await.unwrap()));
        }

        let mut total = 0;
        for path in paths {
            let content = std::fs::read_to_string(path).unwrap();
            for line in content.lines() {
                serde_json::from_str::<AuditEvent>(line).unwrap();
                total += 1;
            }
        }
        assert_eq!(total, 20);
    }
}
