//! Core data model for the a3s-guard pipeline
//!
//! All serializable types use camelCase JSON for wire compatibility with
//! audit archives and downstream consumers.

use crate::executor::OperationHandler;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Structured key/value details attached to audit events and metrics
pub type Details = serde_json::Map<String, serde_json::Value>;

/// A unit of business work submitted to the pipeline
///
/// Carries its own permission requirements and the handler that performs
/// the work. Fields are read-only once built; the pipeline takes the
/// operation by value so it cannot change after submission.
#[derive(Clone)]
pub struct Operation {
    id: String,
    operation_type: String,
    payload: serde_json::Value,
    required_permissions: BTreeSet<String>,
    handler: Arc<dyn OperationHandler>,
}

impl Operation {
    /// Create an operation with a generated id (op-<uuid>)
    pub fn new(
        operation_type: impl Into<String>,
        payload: serde_json::Value,
        handler: Arc<dyn OperationHandler>,
    ) -> Self {
        Self {
            id: format!("op-{}", uuid::Uuid::new_v4()),
            operation_type: operation_type.into(),
            payload,
            required_permissions: BTreeSet::new(),
            handler,
        }
    }

    /// Use a caller-supplied id instead of the generated one
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Add a permission the actor must hold
    pub fn require(mut self, permission: impl Into<String>) -> Self {
        self.required_permissions.insert(permission.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn operation_type(&self) -> &str {
        &self.operation_type
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn required_permissions(&self) -> &BTreeSet<String> {
        &self.required_permissions
    }

    pub(crate) fn handler(&self) -> &Arc<dyn OperationHandler> {
        &self.handler
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("operation_type", &self.operation_type)
            .field("payload", &self.payload)
            .field("required_permissions", &self.required_permissions)
            .finish_non_exhaustive()
    }
}

/// The actor and request metadata attached to an operation's execution
///
/// Built once per request and read-only afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    /// Authenticated user, `None` for anonymous actors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Permissions granted to the current actor
    #[serde(default)]
    pub permissions: BTreeSet<String>,

    /// Request identifier (req-<uuid> when generated)
    pub request_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl SecurityContext {
    /// Anonymous context with a generated request id
    pub fn anonymous() -> Self {
        Self {
            request_id: format!("req-{}", uuid::Uuid::new_v4()),
            ..Default::default()
        }
    }

    /// Authenticated context for a user
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Self::anonymous()
        }
    }

    /// Grant a permission
    pub fn with_permission(mut self, permission: impl Into<String>) -> Self {
        self.permissions.insert(permission.into());
        self
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none()
    }

    /// Key used to attribute activity: user id, then client IP, then "anonymous"
    pub fn actor_key(&self) -> &str {
        self.user_id
            .as_deref()
            .or(self.client_ip.as_deref())
            .unwrap_or("anonymous")
    }

    /// Permissions in `required` that this context does not hold
    pub fn missing_permissions<'a>(
        &self,
        required: impl IntoIterator<Item = &'a String>,
    ) -> Vec<String> {
        required
            .into_iter()
            .filter(|p| !self.permissions.contains(*p))
            .cloned()
            .collect()
    }
}

/// Outcome of an operation's business logic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResult {
    /// Whether the business logic considers its own output valid
    pub valid: bool,

    /// Result payload
    pub data: serde_json::Value,

    /// Opaque token stamped by integrity verification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_token: Option<String>,
}

impl OperationResult {
    pub fn valid(data: serde_json::Value) -> Self {
        Self {
            valid: true,
            data,
            integrity_token: None,
        }
    }

    pub fn invalid(data: serde_json::Value) -> Self {
        Self {
            valid: false,
            data,
            integrity_token: None,
        }
    }

    pub fn with_integrity_token(mut self, token: impl Into<String>) -> Self {
        self.integrity_token = Some(token.into());
        self
    }
}

/// Audit event classification
///
/// Serialized as an uppercase tag (`OPERATION_START`, ...). Any other tag
/// is a security event tag such as `ACCESS_DENIED`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AuditEventType {
    OperationStart,
    OperationSuccess,
    OperationFailure,
    Security(String),
}

impl AuditEventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::OperationStart => "OPERATION_START",
            Self::OperationSuccess => "OPERATION_SUCCESS",
            Self::OperationFailure => "OPERATION_FAILURE",
            Self::Security(tag) => tag,
        }
    }

    /// Security event tag
    ///
    /// Tags that collide with a lifecycle name get a `SECURITY_` prefix so the
    /// event never reads back as a lifecycle event.
    pub fn security(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        match Self::from(tag) {
            Self::Security(tag) => Self::Security(tag),
            lifecycle => Self::Security(format!("SECURITY_{}", lifecycle.as_str())),
        }
    }

    /// SUCCESS or FAILURE
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::OperationSuccess | Self::OperationFailure)
    }
}

impl fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for AuditEventType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "OPERATION_START" => Self::OperationStart,
            "OPERATION_SUCCESS" => Self::OperationSuccess,
            "OPERATION_FAILURE" => Self::OperationFailure,
            _ => Self::Security(tag),
        }
    }
}

impl From<AuditEventType> for String {
    fn from(event_type: AuditEventType) -> Self {
        event_type.as_str().to_string()
    }
}

/// An append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Unique event identifier (aud-<uuid>)
    pub event_id: String,

    /// Identity of the system that produced the event
    pub system_id: String,

    pub event_type: AuditEventType,

    /// Operation id, or the id of the security event being recorded
    pub reference_id: String,

    /// Unix timestamp in milliseconds
    pub timestamp: u64,

    #[serde(default)]
    pub details: Details,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default)]
    pub is_security_event: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl AuditEvent {
    /// Create an event stamped with a fresh id and the current time
    pub fn new(
        system_id: impl Into<String>,
        event_type: AuditEventType,
        reference_id: impl Into<String>,
        details: Details,
        is_security_event: bool,
        context: Option<&SecurityContext>,
    ) -> Self {
        Self {
            event_id: format!("aud-{}", uuid::Uuid::new_v4()),
            system_id: system_id.into(),
            event_type,
            reference_id: reference_id.into(),
            timestamp: now_millis(),
            details,
            user_id: context.and_then(|c| c.user_id.clone()),
            is_security_event,
            ip_address: context.and_then(|c| c.client_ip.clone()),
            user_agent: context.and_then(|c| c.user_agent.clone()),
        }
    }
}

/// A single numeric sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub name: String,
    pub value: f64,

    /// Unix timestamp in milliseconds
    pub timestamp: u64,

    #[serde(default)]
    pub context: Details,
}

impl Metric {
    /// Sample stamped with the current time
    pub fn new(name: impl Into<String>, value: f64, context: Details) -> Self {
        Self::at(name, value, now_millis(), context)
    }

    /// Sample with an explicit timestamp
    pub fn at(name: impl Into<String>, value: f64, timestamp: u64, context: Details) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
            context,
        }
    }
}

/// Summary statistics over a metric window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub count: usize,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
