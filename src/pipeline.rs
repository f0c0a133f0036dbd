//! Secure critical-operation pipeline
//!
//! Every operation runs through the same fixed sequence:
//!
//! ```text
//! Validating -> Beginning -> Executing -> Verifying -> Committing -> Auditing -> Done
//!                                   \__________\____________\-> RollingBack -> Auditing
//! ```
//!
//! Each invocation emits exactly one `OPERATION_START` and exactly one
//! terminal (`OPERATION_SUCCESS` or `OPERATION_FAILURE`) audit event under the
//! operation id. Gate failures never open a transaction. Failures after the
//! transaction is open roll it back exactly once. The caller always receives
//! the original error. Audit and metrics failures never change the outcome.

use crate::audit::{AuditSink, AuditTrail, EscalationChannel, FallbackChannel, MemoryAuditSink};
use crate::config::PipelineConfig;
use crate::error::{GuardError, Result};
use crate::executor::{ExecutionContext, OperationExecutor};
use crate::gate::{SecurityGate, StandardSecurityGate};
use crate::metrics::{MemoryMetricsStore, MetricsRecorder, MetricsStore};
use crate::store::TransactionalStore;
use crate::transaction::TransactionCoordinator;
use crate::types::{AuditEventType, Details, Operation, OperationResult, SecurityContext};
use crate::validator::{RuleValidator, Validator};
use crate::verifier::IntegrityVerifier;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Audit tag for permission denials
pub const ACCESS_DENIED: &str = "ACCESS_DENIED";

/// Audit tag for security-constraint violations
pub const SECURITY_CONSTRAINT_VIOLATION: &str = "SECURITY_CONSTRAINT_VIOLATION";

/// Stage of a pipeline invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Validating,
    /// Opening the transaction
    Beginning,
    Executing,
    Verifying,
    Committing,
    RollingBack,
    Auditing,
    Done,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Beginning => "beginning",
            Self::Executing => "executing",
            Self::Verifying => "verifying",
            Self::Committing => "committing",
            Self::RollingBack => "rolling_back",
            Self::Auditing => "auditing",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of the duration metric recorded for an operation type
pub fn duration_metric_name(operation_type: &str) -> String {
    format!("operation.{}.duration_ms", operation_type)
}

/// Name of the error counter incremented for an operation type
pub fn error_metric_name(operation_type: &str) -> String {
    format!("operation.{}.errors", operation_type)
}

fn into_details(value: serde_json::Value) -> Details {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Details::new(),
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Wraps business operations with authorization, atomic execution,
/// integrity verification, audit logging and metrics
pub struct SecureOperationPipeline {
    config: PipelineConfig,
    gate: Arc<dyn SecurityGate>,
    store: Arc<dyn TransactionalStore>,
    executor: OperationExecutor,
    verifier: IntegrityVerifier,
    audit: Arc<AuditTrail>,
    metrics: Arc<MetricsRecorder>,
}

impl SecureOperationPipeline {
    /// Start building a pipeline around a transactional store
    pub fn builder(config: PipelineConfig, store: Arc<dyn TransactionalStore>) -> PipelineBuilder {
        PipelineBuilder::new(config, store)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// Run an operation through the full pipeline
    ///
    /// Returns the verified, integrity-sealed result after a successful
    /// commit, or the original error after cleanup.
    pub async fn execute(
        &self,
        operation: Operation,
        context: &SecurityContext,
    ) -> Result<OperationResult> {
        let started = Instant::now();
        tracing::debug!(
            operation_id = %operation.id(),
            operation_type = %operation.operation_type(),
            request_id = %context.request_id,
            stage = %PipelineStage::Validating,
            "Pipeline started"
        );

        let validated = match self.gate.validate(&operation, context).await {
            Ok(validated) => validated,
            Err(e) => {
                self.record_start(&operation, context).await;
                self.record_denial(&operation, context, &e).await;
                self.record_failure(&operation, context, PipelineStage::Validating, &e, started, None)
                    .await;
                tracing::warn!(
                    operation_id = %operation.id(),
                    operation_type = %operation.operation_type(),
                    error = %e,
                    "Operation rejected by security gate"
                );
                return Err(e);
            }
        };

        let mut transaction = TransactionCoordinator::new(self.store.clone());
        let tx = match transaction.begin().await {
            Ok(tx) => tx.clone(),
            Err(e) => {
                self.record_start(&operation, context).await;
                self.record_failure(&operation, context, PipelineStage::Beginning, &e, started, None)
                    .await;
                self.record_error_metric(&operation, &e).await;
                tracing::error!(
                    operation_id = %operation.id(),
                    error = %e,
                    "Failed to open transaction"
                );
                return Err(e);
            }
        };
        self.record_start(&operation, context).await;

        tracing::debug!(
            operation_id = %operation.id(),
            transaction = %tx,
            stage = %PipelineStage::Executing,
            "Pipeline stage"
        );
        let execution = self
            .executor
            .execute(ExecutionContext {
                operation: &operation,
                validated: &validated,
                security: context,
                transaction: &tx,
            })
            .await;
        let execution = match execution {
            Ok(execution) => execution,
            Err(e) => {
                return Err(self
                    .abort(&mut transaction, &operation, context, PipelineStage::Executing, e, started)
                    .await)
            }
        };

        tracing::debug!(operation_id = %operation.id(), stage = %PipelineStage::Verifying, "Pipeline stage");
        let result = match self
            .verifier
            .verify(operation.operation_type(), execution.result)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                return Err(self
                    .abort(&mut transaction, &operation, context, PipelineStage::Verifying, e, started)
                    .await)
            }
        };

        tracing::debug!(operation_id = %operation.id(), stage = %PipelineStage::Committing, "Pipeline stage");
        if let Err(e) = transaction.commit().await {
            return Err(self
                .abort(&mut transaction, &operation, context, PipelineStage::Committing, e, started)
                .await);
        }

        let duration_ms = elapsed_ms(started);
        let summary = serde_json::json!({
            "operationType": operation.operation_type(),
            "durationMs": duration_ms,
            "executionMs": execution.duration.as_secs_f64() * 1000.0,
            "transactionId": tx.as_str(),
            "result": {
                "valid": result.valid,
                "integrityToken": result.integrity_token,
                "dataKeys": result
                    .data
                    .as_object()
                    .map(|m| m.keys().cloned().collect::<Vec<_>>())
                    .unwrap_or_default(),
            },
        });
        self.audit
            .record(
                AuditEventType::OperationSuccess,
                operation.id(),
                into_details(summary),
                false,
                Some(context),
            )
            .await;

        let metric_context = into_details(serde_json::json!({
            "operationType": operation.operation_type(),
            "operationId": operation.id(),
        }));
        if let Err(e) = self
            .metrics
            .record_metric(
                &duration_metric_name(operation.operation_type()),
                duration_ms,
                metric_context,
            )
            .await
        {
            tracing::warn!(
                operation_id = %operation.id(),
                error = %e,
                "Failed to record duration metric"
            );
        }

        tracing::info!(
            operation_id = %operation.id(),
            operation_type = %operation.operation_type(),
            duration_ms,
            stage = %PipelineStage::Done,
            "Operation completed"
        );
        Ok(result)
    }

    /// Roll back, audit the failure, and hand back the error for the caller
    async fn abort(
        &self,
        transaction: &mut TransactionCoordinator,
        operation: &Operation,
        context: &SecurityContext,
        stage: PipelineStage,
        error: GuardError,
        started: Instant,
    ) -> GuardError {
        tracing::warn!(
            operation_id = %operation.id(),
            stage = %stage,
            error = %error,
            next = %PipelineStage::RollingBack,
            "Operation failed, rolling back"
        );

        let rollback_error = match transaction.rollback().await {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(
                    operation_id = %operation.id(),
                    error = %e,
                    "Rollback failed"
                );
                Some(e)
            }
        };

        self.record_failure(operation, context, stage, &error, started, Some(rollback_error.as_ref()))
            .await;
        self.record_error_metric(operation, &error).await;
        error
    }

    async fn record_start(&self, operation: &Operation, context: &SecurityContext) {
        let details = serde_json::json!({
            "operationType": operation.operation_type(),
            "requestId": context.request_id,
            "requiredPermissions": operation.required_permissions(),
        });
        self.audit
            .record(
                AuditEventType::OperationStart,
                operation.id(),
                into_details(details),
                false,
                Some(context),
            )
            .await;
    }

    /// `rollback` is `None` when no transaction was open, otherwise the
    /// rollback outcome
    async fn record_failure(
        &self,
        operation: &Operation,
        context: &SecurityContext,
        stage: PipelineStage,
        error: &GuardError,
        started: Instant,
        rollback: Option<Option<&GuardError>>,
    ) {
        tracing::debug!(operation_id = %operation.id(), stage = %PipelineStage::Auditing, "Pipeline stage");

        let mut details = into_details(serde_json::json!({
            "operationType": operation.operation_type(),
            "requestId": context.request_id,
            "stage": stage.as_str(),
            "errorKind": error.kind(),
            "error": error.to_string(),
            "durationMs": elapsed_ms(started),
            "rolledBack": matches!(rollback, Some(None)),
        }));
        if let Some(Some(rollback_error)) = rollback {
            details.insert(
                "rollbackError".to_string(),
                serde_json::Value::String(rollback_error.to_string()),
            );
        }

        self.audit
            .record(
                AuditEventType::OperationFailure,
                operation.id(),
                details,
                false,
                Some(context),
            )
            .await;
    }

    /// Permission and constraint denials are also security events
    async fn record_denial(
        &self,
        operation: &Operation,
        context: &SecurityContext,
        error: &GuardError,
    ) {
        let tag = match error {
            GuardError::AccessDenied { .. } => ACCESS_DENIED,
            GuardError::SecurityConstraint { .. } => SECURITY_CONSTRAINT_VIOLATION,
            _ => return,
        };
        let details = serde_json::json!({
            "operationId": operation.id(),
            "operationType": operation.operation_type(),
            "requestId": context.request_id,
            "error": error.to_string(),
        });
        self.audit
            .record_security_event(tag, into_details(details), Some(context))
            .await;
    }

    async fn record_error_metric(&self, operation: &Operation, error: &GuardError) {
        let context = into_details(serde_json::json!({
            "operationId": operation.id(),
            "errorKind": error.kind(),
        }));
        if let Err(e) = self
            .metrics
            .record_error(&error_metric_name(operation.operation_type()), context)
            .await
        {
            tracing::warn!(
                operation_id = %operation.id(),
                error = %e,
                "Failed to record error metric"
            );
        }
    }
}

/// Assembles a `SecureOperationPipeline`
///
/// Only the transactional store is required. Defaults: a `RuleValidator`
/// with no rules, a `StandardSecurityGate` over that validator, an in-memory
/// audit sink with tracing escalation/fallback, and in-memory metrics.
pub struct PipelineBuilder {
    config: PipelineConfig,
    store: Arc<dyn TransactionalStore>,
    validator: Option<Arc<dyn Validator>>,
    gate: Option<Arc<dyn SecurityGate>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    escalation: Option<Arc<dyn EscalationChannel>>,
    fallback: Option<Arc<dyn FallbackChannel>>,
    metrics_store: Option<Arc<dyn MetricsStore>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig, store: Arc<dyn TransactionalStore>) -> Self {
        Self {
            config,
            store,
            validator: None,
            gate: None,
            audit_sink: None,
            escalation: None,
            fallback: None,
            metrics_store: None,
        }
    }

    /// Validator used by the default gate and by integrity verification
    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn gate(mut self, gate: Arc<dyn SecurityGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn escalation(mut self, escalation: Arc<dyn EscalationChannel>) -> Self {
        self.escalation = Some(escalation);
        self
    }

    pub fn fallback(mut self, fallback: Arc<dyn FallbackChannel>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn metrics_store(mut self, store: Arc<dyn MetricsStore>) -> Self {
        self.metrics_store = Some(store);
        self
    }

    /// Validate the config and assemble the pipeline
    pub fn build(self) -> Result<SecureOperationPipeline> {
        self.config.validate()?;

        let validator = self
            .validator
            .unwrap_or_else(|| Arc::new(RuleValidator::new()));
        let gate = self
            .gate
            .unwrap_or_else(|| Arc::new(StandardSecurityGate::new(validator.clone())));

        let sink = self
            .audit_sink
            .unwrap_or_else(|| Arc::new(MemoryAuditSink::new()));
        let mut audit = AuditTrail::new(&self.config, sink);
        if let Some(escalation) = self.escalation {
            audit = audit.with_escalation(escalation);
        }
        if let Some(fallback) = self.fallback {
            audit = audit.with_fallback(fallback);
        }

        let metrics_store = self
            .metrics_store
            .unwrap_or_else(|| Arc::new(MemoryMetricsStore::new()));
        let metrics = MetricsRecorder::new(&self.config, metrics_store);

        Ok(SecureOperationPipeline {
            executor: OperationExecutor::new(self.config.execution_timeout()),
            verifier: IntegrityVerifier::new(validator),
            gate,
            store: self.store,
            audit: Arc::new(audit),
            metrics: Arc::new(metrics),
            config: self.config,
        })
    }
}
