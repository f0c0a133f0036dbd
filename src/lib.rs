//! # a3s-guard
//!
//! Secure critical-operation pipeline for the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-guard` wraps an arbitrary business operation with pre-execution
//! authorization and validation, atomic transactional execution,
//! post-execution integrity verification, append-only audit logging, and
//! performance metrics. Any failure rolls the transaction back and is
//! audited before the original error reaches the caller.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use a3s_guard::{
//!     ExecutionContext, MemoryRepository, Operation, OperationHandler, OperationResult,
//!     PipelineConfig, Repository, SecureOperationPipeline, SecurityContext,
//! };
//!
//! struct CreateArticle(MemoryRepository);
//!
//! #[async_trait::async_trait]
//! impl OperationHandler for CreateArticle {
//!     async fn execute(&self, ctx: ExecutionContext<'_>) -> a3s_guard::Result<OperationResult> {
//!         let entity = self.0.create(ctx.transaction, "article", ctx.validated.clone()).await?;
//!         Ok(OperationResult::valid(serde_json::to_value(entity)?))
//!     }
//! }
//!
//! # async fn example() -> a3s_guard::Result<()> {
//! let repo = MemoryRepository::new();
//! let pipeline = SecureOperationPipeline::builder(PipelineConfig::default(), Arc::new(repo.clone()))
//!     .build()?;
//!
//! let operation = Operation::new(
//!     "article.create",
//!     serde_json::json!({"title": "Hello"}),
//!     Arc::new(CreateArticle(repo)),
//! )
//! .require("article.create");
//!
//! let context = SecurityContext::for_user("editor").with_permission("article.create");
//! let result = pipeline.execute(operation, &context).await?;
//! println!("Committed with token {:?}", result.integrity_token);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **SecurityGate**: payload validation, permission check, security constraints
//! - **TransactionCoordinator**: `Idle -> Active -> {Committed, RolledBack}`
//! - **OperationExecutor**: runs an `OperationHandler`, optional timeout
//! - **IntegrityVerifier**: structural and business-rule checks, seals the result
//! - **AuditTrail**: primary sink, escalation channel, fallback channel, daily archive
//! - **MetricsRecorder**: time-bucketed samples, error counters, window analysis
//! - **SecureOperationPipeline**: orchestrates all of the above

pub mod audit;
pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod gate;
pub mod metrics;
pub mod pipeline;
pub mod service;
pub mod store;
pub mod transaction;
pub mod types;
pub mod validator;
pub mod verifier;

// Re-export core types
pub use audit::{
    AuditSink, AuditTrail, EmergencyRecord, EscalationChannel, FallbackChannel, FileAuditArchive,
    MemoryAuditSink, MemoryEscalationChannel, MemoryFallbackChannel, TracingEscalationChannel,
    TracingFallbackChannel,
};
pub use cache::{Cache, CacheExt, MemoryCache};
pub use config::{ArchivePolicy, PipelineConfig};
pub use error::{GuardError, Result};
pub use executor::{Execution, ExecutionContext, OperationExecutor, OperationHandler};
pub use gate::{
    AuthenticatedConstraint, RateLimitConstraint, SecurityConstraint, SecurityGate,
    StandardSecurityGate,
};
pub use metrics::{summarize, MemoryMetricsStore, MetricsRecorder, MetricsStore};
pub use pipeline::{
    duration_metric_name, error_metric_name, PipelineBuilder, PipelineStage,
    SecureOperationPipeline, ACCESS_DENIED, SECURITY_CONSTRAINT_VIOLATION,
};
pub use service::ContentService;
pub use store::{Entity, MemoryRepository, Repository, TransactionId, TransactionalStore};
pub use transaction::{TransactionCoordinator, TransactionState};
pub use types::{
    AuditEvent, AuditEventType, Details, Metric, Operation, OperationResult, PerformanceSummary,
    SecurityContext,
};
pub use validator::{integrity_token, OperationSchema, RuleValidator, Validator};
pub use verifier::IntegrityVerifier;
