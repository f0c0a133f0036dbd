//! Operation execution
//!
//! An `OperationHandler` is the business logic of an operation. The
//! `OperationExecutor` runs it, measures wall-clock duration, applies the
//! optional timeout, and wraps every failure as `GuardError::Execution`.

use crate::error::{GuardError, Result};
use crate::store::TransactionId;
use crate::types::{Operation, OperationResult, SecurityContext};
use async_trait::async_trait;
use std::time::{Duration, Instant};

/// Everything a handler may use while the transaction is active
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub operation: &'a Operation,

    /// Payload as returned by the validator
    pub validated: &'a serde_json::Value,

    pub security: &'a SecurityContext,

    /// Transaction all writes must go through
    pub transaction: &'a TransactionId,
}

/// Business logic of an operation
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext<'_>) -> Result<OperationResult>;
}

/// A successful execution with its measured duration
#[derive(Debug, Clone)]
pub struct Execution {
    pub result: OperationResult,
    pub duration: Duration,
}

/// Runs operation handlers
#[derive(Debug, Clone, Default)]
pub struct OperationExecutor {
    timeout: Option<Duration>,
}

impl OperationExecutor {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Invoke the operation's handler
    ///
    /// Handler errors (and timeouts) come back as `GuardError::Execution`
    /// with the original error as the source.
    pub async fn execute(&self, ctx: ExecutionContext<'_>) -> Result<Execution> {
        let operation_type = ctx.operation.operation_type();
        let start = Instant::now();

        let handler = ctx.operation.handler();
        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, handler.execute(ctx)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(GuardError::Timeout(format!(
                    "Operation '{}' exceeded {}ms",
                    operation_type,
                    limit.as_millis()
                ))),
            },
            None => handler.execute(ctx).await,
        };
        let duration = start.elapsed();

        match outcome {
            Ok(result) => {
                tracing::debug!(
                    operation_id = %ctx.operation.id(),
                    duration_ms = duration.as_millis() as u64,
                    "Operation executed"
                );
                Ok(Execution { result, duration })
            }
            Err(e @ GuardError::Execution { .. }) => Err(e),
            Err(e) => Err(GuardError::execution(operation_type, e)),
        }
    }
}
