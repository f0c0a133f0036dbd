//! Security gate: pre-execution validation and authorization
//!
//! Checks run in a fixed order and stop at the first failure:
//!
//! 1. payload validation (`Validator::validate`)
//! 2. permissions: the context must hold every required permission
//! 3. security constraints (rate limits, authentication rules, ...)
//!
//! The gate never touches the transactional store; it runs before a
//! transaction is opened.

use crate::error::{GuardError, Result};
use crate::types::{Operation, SecurityContext};
use crate::validator::Validator;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Pre-execution check of an operation against its security context
#[async_trait]
pub trait SecurityGate: Send + Sync {
    /// Validate the operation, returning the validated payload
    async fn validate(
        &self,
        operation: &Operation,
        context: &SecurityContext,
    ) -> Result<serde_json::Value>;
}

/// A rate or context-specific rule evaluated after the permission check
#[async_trait]
pub trait SecurityConstraint: Send + Sync {
    /// Constraint name, reported in `GuardError::SecurityConstraint`
    fn name(&self) -> &str;

    async fn check(&self, operation: &Operation, context: &SecurityContext) -> Result<()>;
}

/// Gate backed by a validator and an ordered list of constraints
pub struct StandardSecurityGate {
    validator: Arc<dyn Validator>,
    constraints: Vec<Arc<dyn SecurityConstraint>>,
}

impl StandardSecurityGate {
    pub fn new(validator: Arc<dyn Validator>) -> Self {
        Self {
            validator,
            constraints: Vec::new(),
        }
    }

    /// Append a constraint; constraints run in insertion order
    pub fn with_constraint(mut self, constraint: impl SecurityConstraint + 'static) -> Self {
        self.constraints.push(Arc::new(constraint));
        self
    }
}

#[async_trait]
impl SecurityGate for StandardSecurityGate {
    async fn validate(
        &self,
        operation: &Operation,
        context: &SecurityContext,
    ) -> Result<serde_json::Value> {
        let validated = self.validator.validate(operation).await?;

        let missing = context.missing_permissions(operation.required_permissions());
        if !missing.is_empty() {
            return Err(GuardError::AccessDenied {
                operation_type: operation.operation_type().to_string(),
                missing,
            });
        }

        for constraint in &self.constraints {
            constraint.check(operation, context).await?;
        }

        Ok(validated)
    }
}

/// Sliding-window limit on operations per actor
///
/// Actors are keyed by `SecurityContext::actor_key`. Every operation that
/// passes this check counts against the limit, even when a later constraint
/// rejects it. Actors with no hits inside the window are dropped.
pub struct RateLimitConstraint {
    max_operations: usize,
    window: Duration,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimitConstraint {
    pub fn new(max_operations: usize, window: Duration) -> Self {
        Self {
            max_operations,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Number of actors with hits inside the window
    pub async fn tracked_actors(&self) -> usize {
        self.hits.lock().await.len()
    }
}

#[async_trait]
impl SecurityConstraint for RateLimitConstraint {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn check(&self, _operation: &Operation, context: &SecurityContext) -> Result<()> {
        let now = Instant::now();
        let actor = context.actor_key();

        let mut hits = self.hits.lock().await;
        hits.retain(|_, recent| {
            while recent
                .front()
                .is_some_and(|t| now.duration_since(*t) >= self.window)
            {
                recent.pop_front();
            }
            !recent.is_empty()
        });

        let recent = hits.entry(actor.to_string()).or_default();

        if recent.len() >= self.max_operations {
            return Err(GuardError::SecurityConstraint {
                constraint: self.name().to_string(),
                reason: format!(
                    "Actor '{}' exceeded {} operations per {}s",
                    actor,
                    self.max_operations,
                    self.window.as_secs()
                ),
            });
        }

        recent.push_back(now);
        Ok(())
    }
}

/// Rejects anonymous actors
///
/// Applies to the listed operation types, or to every type when none are listed.
#[derive(Debug, Default)]
pub struct AuthenticatedConstraint {
    operation_types: HashSet<String>,
}

impl AuthenticatedConstraint {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            operation_types: types.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl SecurityConstraint for AuthenticatedConstraint {
    fn name(&self) -> &str {
        "authenticated"
    }

    async fn check(&self, operation: &Operation, context: &SecurityContext) -> Result<()> {
        let applies = self.operation_types.is_empty()
            || self.operation_types.contains(operation.operation_type());
        if applies && context.is_anonymous() {
            return Err(GuardError::SecurityConstraint {
                constraint: self.name().to_string(),
                reason: format!(
                    "Operation '{}' requires an authenticated user",
                    operation.operation_type()
                ),
            });
        }
        Ok(())
    }
}
