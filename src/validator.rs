//! Validator port: payload validation and result checks
//!
//! The security gate calls `validate` before anything happens; the
//! integrity verifier calls `verify_integrity` and `verify_business_rules`
//! after execution.

use crate::error::{GuardError, Result};
use crate::types::{Operation, OperationResult};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Validation and verification rules for operations and their results
#[async_trait]
pub trait Validator: Send + Sync {
    /// Validate an operation's payload, returning the validated data
    async fn validate(&self, operation: &Operation) -> Result<serde_json::Value>;

    /// Structural integrity check of a result
    async fn verify_integrity(&self, result: &OperationResult) -> Result<bool>;

    /// Business-rule check of a result produced by `operation_type`
    async fn verify_business_rules(
        &self,
        operation_type: &str,
        result: &OperationResult,
    ) -> Result<bool>;
}

/// Payload requirements for one operation type
#[derive(Debug, Clone, Default)]
pub struct OperationSchema {
    pub operation_type: String,

    /// Top-level payload fields that must be present
    pub required_fields: Vec<String>,

    /// Maximum serialized payload size in bytes
    pub max_payload_bytes: Option<usize>,
}

impl OperationSchema {
    pub fn new(operation_type: impl Into<String>) -> Self {
        Self {
            operation_type: operation_type.into(),
            ..Default::default()
        }
    }

    pub fn require_field(mut self, field: impl Into<String>) -> Self {
        self.required_fields.push(field.into());
        self
    }

    pub fn max_payload_bytes(mut self, limit: usize) -> Self {
        self.max_payload_bytes = Some(limit);
        self
    }
}

type RulePredicate = Arc<dyn Fn(&OperationResult) -> bool + Send + Sync>;

struct BusinessRule {
    name: String,
    predicate: RulePredicate,
}

/// Compute the integrity token for a result payload
///
/// Base64 SHA-256 over the serialized JSON. Object keys serialize in sorted
/// order, so equal values always produce equal tokens.
pub fn integrity_token(data: &serde_json::Value) -> Result<String> {
    let bytes = serde_json::to_vec(data)?;
    Ok(BASE64.encode(Sha256::digest(&bytes)))
}

/// Rule-based validator backed by registered schemas and predicates
///
/// Operation types without a schema pass validation unchanged, like untyped
/// events pass a schema registry.
#[derive(Default)]
pub struct RuleValidator {
    schemas: RwLock<HashMap<String, OperationSchema>>,
    rules: RwLock<HashMap<String, Vec<BusinessRule>>>,
}

impl RuleValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the schema for an operation type
    pub fn register_schema(&self, schema: OperationSchema) -> Result<()> {
        if schema.operation_type.is_empty() {
            return Err(GuardError::Config(
                "Operation type cannot be empty".to_string(),
            ));
        }
        let mut schemas = self.schemas.write().map_err(|e| {
            GuardError::Storage(format!("Validator lock poisoned: {}", e))
        })?;
        schemas.insert(schema.operation_type.clone(), schema);
        Ok(())
    }

    /// Add a named business rule for an operation type
    pub fn add_rule(
        &self,
        operation_type: impl Into<String>,
        name: impl Into<String>,
        predicate: impl Fn(&OperationResult) -> bool + Send + Sync + 'static,
    ) -> Result<()> {
        let mut rules = self.rules.write().map_err(|e| {
            GuardError::Storage(format!("Validator lock poisoned: {}", e))
        })?;
        rules
            .entry(operation_type.into())
            .or_default()
            .push(BusinessRule {
                name: name.into(),
                predicate: Arc::new(predicate),
            });
        Ok(())
    }
}

#[async_trait]
impl Validator for RuleValidator {
    async fn validate(&self, operation: &Operation) -> Result<serde_json::Value> {
        let operation_type = operation.operation_type();
        let invalid = |reason: String| GuardError::Validation {
            operation_type: operation_type.to_string(),
            reason,
        };

        if operation_type.trim().is_empty() {
            return Err(invalid("Operation type cannot be empty".to_string()));
        }

        let schema = {
            let schemas = self.schemas.read().map_err(|e| {
                GuardError::Storage(format!("Validator lock poisoned: {}", e))
            })?;
            match schemas.get(operation_type) {
                Some(s) => s.clone(),
                None => return Ok(operation.payload().clone()),
            }
        };

        let payload = operation.payload();
        if let Some(limit) = schema.max_payload_bytes {
            let size = serde_json::to_vec(payload)?.len();
            if size > limit {
                return Err(invalid(format!(
                    "Payload is {} bytes, limit is {}",
                    size, limit
                )));
            }
        }

        match payload {
            serde_json::Value::Object(map) => {
                for field in &schema.required_fields {
                    if !map.contains_key(field) {
                        return Err(invalid(format!("Missing required field '{}'", field)));
                    }
                }
            }
            _ if !schema.required_fields.is_empty() => {
                return Err(invalid(
                    "Payload must be a JSON object when schema has required fields".to_string(),
                ));
            }
            _ => {}
        }

        Ok(payload.clone())
    }

    async fn verify_integrity(&self, result: &OperationResult) -> Result<bool> {
        if result.data.is_null() {
            return Ok(false);
        }
        match &result.integrity_token {
            Some(token) => Ok(*token == integrity_token(&result.data)?),
            None => Ok(true),
        }
    }

    async fn verify_business_rules(
        &self,
        operation_type: &str,
        result: &OperationResult,
    ) -> Result<bool> {
        let rules = self.rules.read().map_err(|e| {
            GuardError::Storage(format!("Validator lock poisoned: {}", e))
        })?;

        for rule in rules.get(operation_type).into_iter().flatten() {
            if !(rule.predicate)(result) {
                tracing::warn!(
                    operation_type = %operation_type,
                    rule = %rule.name,
                    "Business rule rejected result"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }
}
