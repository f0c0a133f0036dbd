//! Post-execution integrity verification

use crate::error::{GuardError, Result};
use crate::types::OperationResult;
use crate::validator::{integrity_token, Validator};
use std::sync::Arc;

/// Checks a result before its transaction may commit
///
/// Both the structural integrity check and the business-rule check must
/// pass. A verified result is sealed with its integrity token.
#[derive(Clone)]
pub struct IntegrityVerifier {
    validator: Arc<dyn Validator>,
}

impl IntegrityVerifier {
    pub fn new(validator: Arc<dyn Validator>) -> Self {
        Self { validator }
    }

    pub async fn verify(
        &self,
        operation_type: &str,
        result: OperationResult,
    ) -> Result<OperationResult> {
        if !result.valid {
            return Err(GuardError::Integrity(format!(
                "Result of '{}' is marked invalid",
                operation_type
            )));
        }

        if !self.validator.verify_integrity(&result).await? {
            return Err(GuardError::Integrity(format!(
                "Result of '{}' failed structural verification",
                operation_type
            )));
        }

        if !self
            .validator
            .verify_business_rules(operation_type, &result)
            .await?
        {
            return Err(GuardError::BusinessRule(format!(
                "Result of '{}' violates business rules",
                operation_type
            )));
        }

        let token = integrity_token(&result.data)?;
        Ok(result.with_integrity_token(token))
    }
}
