//! Content service: repository writes routed through the pipeline
//!
//! Every write becomes a pipeline `Operation` whose handler calls the
//! repository inside the active transaction. Reads go through the cache,
//! and the `content` cache tag is cleared after each committed write.

use crate::cache::{Cache, CacheExt};
use crate::error::{GuardError, Result};
use crate::executor::{ExecutionContext, OperationHandler};
use crate::pipeline::SecureOperationPipeline;
use crate::store::{Entity, Repository};
use crate::types::{Operation, OperationResult, SecurityContext};
use crate::validator::{OperationSchema, RuleValidator};
use async_trait::async_trait;
use std::sync::Arc;

/// Cache tag carried by every cached content entry
pub const CONTENT_CACHE_TAG: &str = "content";

pub const CONTENT_CREATE: &str = "content.create";
pub const CONTENT_UPDATE: &str = "content.update";
pub const CONTENT_DELETE: &str = "content.delete";
pub const CONTENT_PUBLISH: &str = "content.publish";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentAction {
    Create,
    Update,
    Delete,
    Publish,
}

impl ContentAction {
    /// Operation type, which doubles as the required permission
    fn operation_type(self) -> &'static str {
        match self {
            Self::Create => CONTENT_CREATE,
            Self::Update => CONTENT_UPDATE,
            Self::Delete => CONTENT_DELETE,
            Self::Publish => CONTENT_PUBLISH,
        }
    }
}

struct ContentHandler {
    repository: Arc<dyn Repository>,
    action: ContentAction,
}

fn field<'a>(payload: &'a serde_json::Value, name: &str) -> Result<&'a serde_json::Value> {
    payload
        .get(name)
        .ok_or_else(|| GuardError::Storage(format!("Payload is missing '{}'", name)))
}

fn str_field<'a>(payload: &'a serde_json::Value, name: &str) -> Result<&'a str> {
    field(payload, name)?
        .as_str()
        .ok_or_else(|| GuardError::Storage(format!("Payload field '{}' must be a string", name)))
}

#[async_trait]
impl OperationHandler for ContentHandler {
    async fn execute(&self, ctx: ExecutionContext<'_>) -> Result<OperationResult> {
        let payload = ctx.validated;
        let tx = ctx.transaction;

        let data = match self.action {
            ContentAction::Create => {
                let kind = str_field(payload, "kind")?;
                let entity = self
                    .repository
                    .create(tx, kind, field(payload, "data")?.clone())
                    .await?;
                serde_json::to_value(entity)?
            }
            ContentAction::Update => {
                let id = str_field(payload, "id")?;
                let entity = self
                    .repository
                    .update(tx, id, field(payload, "data")?.clone())
                    .await?;
                serde_json::to_value(entity)?
            }
            ContentAction::Delete => {
                let id = str_field(payload, "id")?;
                self.repository.delete(tx, id).await?;
                serde_json::json!({"id": id, "deleted": true})
            }
            ContentAction::Publish => {
                let id = str_field(payload, "id")?;
                let entity = self.repository.publish(tx, id).await?;
                serde_json::to_value(entity)?
            }
        };

        Ok(OperationResult::valid(data))
    }
}

/// Content CRUD on top of a `SecureOperationPipeline`
pub struct ContentService {
    pipeline: Arc<SecureOperationPipeline>,
    repository: Arc<dyn Repository>,
    cache: Arc<dyn Cache>,
}

impl ContentService {
    pub fn new(
        pipeline: Arc<SecureOperationPipeline>,
        repository: Arc<dyn Repository>,
        cache: Arc<dyn Cache>,
    ) -> Self {
        Self {
            pipeline,
            repository,
            cache,
        }
    }

    /// Register payload schemas and business rules for content operations
    pub fn register_rules(validator: &RuleValidator) -> Result<()> {
        validator.register_schema(
            OperationSchema::new(CONTENT_CREATE)
                .require_field("kind")
                .require_field("data"),
        )?;
        validator.register_schema(
            OperationSchema::new(CONTENT_UPDATE)
                .require_field("id")
                .require_field("data"),
        )?;
        validator.register_schema(OperationSchema::new(CONTENT_DELETE).require_field("id"))?;
        validator.register_schema(OperationSchema::new(CONTENT_PUBLISH).require_field("id"))?;
        validator.add_rule(CONTENT_PUBLISH, "entity-published", |result| {
            result.data["published"] == serde_json::Value::Bool(true)
        })?;
        Ok(())
    }

    pub async fn create(
        &self,
        kind: &str,
        data: serde_json::Value,
        context: &SecurityContext,
    ) -> Result<Entity> {
        let payload = serde_json::json!({"kind": kind, "data": data});
        let result = self.run(ContentAction::Create, payload, context).await?;
        Ok(serde_json::from_value(result.data)?)
    }

    pub async fn update(
        &self,
        id: &str,
        data: serde_json::Value,
        context: &SecurityContext,
    ) -> Result<Entity> {
        let payload = serde_json::json!({"id": id, "data": data});
        let result = self.run(ContentAction::Update, payload, context).await?;
        Ok(serde_json::from_value(result.data)?)
    }

    pub async fn delete(&self, id: &str, context: &SecurityContext) -> Result<()> {
        self.run(ContentAction::Delete, serde_json::json!({"id": id}), context)
            .await?;
        Ok(())
    }

    pub async fn publish(&self, id: &str, context: &SecurityContext) -> Result<Entity> {
        let result = self
            .run(ContentAction::Publish, serde_json::json!({"id": id}), context)
            .await?;
        Ok(serde_json::from_value(result.data)?)
    }

    /// Committed entity by id, served from cache when possible
    pub async fn find(&self, id: &str) -> Result<Option<Entity>> {
        let key = format!("content:{}", id);
        let repository = self.repository.clone();
        let lookup = self
            .cache
            .remember(&key, &[CONTENT_CACHE_TAG], || async move {
                match repository.get(id).await? {
                    Some(entity) => Ok(serde_json::to_value(entity)?),
                    None => Err(GuardError::NotFound(format!("Entity not found: {}", id))),
                }
            })
            .await;

        match lookup {
            Ok(value) => Ok(Some(serde_json::from_value(value)?)),
            Err(GuardError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn run(
        &self,
        action: ContentAction,
        payload: serde_json::Value,
        context: &SecurityContext,
    ) -> Result<OperationResult> {
        let handler = Arc::new(ContentHandler {
            repository: self.repository.clone(),
            action,
        });
        let operation = Operation::new(action.operation_type(), payload, handler)
            .require(action.operation_type());

        let result = self.pipeline.execute(operation, context).await?;
        self.cache.clear(Some(CONTENT_CACHE_TAG)).await;
        Ok(result)
    }
}
