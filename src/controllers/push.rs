use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::error::AppResult;
use crate::storage::Object;

#[async_trait]
pub trait PushController: Send + Sync {
    /// Deliver `body` to every installation matching `where_`.
    async fn send_push(&self, body: &Object, where_: &Object) -> AppResult<()>;
}

/// A push request as handed to the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct PushRequest {
    pub body: Object,
    pub where_: Object,
}

/// Logs push requests and keeps them in memory; no delivery.
#[derive(Debug, Clone, Default)]
pub struct LoggingPushController {
    queue: Arc<Mutex<Vec<PushRequest>>>,
}

impl LoggingPushController {
    pub fn new() -> Self { Self::default() }

    pub fn sent(&self) -> Vec<PushRequest> { self.queue.lock().clone() }
}

#[async_trait]
impl PushController for LoggingPushController {
    async fn send_push(&self, body: &Object, where_: &Object) -> AppResult<()> {
        info!(target: "basalt::push", "send_push: where={} body_keys={:?}", serde_json::Value::Object(where_.clone()), body.keys().collect::<Vec<_>>());
        self.queue.lock().push(PushRequest { body: body.clone(), where_: where_.clone() });
        Ok(())
    }
}
