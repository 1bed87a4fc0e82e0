//! Hooks for server-originated notifications and requests.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use tether_types::BoxFuture;
use tether_types::ErrorObject;
use tether_types::schema::{
    CancelledParams, LoggingMessageParams, ProgressParams, ResourceUpdatedParams,
};

/// Receives server notifications, in arrival order, on the session's
/// inbound loop. Keep implementations quick; hand heavy work to a task.
///
/// Every method defaults to a no-op.
pub trait NotificationHandler: Send + Sync {
    /// `notifications/message`
    fn on_log_message(&self, _params: LoggingMessageParams) {}

    /// `notifications/resources/updated`
    fn on_resource_updated(&self, _params: ResourceUpdatedParams) {}

    /// `notifications/resources/list_changed`
    fn on_resources_list_changed(&self) {}

    /// `notifications/tools/list_changed`
    fn on_tools_list_changed(&self) {}

    /// `notifications/prompts/list_changed`
    fn on_prompts_list_changed(&self) {}

    /// `notifications/progress`
    fn on_progress(&self, _params: ProgressParams) {}

    /// `notifications/cancelled`
    fn on_cancelled(&self, _params: CancelledParams) {}
}

/// Handler that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotificationHandler;

impl NotificationHandler for NoopNotificationHandler {}

pub(crate) type HandlerFuture = BoxFuture<'static, Result<Value, ErrorObject>>;

type ErasedHandler = Box<dyn Fn(Option<Value>) -> Result<HandlerFuture, ErrorObject> + Send + Sync>;

/// Method-name registry for server-initiated requests.
///
/// Params are decoded when the request is prepared, so a bad payload is
/// rejected with `-32602` before any handler code runs.
#[derive(Default)]
pub(crate) struct RequestHandlers {
    handlers: HashMap<String, ErasedHandler>,
}

impl RequestHandlers {
    pub fn register<P, R, F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        P: DeserializeOwned + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ErrorObject>> + Send + 'static,
    {
        let erased = move |params: Option<Value>| -> Result<HandlerFuture, ErrorObject> {
            let params: P = decode_params(params).map_err(ErrorObject::invalid_params)?;
            let fut = handler(params);
            Ok(Box::pin(async move {
                let result = fut.await?;
                serde_json::to_value(result).map_err(ErrorObject::internal_error)
            }) as HandlerFuture)
        };
        self.handlers.insert(method.into(), Box::new(erased));
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Decode params and build the handler future, or the error to reply with.
    pub fn prepare(&self, method: &str, params: Option<Value>) -> Result<HandlerFuture, ErrorObject> {
        let handler = self
            .handlers
            .get(method)
            .ok_or_else(|| ErrorObject::method_not_found(method))?;
        handler(params)
    }
}

/// Omitted params decode as `null`, falling back to `{}` for struct-shaped targets.
fn decode_params<P: DeserializeOwned>(params: Option<Value>) -> Result<P, serde_json::Error> {
    match params {
        Some(value) => serde_json::from_value(value),
        None => serde_json::from_value(Value::Null)
            .or_else(|_| serde_json::from_value(Value::Object(Default::default()))),
    }
}
