//! Builder for [`McpClient`].

use crate::config::ClientConfig;
use crate::handler::{NoopNotificationHandler, NotificationHandler, RequestHandlers};
use crate::reconnect::ReconnectPolicy;
use crate::session::McpClient;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tether_types::schema::{
    ClientCapabilities, Implementation, ListChangedCapability, ListRootsResult, Root,
};
use tether_types::{ErrorObject, Transport};

/// Server request method answered from the configured roots.
const ROOTS_LIST: &str = "roots/list";

/// Server request method for sampling.
const SAMPLING_CREATE_MESSAGE: &str = "sampling/createMessage";

pub struct McpClientBuilder {
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    notifications: Arc<dyn NotificationHandler>,
    requests: RequestHandlers,
    roots: Option<Vec<Root>>,
}

impl McpClient {
    pub fn builder(transport: Arc<dyn Transport>) -> McpClientBuilder {
        McpClientBuilder {
            transport,
            config: ClientConfig::default(),
            notifications: Arc::new(NoopNotificationHandler),
            requests: RequestHandlers::default(),
            roots: None,
        }
    }
}

impl McpClientBuilder {
    /// Replace the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn client_info(mut self, info: Implementation) -> Self {
        self.config.client_info = info;
        self
    }

    pub fn capabilities(mut self, capabilities: ClientCapabilities) -> Self {
        self.config.capabilities = capabilities;
        self
    }

    pub fn protocol_version(mut self, version: impl Into<String>) -> Self {
        self.config.protocol_version = version.into();
        self
    }

    /// Per-request timeout; `None` disables it.
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Ping the server every `interval` while connected over a persistent transport.
    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = Some(interval);
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    pub fn notification_handler(mut self, handler: impl NotificationHandler + 'static) -> Self {
        self.notifications = Arc::new(handler);
        self
    }

    /// Answer `roots/list` with `roots` and advertise the capability.
    pub fn roots(mut self, roots: Vec<Root>) -> Self {
        self.roots = Some(roots);
        self
    }

    /// Register a handler for a server-initiated request.
    ///
    /// Params are decoded into `P`; a decode failure is answered with
    /// `-32602` without calling the handler.
    pub fn on_request<P, R, F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        P: DeserializeOwned + 'static,
        R: Serialize + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ErrorObject>> + Send + 'static,
    {
        self.requests.register(method, handler);
        self
    }

    pub fn build(self) -> McpClient {
        let mut config = self.config;
        let mut requests = self.requests;

        if !requests.contains("ping") {
            requests.register("ping", |_: Value| async {
                Ok::<_, ErrorObject>(serde_json::json!({}))
            });
        }

        if let Some(roots) = self.roots {
            config.capabilities.roots.get_or_insert(ListChangedCapability {
                list_changed: Some(true),
            });
            let roots = Arc::new(roots);
            requests.register(ROOTS_LIST, move |_: Value| {
                let roots = Arc::clone(&roots);
                async move {
                    Ok::<_, ErrorObject>(ListRootsResult {
                        roots: roots.as_ref().clone(),
                    })
                }
            });
        }

        if requests.contains(SAMPLING_CREATE_MESSAGE) {
            config.capabilities.sampling.get_or_insert_with(Default::default);
        }

        McpClient::from_parts(self.transport, config, self.notifications, requests)
    }
}
