//! Notification handling for the CLI.

use serde_json::{Value, json};
use tether_client::NotificationHandler;
use tether_types::schema::{
    CancelledParams, LoggingLevel, LoggingMessageParams, ProgressParams, ResourceUpdatedParams,
};

/// Re-emits server log messages through `tracing`. When `echo` is set,
/// every notification is also printed to stdout as a JSON line.
pub struct CliNotifications {
    pub server: String,
    pub echo: bool,
}

impl CliNotifications {
    fn print(&self, kind: &str, params: Value) {
        if self.echo {
            println!("{}", json!({"event": kind, "params": params}));
        }
    }
}

impl NotificationHandler for CliNotifications {
    fn on_log_message(&self, params: LoggingMessageParams) {
        let logger = params.logger.as_deref().unwrap_or("-");
        let server = &self.server;
        let data = &params.data;
        match params.level {
            LoggingLevel::Debug => tracing::debug!("[{server}/{logger}] {data}"),
            LoggingLevel::Info | LoggingLevel::Notice => {
                tracing::info!("[{server}/{logger}] {data}")
            }
            LoggingLevel::Warning => tracing::warn!("[{server}/{logger}] {data}"),
            _ => tracing::error!("[{server}/{logger}] {data}"),
        }
        self.print("log", json!(params));
    }

    fn on_resource_updated(&self, params: ResourceUpdatedParams) {
        self.print("resource_updated", json!(params));
    }

    fn on_resources_list_changed(&self) {
        self.print("resources_list_changed", Value::Null);
    }

    fn on_tools_list_changed(&self) {
        self.print("tools_list_changed", Value::Null);
    }

    fn on_prompts_list_changed(&self) {
        self.print("prompts_list_changed", Value::Null);
    }

    fn on_progress(&self, params: ProgressParams) {
        self.print("progress", json!(params));
    }

    fn on_cancelled(&self, params: CancelledParams) {
        self.print("cancelled", json!(params));
    }
}
