//! Typed MCP methods over [`McpClient::send_request`].

use crate::error::McpError;
use crate::session::McpClient;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tether_types::schema::{
    CallToolParams, CallToolResult, CompleteParams, CompleteResult, CompletionArgument,
    CompletionReference, GetPromptParams, GetPromptResult, ListPromptsResult,
    ListResourceTemplatesResult, ListResourcesResult, ListToolsResult, LoggingLevel,
    PaginatedParams, ReadResourceParams, ReadResourceResult, SetLevelParams, SubscribeParams,
    Tool,
};

impl McpClient {
    pub async fn ping(&self) -> Result<(), McpError> {
        self.send_request::<Value>("ping", ()).await.map(|_| ())
    }

    pub async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult, McpError> {
        self.send_request("tools/list", PaginatedParams { cursor })
            .await
    }

    /// Follow `nextCursor` until every tool has been listed. Fails if the
    /// server hands back a cursor it already gave.
    pub async fn list_all_tools(&self) -> Result<Vec<Tool>, McpError> {
        let mut tools = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = None;
        loop {
            let page = self.list_tools(cursor).await?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !seen.insert(next.clone()) => {
                    return Err(McpError::UnexpectedMessageFormat(format!(
                        "tools/list repeated cursor '{next}'"
                    )));
                }
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, McpError> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };
        self.send_request("tools/call", params).await
    }

    pub async fn list_resources(
        &self,
        cursor: Option<String>,
    ) -> Result<ListResourcesResult, McpError> {
        self.send_request("resources/list", PaginatedParams { cursor })
            .await
    }

    pub async fn list_resource_templates(
        &self,
        cursor: Option<String>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        self.send_request("resources/templates/list", PaginatedParams { cursor })
            .await
    }

    pub async fn read_resource(&self, uri: &str) -> Result<ReadResourceResult, McpError> {
        let params = ReadResourceParams {
            uri: uri.to_string(),
        };
        self.send_request("resources/read", params).await
    }

    pub async fn subscribe_resource(&self, uri: &str) -> Result<(), McpError> {
        let params = SubscribeParams {
            uri: uri.to_string(),
        };
        self.send_request::<Value>("resources/subscribe", params)
            .await
            .map(|_| ())
    }

    pub async fn unsubscribe_resource(&self, uri: &str) -> Result<(), McpError> {
        let params = SubscribeParams {
            uri: uri.to_string(),
        };
        self.send_request::<Value>("resources/unsubscribe", params)
            .await
            .map(|_| ())
    }

    pub async fn list_prompts(&self, cursor: Option<String>) -> Result<ListPromptsResult, McpError> {
        self.send_request("prompts/list", PaginatedParams { cursor })
            .await
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<HashMap<String, String>>,
    ) -> Result<GetPromptResult, McpError> {
        let params = GetPromptParams {
            name: name.to_string(),
            arguments,
        };
        self.send_request("prompts/get", params).await
    }

    /// Ask for completions of a prompt or resource-template argument.
    pub async fn complete(
        &self,
        reference: CompletionReference,
        argument: &str,
        value: &str,
    ) -> Result<CompleteResult, McpError> {
        let params = CompleteParams {
            reference,
            argument: CompletionArgument {
                name: argument.to_string(),
                value: value.to_string(),
            },
        };
        self.send_request("completion/complete", params).await
    }

    pub async fn set_logging_level(&self, level: LoggingLevel) -> Result<(), McpError> {
        self.send_request::<Value>("logging/setLevel", SetLevelParams { level })
            .await
            .map(|_| ())
    }

    /// Tell the server the configured roots changed.
    pub async fn notify_roots_list_changed(&self) -> Result<(), McpError> {
        self.notify("notifications/roots/list_changed", ()).await
    }
}
