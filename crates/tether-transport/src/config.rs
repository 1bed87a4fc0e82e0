//! Transport selection from configuration.

use crate::http::HttpConfig;
use crate::{SseTransport, StdioTransport, StreamableHttpTransport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tether_types::{Transport, TransportError};

/// How to launch a stdio MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdioConfig {
    /// Command to run (e.g., "npx", "python").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables to set for the server process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the server process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl StdioConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }
}

/// Which transport to use for one server, tagged by `transport`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "kebab-case")]
pub enum TransportConfig {
    Stdio(StdioConfig),
    Sse(HttpConfig),
    StreamableHttp(HttpConfig),
}

impl TransportConfig {
    /// Construct the configured transport. Fails on invalid URLs or headers.
    pub fn build(&self) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(match self {
            Self::Stdio(config) => Arc::new(StdioTransport::new(config.clone())),
            Self::Sse(config) => Arc::new(SseTransport::new(config.clone())?),
            Self::StreamableHttp(config) => Arc::new(StreamableHttpTransport::new(config.clone())?),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio(_) => "stdio",
            Self::Sse(_) => "sse",
            Self::StreamableHttp(_) => "streamable-http",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stdio() {
        let toml_str = r#"
transport = "stdio"
command = "npx"
args = ["-y", "@modelcontextprotocol/server-filesystem", "/home/user"]
env = { DEBUG = "1" }
"#;
        let config: TransportConfig = toml::from_str(toml_str).unwrap();
        match config {
            TransportConfig::Stdio(stdio) => {
                assert_eq!(stdio.command, "npx");
                assert_eq!(stdio.args.len(), 3);
                assert_eq!(stdio.env["DEBUG"], "1");
                assert!(stdio.cwd.is_none());
            }
            other => panic!("Expected stdio, got {other:?}"),
        }
    }

    #[test]
    fn parse_sse_with_defaults() {
        let toml_str = r#"
transport = "sse"
url = "http://localhost:8080/sse"
"#;
        let config: TransportConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.kind(), "sse");
        match config {
            TransportConfig::Sse(http) => {
                assert_eq!(http.url, "http://localhost:8080/sse");
                assert_eq!(http.connect_retries, 3);
                assert_eq!(http.retry_delay_ms, 1000);
                assert!(http.headers.is_empty());
            }
            other => panic!("Expected sse, got {other:?}"),
        }
    }

    #[test]
    fn parse_streamable_http_with_headers() {
        let toml_str = r#"
transport = "streamable-http"
url = "https://mcp.example.com/mcp"
headers = { Authorization = "Bearer abc" }
connect_retries = 0
"#;
        let config: TransportConfig = toml::from_str(toml_str).unwrap();
        match &config {
            TransportConfig::StreamableHttp(http) => {
                assert_eq!(http.headers["Authorization"], "Bearer abc");
                assert_eq!(http.connect_retries, 0);
            }
            other => panic!("Expected streamable-http, got {other:?}"),
        }
        assert_eq!(config.build().unwrap().name(), "streamable-http");
    }

    #[test]
    fn unknown_transport_is_rejected() {
        let result: Result<TransportConfig, _> = toml::from_str("transport = \"carrier-pigeon\"");
        assert!(result.is_err());
    }

    #[test]
    fn build_rejects_bad_url() {
        let config = TransportConfig::Sse(HttpConfig::new("::not a url::"));
        assert!(matches!(
            config.build(),
            Err(TransportError::InvalidConfig(_))
        ));
    }

    #[test]
    fn build_stdio_does_not_spawn() {
        let config = TransportConfig::Stdio(StdioConfig::new("this_command_does_not_exist_xyz123"));
        let transport = config.build().unwrap();
        assert_eq!(transport.name(), "stdio");
        assert!(transport.is_persistent());
    }
}
