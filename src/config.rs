// switchyard/src/config.rs

//! Runtime configuration for the orchestrator: completion endpoint
//! options, the MCP server table, and the rejected-tools filter.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

/// The validated runtime configuration.
///
/// Created by parsing TOML content with [`RuntimeConfig::from_toml_str`].
/// The API key is provided separately by the caller (typically from the
/// environment) and is never read from the file.
#[derive(Deserialize, Debug, Clone)]
pub struct RuntimeConfig {
    /// Optional system prompt prepended to every conversation.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Completion endpoint options.
    pub client: ClientConfig,
    /// MCP servers keyed by a user-defined identifier. An entry with a
    /// `url` is an HTTP server; an entry with a `command` is spawned
    /// over stdio.
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
    /// Tool names hidden from the model even when a server advertises them.
    #[serde(default)]
    pub rejected_tools: Vec<String>,
    /// Bearer token for the completion endpoint. Not deserialized from
    /// TOML but provided separately.
    #[serde(skip)]
    pub api_key: String,
}

/// Options for the resilient completion client.
#[derive(Deserialize, Debug, Clone)]
pub struct ClientConfig {
    /// Full URL of the chat-completions endpoint.
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// When set, sent as the `X-Title` header.
    #[serde(default)]
    pub app_title: Option<String>,
}

fn default_user_agent() -> String {
    format!("switchyard/{}", env!("CARGO_PKG_VERSION"))
}

/// One MCP server definition. The transport is chosen by shape: a `url`
/// attribute means HTTP, otherwise a stdio child process.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ServerConfig {
    Http(HttpServerConfig),
    Stdio(StdioServerConfig),
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct HttpServerConfig {
    pub url: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub execution_id: Option<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct StdioServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl RuntimeConfig {
    /// Parses TOML configuration content and validates it against the
    /// provided API key.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The `api_key` is empty.
    /// * The content is not valid TOML.
    /// * The client `base_url` or any server `url` is not a valid URL.
    /// * Any stdio server has an empty `command`.
    pub fn from_toml_str(config_toml_content: &str, api_key: String) -> Result<RuntimeConfig> {
        if api_key.is_empty() {
            return Err(anyhow!("Provided API key is empty."));
        }

        let mut config: RuntimeConfig = toml::from_str(config_toml_content)
            .context("Failed to parse configuration TOML content. Check TOML syntax.")?;
        config.api_key = api_key;

        Url::parse(&config.client.base_url).with_context(|| {
            format!(
                "Invalid URL format for client base_url ('{}').",
                config.client.base_url
            )
        })?;

        for (key, server) in &config.servers {
            match server {
                ServerConfig::Http(http) => {
                    Url::parse(&http.url).with_context(|| {
                        format!(
                            "Invalid URL format for server '{}' ('{}').",
                            key, http.url
                        )
                    })?;
                }
                ServerConfig::Stdio(stdio) => {
                    if stdio.command.trim().is_empty() {
                        return Err(anyhow!("Server definition '{}' has an empty 'command'.", key));
                    }
                }
            }
        }

        tracing::info!(
            servers = config.servers.len(),
            rejected_tools = config.rejected_tools.len(),
            "Successfully parsed and validated configuration content."
        );
        Ok(config)
    }
}
