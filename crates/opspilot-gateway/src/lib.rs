//! Tool execution gateway client and configuration.
//!
//! The gateway is the external service that lists named tools and executes
//! them, returning text/JSON content envelopes. Server endpoints are
//! configured in layered JSON files (user, then project; project wins on
//! duplicate ids).

use anyhow::{Result, anyhow};
use opspilot_core::{ToolDescriptor, ToolEnvelope};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub trait Gateway: Send + Sync {
    fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;
    fn call_tool(&self, name: &str, args: &Value) -> Result<ToolEnvelope>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayServer {
    pub id: String,
    pub url: String,
    pub enabled: bool,
    pub metadata: Value,
}

impl Default for GatewayServer {
    fn default() -> Self {
        Self {
            id: String::new(),
            url: String::new(),
            enabled: true,
            metadata: Value::Null,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub servers: Vec<GatewayServer>,
}

pub struct GatewayManager {
    workspace: PathBuf,
}

impl GatewayManager {
    pub fn new(workspace: &Path) -> Self {
        Self {
            workspace: workspace.to_path_buf(),
        }
    }

    pub fn project_config_path(&self) -> PathBuf {
        opspilot_core::runtime_dir(&self.workspace).join("gateway.json")
    }

    pub fn user_config_path() -> Option<PathBuf> {
        let home = std::env::var("HOME")
            .ok()
            .or_else(|| std::env::var("USERPROFILE").ok())?;
        Some(Path::new(&home).join(".opspilot/gateway.json"))
    }

    pub fn load_project_config(&self) -> Result<GatewayConfig> {
        load_config_if_exists(&self.project_config_path())
    }

    pub fn save_project_config(&self, config: &GatewayConfig) -> Result<()> {
        let path = self.project_config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(config)?)?;
        Ok(())
    }

    /// User config first, project config last; duplicates (by id) keep the
    /// last occurrence so project settings override user ones.
    pub fn list_servers(&self) -> Result<Vec<GatewayServer>> {
        let mut merged = Vec::new();
        if let Some(path) = Self::user_config_path() {
            merged.extend(load_config_if_exists(&path)?.servers);
        }
        merged.extend(self.load_project_config()?.servers);
        let mut deduped: Vec<GatewayServer> = Vec::new();
        for server in merged {
            deduped.retain(|existing| existing.id != server.id);
            deduped.push(server);
        }
        Ok(deduped)
    }

    pub fn add_server(&self, server: GatewayServer) -> Result<()> {
        if server.id.trim().is_empty() {
            return Err(anyhow!("server id cannot be empty"));
        }
        let mut cfg = self.load_project_config()?;
        cfg.servers.retain(|existing| existing.id != server.id);
        cfg.servers.push(server);
        self.save_project_config(&cfg)
    }

    pub fn remove_server(&self, id: &str) -> Result<bool> {
        let mut cfg = self.load_project_config()?;
        let before = cfg.servers.len();
        cfg.servers.retain(|existing| existing.id != id);
        let removed = cfg.servers.len() != before;
        if removed {
            self.save_project_config(&cfg)?;
        }
        Ok(removed)
    }

    /// First enabled server, used as the default gateway endpoint.
    pub fn primary(&self) -> Result<GatewayServer> {
        self.list_servers()?
            .into_iter()
            .find(|s| s.enabled)
            .ok_or_else(|| anyhow!("no enabled gateway server configured"))
    }
}

fn load_config_if_exists(path: &Path) -> Result<GatewayConfig> {
    if !path.exists() {
        return Ok(GatewayConfig::default());
    }
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

/// HTTP gateway client. `GET {base}/tools` lists tools; `POST
/// {base}/tools/call` executes one.
pub struct HttpGateway {
    base_url: String,
    client: Client,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn from_server(server: &GatewayServer) -> Result<Self> {
        Self::new(server.url.clone(), Duration::from_secs(60))
    }
}

impl Gateway for HttpGateway {
    fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let value: Value = self
            .client
            .get(format!("{}/tools", self.base_url))
            .send()?
            .error_for_status()?
            .json()?;
        let tools = value
            .get("tools")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|entry| {
                        let name = entry.get("name")?.as_str()?.to_string();
                        let description = entry
                            .get("description")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        Some(ToolDescriptor {
                            name,
                            description,
                            input_schema: entry.get("inputSchema").cloned(),
                        })
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        Ok(tools)
    }

    fn call_tool(&self, name: &str, args: &Value) -> Result<ToolEnvelope> {
        let response = self
            .client
            .post(format!("{}/tools/call", self.base_url))
            .json(&serde_json::json!({"name": name, "arguments": args}))
            .send()?
            .error_for_status()?;
        Ok(response.json()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_list_remove_server_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = GatewayManager::new(dir.path());

        manager
            .add_server(GatewayServer {
                id: "local".to_string(),
                url: "http://127.0.0.1:9700".to_string(),
                enabled: true,
                metadata: Value::Null,
            })
            .expect("add");

        let listed = manager.list_servers().expect("list");
        assert!(listed.iter().any(|s| s.id == "local"));
        assert_eq!(manager.primary().expect("primary").id, "local");

        let removed = manager.remove_server("local").expect("remove");
        assert!(removed);
    }

    #[test]
    fn empty_server_id_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = GatewayManager::new(dir.path());
        assert!(manager.add_server(GatewayServer::default()).is_err());
    }

    #[test]
    fn project_config_overrides_user_duplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = GatewayManager::new(dir.path());
        manager
            .add_server(GatewayServer {
                id: "gw".to_string(),
                url: "http://one".to_string(),
                ..GatewayServer::default()
            })
            .expect("add one");
        manager
            .add_server(GatewayServer {
                id: "gw".to_string(),
                url: "http://two".to_string(),
                ..GatewayServer::default()
            })
            .expect("add two");
        let listed = manager.list_servers().expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].url, "http://two");
    }
}
