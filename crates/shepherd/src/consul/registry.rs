//! Consul service registration and discovery.
//!
//! Talks to the Consul agent HTTP API. Every operation degrades to a
//! benign no-op when the bridge is disabled or the backend is
//! unreachable: the orchestration flow must never block or fail because
//! discovery is down.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::runtime::health::Probe;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(2);

/// Services whose HTTP health endpoints are known to be unstable get a
/// TCP check instead.
pub(crate) const TCP_CHECK_SERVICES: &[&str] = &["ollama", "ollama_server"];

/// Consul bridge settings from the `consul:` section of the
/// configuration file. An absent section leaves the bridge disabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsulConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_prefix")]
    pub service_prefix: String,
    /// Start a dev-mode agent when the backend is not running.
    #[serde(default)]
    pub auto_start: bool,
    /// Register services automatically after a successful start run.
    #[serde(default = "default_enabled")]
    pub auto_register: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_url() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_prefix() -> String {
    "shepherd".to_string()
}

impl Default for ConsulConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_url(),
            service_prefix: default_prefix(),
            auto_start: false,
            auto_register: true,
        }
    }
}

/// One entry as seen in the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub name: String,
    pub service_id: String,
    pub host: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub meta: HashMap<String, String>,
}

/// Service object returned by `/v1/agent/services`.
#[derive(Debug, Clone, Deserialize)]
struct AgentService {
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Address", default)]
    address: String,
    #[serde(rename = "Port", default)]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
    #[serde(rename = "Meta", default)]
    meta: HashMap<String, String>,
}

/// Health check descriptor attached to a registration.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct AgentCheck {
    #[serde(rename = "HTTP", skip_serializing_if = "Option::is_none")]
    http: Option<String>,
    #[serde(rename = "TCP", skip_serializing_if = "Option::is_none")]
    tcp: Option<String>,
    #[serde(rename = "Interval")]
    interval: String,
    #[serde(rename = "Timeout")]
    timeout: String,
    #[serde(rename = "DeregisterCriticalServiceAfter")]
    deregister_after: String,
}

impl AgentCheck {
    fn http(url: String) -> Self {
        Self {
            http: Some(url),
            tcp: None,
            ..Self::base()
        }
    }

    fn tcp(host: &str, port: u16) -> Self {
        Self {
            http: None,
            tcp: Some(format!("{}:{}", host, port)),
            ..Self::base()
        }
    }

    fn base() -> Self {
        Self {
            http: None,
            tcp: None,
            interval: "10s".to_string(),
            timeout: "5s".to_string(),
            deregister_after: "30s".to_string(),
        }
    }
}

/// Body for `/v1/agent/service/register`.
#[derive(Debug, Clone, Serialize)]
struct AgentServiceRegistration {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags")]
    tags: Vec<String>,
    #[serde(rename = "Meta")]
    meta: HashMap<String, String>,
    #[serde(rename = "Check", skip_serializing_if = "Option::is_none")]
    check: Option<AgentCheck>,
}

/// Node entry from `/v1/health/service/{name}`.
#[derive(Debug, Clone, Deserialize)]
struct HealthServiceNode {
    #[serde(rename = "Service")]
    service: AgentService,
}

/// Registers and discovers services against a Consul agent.
pub struct ConsulRegistry {
    config: ConsulConfig,
    client: reqwest::Client,
}

impl ConsulRegistry {
    pub fn new(config: ConsulConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &ConsulConfig {
        &self.config
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Registry-facing display name: `{prefix}-{name}`.
    pub fn display_name(&self, name: &str) -> String {
        if self.config.service_prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}-{}", self.config.service_prefix, name)
        }
    }

    /// Deterministic id: `{prefix}-{name}-{host}-{port}`.
    pub fn service_id(&self, name: &str, host: &str, port: u16) -> String {
        if self.config.service_prefix.is_empty() {
            format!("{}-{}-{}", name, host, port)
        } else {
            format!("{}-{}-{}-{}", self.config.service_prefix, name, host, port)
        }
    }

    /// True only if the backend answers its leader probe.
    pub async fn is_available(&self) -> bool {
        if !self.config.enabled {
            return false;
        }
        let url = format!("{}/v1/status/leader", self.config.url);
        match self
            .client
            .get(&url)
            .timeout(AVAILABILITY_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                let body = resp.text().await.unwrap_or_default();
                !body.trim().trim_matches('"').is_empty()
            }
            Ok(resp) => {
                log::debug!("consul leader probe returned {}", resp.status());
                false
            }
            Err(e) => {
                log::debug!("consul leader probe failed: {}", e);
                false
            }
        }
    }

    async fn agent_services(&self) -> Option<HashMap<String, AgentService>> {
        let url = format!("{}/v1/agent/services", self.config.url);
        match self.client.get(&url).timeout(REQUEST_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => match resp.json().await {
                Ok(services) => Some(services),
                Err(e) => {
                    log::warn!("failed to decode consul service list: {}", e);
                    None
                }
            },
            Ok(resp) => {
                log::warn!("consul service list returned {}", resp.status());
                None
            }
            Err(e) => {
                log::warn!("consul unreachable: {}", e);
                None
            }
        }
    }

    /// Register a service. Registering an entry that already exists
    /// (same id, or same name/address/port) is a no-op success, never a
    /// duplicate. Returns false when the backend is unavailable.
    pub async fn register(
        &self,
        name: &str,
        host: &str,
        port: u16,
        probe: Option<&Probe>,
        tags: Vec<String>,
        meta: HashMap<String, String>,
    ) -> bool {
        if !self.config.enabled {
            log::debug!("consul disabled, skipping registration of {}", name);
            return false;
        }

        let Some(existing) = self.agent_services().await else {
            log::warn!("consul unavailable, skipping registration of {}", name);
            return false;
        };

        let id = self.service_id(name, host, port);
        if existing.contains_key(&id) {
            log::info!("service already registered: {} ({})", name, id);
            return true;
        }

        let display_name = self.display_name(name);
        if let Some(dup) = existing
            .values()
            .find(|s| s.service == display_name && s.address == host && s.port == port)
        {
            log::info!(
                "equivalent entry already registered: {} (existing id {})",
                name,
                dup.id
            );
            return true;
        }

        let check = probe.map(|probe| match probe {
            Probe::Http { url, .. } => AgentCheck::http(url.clone()),
            Probe::Tcp { host, port } => AgentCheck::tcp(host, *port),
        });

        let mut tags = tags;
        if !self.config.service_prefix.is_empty()
            && !tags.contains(&self.config.service_prefix)
        {
            tags.insert(0, self.config.service_prefix.clone());
        }

        let body = AgentServiceRegistration {
            name: display_name,
            id: id.clone(),
            address: host.to_string(),
            port,
            tags,
            meta,
            check,
        };

        let url = format!("{}/v1/agent/service/register", self.config.url);
        match self
            .client
            .put(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                log::info!("registered service {} ({}) at {}:{}", name, id, host, port);
                true
            }
            Ok(resp) => {
                log::warn!("registration of {} returned {}", name, resp.status());
                false
            }
            Err(e) => {
                log::warn!("registration of {} failed: {}", name, e);
                false
            }
        }
    }

    /// Deregister a service. The port is resolved from the currently
    /// listed entries when the caller does not know it; an unknown
    /// service is a logged no-op.
    pub async fn deregister(&self, name: &str, host: &str, port: Option<u16>) -> bool {
        if !self.config.enabled {
            log::debug!("consul disabled, skipping deregistration of {}", name);
            return false;
        }

        let port = match port {
            Some(p) => Some(p),
            None => self
                .list_services()
                .await
                .into_iter()
                .find(|entry| entry.name.ends_with(name))
                .map(|entry| entry.port),
        };
        let Some(port) = port else {
            log::warn!("cannot determine port for service {}, skipping deregistration", name);
            return false;
        };

        let id = self.service_id(name, host, port);
        let url = format!("{}/v1/agent/service/deregister/{}", self.config.url, id);
        match self.client.put(&url).timeout(REQUEST_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => {
                log::info!("deregistered service {} ({})", name, id);
                true
            }
            Ok(resp) => {
                log::warn!("deregistration of {} returned {}", name, resp.status());
                false
            }
            Err(e) => {
                log::warn!("deregistration of {} failed: {}", name, e);
                false
            }
        }
    }

    /// List entries managed under this bridge's prefix.
    pub async fn list_services(&self) -> Vec<RegistryEntry> {
        if !self.config.enabled {
            return Vec::new();
        }
        match self.agent_services().await {
            Some(services) => entries_with_prefix(&services, &self.config.service_prefix),
            None => Vec::new(),
        }
    }

    /// Discover entries, optionally restricted to one service name.
    /// Unhealthy entries are included: an operator must be able to see
    /// failing services.
    pub async fn discover(&self, name: Option<&str>) -> Vec<RegistryEntry> {
        if !self.config.enabled {
            return Vec::new();
        }

        let Some(name) = name else {
            return self.list_services().await;
        };

        let url = format!(
            "{}/v1/health/service/{}",
            self.config.url,
            self.display_name(name)
        );
        match self.client.get(&url).timeout(REQUEST_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<Vec<HealthServiceNode>>().await {
                    Ok(nodes) => nodes
                        .into_iter()
                        .map(|node| entry_from(&node.service))
                        .collect(),
                    Err(e) => {
                        log::warn!("failed to decode discovery response: {}", e);
                        Vec::new()
                    }
                }
            }
            Ok(resp) => {
                log::warn!("discovery of {} returned {}", name, resp.status());
                Vec::new()
            }
            Err(e) => {
                log::warn!("discovery of {} failed: {}", name, e);
                Vec::new()
            }
        }
    }
}

fn entry_from(service: &AgentService) -> RegistryEntry {
    RegistryEntry {
        name: service.service.clone(),
        service_id: service.id.clone(),
        host: service.address.clone(),
        port: service.port,
        tags: service.tags.clone(),
        meta: service.meta.clone(),
    }
}

fn entries_with_prefix(
    services: &HashMap<String, AgentService>,
    prefix: &str,
) -> Vec<RegistryEntry> {
    let mut entries: Vec<RegistryEntry> = services
        .values()
        .filter(|s| prefix.is_empty() || s.service.starts_with(prefix))
        .map(entry_from)
        .collect();
    entries.sort_by(|a, b| a.service_id.cmp(&b.service_id));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(prefix: &str, enabled: bool) -> ConsulRegistry {
        ConsulRegistry::new(ConsulConfig {
            enabled,
            url: "http://127.0.0.1:8500".to_string(),
            service_prefix: prefix.to_string(),
            auto_start: false,
            auto_register: true,
        })
    }

    fn agent_service(name: &str, id: &str, host: &str, port: u16) -> AgentService {
        AgentService {
            service: name.to_string(),
            id: id.to_string(),
            address: host.to_string(),
            port,
            tags: vec![],
            meta: HashMap::new(),
        }
    }

    #[test]
    fn test_service_id_format() {
        let reg = registry("shepherd", true);
        assert_eq!(
            reg.service_id("web", "127.0.0.1", 8010),
            "shepherd-web-127.0.0.1-8010"
        );

        let bare = registry("", true);
        assert_eq!(bare.service_id("web", "127.0.0.1", 8010), "web-127.0.0.1-8010");
    }

    #[test]
    fn test_display_name() {
        let reg = registry("shepherd", true);
        assert_eq!(reg.display_name("web"), "shepherd-web");
        let bare = registry("", true);
        assert_eq!(bare.display_name("web"), "web");
    }

    #[test]
    fn test_config_defaults() {
        // Absent section: disabled
        let config = ConsulConfig::default();
        assert!(!config.enabled);

        // Present but empty section: enabled with defaults
        let config: ConsulConfig = serde_yaml::from_str("{}").unwrap();
        assert!(config.enabled);
        assert_eq!(config.url, "http://127.0.0.1:8500");
        assert_eq!(config.service_prefix, "shepherd");
        assert!(!config.auto_start);
        assert!(config.auto_register);
    }

    #[test]
    fn test_check_serialization() {
        let check = AgentCheck::http("http://127.0.0.1:8010/health".to_string());
        let value = serde_json::to_value(&check).unwrap();
        assert_eq!(value["HTTP"], "http://127.0.0.1:8010/health");
        assert!(value.get("TCP").is_none());
        assert_eq!(value["Interval"], "10s");
        assert_eq!(value["Timeout"], "5s");
        assert_eq!(value["DeregisterCriticalServiceAfter"], "30s");

        let check = AgentCheck::tcp("127.0.0.1", 11434);
        let value = serde_json::to_value(&check).unwrap();
        assert_eq!(value["TCP"], "127.0.0.1:11434");
        assert!(value.get("HTTP").is_none());
    }

    #[test]
    fn test_registration_body_shape() {
        let body = AgentServiceRegistration {
            name: "shepherd-web".to_string(),
            id: "shepherd-web-127.0.0.1-8010".to_string(),
            address: "127.0.0.1".to_string(),
            port: 8010,
            tags: vec!["shepherd".to_string(), "external-service".to_string()],
            meta: HashMap::new(),
            check: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["Name"], "shepherd-web");
        assert_eq!(value["Port"], 8010);
        assert!(value.get("Check").is_none());
    }

    #[test]
    fn test_agent_service_decoding() {
        let json = r#"{
            "web-1": {"ID": "web-1", "Service": "shepherd-web", "Address": "127.0.0.1",
                      "Port": 8010, "Tags": ["shepherd"], "Meta": {"managed-by": "shepherd"}}
        }"#;
        let services: HashMap<String, AgentService> = serde_json::from_str(json).unwrap();
        assert_eq!(services["web-1"].service, "shepherd-web");
        assert_eq!(services["web-1"].port, 8010);
        assert_eq!(services["web-1"].meta["managed-by"], "shepherd");
    }

    #[test]
    fn test_prefix_filtering() {
        let mut services = HashMap::new();
        services.insert(
            "a".to_string(),
            agent_service("shepherd-web", "a", "127.0.0.1", 8010),
        );
        services.insert(
            "b".to_string(),
            agent_service("unrelated", "b", "127.0.0.1", 9999),
        );

        let entries = entries_with_prefix(&services, "shepherd");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "shepherd-web");

        // No prefix: everything is surfaced
        let entries = entries_with_prefix(&services, "");
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_disabled_bridge_is_benign() {
        let reg = registry("shepherd", false);
        assert!(!reg.is_available().await);
        assert!(!reg.register("web", "127.0.0.1", 8010, None, vec![], HashMap::new()).await);
        assert!(!reg.deregister("web", "127.0.0.1", Some(8010)).await);
        assert!(reg.list_services().await.is_empty());
        assert!(reg.discover(Some("web")).await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_benign() {
        let reg = ConsulRegistry::new(ConsulConfig {
            enabled: true,
            // Nothing listens here; connections are refused immediately.
            url: "http://127.0.0.1:1".to_string(),
            service_prefix: "shepherd".to_string(),
            auto_start: false,
            auto_register: true,
        });
        assert!(!reg.is_available().await);
        assert!(!reg.register("web", "127.0.0.1", 8010, None, vec![], HashMap::new()).await);
        assert!(reg.list_services().await.is_empty());
    }
}
