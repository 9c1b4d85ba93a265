//! Liveness probes for started services.
//!
//! A probe is polled at a fixed interval until it reports the expected
//! result or the overall deadline elapses. Services without a declared
//! probe are considered immediately healthy.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;

/// Interval between probe attempts.
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Per-attempt request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A liveness probe target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Http {
        url: String,
        method: String,
        expected_status: u16,
    },
    Tcp {
        host: String,
        port: u16,
    },
}

impl Probe {
    /// Parse a probe from a health check URL.
    ///
    /// `http://` and `https://` URLs become HTTP GET probes expecting a
    /// 200; `tcp://host:port` (or the shorthand `tcp:port`) becomes a
    /// TCP connect probe.
    pub fn from_url(url: &str) -> Result<Self, String> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return Ok(Probe::Http {
                url: url.to_string(),
                method: "GET".to_string(),
                expected_status: 200,
            });
        }

        if let Some(rest) = url.strip_prefix("tcp://") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| format!("tcp probe '{}' must be host:port", url))?;
            let port = port
                .parse::<u16>()
                .map_err(|_| format!("tcp probe '{}' has an invalid port", url))?;
            let host = if host.is_empty() { "127.0.0.1" } else { host };
            return Ok(Probe::Tcp {
                host: host.to_string(),
                port,
            });
        }

        if let Some(rest) = url.strip_prefix("tcp:") {
            let port = rest
                .parse::<u16>()
                .map_err(|_| format!("tcp probe '{}' has an invalid port", url))?;
            return Ok(Probe::Tcp {
                host: "127.0.0.1".to_string(),
                port,
            });
        }

        Err(format!("unsupported health check scheme: {}", url))
    }

    /// Well-known probe for a service with no explicit health check URL.
    pub fn default_for(service: &str, port: u16) -> Option<Self> {
        let path = match service.to_ascii_lowercase().as_str() {
            "consul" => "/v1/status/leader",
            "ollama" | "ollama_server" => "/api/tags",
            "redis" | "redis-server" | "postgres" | "postgresql" | "mysql" | "mysqld" => {
                return Some(Probe::Tcp {
                    host: "127.0.0.1".to_string(),
                    port,
                });
            }
            _ => return None,
        };
        Some(Probe::Http {
            url: format!("http://127.0.0.1:{}{}", port, path),
            method: "GET".to_string(),
            expected_status: 200,
        })
    }
}

/// Polls probes until they pass or a deadline elapses.
pub struct HealthVerifier {
    client: reqwest::Client,
    interval: Duration,
}

impl Default for HealthVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthVerifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            interval: POLL_INTERVAL,
        }
    }

    /// Override the poll interval (used by tests).
    pub fn with_interval(interval: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            interval,
        }
    }

    /// Poll `probe` until it passes or `overall_timeout` elapses.
    ///
    /// Returns no later than the deadline plus one poll interval. An
    /// unsupported HTTP method fails immediately instead of polling.
    pub async fn check(&self, service: &str, probe: &Probe, overall_timeout: Duration) -> bool {
        if let Probe::Http { method, .. } = probe {
            if !matches!(method.to_ascii_uppercase().as_str(), "GET" | "POST") {
                log::error!("[{}] unsupported health check method: {}", service, method);
                return false;
            }
        }

        log::info!("[{}] health check: {:?}", service, probe);
        let deadline = Instant::now() + overall_timeout;

        loop {
            if self.attempt(probe).await {
                log::info!("[{}] health check passed", service);
                return true;
            }
            if Instant::now() + self.interval > deadline {
                break;
            }
            tokio::time::sleep(self.interval).await;
        }

        log::error!(
            "[{}] health check failed after {}s",
            service,
            overall_timeout.as_secs()
        );
        false
    }

    async fn attempt(&self, probe: &Probe) -> bool {
        match probe {
            Probe::Http {
                url,
                method,
                expected_status,
            } => {
                let request = match method.to_ascii_uppercase().as_str() {
                    "GET" => self.client.get(url),
                    "POST" => self.client.post(url),
                    _ => return false,
                };
                match request.timeout(REQUEST_TIMEOUT).send().await {
                    Ok(resp) => resp.status().as_u16() == *expected_status,
                    Err(e) => {
                        log::debug!("health probe attempt failed for {}: {}", url, e);
                        false
                    }
                }
            }
            Probe::Tcp { host, port } => matches!(
                tokio::time::timeout(REQUEST_TIMEOUT, TcpStream::connect((host.as_str(), *port)))
                    .await,
                Ok(Ok(_))
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_from_http_url() {
        let probe = Probe::from_url("http://127.0.0.1:11434/api/tags").unwrap();
        assert_eq!(
            probe,
            Probe::Http {
                url: "http://127.0.0.1:11434/api/tags".to_string(),
                method: "GET".to_string(),
                expected_status: 200,
            }
        );
    }

    #[test]
    fn test_probe_from_tcp_url() {
        let probe = Probe::from_url("tcp://10.0.0.5:8010").unwrap();
        assert_eq!(
            probe,
            Probe::Tcp {
                host: "10.0.0.5".to_string(),
                port: 8010,
            }
        );
    }

    #[test]
    fn test_probe_from_tcp_shorthand() {
        let probe = Probe::from_url("tcp:8010").unwrap();
        assert_eq!(
            probe,
            Probe::Tcp {
                host: "127.0.0.1".to_string(),
                port: 8010,
            }
        );
    }

    #[test]
    fn test_probe_rejects_unknown_scheme() {
        assert!(Probe::from_url("gopher://example.com").is_err());
        assert!(Probe::from_url("tcp://nohost").is_err());
        assert!(Probe::from_url("tcp:notaport").is_err());
    }

    #[test]
    fn test_default_probes() {
        assert_eq!(
            Probe::default_for("consul", 8500),
            Some(Probe::Http {
                url: "http://127.0.0.1:8500/v1/status/leader".to_string(),
                method: "GET".to_string(),
                expected_status: 200,
            })
        );
        assert_eq!(
            Probe::default_for("redis-server", 6379),
            Some(Probe::Tcp {
                host: "127.0.0.1".to_string(),
                port: 6379,
            })
        );
        assert_eq!(Probe::default_for("my-custom-service", 9000), None);
    }

    #[tokio::test]
    async fn test_unsupported_method_fails_immediately() {
        let verifier = HealthVerifier::new();
        let probe = Probe::Http {
            url: "http://127.0.0.1:1/never".to_string(),
            method: "DELETE".to_string(),
            expected_status: 200,
        };
        let started = std::time::Instant::now();
        let healthy = verifier
            .check("svc", &probe, Duration::from_secs(30))
            .await;
        assert!(!healthy);
        // No polling happened
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_tcp_probe_passes_against_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let verifier = HealthVerifier::new();
        let probe = Probe::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        };
        assert!(verifier.check("svc", &probe, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_tcp_probe_respects_deadline() {
        let verifier = HealthVerifier::with_interval(Duration::from_millis(100));
        // Port 1 is essentially never listening; connects are refused fast.
        let probe = Probe::Tcp {
            host: "127.0.0.1".to_string(),
            port: 1,
        };
        let started = std::time::Instant::now();
        let healthy = verifier
            .check("svc", &probe, Duration::from_millis(500))
            .await;
        assert!(!healthy);
        // Bounded by the deadline plus one poll interval (with slack).
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
