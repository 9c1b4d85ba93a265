//! Service lifecycle orchestration.
//!
//! Composes the supervisor, health verifier, retry engine, state store
//! and registry bridge into the start/stop/status operations. The
//! orchestrator owns the name-to-record map; nothing else mutates it.

use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

use crate::config::{ServiceFile, ServiceSpec};
use crate::consul::{ConsulProcess, ConsulRegistry, RegistryEntry, TCP_CHECK_SERVICES};
use crate::error::{Result, ServiceError};
use crate::runtime::health::{HealthVerifier, Probe};
use crate::runtime::retry::{self, RetryPolicy};
use crate::runtime::supervisor::{Liveness, ProcessSupervisor, GRACEFUL_STOP_TIMEOUT};
use crate::state::{self, now_secs, RuntimeRecord, ServiceStatus, StateStore};

/// Outcome of a `start-all` run. Base failures are critical; optional
/// failures are informational.
#[derive(Debug, Default)]
pub struct StartReport {
    pub started: Vec<String>,
    pub base_failures: Vec<(String, String)>,
    pub optional_failures: Vec<(String, String)>,
}

impl StartReport {
    pub fn success(&self) -> bool {
        self.base_failures.is_empty() && self.optional_failures.is_empty()
    }
}

impl fmt::Display for StartReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Started {} service(s)", self.started.len())?;
        for name in &self.started {
            writeln!(f, "  + {}", name)?;
        }
        for (name, error) in &self.base_failures {
            writeln!(f, "  ! {} (base, critical): {}", name, error)?;
        }
        for (name, error) in &self.optional_failures {
            writeln!(f, "  - {} (optional): {}", name, error)?;
        }
        Ok(())
    }
}

/// Outcome of a `stop-all` run.
#[derive(Debug, Default)]
pub struct StopReport {
    pub stopped: usize,
    pub failures: Vec<(String, String)>,
}

impl StopReport {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Point-in-time view of one service.
#[derive(Debug, Clone)]
pub struct ServiceStatusView {
    pub name: String,
    pub class: &'static str,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub status: ServiceStatus,
    pub uptime_secs: u64,
}

/// Registry side of the status view.
#[derive(Debug, Clone)]
pub struct ConsulStatusView {
    pub available: bool,
    pub registered: Vec<RegistryEntry>,
}

/// Full `status` output.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub services: Vec<ServiceStatusView>,
    pub consul: Option<ConsulStatusView>,
    pub timestamp: u64,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Service status ({} tracked)", self.services.len())?;
        for service in &self.services {
            let uptime = service.uptime_secs;
            writeln!(
                f,
                "  {} [{}] status={} pid={} port={} uptime={}h{}m{}s",
                service.name,
                service.class,
                service.status.as_str(),
                service
                    .pid
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                service
                    .port
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                uptime / 3600,
                (uptime % 3600) / 60,
                uptime % 60,
            )?;
        }
        if let Some(consul) = &self.consul {
            writeln!(
                f,
                "Consul: {}",
                if consul.available { "available" } else { "unavailable" }
            )?;
            for entry in &consul.registered {
                writeln!(
                    f,
                    "  * {} ({}) {}:{}",
                    entry.name, entry.service_id, entry.host, entry.port
                )?;
            }
        }
        Ok(())
    }
}

/// Drives the per-service lifecycle state machine across the whole
/// configured fleet.
pub struct Orchestrator {
    specs: Vec<ServiceSpec>,
    records: IndexMap<String, RuntimeRecord>,
    supervisor: ProcessSupervisor,
    verifier: HealthVerifier,
    registry: ConsulRegistry,
    consul_process: ConsulProcess,
    store: StateStore,
    retry: RetryPolicy,
}

impl Orchestrator {
    /// Build an orchestrator rooted at the default base directory.
    pub fn new(file: &ServiceFile) -> Result<Self> {
        Self::with_home(file, state::shepherd_home())
    }

    /// Build an orchestrator rooted at an explicit base directory
    /// (state file and log directory live underneath it).
    pub fn with_home(file: &ServiceFile, home: PathBuf) -> Result<Self> {
        let specs = file.validated_specs()?;
        let store = StateStore::new(home.join("service_state.json"));
        let records = store.load();
        let supervisor = ProcessSupervisor::new(home.clone(), home.join("logs"));

        Ok(Self {
            specs,
            records,
            supervisor,
            verifier: HealthVerifier::new(),
            registry: ConsulRegistry::new(file.consul.clone()),
            consul_process: ConsulProcess::new(),
            store,
            retry: RetryPolicy::default(),
        })
    }

    /// Override the startup retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn records(&self) -> &IndexMap<String, RuntimeRecord> {
        &self.records
    }

    pub fn specs(&self) -> &[ServiceSpec] {
        &self.specs
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.records) {
            log::error!("failed to persist service state: {}", e);
        }
    }

    /// Start every configured service: base services strictly first,
    /// sequentially within each class. A base failure is critical but
    /// does not abort the remaining base services; failures are
    /// aggregated into the report.
    pub async fn start_all(&mut self, shutdown_rx: &watch::Receiver<()>) -> StartReport {
        log::info!("starting all external services...");
        let mut report = StartReport::default();

        // This run is now authoritative for what should be running.
        self.records.clear();
        self.persist();

        if self.registry.enabled() && self.registry.config().auto_start {
            if !self.registry.is_available().await {
                if let Err(e) = self.consul_process.start(&self.registry, "0.0.0.0").await {
                    log::warn!("failed to auto-start consul: {}", e);
                }
            }
        }

        let base: Vec<ServiceSpec> = self.specs.iter().filter(|s| s.is_base).cloned().collect();
        let optional: Vec<ServiceSpec> =
            self.specs.iter().filter(|s| !s.is_base).cloned().collect();

        for spec in &base {
            if shutdown_rx.has_changed().unwrap_or(false) {
                log::info!("shutdown requested, aborting start sequence");
                return report;
            }
            match self.start_one(spec).await {
                Ok(()) => report.started.push(spec.name.clone()),
                Err(e) => {
                    log::error!("critical: base service failed to start: {}", e);
                    report.base_failures.push((spec.name.clone(), e.to_string()));
                }
            }
        }

        for spec in &optional {
            if shutdown_rx.has_changed().unwrap_or(false) {
                log::info!("shutdown requested, aborting start sequence");
                return report;
            }
            match self.start_one(spec).await {
                Ok(()) => report.started.push(spec.name.clone()),
                Err(e) => {
                    log::warn!("optional service failed to start: {}", e);
                    report
                        .optional_failures
                        .push((spec.name.clone(), e.to_string()));
                }
            }
        }

        if self.registry.enabled() && self.registry.config().auto_register {
            if self.registry.is_available().await {
                self.register_all().await;
            } else {
                log::info!("consul unavailable, skipping automatic registration");
            }
        }

        log::info!(
            "start run complete: {} started, {} base failure(s), {} optional failure(s)",
            report.started.len(),
            report.base_failures.len(),
            report.optional_failures.len()
        );
        report
    }

    /// Start one named service.
    pub async fn start_service(&mut self, name: &str) -> Result<()> {
        let spec = self
            .specs
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound {
                service: name.to_string(),
            })?;
        self.start_one(&spec).await
    }

    /// Drive one spec through Starting -> HealthChecking -> Running,
    /// with the (spawn, probe) pair retried as a unit. Every transition
    /// is persisted.
    async fn start_one(&mut self, spec: &ServiceSpec) -> Result<()> {
        let name = spec.name.clone();
        self.records.insert(
            name.clone(),
            RuntimeRecord {
                pid: None,
                start_time: now_secs(),
                script: spec.command.match_target(),
                args: spec.command.args().to_vec(),
                cwd: spec.working_dir.as_ref().map(|p| p.display().to_string()),
                port: spec.resolve_port(),
                status: ServiceStatus::Starting,
                class: spec.class(),
            },
        );
        self.persist();

        let supervisor = &self.supervisor;
        let verifier = &self.verifier;
        let store = &self.store;
        let probe = spec.resolve_probe();
        let snapshot = self.records.clone();

        let start = || {
            let spec = spec.clone();
            let mut snapshot = snapshot.clone();
            async move {
                let record = supervisor.spawn(&spec).await?;
                let mut checking = record.clone();
                checking.status = ServiceStatus::HealthChecking;
                snapshot.insert(spec.name.clone(), checking);
                if let Err(e) = store.save(&snapshot) {
                    log::warn!("[{}] failed to persist state: {}", spec.name, e);
                }
                Ok(record)
            }
        };

        let health = || {
            let probe = probe.clone();
            let name = name.clone();
            let deadline = spec.startup_timeout;
            async move {
                match probe {
                    Some(probe) => {
                        if verifier.check(&name, &probe, deadline).await {
                            Ok(())
                        } else {
                            Err(ServiceError::HealthCheck {
                                service: name,
                                message: format!(
                                    "probe did not pass within {}s",
                                    deadline.as_secs()
                                ),
                            })
                        }
                    }
                    None => Ok(()),
                }
            }
        };

        match retry::retry_start(&name, &self.retry, start, health).await {
            Ok(mut record) => {
                record.status = if record.pid.is_some() {
                    ServiceStatus::Running
                } else {
                    // Foreground services already ran to completion.
                    ServiceStatus::Stopped
                };
                self.records.insert(name, record);
                self.persist();
                Ok(())
            }
            Err(e) => {
                if let Some(record) = self.records.get_mut(&name) {
                    record.status = ServiceStatus::Failed;
                    record.pid = None;
                }
                self.persist();
                Err(e)
            }
        }
    }

    /// Terminate one remembered service: by tracked pid first, then by
    /// reconciled process-table evidence.
    async fn stop_record(&self, name: &str, record: &RuntimeRecord) -> Result<bool> {
        let mut result = Ok(true);
        if let Some(pid) = record.pid {
            result = self
                .supervisor
                .terminate(name, pid, GRACEFUL_STOP_TIMEOUT)
                .await;
        }

        match self.supervisor.reconcile(record).await {
            Liveness::Alive { pid } => {
                result = self
                    .supervisor
                    .terminate(name, pid, GRACEFUL_STOP_TIMEOUT)
                    .await;
            }
            Liveness::Listening { port } => {
                log::warn!(
                    "[{}] something still listening on port {} after termination",
                    name,
                    port
                );
            }
            Liveness::Dead => {}
        }
        result
    }

    /// Stop every remembered service. Deregisters first (best-effort),
    /// then terminates, then clears the persisted state only after all
    /// termination attempts have been made.
    pub async fn stop_all(&mut self) -> StopReport {
        log::info!("stopping all external services...");
        let mut report = StopReport::default();

        if self.registry.enabled() && !self.records.is_empty() {
            self.deregister_all().await;
        }

        let entries: Vec<(String, RuntimeRecord)> = self
            .records
            .iter()
            .map(|(name, record)| (name.clone(), record.clone()))
            .collect();

        for (name, record) in entries {
            match self.stop_record(&name, &record).await {
                Ok(_) => {
                    report.stopped += 1;
                    if let Some(r) = self.records.get_mut(&name) {
                        r.status = ServiceStatus::Stopped;
                        r.pid = None;
                    }
                }
                Err(e) => {
                    log::error!("{}", e);
                    report.failures.push((name, e.to_string()));
                }
            }
        }

        self.records.clear();
        self.persist();
        log::info!(
            "stop run complete: {} stopped, {} failure(s)",
            report.stopped,
            report.failures.len()
        );
        report
    }

    /// Stop one named service and drop it from the state.
    pub async fn stop_service(&mut self, name: &str) -> Result<()> {
        let record = self
            .records
            .shift_remove(name)
            .ok_or_else(|| ServiceError::NotFound {
                service: name.to_string(),
            })?;

        if self.registry.enabled() {
            self.registry.deregister(name, "127.0.0.1", record.port).await;
        }
        let result = self.stop_record(name, &record).await;
        self.persist();
        result.map(|_| ())
    }

    /// Stop everything, then run the full start sequence again.
    pub async fn restart_all(&mut self, shutdown_rx: &watch::Receiver<()>) -> (StopReport, StartReport) {
        let stop = self.stop_all().await;
        let start = self.start_all(shutdown_rx).await;
        (stop, start)
    }

    /// Reconcile every remembered service against the live host and
    /// report the result, together with the registry view.
    pub async fn status(&mut self) -> StatusReport {
        let supervisor = &self.supervisor;
        for (name, record) in self.records.iter_mut() {
            match supervisor.reconcile(record).await {
                Liveness::Alive { pid } => {
                    record.pid = Some(pid);
                    if !matches!(
                        record.status,
                        ServiceStatus::Starting | ServiceStatus::HealthChecking
                    ) {
                        record.status = ServiceStatus::Running;
                    }
                }
                Liveness::Listening { port } => {
                    log::debug!("[{}] port {} still answering", name, port);
                }
                Liveness::Dead => {
                    record.pid = None;
                    if record.status != ServiceStatus::Failed {
                        record.status = ServiceStatus::Stopped;
                    }
                }
            }
        }
        self.persist();

        let services = self
            .records
            .iter()
            .map(|(name, record)| ServiceStatusView {
                name: name.clone(),
                class: record.class.as_str(),
                pid: record.pid,
                port: record.port,
                status: record.status,
                uptime_secs: if record.status == ServiceStatus::Running {
                    record.uptime_secs()
                } else {
                    0
                },
            })
            .collect();

        let consul = if self.registry.enabled() {
            let available = self.registry.is_available().await;
            let registered = if available {
                self.registry.list_services().await
            } else {
                Vec::new()
            };
            Some(ConsulStatusView {
                available,
                registered,
            })
        } else {
            None
        };

        StatusReport {
            services,
            consul,
            timestamp: now_secs(),
        }
    }

    /// Register every remembered service with the registry. Services
    /// without a resolvable port are skipped with a warning; the
    /// backend process itself is never registered.
    pub async fn register_all(&self) -> bool {
        if !self.registry.enabled() {
            log::warn!("consul integration disabled, cannot register services");
            return false;
        }

        let host_name = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let mut all_ok = true;
        for (name, record) in &self.records {
            if name.eq_ignore_ascii_case("consul") {
                log::info!("skipping registration of the consul backend itself");
                continue;
            }
            let Some(port) = record.port else {
                log::warn!("service {} has no known port, skipping registration", name);
                all_ok = false;
                continue;
            };

            let probe = self.registration_probe(name, port);
            let tags = vec!["external-service".to_string(), record.class.as_str().to_string()];
            let meta = HashMap::from([
                ("managed-by".to_string(), "shepherd".to_string()),
                ("hostname".to_string(), host_name.clone()),
            ]);

            let registered = self
                .registry
                .register(name, "127.0.0.1", port, probe.as_ref(), tags, meta)
                .await;
            if registered {
                log::info!("service registered with consul: {}", name);
            } else {
                all_ok = false;
            }
        }
        all_ok
    }

    /// The check descriptor attached to a registration. Known-flaky
    /// HTTP endpoints are demoted to TCP checks.
    fn registration_probe(&self, name: &str, port: u16) -> Option<Probe> {
        if TCP_CHECK_SERVICES.contains(&name.to_ascii_lowercase().as_str()) {
            return Some(Probe::Tcp {
                host: "127.0.0.1".to_string(),
                port,
            });
        }
        self.specs
            .iter()
            .find(|s| s.name == name)
            .and_then(|s| s.resolve_probe())
            .or_else(|| Probe::default_for(name, port))
    }

    /// Deregister every remembered service (best-effort).
    pub async fn deregister_all(&self) -> bool {
        if !self.registry.enabled() {
            log::warn!("consul integration disabled, cannot deregister services");
            return false;
        }
        if !self.registry.is_available().await {
            log::info!("consul unavailable, skipping deregistration");
            return false;
        }

        let mut all_ok = true;
        for (name, record) in &self.records {
            if name.eq_ignore_ascii_case("consul") {
                continue;
            }
            if self
                .registry
                .deregister(name, "127.0.0.1", record.port)
                .await
            {
                log::info!("service deregistered from consul: {}", name);
            } else {
                all_ok = false;
            }
        }
        all_ok
    }

    /// Discover registry entries, optionally restricted to one name.
    pub async fn discover(&self, name: Option<&str>) -> Vec<RegistryEntry> {
        self.registry.discover(name).await
    }
}

/// Default graceful window granted to each service on stop.
pub const STOP_TIMEOUT: Duration = GRACEFUL_STOP_TIMEOUT;
