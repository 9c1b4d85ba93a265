//! Service configuration schema and validation.
//!
//! The YAML file is deserialized into loosely-typed raw entries, then
//! validated once into strongly-typed [`ServiceSpec`] values before any
//! process is touched. Invalid entries fail closed.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ports;
use crate::consul::ConsulConfig;
use crate::error::{Result, ServiceError};
use crate::runtime::health::Probe;
use crate::state::ServiceClass;

const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 60;

/// Root configuration file (`service_config.yml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceFile {
    #[serde(default)]
    pub external_services: ExternalServices,
    #[serde(default)]
    pub consul: ConsulConfig,
}

/// Managed services, split by failure class. Order within each list is
/// the startup order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExternalServices {
    #[serde(default)]
    pub base_services: Vec<RawService>,
    #[serde(default)]
    pub optional_services: Vec<RawService>,
}

/// One service entry as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawService {
    #[serde(default)]
    pub service_name: Option<String>,
    /// Script path for interpreter-backed services, or the program
    /// itself for shell-backed services without a `command`.
    #[serde(default)]
    pub script: Option<String>,
    /// Conda environment root providing the interpreter.
    #[serde(default)]
    pub conda_env: Option<String>,
    /// Shell program to run instead of a script.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub use_python: bool,
    #[serde(default = "default_true")]
    pub run_in_background: bool,
    #[serde(default)]
    pub is_base: bool,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Overall health check deadline per attempt, in seconds.
    #[serde(default)]
    pub startup_timeout: Option<u64>,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl Default for RawService {
    fn default() -> Self {
        Self {
            service_name: None,
            script: None,
            conda_env: None,
            command: None,
            args: Vec::new(),
            use_python: false,
            run_in_background: true,
            is_base: false,
            log_file: None,
            working_dir: None,
            startup_timeout: None,
            health_check_url: None,
            dependencies: Vec::new(),
        }
    }
}

/// How a service is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    /// Interpreter-backed: `<interpreter> <script> <args...>`.
    Python {
        interpreter: PathBuf,
        script: PathBuf,
        args: Vec<String>,
    },
    /// Shell-backed: `<program> <args...>`.
    Shell { program: String, args: Vec<String> },
}

impl CommandSpec {
    pub fn args(&self) -> &[String] {
        match self {
            CommandSpec::Python { args, .. } | CommandSpec::Shell { args, .. } => args,
        }
    }

    /// The token used to re-identify running instances of this service
    /// in the host process table.
    pub fn match_target(&self) -> String {
        match self {
            CommandSpec::Python { script, .. } => script.display().to_string(),
            CommandSpec::Shell { program, .. } => program.clone(),
        }
    }

    /// Human-readable command line for logging.
    pub fn display(&self) -> String {
        match self {
            CommandSpec::Python {
                interpreter,
                script,
                args,
            } => format!(
                "{} {} {}",
                interpreter.display(),
                script.display(),
                args.join(" ")
            )
            .trim_end()
            .to_string(),
            CommandSpec::Shell { program, args } => {
                format!("{} {}", program, args.join(" ")).trim_end().to_string()
            }
        }
    }
}

/// Validated, normalized description of one manageable service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceSpec {
    pub name: String,
    pub command: CommandSpec,
    pub working_dir: Option<PathBuf>,
    pub log_file: Option<String>,
    pub run_in_background: bool,
    pub is_base: bool,
    pub startup_timeout: Duration,
    pub health_check_url: Option<String>,
    pub dependencies: Vec<String>,
}

impl ServiceSpec {
    pub fn class(&self) -> ServiceClass {
        if self.is_base {
            ServiceClass::Base
        } else {
            ServiceClass::Optional
        }
    }

    /// Best-effort listening port: command args, then health check URL,
    /// then the well-known defaults table.
    pub fn resolve_port(&self) -> Option<u16> {
        ports::port_from_args(self.command.args())
            .or_else(|| {
                self.health_check_url
                    .as_deref()
                    .and_then(ports::port_from_url)
            })
            .or_else(|| ports::known_port(&self.name))
    }

    /// The probe verifying this service, if any.
    pub fn resolve_probe(&self) -> Option<Probe> {
        if let Some(url) = &self.health_check_url {
            return Probe::from_url(url).ok();
        }
        self.resolve_port()
            .and_then(|port| Probe::default_for(&self.name, port))
    }
}

impl RawService {
    /// Validate this entry into a [`ServiceSpec`].
    ///
    /// Missing or unusable required fields fail with a config error
    /// naming the offending field; the service is never spawned.
    pub fn to_spec(&self, class: ServiceClass) -> Result<ServiceSpec> {
        let name = match &self.service_name {
            Some(n) if !n.is_empty() => n.clone(),
            _ => {
                return Err(ServiceError::Config {
                    service: "<unnamed>".to_string(),
                    message: "missing required field: service_name".to_string(),
                })
            }
        };

        let command = if self.use_python {
            let script = self.script.as_ref().ok_or_else(|| ServiceError::Config {
                service: name.clone(),
                message: "missing required field: script".to_string(),
            })?;
            let conda_env = self.conda_env.as_ref().ok_or_else(|| ServiceError::Config {
                service: name.clone(),
                message: "missing required field: conda_env".to_string(),
            })?;
            let interpreter = Path::new(conda_env).join("bin").join("python");
            if !interpreter.exists() {
                return Err(ServiceError::Config {
                    service: name.clone(),
                    message: format!("python interpreter not found: {}", interpreter.display()),
                });
            }
            CommandSpec::Python {
                interpreter,
                script: PathBuf::from(script),
                args: self.args.clone(),
            }
        } else {
            let program = self
                .command
                .clone()
                .or_else(|| self.script.clone())
                .ok_or_else(|| ServiceError::Config {
                    service: name.clone(),
                    message: "missing required field: script".to_string(),
                })?;
            CommandSpec::Shell {
                program,
                args: self.args.clone(),
            }
        };

        if let Some(url) = &self.health_check_url {
            Probe::from_url(url).map_err(|message| ServiceError::Config {
                service: name.clone(),
                message,
            })?;
        }

        let working_dir = self
            .working_dir
            .as_ref()
            .map(PathBuf::from)
            .or_else(|| match &command {
                CommandSpec::Python { script, .. } => {
                    script.parent().filter(|p| !p.as_os_str().is_empty()).map(Path::to_path_buf)
                }
                CommandSpec::Shell { .. } => None,
            });

        Ok(ServiceSpec {
            log_file: Some(
                self.log_file
                    .clone()
                    .unwrap_or_else(|| format!("{}.log", name)),
            ),
            command,
            working_dir,
            run_in_background: self.run_in_background,
            is_base: self.is_base || class == ServiceClass::Base,
            startup_timeout: Duration::from_secs(
                self.startup_timeout.unwrap_or(DEFAULT_STARTUP_TIMEOUT_SECS),
            ),
            health_check_url: self.health_check_url.clone(),
            dependencies: self.dependencies.clone(),
            name,
        })
    }
}

impl ServiceFile {
    /// Load the configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ServiceError::Config {
            service: "configuration".to_string(),
            message: format!("failed to read {}: {}", path.display(), e),
        })?;
        Self::from_yaml(&content)
    }

    /// Parse the configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| ServiceError::Config {
            service: "configuration".to_string(),
            message: format!("failed to parse configuration: {}", e),
        })
    }

    /// Validate every entry into specs, base services first.
    ///
    /// Fails on the first invalid entry, duplicate name, or dependency
    /// on a service not present in the file.
    pub fn validated_specs(&self) -> Result<Vec<ServiceSpec>> {
        let mut specs = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        let entries = self
            .external_services
            .base_services
            .iter()
            .map(|raw| (raw, ServiceClass::Base))
            .chain(
                self.external_services
                    .optional_services
                    .iter()
                    .map(|raw| (raw, ServiceClass::Optional)),
            );

        for (raw, class) in entries {
            let spec = raw.to_spec(class)?;
            if !seen.insert(spec.name.clone()) {
                return Err(ServiceError::Config {
                    service: spec.name,
                    message: "duplicate service name".to_string(),
                });
            }
            specs.push(spec);
        }

        for spec in &specs {
            for dep in &spec.dependencies {
                if !seen.contains(dep) {
                    return Err(ServiceError::Config {
                        service: spec.name.clone(),
                        message: format!("depends on unknown service '{}'", dep),
                    });
                }
            }
        }

        Ok(specs)
    }
}
