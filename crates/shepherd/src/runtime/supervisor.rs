//! Process supervision.
//!
//! Spawns services in their own process group, terminates whole process
//! trees with graceful-then-forceful escalation, and re-identifies
//! processes from prior manager runs when the in-memory handle is gone.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use sysinfo::{ProcessStatus, ProcessesToUpdate, System};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::{CommandSpec, ServiceSpec};
use crate::error::{Result, ServiceError};
use crate::state::{now_secs, RuntimeRecord, ServiceStatus as RecordStatus};

/// Default graceful termination window before escalating to SIGKILL.
pub const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Window granted to stale instances cleaned up before a respawn.
const CLEANUP_GRACE: Duration = Duration::from_secs(2);

/// How long to wait for a process to disappear after SIGKILL.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(3);

const LIVENESS_POLL: Duration = Duration::from_millis(200);

/// Evidence that a remembered service is still alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// A process was found, by remembered pid or by command-line match.
    Alive { pid: u32 },
    /// No process found, but something still answers on the service port.
    Listening { port: u16 },
    Dead,
}

impl Liveness {
    pub fn is_alive(&self) -> bool {
        !matches!(self, Liveness::Dead)
    }
}

/// Spawns, tracks and terminates service processes.
pub struct ProcessSupervisor {
    home: PathBuf,
    log_dir: PathBuf,
    /// Child handles for processes spawned by this manager run.
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessSupervisor {
    pub fn new(home: PathBuf, log_dir: PathBuf) -> Self {
        Self {
            home,
            log_dir,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Environment injected into every child: the base directory plus a
    /// search path extended with it. The caller's environment is
    /// inherited, never discarded.
    fn prepare_environment(&self) -> Vec<(String, String)> {
        let home = self.home.display().to_string();
        let pythonpath = match std::env::var("PYTHONPATH") {
            Ok(existing) if !existing.is_empty() => {
                if existing.split(':').any(|p| p == home) {
                    existing
                } else {
                    format!("{}:{}", home, existing)
                }
            }
            _ => home.clone(),
        };
        vec![
            ("SHEPHERD_HOME".to_string(), home),
            ("PYTHONPATH".to_string(), pythonpath),
        ]
    }

    fn resolve_script(&self, script: &Path) -> PathBuf {
        if script.is_absolute() {
            script.to_path_buf()
        } else {
            self.home.join(script)
        }
    }

    /// Spawn a service process.
    ///
    /// Any already-running instance matching the same invocation target
    /// is terminated first, so at most one live instance exists per
    /// service name. Background services return a tracked record with a
    /// pid; foreground services block until exit and return no pid.
    pub async fn spawn(&self, spec: &ServiceSpec) -> Result<RuntimeRecord> {
        let cleaned = self.cleanup_existing(spec).await;
        if cleaned > 0 {
            log::info!(
                "[{}] terminated {} stale instance(s) before start",
                spec.name,
                cleaned
            );
        }

        let (program, args, match_target) = match &spec.command {
            CommandSpec::Python {
                interpreter,
                script,
                args,
            } => {
                let script = self.resolve_script(script);
                let mut full_args = vec![script.display().to_string()];
                full_args.extend(args.iter().cloned());
                (
                    interpreter.display().to_string(),
                    full_args,
                    script.display().to_string(),
                )
            }
            CommandSpec::Shell { program, args } => {
                (program.clone(), args.clone(), program.clone())
            }
        };

        let cwd = spec
            .working_dir
            .clone()
            .unwrap_or_else(|| self.home.clone());

        let mut cmd = Command::new(&program);
        cmd.args(&args);
        for (key, value) in self.prepare_environment() {
            cmd.env(key, value);
        }
        if cwd.is_dir() {
            cmd.current_dir(&cwd);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        log::info!("[{}] starting: {} {}", spec.name, program, args.join(" "));

        if spec.run_in_background {
            cmd.stdin(Stdio::null());
            match &spec.log_file {
                Some(log_file) => {
                    std::fs::create_dir_all(&self.log_dir)?;
                    let log_path = self.log_dir.join(log_file);
                    let file = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&log_path)
                        .map_err(|e| ServiceError::Startup {
                            service: spec.name.clone(),
                            message: format!(
                                "failed to open log file {}: {}",
                                log_path.display(),
                                e
                            ),
                        })?;
                    let stderr = file.try_clone().map_err(|e| ServiceError::Startup {
                        service: spec.name.clone(),
                        message: format!("failed to clone log handle: {}", e),
                    })?;
                    cmd.stdout(Stdio::from(file)).stderr(Stdio::from(stderr));
                }
                None => {
                    log::warn!("[{}] starting with no log file", spec.name);
                    cmd.stdout(Stdio::null()).stderr(Stdio::null());
                }
            }

            let child = cmd.spawn().map_err(|e| ServiceError::Startup {
                service: spec.name.clone(),
                message: format!("failed to spawn '{}': {}", program, e),
            })?;
            let pid = child.id();
            log::info!("[{}] started with pid {:?}", spec.name, pid);

            self.children.lock().await.insert(spec.name.clone(), child);

            Ok(RuntimeRecord {
                pid,
                start_time: now_secs(),
                script: match_target,
                args: spec.command.args().to_vec(),
                cwd: Some(cwd.display().to_string()),
                port: spec.resolve_port(),
                status: RecordStatus::Starting,
                class: spec.class(),
            })
        } else {
            // Foreground: block until exit; there is no pid to track.
            let status = cmd.status().await.map_err(|e| ServiceError::Startup {
                service: spec.name.clone(),
                message: format!("failed to run '{}': {}", program, e),
            })?;
            if !status.success() {
                return Err(ServiceError::Startup {
                    service: spec.name.clone(),
                    message: format!("exited with status {}", status),
                });
            }
            Ok(RuntimeRecord {
                pid: None,
                start_time: now_secs(),
                script: match_target,
                args: spec.command.args().to_vec(),
                cwd: Some(cwd.display().to_string()),
                port: spec.resolve_port(),
                status: RecordStatus::Stopped,
                class: spec.class(),
            })
        }
    }

    /// Terminate a service process (and its process group).
    ///
    /// Terminating an already-dead process is a success. When this run
    /// still holds the child handle the exit is reaped directly;
    /// otherwise liveness is polled from the process table.
    pub async fn terminate(&self, name: &str, pid: u32, graceful: Duration) -> Result<bool> {
        let child = self.children.lock().await.remove(name);
        if let Some(mut child) = child {
            if child.id() == Some(pid) {
                return self.terminate_child(name, &mut child, pid, graceful).await;
            }
        }

        if !pid_alive(pid) {
            log::info!("[{}] process {} already terminated", name, pid);
            return Ok(true);
        }
        terminate_tree(name, pid, graceful).await
    }

    async fn terminate_child(
        &self,
        name: &str,
        child: &mut Child,
        pid: u32,
        graceful: Duration,
    ) -> Result<bool> {
        log::info!("[{}] stopping process {}", name, pid);
        #[cfg(unix)]
        {
            let _ = signal_tree(pid, nix::sys::signal::Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        match tokio::time::timeout(graceful, child.wait()).await {
            Ok(Ok(status)) => {
                log::info!("[{}] exited with {:?}", name, status.code());
                Ok(true)
            }
            Ok(Err(e)) => {
                log::warn!("[{}] error waiting for exit: {}", name, e);
                Ok(true)
            }
            Err(_) => {
                log::warn!("[{}] did not exit within {:?}, force killing", name, graceful);
                #[cfg(unix)]
                {
                    let _ = signal_tree(pid, nix::sys::signal::Signal::SIGKILL);
                }
                let _ = child.kill().await;
                match tokio::time::timeout(KILL_CONFIRM_TIMEOUT, child.wait()).await {
                    Ok(_) => Ok(true),
                    Err(_) => Err(ServiceError::Stop {
                        service: name.to_string(),
                        message: format!("process {} survived SIGKILL", pid),
                    }),
                }
            }
        }
    }

    /// Determine whether a remembered service is still alive, using
    /// only persisted facts. Used after the in-memory handle is lost
    /// (e.g. a later manager invocation).
    pub async fn reconcile(&self, record: &RuntimeRecord) -> Liveness {
        if let Some(pid) = record.pid {
            if pid_alive(pid) {
                return Liveness::Alive { pid };
            }
        }

        if !record.script.is_empty() {
            if let Some(pid) = find_processes_matching(&record.script, &[]).into_iter().next() {
                return Liveness::Alive { pid };
            }
        }

        if let Some(port) = record.port {
            if port_open("127.0.0.1", port).await {
                return Liveness::Listening { port };
            }
        }

        Liveness::Dead
    }

    /// Terminate any host process matching this service's invocation
    /// target. Returns the number of processes found.
    pub async fn cleanup_existing(&self, spec: &ServiceSpec) -> usize {
        let target = match &spec.command {
            CommandSpec::Python { script, .. } => {
                self.resolve_script(script).display().to_string()
            }
            CommandSpec::Shell { program, .. } => program.clone(),
        };

        let pids = find_processes_matching(&target, &[]);
        if pids.is_empty() {
            return 0;
        }

        log::warn!(
            "[{}] found {} existing instance(s) matching '{}'",
            spec.name,
            pids.len(),
            target
        );
        for pid in &pids {
            if let Err(e) = terminate_tree(&spec.name, *pid, CLEANUP_GRACE).await {
                log::warn!("[{}] failed to clean up pid {}: {}", spec.name, pid, e);
            }
        }
        pids.len()
    }
}

/// Terminate the process tree rooted at `pid`: SIGTERM to the group,
/// bounded wait, SIGKILL escalation, then confirmation. An already-dead
/// target is a success.
#[cfg(unix)]
pub async fn terminate_tree(name: &str, pid: u32, graceful: Duration) -> Result<bool> {
    use nix::sys::signal::Signal;

    match signal_tree(pid, Signal::SIGTERM) {
        Ok(false) => return Ok(true),
        Ok(true) => {}
        Err(e) => log::warn!("[{}] SIGTERM to {} failed: {}", name, pid, e),
    }

    let deadline = Instant::now() + graceful;
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            log::info!("[{}] process {} terminated gracefully", name, pid);
            return Ok(true);
        }
        tokio::time::sleep(LIVENESS_POLL).await;
    }

    log::warn!("[{}] process {} still alive, sending SIGKILL", name, pid);
    match signal_tree(pid, Signal::SIGKILL) {
        Ok(false) => return Ok(true),
        Ok(true) => {}
        Err(e) => log::warn!("[{}] SIGKILL to {} failed: {}", name, pid, e),
    }

    let deadline = Instant::now() + KILL_CONFIRM_TIMEOUT;
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            return Ok(true);
        }
        tokio::time::sleep(LIVENESS_POLL).await;
    }

    Err(ServiceError::Stop {
        service: name.to_string(),
        message: format!("process {} survived SIGKILL", pid),
    })
}

#[cfg(not(unix))]
pub async fn terminate_tree(name: &str, pid: u32, graceful: Duration) -> Result<bool> {
    let mut sys = System::new();
    let target = sysinfo::Pid::from_u32(pid);
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    let Some(process) = sys.process(target) else {
        return Ok(true);
    };
    process.kill();

    let deadline = Instant::now() + graceful + KILL_CONFIRM_TIMEOUT;
    while Instant::now() < deadline {
        if !pid_alive(pid) {
            return Ok(true);
        }
        tokio::time::sleep(LIVENESS_POLL).await;
    }
    Err(ServiceError::Stop {
        service: name.to_string(),
        message: format!("process {} could not be killed", pid),
    })
}

/// Signal a process group, falling back to the single process when the
/// target is not a group leader. `Ok(false)` means the target no longer
/// exists.
#[cfg(unix)]
pub(crate) fn signal_tree(
    pid: u32,
    signal: nix::sys::signal::Signal,
) -> std::result::Result<bool, String> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return Ok(false);
    }
    let target = Pid::from_raw(pid as i32);
    match killpg(target, signal) {
        Ok(()) => Ok(true),
        Err(_) => match kill(target, signal) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(e.to_string()),
        },
    }
}

/// Whether a pid is present in the process table (zombies excluded).
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let mut sys = System::new();
    let target = sysinfo::Pid::from_u32(pid);
    sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
    match sys.process(target) {
        Some(process) => process.status() != ProcessStatus::Zombie,
        None => false,
    }
}

/// Find live processes whose command line references `target`.
///
/// A token matches when it equals the target exactly, or (for bare
/// program names) when its basename does. The calling process and any
/// pid in `exclude` are skipped.
pub fn find_processes_matching(target: &str, exclude: &[u32]) -> Vec<u32> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let own_pid = std::process::id();
    let mut pids = Vec::new();

    for (pid, process) in sys.processes() {
        let pid = pid.as_u32();
        if pid == own_pid || exclude.contains(&pid) {
            continue;
        }
        if process.status() == ProcessStatus::Zombie {
            continue;
        }
        let matched = process.cmd().iter().any(|arg| {
            let token = arg.to_string_lossy();
            token_matches(&token, target)
        });
        if matched {
            pids.push(pid);
        }
    }

    pids.sort_unstable();
    pids
}

fn token_matches(token: &str, target: &str) -> bool {
    if token == target {
        return true;
    }
    if target.contains('/') {
        return false;
    }
    token.rsplit('/').next() == Some(target)
}

/// Whether something accepts TCP connections on `host:port`.
pub async fn port_open(host: &str, port: u16) -> bool {
    matches!(
        tokio::time::timeout(Duration::from_secs(1), TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}
