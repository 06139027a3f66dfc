//! Local INDI server process supervision
//!
//! Each `ServerManager` owns one `indiserver` process and the named pipe used to
//! start and stop drivers inside it. The child is owned by a supervisor task that
//! either observes an unexpected exit or performs the SIGTERM → SIGKILL shutdown when
//! asked to, so the process is always reaped.

use crate::client_manager::ClientManager;
use crate::config::DriverManagerConfig;
use crate::driver_info::{DriverHandle, DriverInfo};
use crate::error::{DriverError, DriverResult};
use ekos_indi::INDI_DEFAULT_PORT;
use nix::sys::signal::{self, Signal};
use nix::sys::stat::Mode;
use nix::unistd::Pid;
use regex::Regex;
use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{broadcast, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

/// Maximum number of stderr lines retained per server
const MAX_LOG_LINES: usize = 5000;

static CRASH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Driver (.*): Terminated after #0 restarts").expect("Invalid crash regex")
});

// =============================================================================
// CRASH DETECTION
// =============================================================================

/// Attributes driver crashes from server output. Matching is heuristic: callers
/// must tolerate both missed and spurious reports.
pub trait DriverCrashDetector: Send + Sync {
    /// Executable of the driver reported dead by `line`, if any
    fn detect(&self, line: &str) -> Option<String>;
}

/// Scans stderr for the server's "terminated after #0 restarts" notice
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrPatternDetector;

impl DriverCrashDetector for StderrPatternDetector {
    fn detect(&self, line: &str) -> Option<String> {
        CRASH_PATTERN
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
    }
}

// =============================================================================
// LOG BUFFER
// =============================================================================

/// Ring buffer of recent server output
#[derive(Debug, Default)]
pub struct ServerLog {
    lines: VecDeque<String>,
}

impl ServerLog {
    pub fn push(&mut self, line: String) {
        if self.lines.len() >= MAX_LOG_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

// =============================================================================
// EVENTS
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Started {
        host: String,
        port: u16,
    },
    DriverCrashed {
        host: String,
        port: u16,
        exec: String,
        label: String,
    },
    /// Process exited without being asked to
    Terminated {
        host: String,
        port: u16,
        exit_code: Option<i32>,
    },
}

// =============================================================================
// FIFO COMMANDS
// =============================================================================

/// `start` line for a driver
pub fn start_command(driver: &DriverInfo, drivers_dir: &Path) -> String {
    if let Some(remote_host) = &driver.remote_host {
        return format!(
            "start {}@{}:{}",
            driver.name,
            remote_host,
            driver.remote_port.unwrap_or(INDI_DEFAULT_PORT)
        );
    }

    let mut line = format!("start {}", driver.exec);
    if !driver.unique_label().is_empty() {
        line.push_str(&format!(" -n \"{}\"", driver.unique_label()));
    }
    if !driver.skeleton.is_empty() {
        line.push_str(&format!(
            " -s \"{}\"",
            drivers_dir.join(&driver.skeleton).display()
        ));
    }
    line
}

/// `stop` line for a driver
pub fn stop_command(driver: &DriverInfo) -> String {
    if driver.unique_label().is_empty() {
        format!("stop {}", driver.exec)
    } else {
        format!("stop {} -n \"{}\"", driver.exec, driver.unique_label())
    }
}

// =============================================================================
// PROCESS CONTROL
// =============================================================================

/// SIGTERM, wait up to 5 seconds, then SIGKILL; always reaps the child
async fn shutdown_child(child: &mut Child) -> io::Result<ExitStatus> {
    let Some(pid) = child.id() else {
        // Already reaped
        return child.wait().await;
    };

    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        if e == nix::errno::Errno::ESRCH {
            return child.wait().await;
        }
        return Err(io::Error::other(e));
    }

    if let Ok(result) = timeout(Duration::from_secs(5), child.wait()).await {
        return result;
    }

    tracing::warn!("INDI server pid {} ignored SIGTERM, killing", pid);
    child.kill().await?;
    child.wait().await
}

struct Supervisor {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

#[derive(Default)]
struct ServerProcess {
    fifo: Option<tokio::fs::File>,
    supervisor: Option<Supervisor>,
}

// =============================================================================
// SERVER MANAGER
// =============================================================================

pub struct ServerManager {
    id: Uuid,
    host: String,
    port: u16,
    config: Arc<DriverManagerConfig>,
    fifo_path: PathBuf,
    process: Mutex<ServerProcess>,
    managed: Arc<RwLock<Vec<DriverHandle>>>,
    log: Arc<RwLock<ServerLog>>,
    detector: Arc<dyn DriverCrashDetector>,
    event_tx: broadcast::Sender<ServerEvent>,
}

impl ServerManager {
    pub fn new(host: &str, port: u16, config: Arc<DriverManagerConfig>) -> Self {
        Self::with_detector(host, port, config, Arc::new(StderrPatternDetector))
    }

    pub fn with_detector(
        host: &str,
        port: u16,
        config: Arc<DriverManagerConfig>,
        detector: Arc<dyn DriverCrashDetector>,
    ) -> Self {
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        let fifo_path = config.fifo_dir.join(format!("indififo{}", suffix));
        let (event_tx, _) = broadcast::channel(64);

        Self {
            id: Uuid::new_v4(),
            host: host.to_string(),
            port,
            config,
            fifo_path,
            process: Mutex::new(ServerProcess::default()),
            managed: Arc::new(RwLock::new(Vec::new())),
            log: Arc::new(RwLock::new(ServerLog::default())),
            detector,
            event_tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn fifo_path(&self) -> &Path {
        &self.fifo_path
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    pub async fn log_buffer(&self) -> Vec<String> {
        self.log.read().await.lines()
    }

    pub async fn is_running(&self) -> bool {
        self.process
            .lock()
            .await
            .supervisor
            .as_ref()
            .map(|s| !s.handle.is_finished())
            .unwrap_or(false)
    }

    /// Number of managed drivers
    pub async fn size(&self) -> usize {
        self.managed.read().await.len()
    }

    pub async fn contains(&self, driver: &DriverHandle) -> bool {
        self.managed
            .read()
            .await
            .iter()
            .any(|d| Arc::ptr_eq(d, driver))
    }

    pub async fn managed_drivers(&self) -> Vec<DriverHandle> {
        self.managed.read().await.clone()
    }

    /// Create the control FIFO and spawn the server
    pub async fn start(&self) -> DriverResult<()> {
        let mut process = self.process.lock().await;
        if process.supervisor.is_some() {
            return Ok(());
        }

        if let Err(e) = nix::unistd::mkfifo(&self.fifo_path, Mode::S_IRUSR | Mode::S_IWUSR) {
            return Err(DriverError::FifoCreation {
                path: self.fifo_path.clone(),
                reason: e.to_string(),
            });
        }

        match self.spawn().await {
            Ok((fifo, supervisor)) => {
                process.fifo = Some(fifo);
                process.supervisor = Some(supervisor);
                tracing::info!("INDI server started on {}:{}", self.host, self.port);
                let _ = self.event_tx.send(ServerEvent::Started {
                    host: self.host.clone(),
                    port: self.port,
                });
                Ok(())
            }
            Err(e) => {
                self.remove_fifo();
                Err(e)
            }
        }
    }

    async fn spawn(&self) -> DriverResult<(tokio::fs::File, Supervisor)> {
        // Read/write so opening never blocks waiting for the other end
        let fifo = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.fifo_path)
            .map_err(|e| DriverError::FifoCreation {
                path: self.fifo_path.clone(),
                reason: e.to_string(),
            })?;

        let mut cmd = Command::new(&self.config.indi_server);
        cmd.arg("-v")
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-m")
            .arg(self.config.server_transfer_buffer_size.to_string())
            .arg("-r")
            .arg("0")
            .arg("-f")
            .arg(&self.fifo_path)
            .env("PATH", self.config.server_path_env())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!("Spawning {:?}", cmd.as_std());

        let mut child = cmd.spawn().map_err(|e| DriverError::ServerStart {
            port: self.port,
            reason: format!("{}: {}", self.config.indi_server.display(), e),
        })?;

        sleep(self.config.server_startup_grace()).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Err(DriverError::ServerStart {
                port: self.port,
                reason: format!("process exited during startup ({})", status),
            });
        }

        let stderr_task = match child.stderr.take() {
            Some(stderr) => self.spawn_stderr_task(stderr),
            None => tokio::spawn(async {}),
        };

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(Self::supervise(
            child,
            shutdown_rx,
            self.event_tx.clone(),
            self.host.clone(),
            self.port,
        ));

        Ok((
            tokio::fs::File::from_std(fifo),
            Supervisor {
                shutdown_tx,
                handle,
                stderr_task,
            },
        ))
    }

    async fn supervise(
        mut child: Child,
        shutdown_rx: oneshot::Receiver<()>,
        event_tx: broadcast::Sender<ServerEvent>,
        host: String,
        port: u16,
    ) {
        tokio::select! {
            status = child.wait() => {
                let exit_code = status.ok().and_then(|s| s.code());
                tracing::warn!(
                    "INDI server on {}:{} terminated unexpectedly (exit code {:?})",
                    host, port, exit_code
                );
                let _ = event_tx.send(ServerEvent::Terminated { host, port, exit_code });
            }
            // Also fires when the manager is dropped
            _ = shutdown_rx => {
                match shutdown_child(&mut child).await {
                    Ok(status) => tracing::debug!("INDI server on port {} exited: {}", port, status),
                    Err(e) => tracing::error!("Failed to shut down INDI server on port {}: {}", port, e),
                }
            }
        }
    }

    fn spawn_stderr_task(&self, stderr: ChildStderr) -> JoinHandle<()> {
        let log = self.log.clone();
        let managed = self.managed.clone();
        let detector = self.detector.clone();
        let event_tx = self.event_tx.clone();
        let host = self.host.clone();
        let port = self.port;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("indiserver[{}]: {}", port, line);
                log.write().await.push(line.clone());

                if let Some(exec) = detector.detect(&line) {
                    let mut label = None;
                    for driver in managed.read().await.iter() {
                        let dv = driver.read().await;
                        if dv.exec == exec {
                            label = Some(dv.display_label().to_string());
                            break;
                        }
                    }
                    match label {
                        Some(label) => {
                            tracing::warn!("INDI driver {} ({}) crashed", label, exec);
                            let _ = event_tx.send(ServerEvent::DriverCrashed {
                                host: host.clone(),
                                port,
                                exec,
                                label,
                            });
                        }
                        None => {
                            tracing::debug!("Crash notice for unmanaged driver {}", exec);
                        }
                    }
                }
            }
        })
    }

    async fn write_command(&self, line: &str) -> DriverResult<()> {
        let mut process = self.process.lock().await;
        let fifo = process
            .fifo
            .as_mut()
            .ok_or(DriverError::ServerNotRunning(self.port))?;

        tracing::debug!("INDI FIFO {}: {}", self.fifo_path.display(), line);
        fifo.write_all(format!("{}\n", line).as_bytes())
            .await
            .map_err(|e| DriverError::FifoWrite(e.to_string()))?;
        fifo.flush()
            .await
            .map_err(|e| DriverError::FifoWrite(e.to_string()))
    }

    fn find_executable(&self, exec: &str) -> Option<PathBuf> {
        if let Ok(path) = which::which(exec) {
            return Some(path);
        }

        let dirs = [
            PathBuf::from("/usr/bin"),
            PathBuf::from("/usr/local/bin"),
            self.config.drivers_dir.clone(),
            self.config.server_dir(),
        ];
        let paths = std::env::join_paths(dirs).ok()?;
        which::which_in(exec, Some(paths), "/").ok()
    }

    /// Start a driver inside this server. A unique label already taken by a managed
    /// driver with the same executable is replaced by the first free `"<label> <n>"`,
    /// n >= 2. Calling this twice for the same driver without an intervening
    /// [`stop_driver`](Self::stop_driver) yields a second, suffixed instance.
    pub async fn start_driver(&self, driver: &DriverHandle) -> DriverResult<()> {
        self.resolve_unique_label(driver).await;

        let line = {
            let dv = driver.read().await;
            if dv.remote_host.is_none() && self.find_executable(&dv.exec).is_none() {
                tracing::error!(
                    "Driver {} was not found on the system. Make sure the package providing '{}' is installed.",
                    dv.exec,
                    dv.exec
                );
                return Err(DriverError::ExecutableNotFound {
                    driver: dv.display_label().to_string(),
                    exec: dv.exec.clone(),
                });
            }
            start_command(&dv, &self.config.drivers_dir)
        };

        tracing::info!("Starting INDI driver on port {}: {}", self.port, line);
        self.write_command(&line).await?;

        self.managed.write().await.push(driver.clone());
        let mut dv = driver.write().await;
        dv.set_server_manager(Some(self.id));
        dv.set_server_state(true);
        dv.port = Some(self.port);
        Ok(())
    }

    async fn resolve_unique_label(&self, driver: &DriverHandle) {
        let (label, exec) = {
            let dv = driver.read().await;
            (dv.unique_label().to_string(), dv.exec.clone())
        };
        if label.is_empty() {
            return;
        }

        let mut taken = HashSet::new();
        for other in self.managed.read().await.iter() {
            if Arc::ptr_eq(other, driver) {
                taken.insert(label.clone());
                continue;
            }
            let other = other.read().await;
            if other.exec == exec {
                taken.insert(other.unique_label().to_string());
            }
        }
        if !taken.contains(&label) {
            return;
        }

        let free = (2..)
            .map(|n| format!("{} {}", label, n))
            .find(|candidate| !taken.contains(candidate));
        if let Some(suffixed) = free {
            driver.write().await.set_unique_label(&suffixed);
        }
    }

    pub async fn stop_driver(&self, driver: &DriverHandle) -> DriverResult<()> {
        self.managed.write().await.retain(|d| !Arc::ptr_eq(d, driver));

        let line = stop_command(&*driver.read().await);
        tracing::info!("Stopping INDI driver on port {}: {}", self.port, line);
        let result = self.write_command(&line).await;

        let mut dv = driver.write().await;
        dv.set_server_state(false);
        dv.set_server_manager(None);
        dv.port = dv.user_port;
        result
    }

    /// Stop the driver, wait, then start it again under the same client session
    pub async fn restart_driver(
        &self,
        driver: &DriverHandle,
        client: &ClientManager,
    ) -> DriverResult<()> {
        // Must run while the driver still lists its devices
        client.remove_managed_driver(driver).await;
        self.stop_driver(driver).await?;

        sleep(self.config.driver_restart_delay()).await;

        let line = start_command(&*driver.read().await, &self.config.drivers_dir);
        tracing::info!("Restarting INDI driver on port {}: {}", self.port, line);
        self.write_command(&line).await?;

        client.append_managed_driver(driver.clone()).await;
        self.managed.write().await.push(driver.clone());
        let mut dv = driver.write().await;
        dv.set_server_manager(Some(self.id));
        dv.set_server_state(true);
        dv.port = Some(self.port);
        Ok(())
    }

    /// Reset all managed drivers and shut the server down
    pub async fn stop(&self) {
        let drivers: Vec<DriverHandle> = self.managed.write().await.drain(..).collect();
        for driver in drivers {
            driver.write().await.reset();
        }
        self.terminate().await;
    }

    /// Shut the process down and remove the FIFO, leaving driver state untouched
    pub async fn terminate(&self) {
        let (fifo, supervisor) = {
            let mut process = self.process.lock().await;
            (process.fifo.take(), process.supervisor.take())
        };

        if let Some(supervisor) = supervisor {
            let _ = supervisor.shutdown_tx.send(());
            if let Err(e) = supervisor.handle.await {
                tracing::error!("INDI server supervisor for port {} failed: {}", self.port, e);
            }
            supervisor.stderr_task.abort();
            tracing::info!("INDI server on {}:{} stopped", self.host, self.port);
        }

        drop(fifo);
        self.remove_fifo();
    }

    fn remove_fifo(&self) {
        match std::fs::remove_file(&self.fifo_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                "Failed to remove FIFO {}: {}",
                self.fifo_path.display(),
                e
            ),
        }
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        // Dropping the supervisor's shutdown sender stops the process
        self.remove_fifo();
    }
}
