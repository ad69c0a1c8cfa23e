//! Lifecycle of the single managed application process.
//!
//! The manager is a start/stop gate, not a supervisor: it launches the first
//! entrypoint script it finds, remembers the child, and kills it on request.
//! It never restarts the application or inspects its exit code beyond
//! noticing that it has gone away.
//!
//! The application runs as the leader of its own process group, and `stop`
//! kills the whole group. Dropping a [`ProcessManager`] leaves the
//! application running; call [`ProcessManager::shutdown`] to stop it.

use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Shell entrypoint file name.
pub const SHELL_ENTRYPOINT: &str = "main.sh";

/// Python entrypoint file name.
pub const PYTHON_ENTRYPOINT: &str = "main.py";

/// Errors that can occur while starting or stopping the application
#[derive(Debug, Error)]
pub enum ProcessError {
    /// A managed application is already running
    #[error("application process already exists (pid {})", .pid.map_or_else(|| "unknown".to_string(), |p| p.to_string()))]
    AlreadyRunning {
        /// PID of the running application, if known
        pid: Option<u32>,
    },
    /// No managed application is running
    #[error("application process doesn't exist")]
    NotRunning,
    /// None of the entrypoint candidates exist
    #[error("entrypoint script not found (searched {})", display_paths(.searched))]
    NoEntrypoint {
        /// Candidates that were checked, in priority order
        searched: Vec<PathBuf>,
    },
    /// The entrypoint has an extension no launcher is configured for
    #[error("no launcher for entrypoint: {}", .0.display())]
    UnsupportedEntrypoint(PathBuf),
    /// The launcher could not be spawned
    #[error("failed to launch {}: {source}", .entrypoint.display())]
    Spawn {
        /// Entrypoint that was being launched
        entrypoint: PathBuf,
        /// Underlying spawn error
        #[source]
        source: std::io::Error,
    },
    /// The running application could not be killed
    #[error("failed to kill application process: {0}")]
    Kill(#[source] std::io::Error),
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// How an entrypoint script is launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LauncherKind {
    /// `.sh` scripts, run by the shell
    Shell,
    /// `.py` scripts, run by the Python interpreter
    Python,
}

impl LauncherKind {
    /// Pick the launcher from a script's extension (case-insensitive).
    pub fn for_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "sh" => Some(Self::Shell),
            "py" => Some(Self::Python),
            _ => None,
        }
    }
}

/// Programs used to run entrypoint scripts.
#[derive(Debug, Clone)]
pub struct Launchers {
    /// Shell for `.sh` entrypoints
    pub shell: PathBuf,
    /// Interpreter for `.py` entrypoints
    pub python: PathBuf,
}

impl Default for Launchers {
    fn default() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
            python: PathBuf::from("python3"),
        }
    }
}

impl Launchers {
    fn program(&self, kind: LauncherKind) -> &Path {
        match kind {
            LauncherKind::Shell => &self.shell,
            LauncherKind::Python => &self.python,
        }
    }
}

/// Ordered list of entrypoint script locations.
#[derive(Debug, Clone)]
pub struct Entrypoints {
    candidates: Vec<PathBuf>,
}

impl Entrypoints {
    /// Standard priority order: sideloaded `main.sh`, sideloaded `main.py`,
    /// then the same two names under the default install directory.
    pub fn new(sideload_dir: impl AsRef<Path>, default_dir: impl AsRef<Path>) -> Self {
        let mut candidates = Vec::with_capacity(4);
        for dir in [sideload_dir.as_ref(), default_dir.as_ref()] {
            candidates.push(dir.join(SHELL_ENTRYPOINT));
            candidates.push(dir.join(PYTHON_ENTRYPOINT));
        }
        Self { candidates }
    }

    /// Use an explicit candidate list, highest priority first.
    pub fn from_candidates(candidates: Vec<PathBuf>) -> Self {
        Self { candidates }
    }

    /// Candidates in priority order.
    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// The first candidate that exists as a file.
    pub async fn resolve(&self) -> Option<PathBuf> {
        for candidate in &self.candidates {
            if let Ok(meta) = tokio::fs::metadata(candidate).await
                && meta.is_file()
            {
                return Some(candidate.clone());
            }
        }
        None
    }
}

/// Snapshot of the managed application slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplicationStatus {
    /// Whether an application is running
    pub running: bool,
    /// PID of the running application
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Entrypoint the running application was launched from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
}

impl ApplicationStatus {
    fn stopped() -> Self {
        Self {
            running: false,
            pid: None,
            entrypoint: None,
        }
    }
}

struct RunningApp {
    child: Child,
    pid: Option<u32>,
    entrypoint: PathBuf,
}

impl RunningApp {
    fn status(&self) -> ApplicationStatus {
        ApplicationStatus {
            running: true,
            pid: self.pid,
            entrypoint: Some(self.entrypoint.display().to_string()),
        }
    }
}

/// Owner of the single managed application slot.
///
/// Every operation holds the slot lock for its whole duration, so
/// concurrent `start` calls can never launch two applications.
pub struct ProcessManager {
    entrypoints: Entrypoints,
    launchers: Launchers,
    slot: Mutex<Option<RunningApp>>,
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("entrypoints", &self.entrypoints)
            .field("launchers", &self.launchers)
            .finish_non_exhaustive()
    }
}

impl ProcessManager {
    /// Create a manager in the stopped state.
    pub fn new(entrypoints: Entrypoints, launchers: Launchers) -> Self {
        Self {
            entrypoints,
            launchers,
            slot: Mutex::new(None),
        }
    }

    /// Launch the highest-priority entrypoint.
    ///
    /// Fails with [`ProcessError::AlreadyRunning`] if an application is
    /// running and [`ProcessError::NoEntrypoint`] if no candidate exists.
    pub async fn start(&self) -> Result<ApplicationStatus, ProcessError> {
        let mut slot = self.slot.lock().await;
        reap_exited(&mut slot);

        if let Some(app) = slot.as_ref() {
            return Err(ProcessError::AlreadyRunning { pid: app.pid });
        }

        let entrypoint =
            self.entrypoints
                .resolve()
                .await
                .ok_or_else(|| ProcessError::NoEntrypoint {
                    searched: self.entrypoints.candidates().to_vec(),
                })?;

        let app = self.launch(entrypoint)?;
        let status = app.status();
        *slot = Some(app);
        Ok(status)
    }

    fn launch(&self, entrypoint: PathBuf) -> Result<RunningApp, ProcessError> {
        let kind = LauncherKind::for_path(&entrypoint)
            .ok_or_else(|| ProcessError::UnsupportedEntrypoint(entrypoint.clone()))?;
        let file_name = entrypoint
            .file_name()
            .ok_or_else(|| ProcessError::UnsupportedEntrypoint(entrypoint.clone()))?;
        let working_dir = entrypoint
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let program = self.launchers.program(kind);

        let mut command = Command::new(program);
        command.arg(file_name).current_dir(working_dir);
        // Lead a fresh group so stop reaches everything the script spawns.
        #[cfg(unix)]
        command.process_group(0);

        let child = command
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                entrypoint: entrypoint.clone(),
                source,
            })?;

        let pid = child.id();
        info!(
            pid = ?pid,
            entrypoint = %entrypoint.display(),
            launcher = %program.display(),
            "Application started"
        );

        Ok(RunningApp {
            child,
            pid,
            entrypoint,
        })
    }

    /// Kill the running application's process group and wait for it to exit.
    ///
    /// Fails with [`ProcessError::NotRunning`] if nothing is running,
    /// including when the application already exited on its own.
    pub async fn stop(&self) -> Result<(), ProcessError> {
        let mut slot = self.slot.lock().await;
        reap_exited(&mut slot);

        let Some(mut app) = slot.take() else {
            return Err(ProcessError::NotRunning);
        };

        match terminate(&mut app.child).await {
            Ok(()) => {
                info!(
                    pid = ?app.pid,
                    entrypoint = %app.entrypoint.display(),
                    "Application stopped"
                );
                Ok(())
            }
            Err(e) => {
                if let Ok(Some(_)) = app.child.try_wait() {
                    info!(pid = ?app.pid, "Application exited while being stopped");
                    return Ok(());
                }
                *slot = Some(app);
                Err(ProcessError::Kill(e))
            }
        }
    }

    /// Current state of the slot.
    pub async fn status(&self) -> ApplicationStatus {
        let mut slot = self.slot.lock().await;
        reap_exited(&mut slot);
        slot.as_ref()
            .map_or_else(ApplicationStatus::stopped, RunningApp::status)
    }

    /// Stop the application if one is running.
    pub async fn shutdown(&self) {
        match self.stop().await {
            Ok(()) | Err(ProcessError::NotRunning) => {}
            Err(e) => warn!("Failed to stop application during shutdown: {}", e),
        }
    }
}

/// SIGKILL the application's process group, then reap the leader.
#[cfg(unix)]
async fn terminate(child: &mut Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pgid = libc::pid_t::try_from(pid).map_err(std::io::Error::other)?;

    // SAFETY: kill(2) has no memory-safety preconditions.
    if unsafe { libc::kill(-pgid, libc::SIGKILL) } == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    child.wait().await?;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child) -> std::io::Result<()> {
    child.kill().await
}

/// Clear the slot if its process already returned.
fn reap_exited(slot: &mut Option<RunningApp>) {
    let Some(app) = slot.as_mut() else {
        return;
    };

    match app.child.try_wait() {
        Ok(Some(exit)) => {
            info!(
                pid = ?app.pid,
                entrypoint = %app.entrypoint.display(),
                %exit,
                "Application exited on its own"
            );
            *slot = None;
        }
        Ok(None) => {}
        Err(e) => warn!("Failed to poll application process: {}", e),
    }
}
