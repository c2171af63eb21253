//! Script process: interpreter lookup, spawn, output pump and shutdown

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::host::HostLog;

/// A command whose first non-empty output line is an interpreter path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LookupCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl fmt::Display for LookupCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Lookup order for the current OS
pub fn default_lookup_commands() -> Vec<LookupCommand> {
    let finder = if cfg!(windows) { "where" } else { "which" };
    vec![
        LookupCommand::new(finder, &["python3"]),
        LookupCommand::new(finder, &["python"]),
    ]
}

/// Run each lookup in order; the first non-empty answer wins
pub async fn locate_interpreter(commands: &[LookupCommand]) -> Result<PathBuf, BridgeError> {
    for command in commands {
        let output = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if let Some(path) = stdout.lines().map(str::trim).find(|l| !l.is_empty()) {
                    info!(interpreter = path, lookup = %command, "Interpreter found");
                    return Ok(PathBuf::from(path));
                }
                debug!(lookup = %command, "Lookup returned nothing");
            }
            Ok(output) => debug!(lookup = %command, status = %output.status, "Lookup failed"),
            Err(e) => debug!(lookup = %command, "Lookup could not run: {}", e),
        }
    }

    Err(BridgeError::InterpreterNotFound {
        tried: commands
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// How a stopped process ended
#[derive(Debug)]
pub enum ExitOutcome {
    Exited(ExitStatus),
    /// Still running after the grace period
    Killed,
}

/// A running script with its output relayed to the host log
pub struct ScriptProcess {
    child: Child,
    pump: JoinHandle<()>,
}

impl ScriptProcess {
    /// Start `<interpreter> <script> <args...>` in the script's directory
    pub fn spawn(
        interpreter: &Path,
        script: &Path,
        args: &[String],
        log: Arc<dyn HostLog>,
    ) -> Result<Self, BridgeError> {
        let dir = script
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut child = Command::new(interpreter)
            .arg(script)
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(BridgeError::Spawn)?;

        info!(
            pid = child.id(),
            interpreter = %interpreter.display(),
            script = %script.display(),
            "Script started"
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let pump = tokio::spawn(pump_output(stdout, stderr, log));

        Ok(Self { child, pump })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status if the process already ended
    pub fn try_status(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Wait for the process to exit on its own
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Ask the process to terminate, force-kill it after `grace`
    ///
    /// The output pump is joined once the process is gone.
    pub async fn stop(mut self, grace: Duration) -> std::io::Result<ExitOutcome> {
        let outcome = match self.child.try_wait()? {
            Some(status) => ExitOutcome::Exited(status),
            None => {
                self.terminate();
                match tokio::time::timeout(grace, self.child.wait()).await {
                    Ok(status) => ExitOutcome::Exited(status?),
                    Err(_) => {
                        warn!(
                            grace_ms = grace.as_millis() as u64,
                            "Script still running after grace period, killing it"
                        );
                        self.child.kill().await?;
                        ExitOutcome::Killed
                    }
                }
            }
        };

        // Grandchildren may hold the pipes open
        if tokio::time::timeout(grace, &mut self.pump).await.is_err() {
            warn!("Output pump did not finish, abandoning it");
            self.pump.abort();
        }

        info!(?outcome, "Script stopped");
        Ok(outcome)
    }

    #[cfg(unix)]
    fn terminate(&mut self) {
        let Some(pid) = self.child.id() else {
            return;
        };
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return;
        };
        // SAFETY: kill(2) has no memory-safety preconditions; pid belongs to
        // our own not-yet-reaped child, so it cannot have been recycled.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc != 0 {
            warn!(pid, "SIGTERM failed: {}", std::io::Error::last_os_error());
        }
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!("Failed to terminate script: {}", e);
        }
    }
}

async fn pump_output(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    log: Arc<dyn HostLog>,
) {
    let out = async {
        if let Some(stdout) = stdout {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "script", "{}", line);
                log.println(&line);
            }
        }
    };

    let err = async {
        if let Some(stderr) = stderr {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "script", stream = "stderr", "{}", line);
                log.errorln(&line);
            }
        }
    };

    tokio::join!(out, err);
}
