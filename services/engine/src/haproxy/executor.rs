//! Host command execution
//!
//! Every `ip`, `ovs-vsctl`, `arping` and `haproxy` invocation and every
//! process signal goes through [`CommandExecutor`], so the driver can be
//! exercised without root.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{LbaasError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Existence probe, delivers nothing
    Probe,
    Term,
    Kill,
}

impl Signal {
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Probe => 0,
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput>;

    /// Deliver `signal`; `Ok(false)` when no such process exists
    fn signal(&self, pid: i32, signal: Signal) -> Result<bool>;
}

/// Run and require a zero exit status, returning stdout
pub async fn run_checked(executor: &dyn CommandExecutor, argv: &[String]) -> Result<String> {
    let output = executor.run(argv).await?;
    if !output.success() {
        return Err(LbaasError::Unknown(format!(
            "{} exited with status {}: {}",
            argv.join(" "),
            output.status,
            output.stderr.trim()
        )));
    }
    Ok(output.stdout)
}

/// Build an argv from string-ish pieces
#[macro_export]
macro_rules! argv {
    ($($part:expr),* $(,)?) => {
        vec![$($part.to_string()),*]
    };
}

pub struct HostExecutor {
    timeout: Duration,
}

impl HostExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandExecutor for HostExecutor {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| LbaasError::BadRequest("empty command line".into()))?;
        debug!(command = %argv.join(" "), "Running command");

        let child = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| {
                LbaasError::Timeout(format!("{} did not finish in {:?}", program, self.timeout))
            })??;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    fn signal(&self, pid: i32, signal: Signal) -> Result<bool> {
        if pid <= 0 {
            return Err(LbaasError::BadRequest(format!("refusing to signal pid {}", pid)));
        }
        // SAFETY: kill(2) has no memory-safety preconditions
        let rc = unsafe { libc::kill(pid, signal.as_raw()) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => Ok(false),
            _ => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_host_executor_runs_and_reports_status() {
        let executor = HostExecutor::new(Duration::from_secs(5));
        let ok = executor.run(&argv!["sh", "-c", "echo hello"]).await.unwrap();
        assert!(ok.success());
        assert_eq!(ok.stdout.trim(), "hello");

        let failed = executor.run(&argv!["sh", "-c", "echo oops >&2; exit 3"]).await.unwrap();
        assert_eq!(failed.status, 3);
        let err = run_checked(&executor, &argv!["sh", "-c", "exit 1"]).await.unwrap_err();
        assert!(err.to_string().contains("status 1"));
    }

    #[tokio::test]
    async fn test_host_executor_timeout() {
        let executor = HostExecutor::new(Duration::from_millis(50));
        let err = executor.run(&argv!["sleep", "5"]).await.unwrap_err();
        assert!(matches!(err, LbaasError::Timeout(_)));
    }

    #[test]
    fn test_probe_own_process() {
        let executor = HostExecutor::new(Duration::from_secs(1));
        assert!(executor.signal(std::process::id() as i32, Signal::Probe).unwrap());
        assert!(executor.signal(0, Signal::Term).is_err());
    }
}

/// Executor that records command lines and simulates haproxy pid files
#[cfg(test)]
pub mod fake {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex;

    use super::*;

    pub struct RecordingExecutor {
        commands: Mutex<Vec<String>>,
        signals: Mutex<Vec<(i32, Signal)>>,
        alive: Mutex<HashSet<i32>>,
        replies: Mutex<Vec<(String, CommandOutput)>>,
        next_pid: AtomicI32,
    }

    impl RecordingExecutor {
        pub fn new() -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                signals: Mutex::new(Vec::new()),
                alive: Mutex::new(HashSet::new()),
                replies: Mutex::new(Vec::new()),
                next_pid: AtomicI32::new(4000),
            }
        }

        /// Answer any command line containing `needle` with `output`
        pub fn reply(&self, needle: &str, output: CommandOutput) {
            self.replies.lock().unwrap().push((needle.to_string(), output));
        }

        pub fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        pub fn commands_containing(&self, needle: &str) -> Vec<String> {
            self.commands().into_iter().filter(|c| c.contains(needle)).collect()
        }

        pub fn signals(&self) -> Vec<(i32, Signal)> {
            self.signals.lock().unwrap().clone()
        }

        pub fn alive(&self) -> Vec<i32> {
            let mut pids: Vec<i32> = self.alive.lock().unwrap().iter().copied().collect();
            pids.sort();
            pids
        }
    }

    #[async_trait]
    impl CommandExecutor for RecordingExecutor {
        async fn run(&self, argv: &[String]) -> Result<CommandOutput> {
            let line = argv.join(" ");
            self.commands.lock().unwrap().push(line.clone());

            if let Some(pos) = argv.iter().position(|a| a == "-p") {
                if let Some(pid_file) = argv.get(pos + 1) {
                    let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
                    std::fs::write(pid_file, format!("{}\n", pid))?;
                    self.alive.lock().unwrap().insert(pid);
                    if let Some(old) = argv.iter().position(|a| a == "-sf") {
                        let mut alive = self.alive.lock().unwrap();
                        for p in &argv[old + 1..] {
                            if let Ok(p) = p.parse::<i32>() {
                                alive.remove(&p);
                            }
                        }
                    }
                }
            }

            let replies = self.replies.lock().unwrap();
            Ok(replies
                .iter()
                .find(|(needle, _)| line.contains(needle.as_str()))
                .map(|(_, output)| output.clone())
                .unwrap_or_default())
        }

        fn signal(&self, pid: i32, signal: Signal) -> Result<bool> {
            let mut alive = self.alive.lock().unwrap();
            if signal == Signal::Probe {
                return Ok(alive.contains(&pid));
            }
            self.signals.lock().unwrap().push((pid, signal));
            Ok(alive.remove(&pid))
        }
    }
}
