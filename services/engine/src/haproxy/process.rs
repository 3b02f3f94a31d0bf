//! haproxy process lifecycle inside a namespace

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::executor::{run_checked, CommandExecutor, Signal};
use crate::argv;
use crate::error::Result;

const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Per-LB files under `<state root>/v2/<lb id>/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePaths {
    dir: PathBuf,
}

impl InstancePaths {
    pub fn new(state_root: &Path, lb_id: &str) -> Self {
        Self {
            dir: Self::root(state_root).join(lb_id),
        }
    }

    /// Directory holding every per-LB directory
    pub fn root(state_root: &Path) -> PathBuf {
        state_root.join("v2")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> PathBuf {
        self.dir.join("haproxy.conf")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.dir.join("haproxy.pid")
    }

    pub fn stats_socket(&self) -> PathBuf {
        self.dir.join("haproxy_stats.sock")
    }
}

/// PIDs listed in a pid file; empty when the file is missing
pub async fn read_pids(pid_file: &Path) -> Vec<i32> {
    match tokio::fs::read_to_string(pid_file).await {
        Ok(text) => text
            .split_whitespace()
            .filter_map(|p| p.parse().ok())
            .filter(|p| *p > 0)
            .collect(),
        Err(_) => Vec::new(),
    }
}

pub struct ProcessManager {
    executor: Arc<dyn CommandExecutor>,
    binary: String,
    grace: Duration,
}

impl ProcessManager {
    pub fn new(executor: Arc<dyn CommandExecutor>, binary: impl Into<String>, grace: Duration) -> Self {
        Self {
            executor,
            binary: binary.into(),
            grace,
        }
    }

    /// Spawn haproxy in `namespace`; on reload the old workers are handed
    /// the sockets with `-sf`
    pub async fn start(&self, namespace: &str, paths: &InstancePaths, reload: bool) -> Result<()> {
        let mut command = argv![
            "ip",
            "netns",
            "exec",
            namespace,
            self.binary,
            "-f",
            paths.config().display(),
            "-p",
            paths.pid_file().display()
        ];
        let old = if reload {
            read_pids(&paths.pid_file()).await
        } else {
            Vec::new()
        };
        if !old.is_empty() {
            command.push("-sf".to_string());
            command.extend(old.iter().map(|p| p.to_string()));
        }
        run_checked(self.executor.as_ref(), &command).await?;
        info!(namespace = %namespace, reload, replaced = ?old, "haproxy started");
        Ok(())
    }

    pub async fn is_running(&self, paths: &InstancePaths) -> bool {
        for pid in read_pids(&paths.pid_file()).await {
            if let Ok(true) = self.executor.signal(pid, Signal::Probe) {
                return true;
            }
        }
        false
    }

    /// TERM every listed pid, escalating to KILL after the grace period
    pub async fn stop(&self, paths: &InstancePaths) -> Result<()> {
        let pids = read_pids(&paths.pid_file()).await;
        for pid in pids {
            if !self.executor.signal(pid, Signal::Term)? {
                debug!(pid, "haproxy process already gone");
                continue;
            }
            let deadline = Instant::now() + self.grace;
            while self.executor.signal(pid, Signal::Probe)? {
                if Instant::now() >= deadline {
                    warn!(pid, "haproxy ignored SIGTERM, killing");
                    self.executor.signal(pid, Signal::Kill)?;
                    break;
                }
                sleep(PROBE_INTERVAL).await;
            }
        }
        Ok(())
    }
}
