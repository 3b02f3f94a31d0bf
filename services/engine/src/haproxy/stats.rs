//! HAProxy stats socket scraping

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use crate::error::Result;
use crate::model::{LoadBalancerStats, OperatingStatus};

/// BACKEND_REQUEST | SERVER_REQUEST
pub const STAT_REQUEST_TYPES: u32 = 2 | 4;

const TYPE_BACKEND: &str = "1";
const TYPE_SERVER: &str = "2";

/// HAProxy columns summed into the aggregated counters
const STATS_MAP: &[&str] = &["scur", "smax", "stot", "bin", "bout", "econ", "eresp"];

fn counter<'a>(stats: &'a mut LoadBalancerStats, column: &str) -> Option<&'a mut u64> {
    match column {
        "scur" => Some(&mut stats.active_connections),
        "smax" => Some(&mut stats.max_connections),
        "stot" => Some(&mut stats.total_connections),
        "bin" => Some(&mut stats.bytes_in),
        "bout" => Some(&mut stats.bytes_out),
        "econ" => Some(&mut stats.connection_errors),
        "eresp" => Some(&mut stats.response_errors),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub loadbalancer: LoadBalancerStats,
    /// Server rows keyed by member id, in socket order
    pub members: Vec<(String, OperatingStatus)>,
}

fn parse_rows(csv: &str) -> Vec<HashMap<&str, &str>> {
    let mut lines = csv.lines();
    let header: Vec<&str> = match lines.next().and_then(|l| l.strip_prefix('#')) {
        Some(h) => h.trim().split(',').collect(),
        None => return Vec::new(),
    };
    lines
        .filter(|l| !l.trim().is_empty())
        .map(|l| header.iter().copied().zip(l.split(',')).collect())
        .collect()
}

/// Sum of backend rows over the mapped columns
pub fn backend_stats(csv: &str) -> LoadBalancerStats {
    let mut stats = LoadBalancerStats::default();
    for row in parse_rows(csv)
        .iter()
        .filter(|r| r.get("type") == Some(&TYPE_BACKEND))
    {
        for column in STATS_MAP {
            let value = row
                .get(column)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(0);
            if let Some(total) = counter(&mut stats, column) {
                *total += value;
            }
        }
    }
    stats
}

fn server_status(status: &str) -> OperatingStatus {
    match status.trim() {
        "UP" | "OPEN" => OperatingStatus::Online,
        "no check" => OperatingStatus::NoMonitor,
        _ => OperatingStatus::Offline,
    }
}

/// Server rows mapped to member operating statuses
pub fn server_stats(csv: &str) -> Vec<(String, OperatingStatus)> {
    parse_rows(csv)
        .iter()
        .filter(|r| r.get("type") == Some(&TYPE_SERVER))
        .filter_map(|r| {
            let id = r.get("svname")?;
            Some((id.to_string(), server_status(r.get("status").unwrap_or(&""))))
        })
        .collect()
}

pub fn parse_snapshot(csv: &str) -> StatsSnapshot {
    StatsSnapshot {
        loadbalancer: backend_stats(csv),
        members: server_stats(csv),
    }
}

/// Query a stats socket; `None` when the socket does not exist
pub async fn query_socket(socket: &Path) -> Result<Option<String>> {
    let mut stream = match UnixStream::connect(socket).await {
        Ok(stream) => stream,
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
            debug!(socket = %socket.display(), "Stats socket unavailable");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    let request = format!("show stat -1 {} -1\n", STAT_REQUEST_TYPES);
    stream.write_all(request.as_bytes()).await?;
    let mut reply = String::new();
    stream.read_to_string(&mut reply).await?;
    Ok(Some(reply))
}
