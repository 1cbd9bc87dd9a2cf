//! Cluster supervision: the primary process forks workers (re-execs of this
//! binary), respawns them on exit, restarts all of them on request, and
//! probes their memory use.
//!
//! Control messages are line-delimited JSON over the worker's stdio: the
//! worker emits `{"cmd":"restartAllWorkers"}` on stdout, the supervisor
//! sends `{"cmd":"checkMemory","maxMem":N}` on stdin. Anything else on a
//! worker's stdout is passed through as log output.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::procs;
use crate::settings::Settings;

/// Role marker in the environment of forked workers.
pub const ROLE_ENV: &str = "TILE_API_ROLE";

/// Memory probe cadence.
const MEMORY_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Share of total system memory a single worker may use.
const WORKER_MEMORY_SHARE: f64 = 0.8;

/// Run the supervisor: fork `WORKER_COUNT` workers and keep them alive.
pub async fn run_supervisor(settings: &Settings, listen: &str) -> Result<()> {
    let worker_count = settings.worker_count.max(1);
    let max_mem = (procs::total_memory_bytes() as f64 * WORKER_MEMORY_SHARE) as u64;
    info!(workers = worker_count, max_mem, "Starting cluster supervisor");

    let (restart_tx, _) = broadcast::channel::<()>(8);
    let mut slots = Vec::new();
    for slot in 0..worker_count {
        let restart_tx = restart_tx.clone();
        let listen = listen.to_string();
        slots.push(tokio::spawn(async move {
            worker_slot(slot, listen, restart_tx, max_mem).await;
        }));
    }
    futures::future::join_all(slots).await;
    Ok(())
}

/// One worker slot: spawn, monitor, respawn forever.
async fn worker_slot(slot: usize, listen: String, restart_tx: broadcast::Sender<()>, max_mem: u64) {
    loop {
        match run_worker_once(slot, &listen, &restart_tx, max_mem).await {
            Ok(()) => info!(slot, "Worker exited, respawning"),
            Err(e) => warn!(slot, error = %e, "Worker slot failed, respawning"),
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}

async fn run_worker_once(
    slot: usize,
    listen: &str,
    restart_tx: &broadcast::Sender<()>,
    max_mem: u64,
) -> Result<()> {
    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let mut child = Command::new(exe)
        .arg("--listen")
        .arg(listen)
        .env(ROLE_ENV, "worker")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn worker")?;

    info!(slot, pid = child.id(), "Worker started");

    let mut stdin = child.stdin.take().context("worker stdin unavailable")?;
    let stdout = child.stdout.take().context("worker stdout unavailable")?;

    // Stdout reader: control lines trigger a cluster-wide restart, the rest
    // is forwarded as-is.
    let restart_fwd = restart_tx.clone();
    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_restart_command(&line) {
                let _ = restart_fwd.send(());
            } else {
                println!("{}", line);
            }
        }
    });

    let mut restart_rx = restart_tx.subscribe();
    let mut memory_tick = tokio::time::interval(MEMORY_CHECK_INTERVAL);
    memory_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    memory_tick.tick().await;

    loop {
        tokio::select! {
            status = child.wait() => {
                info!(slot, status = ?status.ok(), "Worker process ended");
                break;
            }
            _ = restart_rx.recv() => {
                info!(slot, "Restart-all requested, replacing worker");
                let _ = child.start_kill();
                let _ = child.wait().await;
                break;
            }
            _ = memory_tick.tick() => {
                let probe = json!({ "cmd": "checkMemory", "maxMem": max_mem });
                let mut line = probe.to_string();
                line.push('\n');
                if stdin.write_all(line.as_bytes()).await.is_err() {
                    // Pipe closed; the wait arm will observe the exit.
                    warn!(slot, "Worker stdin closed");
                }
            }
        }
    }

    stdout_task.abort();
    Ok(())
}

fn is_restart_command(line: &str) -> bool {
    serde_json::from_str::<Value>(line.trim())
        .ok()
        .and_then(|msg| {
            msg.get("cmd")
                .and_then(Value::as_str)
                .map(|cmd| cmd == "restartAllWorkers")
        })
        .unwrap_or(false)
}

/// Worker side: watch stdin for supervisor probes. A worker above the
/// broadcast memory ceiling exits with code 1 and gets replaced.
pub fn start_worker_control() {
    tokio::spawn(async {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(msg) = serde_json::from_str::<Value>(line.trim()) else {
                continue;
            };
            if msg.get("cmd").and_then(Value::as_str) != Some("checkMemory") {
                continue;
            }
            let Some(max_mem) = msg.get("maxMem").and_then(Value::as_u64) else {
                continue;
            };
            let rss = procs::own_rss_bytes();
            if rss > max_mem {
                warn!(rss, max_mem, "Memory ceiling exceeded, exiting for replacement");
                std::process::exit(1);
            }
        }
    });
}

/// Emit the restart-all control line; only meaningful in a worker whose
/// stdout is the supervisor pipe.
pub fn request_restart_all() {
    println!("{}", json!({ "cmd": "restartAllWorkers" }));
}

/// Bind with `SO_REUSEPORT` so all workers share the listen port and the
/// kernel balances connections.
pub fn bind_reuseport(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restart_command_detection() {
        assert!(is_restart_command(r#"{"cmd":"restartAllWorkers"}"#));
        assert!(is_restart_command(r#"  {"cmd":"restartAllWorkers","from":3} "#));
        assert!(!is_restart_command(r#"{"cmd":"checkMemory"}"#));
        assert!(!is_restart_command("plain log line"));
        assert!(!is_restart_command(""));
    }

    #[test]
    fn test_bind_reuseport_twice() {
        let first = bind_reuseport("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = first.local_addr().unwrap();
        // A second bind on the same port must succeed on Unix.
        #[cfg(unix)]
        bind_reuseport(addr).unwrap();
        #[cfg(not(unix))]
        let _ = addr;
    }
}
