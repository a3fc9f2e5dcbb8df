//! Systemd service integration
//!
//! sd-notify lifecycle messages plus a watchdog that only pets systemd while
//! the reassembly and persistence tasks keep making progress.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

fn send_datagram(socket_path: &Path, message: &str) -> Result<()> {
    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), socket_path)
        .with_context(|| format!("Failed to send {} notification to systemd", message))?;
    Ok(())
}

/// False when not running under systemd
fn send_notification(message: &str) -> Result<bool> {
    let Some(socket_path) = env::var_os("NOTIFY_SOCKET") else {
        return Ok(false);
    };
    send_datagram(Path::new(&socket_path), message)?;
    Ok(true)
}

/// Notify systemd that the logger is capturing
pub fn notify_ready() -> Result<()> {
    if send_notification("READY=1")? {
        info!("Notified systemd: service ready");
    } else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
    }
    Ok(())
}

/// Notify systemd that shutdown has begun
pub fn notify_stopping() -> Result<()> {
    if send_notification("STOPPING=1")? {
        info!("Notified systemd: service stopping");
    }
    Ok(())
}

pub fn notify_watchdog() -> Result<()> {
    if send_notification("WATCHDOG=1")? {
        debug!("Notified systemd: watchdog keepalive");
    }
    Ok(())
}

/// Status line shown by `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    if send_notification(&format!("STATUS={}", status))? {
        debug!("Notified systemd: status = {}", status);
    }
    Ok(())
}

/// Watchdog timeout configured by systemd (in microseconds)
pub fn get_watchdog_timeout() -> Option<u64> {
    env::var("WATCHDOG_USEC").ok().and_then(|s| s.parse().ok())
}

pub fn is_systemd() -> bool {
    env::var("NOTIFY_SOCKET").is_ok()
}

/// Progress counter bumped by a periodic task on every cycle
#[derive(Debug, Clone, Default)]
pub struct Heartbeat(Arc<AtomicU64>);

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn beat(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Tracks a set of heartbeats between watchdog ticks
#[derive(Debug)]
pub struct LivenessCheck {
    beats: Vec<(&'static str, Heartbeat, u64)>,
}

impl LivenessCheck {
    pub fn new(beats: Vec<(&'static str, Heartbeat)>) -> Self {
        Self {
            beats: beats
                .into_iter()
                .map(|(name, beat)| {
                    let seen = beat.count();
                    (name, beat, seen)
                })
                .collect(),
        }
    }

    /// Names of the tasks that have not beaten since the previous call
    pub fn stalled(&mut self) -> Vec<&'static str> {
        let mut stalled = Vec::new();
        for (name, beat, seen) in &mut self.beats {
            let now = beat.count();
            if now == *seen {
                stalled.push(*name);
            }
            *seen = now;
        }
        stalled
    }
}

/// Send WATCHDOG=1 at half the configured interval while all tasks are live
///
/// Returns `None` when systemd has not enabled the watchdog.
pub fn spawn_watchdog_task(beats: Vec<(&'static str, Heartbeat)>) -> Option<JoinHandle<()>> {
    let timeout_usec = get_watchdog_timeout()?;
    let interval = Duration::from_micros(timeout_usec / 2).max(Duration::from_secs(1));

    info!(
        "Systemd watchdog enabled, interval: {}s (timeout: {}s)",
        interval.as_secs(),
        timeout_usec / 1_000_000
    );

    Some(tokio::spawn(async move {
        let mut check = LivenessCheck::new(beats);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let stalled = check.stalled();
            if !stalled.is_empty() {
                warn!("Withholding watchdog keepalive, stalled: {:?}", stalled);
                continue;
            }
            if let Err(e) = notify_watchdog() {
                error!("Failed to send watchdog keepalive: {:#}", e);
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_functions_without_socket() {
        unsafe {
            env::remove_var("NOTIFY_SOCKET");
        }
        assert!(!is_systemd());
        assert!(notify_ready().is_ok());
        assert!(notify_stopping().is_ok());
        assert!(notify_watchdog().is_ok());
        assert!(notify_status("capturing").is_ok());
    }

    #[test]
    fn test_notify_reaches_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.sock");
        let listener = UnixDatagram::bind(&path).unwrap();

        send_datagram(&path, "STATUS=attached").unwrap();

        let mut buf = [0u8; 64];
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"STATUS=attached");
    }

    #[test]
    fn test_get_watchdog_timeout() {
        unsafe {
            env::remove_var("WATCHDOG_USEC");
        }
        assert!(get_watchdog_timeout().is_none());

        unsafe {
            env::set_var("WATCHDOG_USEC", "30000000");
        }
        assert_eq!(get_watchdog_timeout(), Some(30_000_000));

        unsafe {
            env::set_var("WATCHDOG_USEC", "invalid");
        }
        assert!(get_watchdog_timeout().is_none());

        unsafe {
            env::remove_var("WATCHDOG_USEC");
        }
    }

    #[test]
    fn test_liveness_check_reports_stalled_tasks() {
        let reassembly = Heartbeat::new();
        let persistence = Heartbeat::new();
        let mut check = LivenessCheck::new(vec![
            ("reassembly", reassembly.clone()),
            ("persistence", persistence.clone()),
        ]);

        reassembly.beat();
        persistence.beat();
        assert!(check.stalled().is_empty());

        reassembly.beat();
        assert_eq!(check.stalled(), vec!["persistence"]);

        assert_eq!(check.stalled(), vec!["reassembly", "persistence"]);
    }
}
