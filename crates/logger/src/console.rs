//! Console sink and command surface
//!
//! Captured lines and command replies share stdout. Commands are read from
//! stdin one per line.

use crate::tasks::{PersistCommand, PersistStatus};
use capture::command::{help_text, new_log_reply, time_reply, time_set_reply};
use capture::{
    BufferGauge, CaptureError, Command, ConsoleSink, DeviceGate, SharedClock, StatusReport,
    ThroughputCounters,
};
use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Console sink writing each line to stdout
#[derive(Debug, Default)]
pub struct StdoutConsole;

impl ConsoleSink for StdoutConsole {
    fn emit(&mut self, line: &str) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{}", line);
    }
}

/// Handles the command surface needs into the running pipeline
#[derive(Clone)]
pub struct CommandContext {
    pub clock: SharedClock,
    pub persist: mpsc::Sender<PersistCommand>,
    pub gauge: BufferGauge,
    pub gate: DeviceGate,
    pub counters: Arc<ThroughputCounters>,
}

impl CommandContext {
    async fn persist_status(&self) -> PersistStatus {
        let (tx, rx) = oneshot::channel();
        if self
            .persist
            .send(PersistCommand::Status { response: tx })
            .await
            .is_err()
        {
            return PersistStatus::default();
        }
        rx.await.unwrap_or_default()
    }

    async fn rotate(&self) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        self.persist
            .send(PersistCommand::Rotate { response: tx })
            .await
            .ok()?;
        rx.await.ok()?.ok()
    }

    /// Run one command and produce its reply
    pub async fn execute(&self, command: Command) -> String {
        match command {
            Command::GetTime => time_reply(self.clock.now()),
            Command::SetTime(time) => match self.clock.set(time) {
                Ok(()) => {
                    info!("Clock set to {}", time);
                    time_set_reply(time)
                }
                Err(CaptureError::ClockUnavailable) => time_reply(None),
                Err(e) => {
                    warn!("settime failed: {}", e);
                    format!("[RTC] {}", e)
                }
            },
            Command::NewLog => new_log_reply(self.rotate().await.as_deref()),
            Command::Status => {
                let persist = self.persist_status().await;
                StatusReport {
                    buffer_used: self.gauge.used(),
                    buffer_capacity: self.gauge.capacity(),
                    device_connected: self.gate.is_open(),
                    storage_available: persist.storage_available,
                    clock_available: self.clock.is_available(),
                    log_file: persist.current_file,
                    usb_bytes: self.counters.total_bytes(),
                    persist: persist.stats,
                }
                .to_string()
            }
            Command::Help => {
                let persist = self.persist_status().await;
                help_text(persist.current_file.as_deref())
            }
        }
    }

    /// Parse and execute one input line; `None` for blank input
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        match Command::parse(line) {
            Ok(Some(command)) => {
                debug!("Console command: {:?}", command);
                Some(self.execute(command).await)
            }
            Ok(None) => None,
            Err(e) => Some(e.to_string()),
        }
    }
}

/// Forward stdin lines from a plain OS thread
///
/// A blocked read on this thread must not hold up runtime shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    let spawned = std::thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("Failed to read command: {}", e);
                        return;
                    }
                }
            }
        });
    if let Err(e) = spawned {
        warn!("Failed to start stdin reader: {}", e);
    }
    rx
}

/// Read commands from stdin until EOF or `stop` fires
pub async fn run_command_surface(context: CommandContext, mut stop: watch::Receiver<bool>) {
    let mut lines = spawn_stdin_reader();

    loop {
        let line = tokio::select! {
            line = lines.recv() => line,
            _ = stop.changed() => return,
        };

        let Some(line) = line else {
            info!("stdin closed, command surface stopped");
            return;
        };
        if let Some(reply) = context.handle_line(&line).await {
            let mut out = std::io::stdout().lock();
            let _ = writeln!(out, "{}", reply);
        }
    }
}
