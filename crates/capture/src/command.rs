//! Console command grammar and replies

use crate::clock::{format_query, parse_query};
use crate::persist::PersistStats;
use chrono::NaiveDateTime;
use std::fmt;
use thiserror::Error;

/// A parsed console command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Print the current timestamp
    GetTime,
    /// Write a new wall-clock time
    SetTime(NaiveDateTime),
    /// Rotate to a freshly named log file
    NewLog,
    /// Print pipeline status
    Status,
    /// List commands
    Help,
}

/// Rejected console input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Invalid time format, use: settime YYYY-MM-DD HH:MM:SS")]
    InvalidTime,

    #[error("Unknown command '{0}', type 'help' for a list")]
    Unknown(String),
}

impl Command {
    /// Parse one input line
    ///
    /// Returns `Ok(None)` for blank input.
    pub fn parse(input: &str) -> Result<Option<Self>, CommandError> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(None);
        }

        let command = match input {
            "gettime" => Self::GetTime,
            "newlog" => Self::NewLog,
            "status" => Self::Status,
            "help" => Self::Help,
            _ => match input.strip_prefix("settime") {
                Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => {
                    let time = parse_query(rest.trim()).map_err(|_| CommandError::InvalidTime)?;
                    Self::SetTime(time)
                }
                _ => return Err(CommandError::Unknown(input.to_string())),
            },
        };

        Ok(Some(command))
    }
}

/// Reply to `gettime`
pub fn time_reply(time: Option<NaiveDateTime>) -> String {
    match time {
        Some(time) => format!("[RTC] Current time: {}", format_query(time)),
        None => "[RTC] Clock unavailable".to_string(),
    }
}

/// Reply to a successful `settime`
pub fn time_set_reply(time: NaiveDateTime) -> String {
    format!("[RTC] Time set: {}", format_query(time))
}

/// Reply to `newlog`
pub fn new_log_reply(file: Option<&str>) -> String {
    match file {
        Some(name) => format!("[SD] New log file: {}", name),
        None => "[SD] Storage unavailable".to_string(),
    }
}

/// Reply to `help`
pub fn help_text(current_file: Option<&str>) -> String {
    let file = match current_file {
        Some(name) => format!("Current log file: {}", name),
        None => "Storage unavailable".to_string(),
    };

    format!(
        "Commands:\n  \
         gettime                        Show current time\n  \
         settime YYYY-MM-DD HH:MM:SS    Set clock\n  \
         newlog                         Start a new log file\n  \
         status                         Show pipeline status\n  \
         help                           Show this help\n\
         {}",
        file
    )
}

/// Snapshot printed by `status`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusReport {
    pub buffer_used: usize,
    pub buffer_capacity: usize,
    pub device_connected: bool,
    pub storage_available: bool,
    pub clock_available: bool,
    pub log_file: Option<String>,
    pub usb_bytes: u64,
    pub persist: PersistStats,
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Buffer: {}/{} bytes",
            self.buffer_used, self.buffer_capacity
        )?;
        writeln!(f, "USB device connected: {}", yes_no(self.device_connected))?;
        writeln!(f, "Storage available: {}", yes_no(self.storage_available))?;
        writeln!(f, "Clock available: {}", yes_no(self.clock_available))?;
        writeln!(
            f,
            "Log file: {}",
            self.log_file.as_deref().unwrap_or("none")
        )?;
        writeln!(f, "USB bytes received: {}", self.usb_bytes)?;
        write!(
            f,
            "Written: {} lines, {} bytes in {} flushes ({} failed, {} lines lost)",
            self.persist.lines_written,
            self.persist.bytes_written,
            self.persist.flush_ops,
            self.persist.failed_flushes,
            self.persist.lines_lost
        )
    }
}
