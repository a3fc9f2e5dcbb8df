//! Clock adapter
//!
//! Wraps an external wall-clock source (an RTC peripheral, the host clock, or
//! nothing at all) and hands out cheap timestamps. The external source is read
//! once at startup and then only every `resync` interval; in between, the
//! estimate is advanced by the monotonic ticks elapsed since the last advance.
//!
//! If the source was unavailable at startup the adapter stays unavailable for
//! the whole session and every stamp renders as [`NO_CLOCK_MARKER`].

use crate::error::{CaptureError, Result};
use chrono::{NaiveDateTime, TimeDelta};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Sentinel rendered instead of a timestamp when no clock is available
pub const NO_CLOCK_MARKER: &str = "[NO_RTC]";

/// Default interval between re-reads of the external source (10 minutes)
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(600);

/// Layout accepted by `settime` and printed by `gettime`
pub const QUERY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Layout used for line prefixes
const STAMP_FORMAT: &str = "[%d.%m.%Y %H:%M:%S]";

/// External wall-clock peripheral
pub trait ClockSource: Send {
    /// Read the current wall-clock time, or `None` when the device is unavailable
    fn read(&mut self) -> Option<NaiveDateTime>;

    /// Write a new wall-clock time to the device
    fn set(&mut self, time: NaiveDateTime) -> Result<()>;
}

/// Clock source for sessions without any time peripheral
#[derive(Debug, Default, Clone, Copy)]
pub struct NoClock;

impl ClockSource for NoClock {
    fn read(&mut self) -> Option<NaiveDateTime> {
        None
    }

    fn set(&mut self, _time: NaiveDateTime) -> Result<()> {
        Err(CaptureError::ClockUnavailable)
    }
}

/// Capture timestamp, or the unavailable sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stamp(Option<NaiveDateTime>);

impl Stamp {
    /// Stamp for a session without a clock
    pub const fn unavailable() -> Self {
        Self(None)
    }

    pub const fn at(time: NaiveDateTime) -> Self {
        Self(Some(time))
    }

    pub fn time(&self) -> Option<NaiveDateTime> {
        self.0
    }

    pub fn is_available(&self) -> bool {
        self.0.is_some()
    }
}

impl From<Option<NaiveDateTime>> for Stamp {
    fn from(time: Option<NaiveDateTime>) -> Self {
        Self(time)
    }
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(time) => write!(f, "{}", time.format(STAMP_FORMAT)),
            None => f.write_str(NO_CLOCK_MARKER),
        }
    }
}

/// Format a wall-clock time the way `gettime` reports it
pub fn format_query(time: NaiveDateTime) -> String {
    time.format(QUERY_FORMAT).to_string()
}

/// Parse a `YYYY-MM-DD HH:MM:SS` argument
///
/// Field widths and separators are checked literally before calendar
/// validation, so `2025-1-15 10:30:00` is rejected even though it would parse.
pub fn parse_query(input: &str) -> Result<NaiveDateTime> {
    let invalid = || CaptureError::InvalidTimeFormat {
        input: input.to_string(),
    };

    let bytes = input.as_bytes();
    if bytes.len() != 19 {
        return Err(invalid());
    }

    for (i, &b) in bytes.iter().enumerate() {
        let ok = match i {
            4 | 7 => b == b'-',
            10 => b == b' ',
            13 | 16 => b == b':',
            _ => b.is_ascii_digit(),
        };
        if !ok {
            return Err(invalid());
        }
    }

    NaiveDateTime::parse_from_str(input, QUERY_FORMAT).map_err(|_| invalid())
}

/// Point at which the local estimate was last advanced
#[derive(Debug, Clone, Copy)]
struct Anchor {
    wall: NaiveDateTime,
    tick: Instant,
}

/// Locally advanced wall-clock estimate over an external source
pub struct ClockAdapter {
    source: Box<dyn ClockSource>,
    anchor: Option<Anchor>,
    last_sync: Instant,
    resync: Duration,
}

impl ClockAdapter {
    /// Seed the adapter from `source`
    pub fn new(source: Box<dyn ClockSource>, resync: Duration) -> Self {
        Self::new_at(source, resync, Instant::now())
    }

    /// Seed the adapter with an explicit monotonic tick
    pub fn new_at(mut source: Box<dyn ClockSource>, resync: Duration, tick: Instant) -> Self {
        let anchor = source.read().map(|wall| Anchor { wall, tick });

        match anchor {
            Some(a) => info!("Clock seeded: {}", format_query(a.wall)),
            None => warn!(
                "Clock source unavailable, timestamps will read {}",
                NO_CLOCK_MARKER
            ),
        }

        Self {
            source,
            anchor,
            last_sync: tick,
            resync,
        }
    }

    /// Whether the adapter was seeded at startup
    pub fn is_available(&self) -> bool {
        self.anchor.is_some()
    }

    pub fn now(&mut self) -> Option<NaiveDateTime> {
        self.now_at(Instant::now())
    }

    /// Current estimate at monotonic tick `tick`
    pub fn now_at(&mut self, tick: Instant) -> Option<NaiveDateTime> {
        let anchor = self.anchor.as_mut()?;

        if tick.saturating_duration_since(self.last_sync) >= self.resync {
            self.last_sync = tick;
            match self.source.read() {
                Some(wall) => {
                    debug!("Clock re-synchronized: {}", format_query(wall));
                    *anchor = Anchor { wall, tick };
                    return Some(wall);
                }
                None => warn!("Clock re-sync failed, keeping local estimate"),
            }
        }

        if tick > anchor.tick {
            let elapsed = TimeDelta::from_std(tick - anchor.tick).unwrap_or(TimeDelta::zero());
            anchor.wall = anchor.wall.checked_add_signed(elapsed).unwrap_or(anchor.wall);
            anchor.tick = tick;
        }

        Some(anchor.wall)
    }

    pub fn set(&mut self, time: NaiveDateTime) -> Result<()> {
        self.set_at(time, Instant::now())
    }

    /// Write `time` to the source and re-seed the estimate at `tick`
    pub fn set_at(&mut self, time: NaiveDateTime, tick: Instant) -> Result<()> {
        if self.anchor.is_none() {
            return Err(CaptureError::ClockUnavailable);
        }

        self.source.set(time)?;
        self.anchor = Some(Anchor { wall: time, tick });
        self.last_sync = tick;
        info!("Clock set to {}", format_query(time));
        Ok(())
    }
}

/// Cloneable handle to the session clock
#[derive(Clone)]
pub struct SharedClock {
    inner: Arc<Mutex<ClockAdapter>>,
}

impl SharedClock {
    pub fn new(adapter: ClockAdapter) -> Self {
        Self {
            inner: Arc::new(Mutex::new(adapter)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ClockAdapter> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_available(&self) -> bool {
        self.lock().is_available()
    }

    pub fn now(&self) -> Option<NaiveDateTime> {
        self.lock().now()
    }

    /// Timestamp for a line captured now
    pub fn stamp(&self) -> Stamp {
        Stamp(self.now())
    }

    pub fn set(&self, time: NaiveDateTime) -> Result<()> {
        self.lock().set(time)
    }
}
