//! Wall-clock sources
//!
//! - [`LinuxRtc`]: a `/dev/rtcN` character device, read and set with the
//!   `RTC_RD_TIME` / `RTC_SET_TIME` ioctls
//! - [`SystemClock`]: the host clock plus an offset; `settime` moves the offset
//!   and never touches the OS clock
//! - [`capture::NoClock`]: no wall clock at all

use crate::config::{ClockSettings, ClockSourceKind};
use capture::{ClockSource, NoClock};
use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, TimeDelta, Timelike};
use tracing::{info, warn};

/// Kernel `struct rtc_time`
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RtcTime {
    pub tm_sec: i32,
    pub tm_min: i32,
    pub tm_hour: i32,
    pub tm_mday: i32,
    /// Months since January
    pub tm_mon: i32,
    /// Years since 1900
    pub tm_year: i32,
    pub tm_wday: i32,
    pub tm_yday: i32,
    pub tm_isdst: i32,
}

impl RtcTime {
    /// `None` for register contents that are not a valid calendar time
    pub fn to_datetime(self) -> Option<NaiveDateTime> {
        let date = NaiveDate::from_ymd_opt(
            self.tm_year.checked_add(1900)?,
            u32::try_from(self.tm_mon.checked_add(1)?).ok()?,
            u32::try_from(self.tm_mday).ok()?,
        )?;
        date.and_hms_opt(
            u32::try_from(self.tm_hour).ok()?,
            u32::try_from(self.tm_min).ok()?,
            u32::try_from(self.tm_sec).ok()?,
        )
    }

    pub fn from_datetime(time: NaiveDateTime) -> Self {
        Self {
            tm_sec: time.second() as i32,
            tm_min: time.minute() as i32,
            tm_hour: time.hour() as i32,
            tm_mday: time.day() as i32,
            tm_mon: time.month0() as i32,
            tm_year: time.year() - 1900,
            tm_wday: time.weekday().num_days_from_sunday() as i32,
            tm_yday: time.ordinal0() as i32,
            tm_isdst: 0,
        }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::RtcTime;
    use capture::{CaptureError, ClockSource};
    use chrono::NaiveDateTime;
    use std::fs::File;
    use std::os::fd::AsRawFd;
    use std::path::PathBuf;
    use tracing::{debug, warn};

    nix::ioctl_read!(rtc_rd_time, b'p', 0x09, RtcTime);
    nix::ioctl_write_ptr!(rtc_set_time, b'p', 0x0a, RtcTime);

    /// Hardware RTC behind a Linux character device
    #[derive(Debug)]
    pub struct LinuxRtc {
        path: PathBuf,
        file: Option<File>,
    }

    impl LinuxRtc {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self {
                path: path.into(),
                file: None,
            }
        }

        fn device(&mut self) -> std::io::Result<&File> {
            if self.file.is_none() {
                let file = File::open(&self.path)?;
                debug!("Opened RTC device {}", self.path.display());
                self.file = Some(file);
            }
            self.file
                .as_ref()
                .ok_or_else(|| std::io::Error::other("RTC device not open"))
        }
    }

    impl ClockSource for LinuxRtc {
        fn read(&mut self) -> Option<NaiveDateTime> {
            let fd = match self.device().map(|file| file.as_raw_fd()) {
                Ok(fd) => fd,
                Err(e) => {
                    debug!("RTC {} not available: {}", self.path.display(), e);
                    return None;
                }
            };

            let mut raw = RtcTime::default();
            // SAFETY: `fd` is an open RTC device and `raw` matches `struct rtc_time`
            match unsafe { rtc_rd_time(fd, &mut raw) } {
                Ok(_) => {
                    let time = raw.to_datetime();
                    if time.is_none() {
                        warn!("RTC returned an invalid time: {:?}", raw);
                    }
                    time
                }
                Err(e) => {
                    warn!("RTC_RD_TIME on {} failed: {}", self.path.display(), e);
                    self.file = None;
                    None
                }
            }
        }

        fn set(&mut self, time: NaiveDateTime) -> capture::Result<()> {
            let fd = self.device()?.as_raw_fd();
            let raw = RtcTime::from_datetime(time);
            // SAFETY: `fd` is an open RTC device and `raw` matches `struct rtc_time`
            unsafe { rtc_set_time(fd, &raw) }
                .map(|_| ())
                .map_err(|e| CaptureError::ClockWrite(e.to_string()))
        }
    }
}

#[cfg(target_os = "linux")]
pub use linux::LinuxRtc;

/// Host clock with a settable offset
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock {
    offset: TimeDelta,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClockSource for SystemClock {
    fn read(&mut self) -> Option<NaiveDateTime> {
        Some(Local::now().naive_local() + self.offset)
    }

    fn set(&mut self, time: NaiveDateTime) -> capture::Result<()> {
        self.offset = time - Local::now().naive_local();
        info!("System clock offset set to {}s", self.offset.num_seconds());
        Ok(())
    }
}

/// Build the clock source named in the configuration
pub fn open_clock_source(settings: &ClockSettings) -> Box<dyn ClockSource> {
    match settings.source {
        ClockSourceKind::Rtc => open_rtc(settings),
        ClockSourceKind::System => {
            info!("Using host system clock");
            Box::new(SystemClock::new())
        }
        ClockSourceKind::None => {
            info!("No wall clock configured, lines will be stamped [NO_RTC]");
            Box::new(NoClock)
        }
    }
}

#[cfg(target_os = "linux")]
fn open_rtc(settings: &ClockSettings) -> Box<dyn ClockSource> {
    info!("Using RTC device {}", settings.rtc_device.display());
    Box::new(LinuxRtc::new(&settings.rtc_device))
}

#[cfg(not(target_os = "linux"))]
fn open_rtc(settings: &ClockSettings) -> Box<dyn ClockSource> {
    warn!(
        "RTC device {} not supported on this platform, running without a clock",
        settings.rtc_device.display()
    );
    Box::new(NoClock)
}

/// Report whether the configured clock answered at startup
pub fn log_clock_state(available: bool) {
    if available {
        info!("Wall clock available");
    } else {
        warn!("Wall clock unavailable for this session, lines will be stamped [NO_RTC]");
    }
}
