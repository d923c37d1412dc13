//! Archive rotation policy.
//!
//! Given a wall-clock timestamp the policy decides which rotation period it
//! falls into, when the next boundary is due, and what the archive file for
//! that period is called. Periods up to one day are aligned to wall-clock
//! multiples counted from midnight in the selected clock's timezone; longer
//! periods align to the Unix epoch.

use std::fmt::Write as _;
use std::fs;
use std::path::PathBuf;

use chrono::{Local, NaiveDateTime, TimeZone, Utc};

use crate::error::{Error, Result};

/// Directory/file naming scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveLayout {
    /// `root/YYYY-MM-DD-HH.suffix`
    Flat,
    /// `root/YYYY/MM/DD/HH/archive.suffix`
    Hierarchy,
    /// `root/YYYY/MM/DD/HH/YYYY-MM-DD-HH.suffix`
    Combo,
    /// `root/YYYY-MM-DD/YYYY-MM-DD-HH.suffix`
    DailyDir,
    /// `root/YYYY-MM-DD/YYYY-MM-DD-HH-mm-ss-cc.suffix` (instantaneous time)
    Accurate,
    /// `root/<strftime template>.suffix`
    Custom,
}

/// Which clock names the files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveClock {
    LocalTime,
    Utc,
    Ptp,
}

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub root: PathBuf,
    pub layout: ArchiveLayout,
    /// File extension without the dot
    pub suffix: String,
    /// Rotation period in seconds; 0 disables rotation
    pub period_sec: u32,
    pub clock: ArchiveClock,
    /// strftime-style template, required for the Custom layout
    pub custom_format: Option<String>,
    /// Create intermediate directories on next_path
    pub create_dirs: bool,
    /// Single continuous output file; disables rotation entirely
    pub single_file: Option<PathBuf>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            layout: ArchiveLayout::Flat,
            suffix: "wav".into(),
            period_sec: 3600,
            clock: ArchiveClock::LocalTime,
            custom_format: None,
            create_dirs: true,
            single_file: None,
        }
    }
}

const NS_PER_SEC: u64 = 1_000_000_000;
const SECS_PER_DAY: u64 = 86_400;

/// Wall-clock aligned rotation decision and path generation.
pub struct ArchivePolicy {
    config: ArchiveConfig,
    current_period_ns: u64,
    next_boundary_ns: u64,
    initialized: bool,
    files_opened: u64,
}

impl ArchivePolicy {
    pub fn new(config: ArchiveConfig) -> Result<Self> {
        if config.layout == ArchiveLayout::Custom {
            let Some(format) = &config.custom_format else {
                return Err(Error::InvalidConfig(
                    "custom archive layout requires an archive format template".into(),
                ));
            };
            // Probe the template once so a bad pattern fails here instead of
            // at the first rotation.
            let probe = Utc
                .timestamp_opt(0, 0)
                .single()
                .map(|dt| dt.naive_utc())
                .ok_or_else(|| Error::InvalidConfig("timestamp out of range".into()))?;
            format_naive(&probe, format)?;
        }
        if config.single_file.is_none() && config.suffix.is_empty() {
            return Err(Error::InvalidConfig("archive suffix must not be empty".into()));
        }
        Ok(Self {
            config,
            current_period_ns: 0,
            next_boundary_ns: 0,
            initialized: false,
            files_opened: 0,
        })
    }

    pub fn clock_source(&self) -> ArchiveClock {
        self.config.clock
    }

    /// True on the very first call (initial file) and whenever `now_ns` has
    /// crossed the period boundary.
    pub fn should_rotate(&self, now_ns: u64) -> bool {
        !self.initialized || now_ns >= self.next_boundary_ns
    }

    /// Compute the archive path for the period containing `now_ns`, create
    /// intermediate directories when configured, and move the boundary state
    /// to that period.
    pub fn next_path(&mut self, now_ns: u64) -> Result<PathBuf> {
        if let Some(path) = &self.config.single_file {
            self.current_period_ns = now_ns;
            self.next_boundary_ns = u64::MAX;
            let path = path.clone();
            self.ensure_parent(&path)?;
            return Ok(path);
        }

        let (start_ns, next_ns) = self.period_bounds(now_ns)?;
        self.current_period_ns = start_ns;
        self.next_boundary_ns = next_ns;

        // ACCURATE names carry the instant, all others the period start.
        let stamp_ns = if self.config.layout == ArchiveLayout::Accurate {
            now_ns
        } else {
            start_ns
        };
        let naive = self.broken_down(stamp_ns)?;
        let suffix = &self.config.suffix;

        let relative = match self.config.layout {
            ArchiveLayout::Flat => {
                PathBuf::from(format!("{}.{}", format_naive(&naive, "%Y-%m-%d-%H")?, suffix))
            }
            ArchiveLayout::Hierarchy => PathBuf::from(format_naive(&naive, "%Y/%m/%d/%H")?)
                .join(format!("archive.{}", suffix)),
            ArchiveLayout::Combo => PathBuf::from(format!(
                "{}.{}",
                format_naive(&naive, "%Y/%m/%d/%H/%Y-%m-%d-%H")?,
                suffix
            )),
            ArchiveLayout::DailyDir => PathBuf::from(format!(
                "{}.{}",
                format_naive(&naive, "%Y-%m-%d/%Y-%m-%d-%H")?,
                suffix
            )),
            ArchiveLayout::Accurate => {
                let centis = (stamp_ns % NS_PER_SEC) / 10_000_000;
                PathBuf::from(format!(
                    "{}-{:02}.{}",
                    format_naive(&naive, "%Y-%m-%d/%Y-%m-%d-%H-%M-%S")?,
                    centis,
                    suffix
                ))
            }
            ArchiveLayout::Custom => {
                // Validated at construction.
                let format = self.config.custom_format.as_deref().unwrap_or("%Y-%m-%d-%H");
                PathBuf::from(format!("{}.{}", format_naive(&naive, format)?, suffix))
            }
        };

        let path = self.config.root.join(relative);
        self.ensure_parent(&path)?;
        Ok(path)
    }

    /// Commit a rotation decided by `should_rotate`/`next_path`.
    pub fn advance(&mut self) {
        self.initialized = true;
        self.files_opened += 1;
    }

    pub fn files_opened(&self) -> u64 {
        self.files_opened
    }

    pub fn current_period_ns(&self) -> u64 {
        self.current_period_ns
    }

    pub fn next_boundary_ns(&self) -> u64 {
        self.next_boundary_ns
    }

    fn ensure_parent(&self, path: &std::path::Path) -> Result<()> {
        if !self.config.create_dirs {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    /// Start and end of the rotation period containing `now_ns`.
    fn period_bounds(&self, now_ns: u64) -> Result<(u64, u64)> {
        let period = self.config.period_sec as u64;
        if period == 0 {
            return Ok((now_ns, u64::MAX));
        }
        let period_ns = period * NS_PER_SEC;

        if period <= SECS_PER_DAY {
            let (midnight_ns, next_midnight_ns) = self.day_bounds(now_ns)?;
            let slot = now_ns.saturating_sub(midnight_ns) / period_ns;
            let start = midnight_ns + slot * period_ns;
            // Periods that do not divide the day truncate at midnight so
            // every boundary stays aligned within its day.
            let next = (start + period_ns).min(next_midnight_ns);
            Ok((start, next))
        } else {
            let now_sec = now_ns / NS_PER_SEC;
            let start_sec = now_sec - now_sec % period;
            Ok((start_sec * NS_PER_SEC, (start_sec + period) * NS_PER_SEC))
        }
    }

    /// Midnight of the day containing `now_ns` and of the following day, in
    /// the policy's timezone.
    fn day_bounds(&self, now_ns: u64) -> Result<(u64, u64)> {
        let naive = self.broken_down(now_ns)?;
        let date = naive.date();
        let next_date = date
            .succ_opt()
            .ok_or_else(|| Error::InvalidConfig("date out of range".into()))?;
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| Error::InvalidConfig("date out of range".into()))?;
        let next_midnight = next_date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| Error::InvalidConfig("date out of range".into()))?;
        Ok((self.naive_to_ns(midnight)?, self.naive_to_ns(next_midnight)?))
    }

    /// Broken-down time of `ns` in the policy's timezone.
    fn broken_down(&self, ns: u64) -> Result<NaiveDateTime> {
        let secs = (ns / NS_PER_SEC) as i64;
        let nsecs = (ns % NS_PER_SEC) as u32;
        let naive = match self.config.clock {
            ArchiveClock::LocalTime => Local
                .timestamp_opt(secs, nsecs)
                .single()
                .map(|dt| dt.naive_local()),
            // PTP time is TAI-based; for naming purposes it is broken down
            // like UTC.
            ArchiveClock::Utc | ArchiveClock::Ptp => {
                Utc.timestamp_opt(secs, nsecs).single().map(|dt| dt.naive_utc())
            }
        };
        naive.ok_or_else(|| Error::InvalidConfig("timestamp out of range".into()))
    }

    fn naive_to_ns(&self, naive: NaiveDateTime) -> Result<u64> {
        let secs = match self.config.clock {
            ArchiveClock::LocalTime => Local
                .from_local_datetime(&naive)
                .earliest()
                .ok_or_else(|| Error::InvalidConfig("nonexistent local time".into()))?
                .timestamp(),
            ArchiveClock::Utc | ArchiveClock::Ptp => Utc.from_utc_datetime(&naive).timestamp(),
        };
        Ok(secs.max(0) as u64 * NS_PER_SEC)
    }
}

/// Format a broken-down time, mapping pattern errors to InvalidConfig
/// instead of panicking inside Display.
fn format_naive(naive: &NaiveDateTime, pattern: &str) -> Result<String> {
    let mut out = String::new();
    write!(out, "{}", naive.format(pattern))
        .map_err(|_| Error::InvalidConfig(format!("invalid archive format pattern '{}'", pattern)))?;
    Ok(out)
}
