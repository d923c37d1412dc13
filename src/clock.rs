//! PTP clock abstraction and RTP↔PTP timestamp correlation.
//!
//! Three modes:
//! - `None`: no PTP; the system realtime clock is used for file naming only
//!   and RTP correlation is disabled.
//! - `Software`: the system realtime clock, assumed disciplined by an
//!   external PTP daemon (e.g. phc2sys).
//! - `Hardware`: a PTP hardware clock character device, read through a
//!   dynamic clock id derived from the open file descriptor.
//!
//! `now_ns()` reports TAI-like nanoseconds and returns 0 when the backing
//! clock cannot be read; callers substitute their documented fallbacks.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Clock source selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtpMode {
    None,
    Software,
    Hardware,
}

/// Clock construction parameters.
#[derive(Debug, Clone, Default)]
pub struct PtpClockConfig {
    pub device: Option<std::path::PathBuf>,
    pub interface: Option<String>,
    pub software: bool,
}

impl PtpClockConfig {
    pub fn mode(&self) -> PtpMode {
        if self.device.is_some() || self.interface.is_some() {
            PtpMode::Hardware
        } else if self.software {
            PtpMode::Software
        } else {
            PtpMode::None
        }
    }
}

/// First-packet RTP↔PTP correlation. Once set, only the wraparound state
/// evolves.
#[derive(Debug, Clone, Copy)]
struct RtpEpoch {
    epoch_rtp_ts: u32,
    epoch_ptp_ns: u64,
    sample_rate: u32,
    wraparound_count: u64,
    last_rtp_ts: u32,
}

// The underlying PHC access layer is initialized process-wide; the refcount
// stays a private detail of this module (created and destroyed clocks must
// leave it at zero).
static INIT_REFCOUNT: AtomicU32 = AtomicU32::new(0);

/// PTP clock with RTP timestamp correlation.
pub struct PtpClock {
    mode: PtpMode,
    #[cfg(unix)]
    phc: Option<std::fs::File>,
    epoch: Mutex<Option<RtpEpoch>>,
}

impl PtpClock {
    /// Select and open the clock source. Fails when hardware mode is
    /// requested and neither the device path nor the interface yields a
    /// usable PHC device.
    pub fn new(config: &PtpClockConfig) -> Result<Self> {
        let mode = config.mode();

        #[cfg(unix)]
        let phc = match mode {
            PtpMode::Hardware => Some(open_phc(config)?),
            _ => None,
        };
        #[cfg(not(unix))]
        if mode == PtpMode::Hardware {
            return Err(Error::ClockUnavailable(
                "PTP hardware clocks are only supported on Unix".into(),
            ));
        }

        INIT_REFCOUNT.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            mode,
            #[cfg(unix)]
            phc,
            epoch: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> PtpMode {
        self.mode
    }

    /// Current time in nanoseconds from the selected source, 0 on failure.
    pub fn now_ns(&self) -> u64 {
        match self.mode {
            PtpMode::None | PtpMode::Software => system_now_ns(),
            PtpMode::Hardware => {
                #[cfg(unix)]
                {
                    self.phc.as_ref().map_or(0, phc_now_ns)
                }
                #[cfg(not(unix))]
                0
            }
        }
    }

    /// Record the first-packet correlation and reset wraparound state.
    pub fn set_rtp_epoch(&self, rtp_ts: u32, ptp_ns: u64, sample_rate: u32) {
        *self.epoch.lock() = Some(RtpEpoch {
            epoch_rtp_ts: rtp_ts,
            epoch_ptp_ns: ptp_ns,
            sample_rate,
            wraparound_count: 0,
            last_rtp_ts: rtp_ts,
        });
    }

    pub fn has_rtp_epoch(&self) -> bool {
        self.epoch.lock().is_some()
    }

    /// Convert an RTP timestamp to PTP nanoseconds, extending across 32-bit
    /// wraparound. Returns 0 when the epoch is unset or the rate is zero.
    pub fn rtp_to_ns(&self, rtp_ts: u32, sample_rate: u32) -> u64 {
        let mut guard = self.epoch.lock();
        let Some(epoch) = guard.as_mut() else {
            return 0;
        };
        if sample_rate == 0 {
            return 0;
        }

        // Wraparound: the timestamp stepped backwards by more than 2^31.
        if rtp_ts < epoch.last_rtp_ts && epoch.last_rtp_ts - rtp_ts > 0x8000_0000 {
            epoch.wraparound_count += 1;
        }
        epoch.last_rtp_ts = rtp_ts;

        let extended = ((epoch.wraparound_count as u128) << 32) | rtp_ts as u128;
        // A late packet from before the epoch must not underflow.
        let elapsed = extended.saturating_sub(epoch.epoch_rtp_ts as u128);
        let elapsed_ns = elapsed * 1_000_000_000 / sample_rate as u128;
        epoch.epoch_ptp_ns.saturating_add(elapsed_ns as u64)
    }

    /// Whether the backing clock currently reads successfully.
    pub fn health_check(&self) -> bool {
        self.now_ns() != 0
    }

    /// Process-wide init refcount, exposed for lifecycle tests only.
    #[doc(hidden)]
    pub fn init_refcount() -> u32 {
        INIT_REFCOUNT.load(Ordering::SeqCst)
    }
}

impl Drop for PtpClock {
    fn drop(&mut self) {
        INIT_REFCOUNT.fetch_sub(1, Ordering::SeqCst);
    }
}

/// System realtime clock in nanoseconds since the Unix epoch.
pub fn system_now_ns() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_nanos() as u64,
        Err(_) => 0,
    }
}

#[cfg(unix)]
fn open_phc(config: &PtpClockConfig) -> Result<std::fs::File> {
    if let Some(path) = &config.device {
        return std::fs::File::open(path).map_err(|e| {
            Error::ClockUnavailable(format!("cannot open PTP device {}: {}", path.display(), e))
        });
    }
    if let Some(iface) = &config.interface {
        return open_phc_for_interface(iface);
    }
    Err(Error::InvalidConfig(
        "hardware PTP mode requires a device path or interface".into(),
    ))
}

/// Find the PHC device backing a network interface via sysfs.
#[cfg(unix)]
fn open_phc_for_interface(iface: &str) -> Result<std::fs::File> {
    let sys_dir = format!("/sys/class/net/{}/device/ptp", iface);
    let entries = std::fs::read_dir(&sys_dir).map_err(|e| {
        Error::ClockUnavailable(format!("no PTP clock behind interface {}: {}", iface, e))
    })?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("ptp") {
            let dev = format!("/dev/{}", name);
            return std::fs::File::open(&dev).map_err(|e| {
                Error::ClockUnavailable(format!("cannot open PTP device {}: {}", dev, e))
            });
        }
    }
    Err(Error::ClockUnavailable(format!(
        "no PTP clock behind interface {}",
        iface
    )))
}

/// Read a PTP hardware clock through its dynamic posix clock id.
#[cfg(unix)]
fn phc_now_ns(file: &std::fs::File) -> u64 {
    use std::os::unix::io::AsRawFd;

    let fd = file.as_raw_fd();
    // Dynamic clock ids encode the fd: CLOCKID = ((~fd) << 3) | 3.
    let clock_id: libc::clockid_t = ((!fd as libc::clockid_t) << 3) | 3;
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime writes into the timespec we own.
    let rc = unsafe { libc::clock_gettime(clock_id, &mut ts) };
    if rc != 0 {
        return 0;
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversion_requires_epoch() {
        let clock = PtpClock::new(&PtpClockConfig::default()).unwrap();
        assert_eq!(clock.rtp_to_ns(1000, 48000), 0);
    }

    #[test]
    fn test_rtp_to_ns_linear() {
        let clock = PtpClock::new(&PtpClockConfig::default()).unwrap();
        clock.set_rtp_epoch(1000, 5_000_000_000, 48000);
        // 48000 ticks = exactly one second.
        assert_eq!(clock.rtp_to_ns(1000, 48000), 5_000_000_000);
        assert_eq!(clock.rtp_to_ns(49000, 48000), 6_000_000_000);
        assert_eq!(clock.rtp_to_ns(49048, 48000), 6_001_000_000);
    }

    #[test]
    fn test_rtp_wraparound_extends() {
        let clock = PtpClock::new(&PtpClockConfig::default()).unwrap();
        let start = u32::MAX - 47999;
        clock.set_rtp_epoch(start, 0, 48000);
        assert_eq!(clock.rtp_to_ns(start, 48000), 0);
        // Crossing the 32-bit boundary keeps time monotonic.
        let after_wrap = 48000u32;
        let ns = clock.rtp_to_ns(after_wrap, 48000);
        assert_eq!(ns, 2_000_000_000);
    }

    #[test]
    fn test_pre_epoch_packet_clamps_to_epoch() {
        let clock = PtpClock::new(&PtpClockConfig::default()).unwrap();
        clock.set_rtp_epoch(10_000, 7_000_000_000, 48000);
        // A packet older than the epoch must not underflow.
        assert_eq!(clock.rtp_to_ns(9_000, 48000), 7_000_000_000);
    }

    #[test]
    fn test_zero_sample_rate_fails() {
        let clock = PtpClock::new(&PtpClockConfig::default()).unwrap();
        clock.set_rtp_epoch(0, 0, 48000);
        assert_eq!(clock.rtp_to_ns(100, 0), 0);
    }

    #[test]
    fn test_software_mode_reads_system_clock() {
        let config = PtpClockConfig {
            software: true,
            ..Default::default()
        };
        let clock = PtpClock::new(&config).unwrap();
        assert_eq!(clock.mode(), PtpMode::Software);
        assert!(clock.now_ns() > 0);
        assert!(clock.health_check());
    }
}
