//! Command-line configuration surface.
//!
//! The CLI is parsed with clap and then cross-validated into a plain
//! `Config` holding one sub-config per component. Every impossible
//! combination is rejected here, at startup, as InvalidConfig.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{ArgAction, Parser, ValueEnum};

use crate::archive::{ArchiveClock, ArchiveConfig, ArchiveLayout};
use crate::clock::PtpClockConfig;
use crate::error::{Error, Result};
use crate::input::RtpInputConfig;
use crate::meter::MeterConfig;
use crate::sink::{SinkFormat, SinkParams};
use crate::vox::{VoxConfig, VoxLevelMode};
use crate::worker::WorkerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LayoutArg {
    Flat,
    Hierarchy,
    Combo,
    Dailydir,
    Accurate,
    Custom,
}

impl From<LayoutArg> for ArchiveLayout {
    fn from(value: LayoutArg) -> Self {
        match value {
            LayoutArg::Flat => ArchiveLayout::Flat,
            LayoutArg::Hierarchy => ArchiveLayout::Hierarchy,
            LayoutArg::Combo => ArchiveLayout::Combo,
            LayoutArg::Dailydir => ArchiveLayout::DailyDir,
            LayoutArg::Accurate => ArchiveLayout::Accurate,
            LayoutArg::Custom => ArchiveLayout::Custom,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ClockArg {
    Localtime,
    Utc,
    Ptp,
}

impl From<ClockArg> for ArchiveClock {
    fn from(value: ClockArg) -> Self {
        match value {
            ClockArg::Localtime => ArchiveClock::LocalTime,
            ClockArg::Utc => ArchiveClock::Utc,
            ClockArg::Ptp => ArchiveClock::Ptp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VoxLevelArg {
    Rms,
    Peak,
    Any,
}

impl From<VoxLevelArg> for VoxLevelMode {
    fn from(value: VoxLevelArg) -> Self {
        match value {
            VoxLevelArg::Rms => VoxLevelMode::Rms,
            VoxLevelArg::Peak => VoxLevelMode::Peak,
            VoxLevelArg::Any => VoxLevelMode::Any,
        }
    }
}

/// 24/7 AES67 stream archiver.
#[derive(Debug, Parser)]
#[command(name = "aircheck", version, about = "24/7 AES67/RTP audio capture and archival engine")]
pub struct Cli {
    /// Archive root directory; enables rotated archive mode
    #[arg(long = "archive-root", value_name = "DIR", conflicts_with = "output")]
    pub archive_root: Option<PathBuf>,

    /// Record into a single file (no rotation)
    #[arg(short = 'o', value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Archive directory/file naming scheme
    #[arg(long = "archive-layout", value_enum, default_value_t = LayoutArg::Flat)]
    pub archive_layout: LayoutArg,

    /// strftime-style template, required with the custom layout
    #[arg(long = "archive-format", value_name = "STRFTIME")]
    pub archive_format: Option<String>,

    /// Rotation period in seconds; 0 disables rotation
    #[arg(long = "archive-period", value_name = "SEC", default_value_t = 3600)]
    pub archive_period: u32,

    /// Clock used for archive file names
    #[arg(long = "archive-clock", value_enum, default_value_t = ClockArg::Localtime)]
    pub archive_clock: ClockArg,

    /// Archive file extension without the dot (wav, opus or ogg)
    #[arg(long = "archive-suffix", value_name = "EXT", default_value = "wav")]
    pub archive_suffix: String,

    /// RTP multicast group to receive
    #[arg(short = 'm', value_name = "IP")]
    pub multicast: Option<Ipv4Addr>,

    /// RTP UDP port
    #[arg(short = 'p', value_name = "PORT", default_value_t = 5004)]
    pub port: u16,

    /// Expected RTP payload type
    #[arg(long = "pt", value_name = "N", default_value_t = 96)]
    pub payload_type: u8,

    /// Samples per RTP packet (per channel)
    #[arg(long = "spp", value_name = "N", default_value_t = 48)]
    pub samples_per_packet: u32,

    /// Network interface to bind the receive socket to
    #[arg(long, value_name = "NAME")]
    pub interface: Option<String>,

    /// Sample rate in Hz
    #[arg(short = 'r', value_name = "HZ", default_value_t = 48000)]
    pub sample_rate: u32,

    /// Channels to record
    #[arg(short = 'c', value_name = "N", default_value_t = 2)]
    pub channels: u16,

    /// Channels carried by the stream (defaults to the recorded count)
    #[arg(long = "stream-channels", value_name = "N")]
    pub stream_channels: Option<u16>,

    /// First stream channel to record
    #[arg(long = "channel-offset", value_name = "N", default_value_t = 0)]
    pub channel_offset: u16,

    /// Opus bitrate in bits/s; 0 selects the default for the channel count
    #[arg(long, value_name = "BPS", default_value_t = 0)]
    pub bitrate: u32,

    /// Variable bitrate Opus encoding (default)
    #[arg(long, conflicts_with = "cbr")]
    pub vbr: bool,

    /// Constant bitrate Opus encoding
    #[arg(long)]
    pub cbr: bool,

    /// Opus encoder complexity (0-10)
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub complexity: u8,

    /// Frame queue capacity in frames
    #[arg(short = 'Q', value_name = "N", default_value_t = 64)]
    pub queue_frames: usize,

    /// Frame pool size in frames
    #[arg(short = 'P', value_name = "N", default_value_t = 128)]
    pub pool_frames: usize,

    /// Samples per frame (per channel)
    #[arg(short = 'F', value_name = "N", default_value_t = 480)]
    pub samples_per_frame: u32,

    /// PTP hardware clock device (e.g. /dev/ptp0)
    #[arg(long = "ptp-device", value_name = "PATH")]
    pub ptp_device: Option<PathBuf>,

    /// Network interface whose PTP hardware clock to use
    #[arg(long = "ptp-interface", value_name = "NAME")]
    pub ptp_interface: Option<String>,

    /// Use the PTP-disciplined system clock
    #[arg(long = "ptp-software")]
    pub ptp_software: bool,

    /// Enable voice-activity gated recording
    #[arg(long)]
    pub vox: bool,

    /// VOX open threshold in dB
    #[arg(long = "vox-threshold", value_name = "DB", default_value_t = -40.0, allow_negative_numbers = true)]
    pub vox_threshold: f32,

    /// VOX close threshold in dB; 0 selects threshold - 5 dB
    #[arg(long = "vox-release", value_name = "DB", default_value_t = 0.0, allow_negative_numbers = true)]
    pub vox_release: f32,

    /// Audio must exceed the threshold this long before opening, in ms
    #[arg(long = "vox-detection", value_name = "MS", default_value_t = 100)]
    pub vox_detection: u32,

    /// Audio must stay quiet this long before closing, in ms
    #[arg(long = "vox-hangover", value_name = "MS", default_value_t = 1000)]
    pub vox_hangover: u32,

    /// Audio kept from before the trigger, in ms
    #[arg(long = "vox-preroll", value_name = "MS", default_value_t = 500)]
    pub vox_preroll: u32,

    /// Which level drives the VOX gate
    #[arg(long = "vox-level", value_enum, default_value_t = VoxLevelArg::Rms)]
    pub vox_level: VoxLevelArg,

    /// Emit one JSON level report per interval on stdout
    #[arg(long)]
    pub levels: bool,

    /// Level report interval in milliseconds
    #[arg(long = "levels-interval", value_name = "MS", default_value_t = 100)]
    pub levels_interval: u32,

    /// Jitter buffer depth in milliseconds
    #[arg(long = "jitter-depth", value_name = "MS", default_value_t = 10)]
    pub jitter_depth: u32,

    /// fsync archive files after writes and on close
    #[arg(long)]
    pub fsync: bool,

    /// Do not create intermediate archive directories
    #[arg(long = "no-mkdir")]
    pub no_mkdir: bool,

    /// Increase log verbosity (repeatable)
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    /// Decrease log verbosity (repeatable)
    #[arg(short = 'q', action = ArgAction::Count)]
    pub quiet: u8,
}

impl Cli {
    /// Log filter derived from -v/-q, before RUST_LOG overrides.
    pub fn log_level(&self) -> log::LevelFilter {
        let verbosity = 2 + self.verbose as i32 - self.quiet as i32;
        match verbosity {
            i32::MIN..=0 => log::LevelFilter::Error,
            1 => log::LevelFilter::Warn,
            2 => log::LevelFilter::Info,
            3 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

/// Fully validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub rtp: RtpInputConfig,
    pub ptp: PtpClockConfig,
    pub archive: ArchiveConfig,
    pub sink: SinkParams,
    pub meter: MeterConfig,
    pub vox: Option<VoxConfig>,
    pub worker: WorkerConfig,
    pub pool_frames: usize,
    pub queue_frames: usize,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let Some(multicast) = cli.multicast else {
            return Err(Error::InvalidConfig(
                "no input source: -m <multicast group> is required".into(),
            ));
        };
        if cli.archive_root.is_none() && cli.output.is_none() {
            return Err(Error::InvalidConfig(
                "either --archive-root or -o <path> is required".into(),
            ));
        }
        if cli.pool_frames < 2 || cli.queue_frames < 2 {
            return Err(Error::InvalidConfig(
                "pool and queue sizes must be at least 2".into(),
            ));
        }
        if cli.complexity > 10 {
            return Err(Error::InvalidConfig(format!(
                "complexity {} out of range 0-10",
                cli.complexity
            )));
        }
        if cli.ptp_software && (cli.ptp_device.is_some() || cli.ptp_interface.is_some()) {
            return Err(Error::InvalidConfig(
                "--ptp-software conflicts with --ptp-device/--ptp-interface".into(),
            ));
        }

        let stream_channels = cli.stream_channels.unwrap_or(cli.channels);

        // The sink format follows the archive suffix, or in single-file mode
        // the output path's extension.
        let format = match &cli.output {
            Some(path) => {
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .ok_or_else(|| {
                        Error::InvalidConfig(format!(
                            "cannot infer format from output path {}",
                            path.display()
                        ))
                    })?;
                SinkFormat::from_suffix(ext)?
            }
            None => SinkFormat::from_suffix(&cli.archive_suffix)?,
        };
        if format == SinkFormat::Opus {
            if ![8_000, 12_000, 16_000, 24_000, 48_000].contains(&cli.sample_rate) {
                return Err(Error::InvalidConfig(format!(
                    "opus archives require a sample rate of 8/12/16/24/48 kHz, got {}",
                    cli.sample_rate
                )));
            }
            if cli.channels > 2 {
                return Err(Error::InvalidConfig(format!(
                    "opus archives support 1 or 2 channels, got {}",
                    cli.channels
                )));
            }
        }

        let rtp = RtpInputConfig {
            multicast_addr: multicast,
            port: cli.port,
            interface: cli.interface.clone(),
            payload_type: cli.payload_type,
            sample_rate: cli.sample_rate,
            stream_channels,
            channel_offset: cli.channel_offset,
            output_channels: cli.channels,
            samples_per_packet: cli.samples_per_packet,
            depth_ms: cli.jitter_depth,
            samples_per_frame: cli.samples_per_frame,
        };

        let ptp = PtpClockConfig {
            device: cli.ptp_device.clone(),
            interface: cli.ptp_interface.clone(),
            software: cli.ptp_software,
        };

        let archive = ArchiveConfig {
            root: cli.archive_root.clone().unwrap_or_default(),
            layout: cli.archive_layout.into(),
            suffix: cli.archive_suffix.clone(),
            period_sec: cli.archive_period,
            clock: cli.archive_clock.into(),
            custom_format: cli.archive_format.clone(),
            create_dirs: !cli.no_mkdir,
            single_file: cli.output.clone(),
        };

        let sink = SinkParams {
            format,
            sample_rate: cli.sample_rate,
            channels: cli.channels,
            bitrate: cli.bitrate,
            vbr: !cli.cbr,
            complexity: cli.complexity,
            fsync: cli.fsync,
        };

        let meter = MeterConfig {
            sample_rate: cli.sample_rate,
            channels: cli.channels,
            interval_ms: cli.levels_interval,
        };

        let vox = cli.vox.then(|| VoxConfig {
            threshold_db: cli.vox_threshold,
            release_db: cli.vox_release,
            detection_ms: cli.vox_detection,
            hangover_ms: cli.vox_hangover,
            preroll_ms: cli.vox_preroll,
            level_mode: cli.vox_level.into(),
            sample_rate: cli.sample_rate,
            samples_per_frame: cli.samples_per_frame,
        });

        let worker = WorkerConfig {
            levels_enabled: cli.levels,
            ..WorkerConfig::default()
        };

        Ok(Self {
            rtp,
            ptp,
            archive,
            sink,
            meter,
            vox,
            worker,
            pool_frames: cli.pool_frames,
            queue_frames: cli.queue_frames,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("aircheck").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_minimal_archive_config() {
        let cli = parse(&["-m", "239.69.1.1", "--archive-root", "/var/archive"]);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.rtp.port, 5004);
        assert_eq!(config.rtp.payload_type, 96);
        assert_eq!(config.sink.format, SinkFormat::Wav);
        assert!(config.sink.vbr);
        assert!(config.archive.single_file.is_none());
        assert!(config.vox.is_none());
    }

    #[test]
    fn test_requires_input_and_destination() {
        let cli = parse(&["--archive-root", "/var/archive"]);
        assert!(matches!(
            Config::from_cli(cli),
            Err(Error::InvalidConfig(_))
        ));

        let cli = parse(&["-m", "239.69.1.1"]);
        assert!(matches!(
            Config::from_cli(cli),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_single_file_mode_infers_format() {
        let cli = parse(&["-m", "239.69.1.1", "-o", "/tmp/capture.opus"]);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.sink.format, SinkFormat::Opus);
        assert_eq!(
            config.archive.single_file,
            Some(PathBuf::from("/tmp/capture.opus"))
        );
    }

    #[test]
    fn test_output_conflicts_with_archive_root() {
        let result = Cli::try_parse_from([
            "aircheck",
            "-m",
            "239.69.1.1",
            "-o",
            "/tmp/a.wav",
            "--archive-root",
            "/var/archive",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_opus_rate_validation() {
        let cli = parse(&[
            "-m",
            "239.69.1.1",
            "--archive-root",
            "/a",
            "--archive-suffix",
            "opus",
            "-r",
            "44100",
        ]);
        assert!(matches!(
            Config::from_cli(cli),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_vox_options() {
        let cli = parse(&[
            "-m",
            "239.69.1.1",
            "--archive-root",
            "/a",
            "--vox",
            "--vox-threshold",
            "-30",
            "--vox-level",
            "any",
        ]);
        let config = Config::from_cli(cli).unwrap();
        let vox = config.vox.unwrap();
        assert_eq!(vox.threshold_db, -30.0);
        assert_eq!(vox.level_mode, VoxLevelMode::Any);
    }

    #[test]
    fn test_channel_subrange() {
        let cli = parse(&[
            "-m",
            "239.69.1.1",
            "--archive-root",
            "/a",
            "-c",
            "2",
            "--stream-channels",
            "8",
            "--channel-offset",
            "4",
        ]);
        let config = Config::from_cli(cli).unwrap();
        assert_eq!(config.rtp.stream_channels, 8);
        assert_eq!(config.rtp.channel_offset, 4);
        assert_eq!(config.rtp.output_channels, 2);
    }

    #[test]
    fn test_log_levels() {
        assert_eq!(
            parse(&["-m", "1.2.3.4", "-o", "/t.wav"]).log_level(),
            log::LevelFilter::Info
        );
        assert_eq!(
            parse(&["-m", "1.2.3.4", "-o", "/t.wav", "-v"]).log_level(),
            log::LevelFilter::Debug
        );
        assert_eq!(
            parse(&["-m", "1.2.3.4", "-o", "/t.wav", "-q", "-q"]).log_level(),
            log::LevelFilter::Error
        );
    }

    #[test]
    fn test_cbr_flag() {
        let cli = parse(&["-m", "239.69.1.1", "--archive-root", "/a", "--cbr"]);
        let config = Config::from_cli(cli).unwrap();
        assert!(!config.sink.vbr);
    }
}
