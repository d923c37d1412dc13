//! RTP input driver: multicast reception, jitter buffering, frame assembly.
//!
//! The receiver thread blocks on the socket with a short timeout so it can
//! poll its running flag, pushes packets through the jitter buffer, and
//! assembles the ordered output into pool frames that it hands to the SPSC
//! queue. Pool exhaustion and queue saturation are counted and absorbed here;
//! they never propagate.

use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use super::jitter::{JitterBuffer, JitterConfig, PopOutcome};
use super::rtp::{decode_channels, RtpPacket, SampleEncoding};
use crate::clock::{system_now_ns, PtpClock};
use crate::error::{Error, Result};
use crate::frame::{queue::FrameQueue, FrameHandle, FramePool};

/// Supported AES67 sample rates.
const SUPPORTED_RATES: [u32; 3] = [44_100, 48_000, 96_000];

/// Socket read timeout; bounds how long stop() waits for the receiver to
/// notice its flag.
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Capture→frame contract for input drivers. An implementation produces
/// timestamped frames into the shared queue between `start` and `stop`.
pub trait InputDriver: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self);
    /// False once the driver has stopped or died on a fatal socket error.
    fn is_healthy(&self) -> bool;
    fn stats(&self) -> InputStats;
}

/// RTP input configuration.
#[derive(Debug, Clone)]
pub struct RtpInputConfig {
    /// Multicast group address
    pub multicast_addr: Ipv4Addr,
    /// UDP port (5004 is the RTP default)
    pub port: u16,
    /// Optional interface name to bind the socket to
    pub interface: Option<String>,
    /// Expected RTP payload type
    pub payload_type: u8,
    /// Stream sample rate in Hz
    pub sample_rate: u32,
    /// Channels carried by the stream
    pub stream_channels: u16,
    /// First stream channel to capture
    pub channel_offset: u16,
    /// Channels to capture
    pub output_channels: u16,
    /// Samples per RTP packet (per channel)
    pub samples_per_packet: u32,
    /// Jitter buffer depth in milliseconds
    pub depth_ms: u32,
    /// Sample frames per assembled output frame
    pub samples_per_frame: u32,
}

impl RtpInputConfig {
    fn validate(&self) -> Result<()> {
        if !SUPPORTED_RATES.contains(&self.sample_rate) {
            return Err(Error::InvalidConfig(format!(
                "unsupported sample rate {} (expected one of {:?})",
                self.sample_rate, SUPPORTED_RATES
            )));
        }
        if self.output_channels == 0 || self.output_channels > 32 {
            return Err(Error::InvalidConfig(format!(
                "unsupported channel count {}",
                self.output_channels
            )));
        }
        if self.stream_channels < self.channel_offset + self.output_channels {
            return Err(Error::InvalidConfig(format!(
                "channel range [{}, {}) exceeds the {}-channel stream",
                self.channel_offset,
                self.channel_offset + self.output_channels,
                self.stream_channels
            )));
        }
        if self.payload_type > 127 {
            return Err(Error::InvalidConfig(format!(
                "invalid payload type {}",
                self.payload_type
            )));
        }
        if self.samples_per_packet == 0 {
            return Err(Error::InvalidConfig("samples per packet must be nonzero".into()));
        }
        if self.samples_per_frame == 0 {
            return Err(Error::InvalidConfig("samples per frame must be nonzero".into()));
        }
        Ok(())
    }
}

/// Counters owned by the input driver itself (jitter counters live inside the
/// jitter buffer's critical section).
#[derive(Default)]
struct InputCounters {
    packets_invalid: AtomicU64,
    pool_drops: AtomicU64,
    queue_drops: AtomicU64,
    frames_produced: AtomicU64,
}

/// Snapshot of all input-side statistics.
#[derive(Debug, Default, Clone)]
pub struct InputStats {
    pub packets_received: u64,
    pub packets_invalid: u64,
    pub packets_reordered: u64,
    pub packets_late: u64,
    pub packets_lost: u64,
    pub packets_played: u64,
    pub pool_drops: u64,
    pub queue_drops: u64,
    pub frames_produced: u64,
}

/// AES67 RTP input driver.
pub struct RtpInput {
    config: RtpInputConfig,
    clock: Arc<PtpClock>,
    pool: Arc<FramePool>,
    queue: Arc<FrameQueue>,
    jitter: Arc<Mutex<JitterBuffer>>,
    counters: Arc<InputCounters>,
    running: Arc<AtomicBool>,
    ended: Arc<AtomicBool>,
    receiver_thread: Option<JoinHandle<()>>,
}

impl RtpInput {
    pub fn new(
        config: RtpInputConfig,
        clock: Arc<PtpClock>,
        pool: Arc<FramePool>,
        queue: Arc<FrameQueue>,
    ) -> Result<Self> {
        config.validate()?;
        let jitter = JitterBuffer::new(&JitterConfig {
            depth_ms: config.depth_ms,
            sample_rate: config.sample_rate,
            samples_per_packet: config.samples_per_packet,
            reset_threshold: JitterConfig::DEFAULT_RESET_THRESHOLD,
        });
        Ok(Self {
            config,
            clock,
            pool,
            queue,
            jitter: Arc::new(Mutex::new(jitter)),
            counters: Arc::new(InputCounters::default()),
            running: Arc::new(AtomicBool::new(false)),
            ended: Arc::new(AtomicBool::new(false)),
            receiver_thread: None,
        })
    }

    /// Create and configure the multicast UDP socket.
    fn create_multicast_socket(&self) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| Error::Network(format!("failed to create socket: {}", e)))?;

        // Allow address reuse (important for quick restarts)
        socket
            .set_reuse_address(true)
            .map_err(|e| Error::Network(format!("failed to set reuse address: {}", e)))?;

        let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.config.port);
        socket
            .bind(&bind_addr.into())
            .map_err(|e| Error::Network(format!("failed to bind to {}: {}", bind_addr, e)))?;

        #[cfg(target_os = "linux")]
        if let Some(iface) = &self.config.interface {
            socket
                .bind_device(Some(iface.as_bytes()))
                .map_err(|e| Error::Network(format!("failed to bind to {}: {}", iface, e)))?;
        }

        // Generous receive buffer for multicast bursts
        let _ = socket.set_recv_buffer_size(1024 * 1024);

        socket
            .join_multicast_v4(&self.config.multicast_addr, &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| {
                Error::Network(format!(
                    "failed to join multicast group {}: {}",
                    self.config.multicast_addr, e
                ))
            })?;

        // Short timeout so the receiver polls its running flag
        socket
            .set_read_timeout(Some(RECV_TIMEOUT))
            .map_err(|e| Error::Network(format!("failed to set read timeout: {}", e)))?;

        Ok(socket.into())
    }

    fn snapshot(&self) -> InputStats {
        let jitter = self.jitter.lock();
        let js = jitter.stats();
        InputStats {
            packets_received: js.packets_received,
            packets_reordered: js.packets_reordered,
            packets_late: js.packets_late,
            packets_lost: js.packets_lost,
            packets_played: js.packets_played,
            packets_invalid: self.counters.packets_invalid.load(Ordering::Relaxed),
            pool_drops: self.counters.pool_drops.load(Ordering::Relaxed),
            queue_drops: self.counters.queue_drops.load(Ordering::Relaxed),
            frames_produced: self.counters.frames_produced.load(Ordering::Relaxed),
        }
    }

    /// Receiver thread: the single producer for the frame queue.
    fn receiver_loop(
        socket: UdpSocket,
        config: RtpInputConfig,
        clock: Arc<PtpClock>,
        jitter: Arc<Mutex<JitterBuffer>>,
        counters: Arc<InputCounters>,
        running: Arc<AtomicBool>,
        ended: Arc<AtomicBool>,
        pool: Arc<FramePool>,
        queue: Arc<FrameQueue>,
    ) {
        let out_channels = config.output_channels as usize;
        let mut buf = [0u8; 2048];
        let mut payload = Vec::with_capacity(2048);
        let mut samples = vec![0.0f32; config.samples_per_packet as usize * out_channels];
        let mut assembler = FrameAssembler::new(
            pool,
            queue,
            Arc::clone(&clock),
            Arc::clone(&counters),
            config.samples_per_frame as usize,
            config.output_channels,
            config.sample_rate,
        );

        while running.load(Ordering::Acquire) {
            match socket.recv(&mut buf) {
                Ok(len) => {
                    let Some(packet) = RtpPacket::parse(&buf[..len]) else {
                        counters.packets_invalid.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    if packet.payload_type != config.payload_type {
                        counters.packets_invalid.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    let mut arrival_ns = clock.now_ns();
                    if arrival_ns == 0 {
                        arrival_ns = system_now_ns();
                    }
                    if !clock.has_rtp_epoch() {
                        clock.set_rtp_epoch(packet.timestamp, arrival_ns, config.sample_rate);
                    }

                    jitter.lock().insert(
                        packet.sequence,
                        packet.timestamp,
                        arrival_ns,
                        packet.payload,
                    );

                    Self::drain_ready(
                        &config,
                        &clock,
                        &jitter,
                        &counters,
                        &mut assembler,
                        &mut payload,
                        &mut samples,
                    );
                }
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    log::error!("rtp input: fatal socket error: {}", e);
                    break;
                }
            }
        }

        ended.store(true, Ordering::Release);
    }

    /// Pull everything the jitter buffer is willing to play and feed the
    /// assembler.
    fn drain_ready(
        config: &RtpInputConfig,
        clock: &PtpClock,
        jitter: &Mutex<JitterBuffer>,
        counters: &InputCounters,
        assembler: &mut FrameAssembler,
        payload: &mut Vec<u8>,
        samples: &mut [f32],
    ) {
        loop {
            let mut now_ns = clock.now_ns();
            if now_ns == 0 {
                now_ns = system_now_ns();
            }
            let outcome = {
                let mut jb = jitter.lock();
                if !jb.ready(now_ns) {
                    return;
                }
                jb.pop(payload)
            };
            match outcome {
                PopOutcome::Packet { rtp_ts, arrival_ns } => {
                    let Some(encoding) = SampleEncoding::detect(
                        payload.len(),
                        config.stream_channels,
                        config.samples_per_packet,
                    ) else {
                        counters.packets_invalid.fetch_add(1, Ordering::Relaxed);
                        continue;
                    };
                    let frames = decode_channels(
                        payload,
                        encoding,
                        config.stream_channels,
                        config.channel_offset,
                        config.output_channels,
                        samples,
                    );
                    assembler.push_samples(
                        &samples[..frames * config.output_channels as usize],
                        rtp_ts,
                        arrival_ns,
                    );
                }
                PopOutcome::Lost => continue,
                PopOutcome::Empty => return,
            }
        }
    }
}

impl InputDriver for RtpInput {
    fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::Acquire) {
            return Err(Error::Network("input already running".into()));
        }

        let socket = self.create_multicast_socket()?;

        self.running.store(true, Ordering::Release);
        self.ended.store(false, Ordering::Release);

        let config = self.config.clone();
        let clock = Arc::clone(&self.clock);
        let jitter = Arc::clone(&self.jitter);
        let counters = Arc::clone(&self.counters);
        let running = Arc::clone(&self.running);
        let ended = Arc::clone(&self.ended);
        let pool = Arc::clone(&self.pool);
        let queue = Arc::clone(&self.queue);

        self.receiver_thread = Some(thread::spawn(move || {
            Self::receiver_loop(
                socket, config, clock, jitter, counters, running, ended, pool, queue,
            );
        }));

        log::info!(
            "rtp input: listening on {}:{} (pt {}, {} Hz, channels [{}, {}) of {})",
            self.config.multicast_addr,
            self.config.port,
            self.config.payload_type,
            self.config.sample_rate,
            self.config.channel_offset,
            self.config.channel_offset + self.config.output_channels,
            self.config.stream_channels,
        );
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.receiver_thread.take() {
            let _ = thread.join();
        }
        let stats = self.stats();
        log::info!(
            "rtp input: stopped ({} packets, {} invalid, {} late, {} lost, {} frames, {} pool drops, {} queue drops)",
            stats.packets_received,
            stats.packets_invalid,
            stats.packets_late,
            stats.packets_lost,
            stats.frames_produced,
            stats.pool_drops,
            stats.queue_drops,
        );
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.ended.load(Ordering::Acquire)
    }

    fn stats(&self) -> InputStats {
        self.snapshot()
    }
}

impl Drop for RtpInput {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            self.stop();
        }
    }
}

/// Accumulates decoded samples into pool frames and hands full frames to the
/// queue. On back-pressure the data is dropped but the handle is kept, so
/// this thread never releases to the pool.
struct FrameAssembler {
    pool: Arc<FramePool>,
    queue: Arc<FrameQueue>,
    clock: Arc<PtpClock>,
    counters: Arc<InputCounters>,
    samples_per_frame: usize,
    channels: u16,
    sample_rate: u32,
    current: Option<FrameHandle>,
    fill: usize,
    frame_rtp_ts: u32,
}

impl FrameAssembler {
    fn new(
        pool: Arc<FramePool>,
        queue: Arc<FrameQueue>,
        clock: Arc<PtpClock>,
        counters: Arc<InputCounters>,
        samples_per_frame: usize,
        channels: u16,
        sample_rate: u32,
    ) -> Self {
        Self {
            pool,
            queue,
            clock,
            counters,
            samples_per_frame,
            channels,
            sample_rate,
            current: None,
            fill: 0,
            frame_rtp_ts: 0,
        }
    }

    /// Append interleaved samples whose first sample frame carries RTP
    /// timestamp `rtp_ts`.
    fn push_samples(&mut self, samples: &[f32], rtp_ts: u32, arrival_ns: u64) {
        let ch = self.channels as usize;
        let total = samples.len() / ch;
        let mut offset = 0;

        while offset < total {
            if self.current.is_none() {
                match self.pool.acquire() {
                    Some(frame) => self.current = Some(frame),
                    None => {
                        self.counters.pool_drops.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
            if self.fill == 0 {
                self.frame_rtp_ts = rtp_ts.wrapping_add(offset as u32);
            }

            let Some(frame) = self.current.as_mut() else {
                return;
            };
            let space = self.samples_per_frame - self.fill;
            let take = space.min(total - offset);
            let dst = self.fill * ch;
            frame.buffer_mut()[dst..dst + take * ch]
                .copy_from_slice(&samples[offset * ch..(offset + take) * ch]);
            self.fill += take;
            offset += take;

            if self.fill == self.samples_per_frame {
                self.finish_frame(arrival_ns);
            }
        }
    }

    fn finish_frame(&mut self, arrival_ns: u64) {
        let Some(mut frame) = self.current.take() else {
            return;
        };
        frame.set_sample_frames(self.fill);
        let mut timestamp_ns = self.clock.rtp_to_ns(self.frame_rtp_ts, self.sample_rate);
        if timestamp_ns == 0 {
            // Clock unavailable or epoch unset; the arrival time is the best
            // estimate we have.
            timestamp_ns = arrival_ns;
        }
        frame.set_timestamp_ns(timestamp_ns);

        self.fill = 0;
        match self.queue.push(frame) {
            Ok(()) => {
                self.counters.frames_produced.fetch_add(1, Ordering::Relaxed);
            }
            Err(frame) => {
                // Queue full: count the drop, keep the handle for reuse.
                self.counters.queue_drops.fetch_add(1, Ordering::Relaxed);
                self.current = Some(frame);
            }
        }
    }
}
