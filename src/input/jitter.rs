//! Jitter buffer for AES67 RTP streams.
//!
//! A circular slot array indexed by `seq % buffer_size` reorders packets and
//! paces playout. Insert runs on the network thread and get on the worker
//! thread, so the owning driver wraps the buffer in a short-lived mutex.

use super::rtp::seq_delta;

/// Statistics for monitoring jitter buffer health
#[derive(Debug, Default, Clone)]
pub struct JitterStats {
    pub packets_received: u64,
    pub packets_played: u64,
    pub packets_late: u64,
    pub packets_lost: u64,
    pub packets_duplicate: u64,
    pub packets_reordered: u64,
    pub slot_collisions: u64,
    pub stream_resets: u64,
    pub max_depth: usize,
}

/// Construction parameters.
#[derive(Debug, Clone)]
pub struct JitterConfig {
    /// Target playout delay in milliseconds
    pub depth_ms: u32,
    /// Audio sample rate in Hz
    pub sample_rate: u32,
    /// Samples per RTP packet (per channel)
    pub samples_per_packet: u32,
    /// Negative delta beyond which a late packet is treated as a stream reset
    pub reset_threshold: i32,
}

impl JitterConfig {
    pub const DEFAULT_RESET_THRESHOLD: i32 = 3000;
}

struct Slot {
    seq: u16,
    rtp_ts: u32,
    arrival_ns: u64,
    payload: Vec<u8>,
    valid: bool,
}

impl Slot {
    fn empty() -> Self {
        Self {
            seq: 0,
            rtp_ts: 0,
            arrival_ns: 0,
            payload: Vec::with_capacity(MAX_PAYLOAD_BYTES),
            valid: false,
        }
    }
}

/// Result of a `pop` call.
#[derive(Debug, PartialEq, Eq)]
pub enum PopOutcome {
    /// The expected packet; payload copied into the caller's buffer.
    Packet { rtp_ts: u32, arrival_ns: u64 },
    /// The expected packet was declared lost and skipped.
    Lost,
    /// Nothing to play yet.
    Empty,
}

// Largest AES67 payload we expect (8ch * 48 samples * 3 bytes < 1452).
const MAX_PAYLOAD_BYTES: usize = 1452;

const MIN_BUFFER_SLOTS: u64 = 16;
const MAX_BUFFER_SLOTS: u64 = 1024;
const MIN_LOSS_THRESHOLD: u64 = 4;

/// RTP packet reordering buffer with loss and late detection.
pub struct JitterBuffer {
    slots: Vec<Slot>,
    started: bool,
    next_seq: u16,
    highest_seq: u16,
    playout_time_ns: u64,
    depth_ns: u64,
    packet_duration_ns: u64,
    loss_threshold: i32,
    reset_threshold: i32,
    occupied: usize,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(config: &JitterConfig) -> Self {
        let rate = config.sample_rate.max(1) as u64;
        let spp = config.samples_per_packet.max(1) as u64;
        let depth = config.depth_ms as u64;

        // packets_per_ms * depth_ms * 2, clamped
        let window = rate * depth * 2 / (spp * 1000);
        let size = window.clamp(MIN_BUFFER_SLOTS, MAX_BUFFER_SLOTS) as usize;
        let loss_threshold = window.max(MIN_LOSS_THRESHOLD) as i32;

        Self {
            slots: (0..size).map(|_| Slot::empty()).collect(),
            started: false,
            next_seq: 0,
            highest_seq: 0,
            playout_time_ns: 0,
            depth_ns: depth * 1_000_000,
            packet_duration_ns: spp * 1_000_000_000 / rate,
            loss_threshold,
            reset_threshold: config.reset_threshold,
            occupied: 0,
            stats: JitterStats::default(),
        }
    }

    fn slot_index(&self, seq: u16) -> usize {
        seq as usize % self.slots.len()
    }

    fn clear_all_slots(&mut self) {
        for slot in &mut self.slots {
            slot.valid = false;
        }
        self.occupied = 0;
    }

    fn init_window(&mut self, seq: u16, arrival_ns: u64) {
        self.next_seq = seq;
        self.highest_seq = seq;
        self.playout_time_ns = arrival_ns + self.depth_ns;
        self.started = true;
    }

    /// Insert a received packet.
    pub fn insert(&mut self, seq: u16, rtp_ts: u32, arrival_ns: u64, payload: &[u8]) {
        self.stats.packets_received += 1;

        if !self.started {
            self.init_window(seq, arrival_ns);
        }

        let delta = seq_delta(self.next_seq, seq);
        if delta < 0 {
            if -delta > self.reset_threshold {
                // The far side restarted; start a fresh window on this packet.
                self.stats.stream_resets += 1;
                self.clear_all_slots();
                self.init_window(seq, arrival_ns);
            } else {
                self.stats.packets_late += 1;
                return;
            }
        } else if delta as usize > self.slots.len() - 1 {
            // Far ahead of the window: slide forward, everything skipped is
            // lost even if it may still arrive.
            let target = seq.wrapping_sub((self.slots.len() - 1) as u16);
            while seq_delta(self.next_seq, target) > 0 {
                let idx = self.slot_index(self.next_seq);
                if self.slots[idx].valid {
                    self.slots[idx].valid = false;
                    self.occupied -= 1;
                }
                self.stats.packets_lost += 1;
                self.next_seq = self.next_seq.wrapping_add(1);
                self.playout_time_ns += self.packet_duration_ns;
            }
        }

        if seq_delta(seq, self.highest_seq) > 0 {
            // Arrived behind the newest packet but still playable.
            self.stats.packets_reordered += 1;
        } else if seq_delta(self.highest_seq, seq) > 0 {
            self.highest_seq = seq;
        }

        let idx = self.slot_index(seq);
        let slot = &mut self.slots[idx];
        if slot.valid {
            if slot.seq == seq {
                self.stats.packets_duplicate += 1;
                return;
            }
            self.stats.slot_collisions += 1;
        } else {
            self.occupied += 1;
        }
        slot.seq = seq;
        slot.rtp_ts = rtp_ts;
        slot.arrival_ns = arrival_ns;
        slot.payload.clear();
        slot.payload.extend_from_slice(payload);
        slot.valid = true;

        if self.occupied > self.stats.max_depth {
            self.stats.max_depth = self.occupied;
        }
    }

    /// Whether a call to `pop` would make progress at time `now_ns`.
    pub fn ready(&self, now_ns: u64) -> bool {
        if !self.started || now_ns < self.playout_time_ns {
            return false;
        }
        let idx = self.slot_index(self.next_seq);
        let expected_present = self.slots[idx].valid && self.slots[idx].seq == self.next_seq;
        expected_present || seq_delta(self.next_seq, self.highest_seq) > self.loss_threshold
    }

    /// Take the next packet in sequence. On `Packet` the payload is copied
    /// into `payload_out` and the window advances; on `Lost` the window
    /// advances past a packet declared lost.
    pub fn pop(&mut self, payload_out: &mut Vec<u8>) -> PopOutcome {
        if !self.started {
            return PopOutcome::Empty;
        }

        let idx = self.slot_index(self.next_seq);
        if self.slots[idx].valid && self.slots[idx].seq == self.next_seq {
            let slot = &mut self.slots[idx];
            payload_out.clear();
            payload_out.extend_from_slice(&slot.payload);
            let outcome = PopOutcome::Packet {
                rtp_ts: slot.rtp_ts,
                arrival_ns: slot.arrival_ns,
            };
            slot.valid = false;
            self.occupied -= 1;
            self.stats.packets_played += 1;
            self.next_seq = self.next_seq.wrapping_add(1);
            self.playout_time_ns += self.packet_duration_ns;
            return outcome;
        }

        if seq_delta(self.next_seq, self.highest_seq) > self.loss_threshold {
            self.stats.packets_lost += 1;
            self.next_seq = self.next_seq.wrapping_add(1);
            self.playout_time_ns += self.packet_duration_ns;
            return PopOutcome::Lost;
        }

        PopOutcome::Empty
    }

    /// Current number of buffered packets
    pub fn depth(&self) -> usize {
        self.occupied
    }

    pub fn stats(&self) -> &JitterStats {
        &self.stats
    }

    /// Reset the buffer (e.g., on stream restart)
    pub fn reset(&mut self) {
        self.clear_all_slots();
        self.started = false;
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.len()
    }
}
