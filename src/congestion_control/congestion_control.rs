// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared vocabulary between the congestion-control core and its host
//! transport: the capability trait the core reads and writes the
//! connection through, the per-ACK rate sample it consumes, and the
//! diagnostic snapshot it exposes.

pub use bbr::Bbr;
pub use bbr::BbrInfo;

/// Microseconds per second.
pub const USEC_PER_SEC: u64 = 1_000_000;

/// Microseconds per millisecond.
pub const USEC_PER_MSEC: u64 = 1000;

/// Ticks per second of the coarse ("jiffy") clock. The transport is
/// expected to tick [`Transport::clock_jiffies`] once per millisecond.
pub const HZ: u64 = 1000;

/// Convert a millisecond duration to coarse-clock ticks.
pub const fn msecs_to_jiffies(ms: u64) -> u64 {
    ms * HZ / 1000
}

/// Host congestion-avoidance state, as reported through
/// [`Bbr::set_state`] and [`Transport::ca_state`].
///
/// The ordering matters: states at or above `Recovery` are the
/// loss-handling states, and the cwnd save/restore discipline compares
/// against that boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CaState {
    /// Normal operation, nothing suspicious.
    Open,

    /// Reordering observed, no loss assumed yet.
    Disorder,

    /// Congestion window reduction in response to local congestion
    /// notification.
    Cwr,

    /// Fast recovery, retransmitting presumed-lost packets.
    Recovery,

    /// Retransmission timeout fired; all outstanding data presumed lost.
    Loss,
}

/// Connection events surfaced to the core outside the ACK pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CwndEvent {
    /// A transmit is starting while no data was outstanding; the
    /// connection is restarting from an application-idle period.
    TxStart,
}

/// One delivery-rate sample, produced by the host transport per ACK.
///
/// `delivered` and `interval_us` describe the ACKed flight; a sample
/// with `delivered < 0` or `interval_us <= 0` carries no rate
/// information and is ignored by the model. `rtt_us < 0` means the ACK
/// produced no RTT measurement.
#[derive(Debug, Clone, Copy)]
pub struct RateSample {
    /// Packets delivered over the sampling interval.
    pub delivered: i64,

    /// The connection `delivered` count when the oldest newly-ACKed
    /// packet was sent. Round accounting compares this against the
    /// round sentinel.
    pub prior_delivered: u64,

    /// Length of the sampling interval in microseconds.
    pub interval_us: i64,

    /// RTT of the sample in microseconds, negative if unknown.
    pub rtt_us: i64,

    /// Packets newly marked lost on this ACK.
    pub losses: u32,

    /// Packets newly (S)ACKed on this ACK.
    pub acked_sacked: u32,

    /// Packets in flight before this ACK was processed.
    pub prior_in_flight: u32,

    /// The sample reflects application send behaviour, not path capacity.
    pub is_app_limited: bool,

    /// The ACK itself was delayed by the receiver.
    pub is_ack_delayed: bool,
}

impl Default for RateSample {
    fn default() -> Self {
        Self {
            delivered: 0,
            prior_delivered: 0,
            interval_us: 0,
            rtt_us: -1,
            losses: 0,
            acked_sacked: 0,
            prior_in_flight: 0,
            is_app_limited: false,
            is_ack_delayed: false,
        }
    }
}

/// The capability surface the core needs from its host transport.
///
/// One implementation per connection; the core holds no reference to it
/// and is handed `&mut T` on every hook invocation. All clocks are
/// monotonic and owned by the transport; the core keeps no timers.
pub trait Transport {
    /// Microsecond monotonic clock (the transport's ACK-processing
    /// timestamp).
    fn clock_us(&self) -> u64;

    /// Coarse monotonic clock, ticking at [`HZ`] (one tick per
    /// millisecond).
    fn clock_jiffies(&self) -> u64;

    /// Current congestion window, in packets.
    fn snd_cwnd(&self) -> u32;

    /// Write the congestion window, in packets.
    fn set_snd_cwnd(&mut self, cwnd: u32);

    /// Host-imposed ceiling on the congestion window, in packets.
    fn snd_cwnd_clamp(&self) -> u32;

    /// Current pacing rate, in bytes per second.
    fn pacing_rate(&self) -> u64;

    /// Write the pacing rate, in bytes per second.
    fn set_pacing_rate(&mut self, rate: u64);

    /// Host-imposed ceiling on the pacing rate, in bytes per second.
    fn max_pacing_rate(&self) -> u64;

    /// Ask the host to enable pacing enforcement if it has not already.
    fn request_pacing(&mut self);

    /// Right-shift applied to the pacing rate when budgeting a single
    /// TSO burst.
    fn pacing_shift(&self) -> u32;

    /// Largest burst the host's segmentation offload can emit, in bytes.
    fn gso_max_size(&self) -> u32;

    /// Current maximum segment size, in bytes.
    fn mss(&self) -> u32;

    /// Packets currently in flight.
    fn packets_in_flight(&self) -> u32;

    /// Total packets delivered over the lifetime of the connection.
    fn delivered(&self) -> u64;

    /// Microsecond timestamp of the most recent `delivered` update.
    fn delivered_mstamp(&self) -> u64;

    /// Total packets marked lost over the lifetime of the connection.
    fn lost(&self) -> u64;

    /// Smoothed RTT in microseconds, 0 if no RTT sample has been taken.
    fn srtt_us(&self) -> u64;

    /// The transport's own minimum-RTT estimate in microseconds,
    /// `u32::MAX` if unknown. Consumed once at init to seed the model.
    fn min_rtt_us(&self) -> u32;

    /// Current congestion-avoidance state.
    fn ca_state(&self) -> CaState;

    /// Whether the connection is currently application-limited.
    fn app_limited(&self) -> bool;

    /// Tag the current send window as application-limited, so rate
    /// samples taken from it are flagged accordingly. PROBE_RTT uses
    /// this to keep its deliberately tiny flight from polluting the
    /// bandwidth model.
    fn mark_app_limited(&mut self);

    /// Current slow-start threshold, in packets.
    fn ssthresh(&self) -> u32;

    /// Write the slow-start threshold, in packets.
    fn set_ssthresh(&mut self, ssthresh: u32);
}

mod bbr;
pub mod minmax;
