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

//! BBR Congestion Control.
//!
//! BBR uses recent measurements of a transport connection's delivery rate
//! and round-trip time to build an explicit model of the network path:
//! the maximum recent bandwidth available to the connection, and its
//! minimum recent round-trip delay. BBR then uses this model to control
//! both how fast it sends data and the maximum amount of data it allows
//! in flight in the network at any time.
//!
//! State transition diagram:
//!
//! ```text
//!             |
//!             V
//!    +---> STARTUP  ----+
//!    |        |         |
//!    |        V         |
//!    |      DRAIN   ----+
//!    |        |         |
//!    |        V         |
//!    +---> PROBE_BW ----+
//!    |      ^    |      |
//!    |      |    |      |
//!    |      +----+      |
//!    |                  |
//!    +---- PROBE_RTT <--+
//! ```
//!
//! A flow starts in STARTUP and ramps up its sending rate quickly; when
//! it estimates the pipe is full it enters DRAIN to drain the queue. In
//! steady state the flow cycles between PROBE_BW and, when the min_rtt
//! estimate goes stale, PROBE_RTT.
//!
//! See "BBR: Congestion-Based Congestion Control", Cardwell, Cheng,
//! Gunn, Hassas Yeganeh, Jacobson. ACM Queue, Vol. 14 No. 5, 2016, and
//! <https://datatracker.ietf.org/doc/html/draft-cardwell-iccrg-bbr-congestion-control-00>.

extern crate rand;

use log::*;
use rand::Rng;
use serde::Serialize;

use super::minmax::WindowedFilter;
use super::msecs_to_jiffies;
use super::CaState;
use super::CwndEvent;
use super::RateSample;
use super::Transport;
use super::HZ;
use super::USEC_PER_MSEC;
use super::USEC_PER_SEC;

/// Scale factor for rates in pkt/µs to avoid truncation in bandwidth
/// estimation. One scaled unit is roughly (1500 bytes / 1 µs / 2^24)
/// ~= 715 bps, which handles bandwidths from 0.06 pkt/s up to 256 Mpkt/s
/// (3 Tbps with 1500-byte packets). The minimum window of 4 packets
/// keeps the lower bound out of reach.
pub const BW_SCALE: u32 = 24;

/// One pkt/µs, in scaled rate units.
pub const BW_UNIT: u64 = 1 << BW_SCALE;

/// Scale factor for fractions in BBR (e.g. gains): a gain is a rational
/// number scaled by 2^8, so 5/4 is stored as 320.
pub const BBR_SCALE: u32 = 8;

/// A gain of 1.0, in scaled gain units.
pub const BBR_UNIT: u32 = 1 << BBR_SCALE;

/// Number of phases in a PROBE_BW pacing gain cycle.
const CYCLE_LEN: usize = 8;

/// Window length of the bandwidth max filter, in packet-timed rounds.
const BW_RTTS: u64 = CYCLE_LEN as u64 + 2;

/// Window length of the min_rtt filter, in seconds.
const MIN_RTT_WIN_SEC: u64 = 10;

/// Minimum time spent at the in-flight floor in PROBE_RTT, in ms.
const PROBE_RTT_MODE_MS: u64 = 200;

/// Skip TSO below this pacing rate (bits/sec).
const MIN_TSO_RATE: u64 = 1_200_000;

/// Pace at ~1% below the estimated bw, on average, to reduce the queue
/// at the bottleneck and drive the network toward low delay while
/// keeping utilization high.
const PACING_MARGIN_PERCENT: u64 = 1;

/// 2/ln(2) is the smallest pacing gain that lets a smoothly paced
/// sender double its delivery rate each round, sending the same number
/// of packets per RTT that an un-paced slow-starting Reno or CUBIC flow
/// would. The +1 keeps the scaled value strictly above the break-even
/// point.
const HIGH_GAIN: u32 = BBR_UNIT * 2885 / 1000 + 1;

/// The inverse of the STARTUP gain, which typically drains the queue
/// created in STARTUP within one round.
const DRAIN_GAIN: u32 = BBR_UNIT * 1000 / 2885;

/// The steady-state cwnd gain, sized to tolerate delayed and stretched
/// ACKs.
const CWND_GAIN: u32 = BBR_UNIT * 2;

/// The pacing gain values for the PROBE_BW cycle: probe for more
/// bandwidth, then drain the queue and/or yield bandwidth to other
/// flows, then cruise at 1.0 without creating excess queue.
const PACING_GAIN: [u32; CYCLE_LEN] = [
    BBR_UNIT * 5 / 4,
    BBR_UNIT * 3 / 4,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
    BBR_UNIT,
];

/// Randomize the starting gain cycling phase over N phases.
const CYCLE_RAND: u32 = 7;

/// Try to keep at least this many packets in flight. A sliding-window
/// protocol ACKing every other packet needs at least 4 packets in
/// flight to function smoothly.
const CWND_MIN_TARGET: u32 = 4;

/// If bw has grown by at least this factor (5/4) in a round, STARTUP
/// may still have more bandwidth available.
const FULL_BW_THRESH: u64 = BBR_UNIT as u64 * 5 / 4;

/// After this many rounds without significant bw growth, estimate the
/// pipe is full. Three rounds: the receive window autotunes, the sender
/// fills the larger window, the higher delivery rate gets measured.
const FULL_BW_CNT: u32 = 3;

/// Minimum number of rounds in a long-term bw sampling interval.
const LT_INTVL_MIN_RTTS: u32 = 4;

/// A lost/delivered ratio above 50/256 (~20%) makes an interval
/// "lossy", a sign the flow may be policed.
const LT_LOSS_THRESH: u64 = 50;

/// Two intervals whose bw ratio differs by no more than 1/8 are
/// "consistent".
const LT_BW_RATIO: u64 = BBR_UNIT as u64 / 8;

/// Two intervals whose bw differs by no more than 4 Kbit/s are also
/// "consistent".
const LT_BW_DIFF: u64 = 4000 / 8;

/// Once policing is inferred, use lt_bw for this many round trips.
const LT_BW_MAX_RTTS: u32 = 48;

/// Gain factor for adding extra_acked to the target cwnd.
const EXTRA_ACKED_GAIN: u32 = BBR_UNIT;

/// Window length of the extra_acked max filter, in round trips.
const EXTRA_ACKED_WIN_RTTS: u32 = 5;

/// Max allowed value of ack_epoch_acked, after which the sampling epoch
/// is reset.
const ACK_EPOCH_ACKED_RESET_THRESH: u64 = 1 << 20;

/// Time period for clamping the cwnd increment due to ack aggregation.
const EXTRA_ACKED_MAX_US: u64 = 100 * 1000;

/// Default initial congestion window, in packets, used while the model
/// has no valid RTT sample.
const TCP_INIT_CWND: u32 = 10;

/// Upper bound on a generic segmentation-offload burst, in bytes.
const GSO_MAX_SIZE: u32 = 65536;

/// Worst-case per-segment header budget reserved out of a GSO burst.
const MAX_TCP_HEADER: u32 = 320;

/// PROBE_BW phase data: the current index into the pacing gain cycle
/// and the time the phase started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProbeBw {
    /// Current index in the pacing gain cycle array.
    cycle_idx: usize,

    /// Delivered timestamp (µs) at which this cycle phase started.
    cycle_mstamp: u64,
}

/// PROBE_RTT exit conditions: the earliest permissible exit time, armed
/// once in-flight first reaches the floor, and whether a full round has
/// elapsed since then.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProbeRtt {
    /// Coarse-clock time after which PROBE_RTT may end, `None` until
    /// in-flight first drops to the floor.
    done_stamp: Option<u64>,

    /// A full packet-timed round elapsed at the in-flight floor.
    round_done: bool,
}

/// The BBR state machine modes for deciding how fast to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Ramp up the sending rate rapidly to fill the pipe.
    Startup,

    /// Drain any queue created during startup.
    Drain,

    /// Discover and share bandwidth: pace around the estimated bw.
    ProbeBw(ProbeBw),

    /// Cut in-flight to the minimum to probe min_rtt.
    ProbeRtt(ProbeRtt),
}

impl Mode {
    fn is_probe_bw(&self) -> bool {
        matches!(self, Mode::ProbeBw(_))
    }

    fn is_probe_rtt(&self) -> bool {
        matches!(self, Mode::ProbeRtt(_))
    }
}

/// Packet-timed round trip accounting. A round starts at the
/// transmission of some segment and ends at the ACK of a segment sent
/// after it.
#[derive(Debug, Default)]
struct RoundTripCounter {
    /// Count of packet-timed rounds elapsed.
    rtt_cnt: u32,

    /// Connection `delivered` value that marks the end of the current
    /// round.
    next_rtt_delivered: u64,

    /// Set once per round, on the ACK that advances `rtt_cnt`.
    round_start: bool,
}

/// STARTUP pipe-full detector: watches for a plateau in the windowed
/// max bandwidth.
#[derive(Debug, Default)]
struct FullBandwidthEstimator {
    /// The pipe has been estimated full at least once.
    reached: bool,

    /// Recent bw baseline, to estimate if the pipe is full.
    bw: u64,

    /// Rounds elapsed without large bw growth.
    cnt: u32,
}

/// Long-term ("LT") bandwidth sampler, used to detect token-bucket
/// traffic policers and model their policed rate explicitly. See
/// "An Internet-Wide Analysis of Traffic Policing", SIGCOMM 2016.
#[derive(Debug, Default)]
struct LongTermEstimator {
    /// Currently taking long-term samples.
    is_sampling: bool,

    /// Round trips elapsed in the current interval, or spent using
    /// `bw` once engaged.
    rtt_cnt: u32,

    /// Use `bw` as the path bandwidth estimate.
    use_bw: bool,

    /// Long-term estimated delivery rate in pkt/µs << 24.
    bw: u64,

    /// Connection `delivered` at the interval start.
    last_delivered: u64,

    /// Connection `lost` at the interval start.
    last_lost: u64,

    /// Delivered timestamp at the interval start, in ms.
    last_stamp: u64,
}

/// ACK aggregation estimator: the windowed max of data ACKed beyond
/// what the bandwidth model expected over the epoch, used to provision
/// extra in-flight data so sending continues across inter-ACK silences.
#[derive(Debug, Default)]
struct AckAggregationEstimator {
    /// Start of the ACK sampling epoch, in µs.
    epoch_mstamp: u64,

    /// Packets (S)ACKed in the sampling epoch.
    epoch_acked: u64,

    /// Max excess data ACKed in recent epochs, two sliding slots.
    extra_acked: [u64; 2],

    /// Age of the current slot, in round trips.
    win_rtts: u32,

    /// Slot currently being filled.
    win_idx: usize,
}

/// BBR congestion control block, one per connection.
///
/// All state mutation happens through the per-ACK pipeline
/// ([`Bbr::cong_control`]) and the event hooks; the block does no I/O,
/// owns no timers, and allocates nothing after construction.
#[derive(Debug)]
pub struct Bbr {
    /// Current mode in the state machine.
    mode: Mode,

    /// Min RTT seen in the min_rtt_win_sec window, `u32::MAX` until a
    /// valid sample arrives.
    min_rtt_us: u32,

    /// Coarse-clock timestamp of the current `min_rtt_us`, anchoring
    /// the 10-second window.
    min_rtt_stamp: u64,

    /// Windowed max filter over recent delivery rate samples, in
    /// pkt/µs << 24, timed in packet rounds.
    bw_filter: WindowedFilter,

    /// Packet-timed round accounting.
    round: RoundTripCounter,

    /// STARTUP pipe-full detection.
    full_bw: FullBandwidthEstimator,

    /// Long-term (policer) bandwidth estimation.
    lt: LongTermEstimator,

    /// ACK aggregation estimation.
    ack_aggr: AckAggregationEstimator,

    /// Current gain for deriving the pacing rate, scaled by 2^8.
    pacing_gain: u32,

    /// Current gain for deriving the cwnd, scaled by 2^8.
    cwnd_gain: u32,

    /// cwnd saved upon entering loss recovery or PROBE_RTT, for
    /// restoration on exit.
    prior_cwnd: u32,

    /// Congestion-avoidance state observed on the previous ACK.
    prev_ca_state: CaState,

    /// In the first round of recovery, sending is held to packet
    /// conservation.
    packet_conservation: bool,

    /// Restarting after an application-idle period.
    idle_restart: bool,

    /// An RTT sample has been observed since init.
    has_seen_rtt: bool,
}

impl Bbr {
    pub fn new() -> Self {
        Self {
            mode: Mode::Startup,
            min_rtt_us: u32::MAX,
            min_rtt_stamp: 0,
            bw_filter: WindowedFilter::max_over(BW_RTTS),
            round: Default::default(),
            full_bw: Default::default(),
            lt: Default::default(),
            ack_aggr: Default::default(),
            pacing_gain: HIGH_GAIN,
            cwnd_gain: HIGH_GAIN,
            prior_cwnd: 0,
            prev_ca_state: CaState::Open,
            packet_conservation: false,
            idle_restart: false,
            has_seen_rtt: false,
        }
    }

    /// Initialize the control block for a fresh connection and seed the
    /// pacing rate from the transport's current cwnd and RTT estimate.
    pub fn init<T: Transport>(&mut self, conn: &mut T) {
        self.prior_cwnd = 0;
        self.round = RoundTripCounter {
            rtt_cnt: 0,
            next_rtt_delivered: conn.delivered(),
            round_start: false,
        };
        self.prev_ca_state = CaState::Open;
        self.packet_conservation = false;

        self.min_rtt_us = conn.min_rtt_us();
        self.min_rtt_stamp = conn.clock_jiffies();

        self.bw_filter = WindowedFilter::max_over(BW_RTTS);

        self.has_seen_rtt = false;
        self.init_pacing_rate_from_rtt(conn);

        self.idle_restart = false;
        self.full_bw = Default::default();
        self.pacing_gain = HIGH_GAIN;
        self.cwnd_gain = HIGH_GAIN;
        self.reset_lt_bw_sampling(conn);
        self.reset_startup_mode();

        self.ack_aggr = Default::default();
        self.ack_aggr.epoch_mstamp = conn.clock_us();

        conn.request_pacing();
    }

    /// The per-ACK control loop: update the path model and the state
    /// machine from the rate sample, then derive the pacing rate and
    /// the congestion window and write both back to the transport.
    pub fn cong_control<T: Transport>(&mut self, conn: &mut T, rs: &RateSample) {
        self.update_model(conn, rs);

        let bw = self.bw();
        self.set_pacing_rate(conn, bw, self.pacing_gain);
        self.set_cwnd(conn, rs, rs.acked_sacked, bw, self.cwnd_gain);
    }

    /// Do we estimate that STARTUP filled the pipe?
    pub fn full_bw_reached(&self) -> bool {
        self.full_bw.reached
    }

    /// Is the current ACK the first of a packet-timed round?
    pub fn is_round_start(&self) -> bool {
        self.round.round_start
    }

    /// Still ramping up in STARTUP?
    pub fn in_slow_start(&self) -> bool {
        self.mode == Mode::Startup
    }

    /// The windowed max recent bandwidth sample, in pkt/µs << 24.
    fn max_bw(&self) -> u64 {
        self.bw_filter.get()
    }

    /// The estimated bandwidth of the path, in pkt/µs << 24: the
    /// policed rate while the long-term estimator is engaged, the
    /// windowed max otherwise.
    fn bw(&self) -> u64 {
        if self.lt.use_bw {
            self.lt.bw
        } else {
            self.max_bw()
        }
    }

    /// Maximum extra acked in the past k-2k round trips, where
    /// k = EXTRA_ACKED_WIN_RTTS.
    fn extra_acked(&self) -> u64 {
        self.ack_aggr.extra_acked[0].max(self.ack_aggr.extra_acked[1])
    }

    /// Convert a scaled rate and gain to bytes per second. The
    /// multiplication order keeps every intermediate within u64 for
    /// input rates up to 2.9 Tbit/s and gains up to 2.89.
    fn rate_bytes_per_sec<T: Transport>(conn: &T, mut rate: u64, gain: u32) -> u64 {
        rate = rate.saturating_mul(conn.mss() as u64);
        rate = rate.saturating_mul(gain as u64);
        rate >>= BBR_SCALE;
        rate = rate.saturating_mul(USEC_PER_SEC / 100 * (100 - PACING_MARGIN_PERCENT));
        rate >> BW_SCALE
    }

    /// Convert a bw and gain factor to a pacing rate in bytes per
    /// second, clamped to the host ceiling.
    fn bw_to_pacing_rate<T: Transport>(conn: &T, bw: u64, gain: u32) -> u64 {
        Self::rate_bytes_per_sec(conn, bw, gain).min(conn.max_pacing_rate())
    }

    /// Initialize the pacing rate to high_gain * init_cwnd / RTT, using
    /// the nominal 1 ms RTT until the first RTT sample arrives.
    fn init_pacing_rate_from_rtt<T: Transport>(&mut self, conn: &mut T) {
        let rtt_us = if conn.srtt_us() != 0 {
            self.has_seen_rtt = true;
            conn.srtt_us().max(1)
        } else {
            USEC_PER_MSEC
        };
        let bw = conn.snd_cwnd() as u64 * BW_UNIT / rtt_us;
        let rate = Self::bw_to_pacing_rate(conn, bw, HIGH_GAIN);
        conn.set_pacing_rate(rate);
    }

    /// Pace using the current bw estimate and a gain factor. The rate
    /// is always allowed to rise; it only falls once the pipe has been
    /// estimated full, so STARTUP never walks its ramp back.
    fn set_pacing_rate<T: Transport>(&mut self, conn: &mut T, bw: u64, gain: u32) {
        let rate = Self::bw_to_pacing_rate(conn, bw, gain);

        if !self.has_seen_rtt && conn.srtt_us() != 0 {
            self.init_pacing_rate_from_rtt(conn);
        }
        if self.full_bw.reached || rate > conn.pacing_rate() {
            conn.set_pacing_rate(rate);
        }
    }

    /// Below MIN_TSO_RATE there is no burst budget to amortize; above
    /// it, keep at least two segments per burst.
    fn min_tso_segs<T: Transport>(conn: &T) -> u32 {
        if conn.pacing_rate() < MIN_TSO_RATE / 8 {
            1
        } else {
            2
        }
    }

    fn tso_segs_generic<T: Transport>(conn: &T, mss_now: u32, gso_max_size: u32) -> u32 {
        // Budget a TSO/GSO burst size allowance based on the pacing rate.
        let bytes = conn.pacing_rate() >> conn.pacing_shift();
        let bytes = bytes.min(gso_max_size.saturating_sub(1 + MAX_TCP_HEADER) as u64);

        ((bytes / mss_now.max(1) as u64) as u32).max(Self::min_tso_segs(conn))
    }

    /// The number of segments to aim for in one offloaded burst, given
    /// the host's GSO size limit. Consulted by the transport at
    /// transmit time.
    pub fn tso_segs<T: Transport>(&self, conn: &T, mss_now: u32) -> u32 {
        Self::tso_segs_generic(conn, mss_now, conn.gso_max_size())
    }

    /// Like [`Bbr::tso_segs`], using the connection mss and the generic
    /// GSO ceiling.
    pub fn tso_segs_goal<T: Transport>(&self, conn: &T) -> u32 {
        Self::tso_segs_generic(conn, conn.mss(), GSO_MAX_SIZE)
    }

    /// Save the last known good cwnd so it can be restored after loss
    /// recovery or PROBE_RTT. Once recovery or PROBE_RTT has already
    /// cut the cwnd, the saved value may only grow.
    fn save_cwnd<T: Transport>(&mut self, conn: &T) {
        if self.prev_ca_state < CaState::Recovery && !self.mode.is_probe_rtt() {
            self.prior_cwnd = conn.snd_cwnd();
        } else {
            self.prior_cwnd = self.prior_cwnd.max(conn.snd_cwnd());
        }
    }

    /// Handle connection events raised outside the ACK pipeline.
    ///
    /// On a transmit start after an application-idle period, the ACK
    /// aggregation epoch restarts and, in PROBE_BW, pacing resumes at
    /// exactly the estimated bw to return to rate balance without a
    /// burst. In PROBE_RTT the exit condition is re-evaluated, since no
    /// ACKs may arrive to do it.
    pub fn cwnd_event<T: Transport>(&mut self, conn: &mut T, event: CwndEvent) {
        match event {
            CwndEvent::TxStart => {
                if !conn.app_limited() {
                    return;
                }
                self.idle_restart = true;
                self.ack_aggr.epoch_mstamp = conn.clock_us();
                self.ack_aggr.epoch_acked = 0;
                if self.mode.is_probe_bw() {
                    let bw = self.bw();
                    self.set_pacing_rate(conn, bw, BBR_UNIT);
                } else if self.mode.is_probe_rtt() {
                    self.check_probe_rtt_done(conn);
                }
            }
        }
    }

    /// The bandwidth-delay product for the given bw and gain, rounded
    /// up to avoid a negative feedback loop. Falls back to the default
    /// initial cwnd while no valid RTT sample exists.
    fn bdp(&self, bw: u64, gain: u32) -> u32 {
        if self.min_rtt_us == u32::MAX {
            return TCP_INIT_CWND;
        }

        let w = bw.saturating_mul(self.min_rtt_us as u64);
        let bdp = ((w.saturating_mul(gain as u64) >> BBR_SCALE) + BW_UNIT - 1) / BW_UNIT;

        u32::try_from(bdp).unwrap_or(u32::MAX)
    }

    /// Budget extra cwnd for full-sized bursts in flight on both end
    /// hosts: one in the sender's queueing discipline, one in the
    /// sender's offload engine, one in the receiver's aggregation
    /// engine. Rounding up to an even cwnd reduces delayed-ACK stalls,
    /// and the 5/4 probing phase gets two more packets so the probe
    /// exceeds the BDP even when the BDP is tiny.
    fn quantization_budget<T: Transport>(&self, conn: &T, mut cwnd: u32) -> u32 {
        cwnd = cwnd.saturating_add(3 * self.tso_segs_goal(conn));

        cwnd = (cwnd + 1) & !1;

        if let Mode::ProbeBw(ref phase) = self.mode {
            if phase.cycle_idx == 0 {
                cwnd += 2;
            }
        }

        cwnd
    }

    /// The in-flight target for the given bw and gain.
    fn inflight<T: Transport>(&self, conn: &T, bw: u64, gain: u32) -> u32 {
        self.quantization_budget(conn, self.bdp(bw, gain))
    }

    /// The cwnd increment provisioned for ACK aggregation, clamped by
    /// bw over EXTRA_ACKED_MAX_US.
    fn ack_aggregation_cwnd(&self) -> u32 {
        if EXTRA_ACKED_GAIN == 0 || !self.full_bw.reached {
            return 0;
        }

        let max_aggr_cwnd = self.bw().saturating_mul(EXTRA_ACKED_MAX_US) / BW_UNIT;
        let aggr_cwnd = (EXTRA_ACKED_GAIN as u64).saturating_mul(self.extra_acked()) >> BBR_SCALE;
        aggr_cwnd.min(max_aggr_cwnd) as u32
    }

    /// On the first round of recovery, follow the packet conservation
    /// principle: send P packets per P packets acked. After recovery
    /// finishes, or upon undo, restore the cwnd held when recovery
    /// started. Returns the adjusted cwnd and whether conservation is
    /// in force.
    fn cwnd_to_recover_or_restore<T: Transport>(
        &mut self,
        conn: &mut T,
        rs: &RateSample,
        acked: u32,
    ) -> (u32, bool) {
        let prev_state = self.prev_ca_state;
        let state = conn.ca_state();
        let mut cwnd = conn.snd_cwnd();

        // An ACK for P pkts should release at most 2*P packets. First
        // deduct the newly lost packets here; then set_cwnd slow-starts
        // back up toward the target.
        if rs.losses > 0 {
            cwnd = cwnd.saturating_sub(rs.losses).max(1);
        }

        if state == CaState::Recovery && prev_state != CaState::Recovery {
            // Starting the first round of recovery, so do packet
            // conservation. Cut cwnd unused by app behaviour or
            // offload deferral.
            self.packet_conservation = true;
            self.round.next_rtt_delivered = conn.delivered();
            cwnd = conn.packets_in_flight() + acked;
        } else if prev_state >= CaState::Recovery && state < CaState::Recovery {
            // Exiting loss recovery; restore the cwnd saved on entry.
            cwnd = cwnd.max(self.prior_cwnd);
            self.packet_conservation = false;
        }
        self.prev_ca_state = state;

        if self.packet_conservation {
            return (cwnd.max(conn.packets_in_flight() + acked), true);
        }
        (cwnd, false)
    }

    /// Slow-start up toward the target cwnd (if the bw estimate grows
    /// or losses drew the cwnd below target), or snap down to the
    /// target when above it.
    fn set_cwnd<T: Transport>(
        &mut self,
        conn: &mut T,
        rs: &RateSample,
        acked: u32,
        bw: u64,
        gain: u32,
    ) {
        let mut cwnd = conn.snd_cwnd();

        // With no packet fully ACKed, just apply the caps below.
        if acked != 0 {
            let (adjusted, conserving) = self.cwnd_to_recover_or_restore(conn, rs, acked);
            cwnd = adjusted;

            if !conserving {
                let mut target = self.bdp(bw, gain);

                // Provision for excess ACKed data that appears to stem
                // from aggregation (of data and/or ACKs) in the path.
                target = target.saturating_add(self.ack_aggregation_cwnd());
                target = self.quantization_budget(conn, target);

                if self.full_bw.reached {
                    // Only cut cwnd once the pipe is known full.
                    cwnd = target.min(cwnd.saturating_add(acked));
                } else if cwnd < target || conn.delivered() < TCP_INIT_CWND as u64 {
                    cwnd = cwnd.saturating_add(acked);
                }
                cwnd = cwnd.max(CWND_MIN_TARGET);
            }
        }

        conn.set_snd_cwnd(cwnd.min(conn.snd_cwnd_clamp()));
        if self.mode.is_probe_rtt() {
            // Drain the queue so min_rtt can be re-measured.
            conn.set_snd_cwnd(conn.snd_cwnd().min(CWND_MIN_TARGET));
        }
    }

    /// End the cycle phase when it has run its time and/or hit the
    /// phase's in-flight target.
    fn is_next_cycle_phase<T: Transport>(
        &self,
        conn: &T,
        rs: &RateSample,
        phase: &ProbeBw,
    ) -> bool {
        let is_full_length = conn.delivered_mstamp().saturating_sub(phase.cycle_mstamp)
            > self.min_rtt_us as u64;

        // A pacing gain of 1.0 paces at the estimated bw to use the
        // pipe without changing the queue: wall clock time decides.
        if self.pacing_gain == BBR_UNIT {
            return is_full_length;
        }

        let inflight = rs.prior_in_flight;
        let bw = self.max_bw();

        // A pacing_gain > 1.0 probes for bw by trying to raise
        // in-flight to at least pacing_gain*BDP, which may take longer
        // than min_rtt when min_rtt is small. Do not persist if packets
        // are lost: a path with small buffers may not hold that much.
        if self.pacing_gain > BBR_UNIT {
            return is_full_length
                && (rs.losses > 0 || inflight >= self.inflight(conn, bw, self.pacing_gain));
        }

        // A pacing_gain < 1.0 drains the extra queue if bw probing did
        // not find more bw. Once in-flight falls to the BDP the queue
        // is estimated drained; persisting would underutilize the pipe.
        is_full_length || inflight <= self.inflight(conn, bw, BBR_UNIT)
    }

    fn advance_cycle_phase<T: Transport>(&mut self, conn: &T) {
        if let Mode::ProbeBw(ref mut phase) = self.mode {
            phase.cycle_idx = (phase.cycle_idx + 1) & (CYCLE_LEN - 1);
            phase.cycle_mstamp = conn.delivered_mstamp();
        }
    }

    /// Gain cycling: cycle the pacing gain to converge to a fair share
    /// of the available bandwidth.
    fn update_cycle_phase<T: Transport>(&mut self, conn: &T, rs: &RateSample) {
        if let Mode::ProbeBw(phase) = self.mode {
            if self.is_next_cycle_phase(conn, rs, &phase) {
                self.advance_cycle_phase(conn);
            }
        }
    }

    fn reset_startup_mode(&mut self) {
        self.mode = Mode::Startup;
    }

    /// Enter PROBE_BW at a random phase of the gain cycle. The draw
    /// lands on CYCLE_LEN-1 minus a 3-bit value below CYCLE_RAND, and
    /// the immediate advance below steps past it, so cycling never
    /// starts in the 3/4 drain phase.
    fn reset_probe_bw_mode<T: Transport>(&mut self, conn: &T) {
        let cycle_idx = CYCLE_LEN - 1 - rand::thread_rng().gen_range(0..CYCLE_RAND) as usize;
        self.mode = Mode::ProbeBw(ProbeBw {
            cycle_idx,
            cycle_mstamp: 0,
        });
        self.advance_cycle_phase(conn);
        trace!("bbr enter PROBE_BW");
    }

    fn reset_mode<T: Transport>(&mut self, conn: &T) {
        if !self.full_bw.reached {
            self.reset_startup_mode();
        } else {
            self.reset_probe_bw_mode(conn);
        }
    }

    /// Start a new long-term sampling interval.
    fn reset_lt_bw_sampling_interval<T: Transport>(&mut self, conn: &T) {
        self.lt.last_stamp = conn.delivered_mstamp() / USEC_PER_MSEC;
        self.lt.last_delivered = conn.delivered();
        self.lt.last_lost = conn.lost();
        self.lt.rtt_cnt = 0;
    }

    /// Completely reset long-term bandwidth sampling.
    fn reset_lt_bw_sampling<T: Transport>(&mut self, conn: &T) {
        self.lt.bw = 0;
        self.lt.use_bw = false;
        self.lt.is_sampling = false;
        self.reset_lt_bw_sampling_interval(conn);
    }

    /// A long-term sampling interval ended: estimate whether the flow
    /// is policed. Two consecutive intervals with consistent throughput
    /// engage the policed-rate model at their average.
    fn lt_bw_interval_done<T: Transport>(&mut self, conn: &T, bw: u64) {
        if self.lt.bw != 0 {
            // Is the new bw close to the lt_bw of the previous interval?
            let diff = bw.abs_diff(self.lt.bw);
            if diff.saturating_mul(BBR_UNIT as u64) <= LT_BW_RATIO * self.lt.bw
                || Self::rate_bytes_per_sec(conn, diff, BBR_UNIT) <= LT_BW_DIFF
            {
                // All criteria are met; estimate we're policed.
                self.lt.bw = (bw + self.lt.bw) >> 1;
                self.lt.use_bw = true;
                self.pacing_gain = BBR_UNIT; // try to avoid drops
                self.lt.rtt_cnt = 0;
                trace!("bbr long-term policed rate engaged, lt_bw {}", self.lt.bw);
                return;
            }
        }
        self.lt.bw = bw;
        self.reset_lt_bw_sampling_interval(conn);
    }

    /// Token-bucket policers admit a burst and then throttle to a
    /// steady rate with heavy loss. Sampling starts only after the
    /// first loss, so the policer's token bucket is drained and the
    /// interval measures the steady policed rate rather than the burst.
    fn lt_bw_sampling<T: Transport>(&mut self, conn: &T, rs: &RateSample) {
        if self.lt.use_bw {
            // Already using the long-term rate: age it out after
            // enough rounds of PROBE_BW, then probe afresh.
            if self.mode.is_probe_bw() && self.round.round_start {
                self.lt.rtt_cnt += 1;
                if self.lt.rtt_cnt >= LT_BW_MAX_RTTS {
                    self.reset_lt_bw_sampling(conn);
                    self.reset_probe_bw_mode(conn);
                }
            }
            return;
        }

        if !self.lt.is_sampling {
            if rs.losses == 0 {
                return;
            }
            self.reset_lt_bw_sampling_interval(conn);
            self.lt.is_sampling = true;
        }

        // To avoid underestimates, reset sampling if we run out of data.
        if rs.is_app_limited {
            self.reset_lt_bw_sampling(conn);
            return;
        }

        if self.round.round_start {
            self.lt.rtt_cnt += 1; // count round trips in this interval
        }
        if self.lt.rtt_cnt < LT_INTVL_MIN_RTTS {
            return; // sampling interval needs to be longer
        }
        if self.lt.rtt_cnt > 4 * LT_INTVL_MIN_RTTS {
            self.reset_lt_bw_sampling(conn); // interval is too long
            return;
        }

        // End the sampling interval only on a loss, estimating that the
        // policer's tokens were exhausted again. Stopping earlier would
        // under-estimate the policed rate.
        if rs.losses == 0 {
            return;
        }

        let lost = conn.lost().saturating_sub(self.lt.last_lost);
        let delivered = conn.delivered().saturating_sub(self.lt.last_delivered);

        // Is the loss rate (lost/delivered) at the policing threshold?
        if delivered == 0 || (lost << BBR_SCALE) < LT_LOSS_THRESH * delivered {
            return;
        }

        // Average delivery rate over this sampling interval.
        let t = (conn.delivered_mstamp() / USEC_PER_MSEC).saturating_sub(self.lt.last_stamp);
        if t < 1 {
            return; // interval is less than one ms, so wait
        }

        let bw = delivered.saturating_mul(BW_UNIT) / (t * USEC_PER_MSEC);
        self.lt_bw_interval_done(conn, bw);
    }

    /// Estimate the bandwidth from how fast packets are delivered.
    fn update_bw<T: Transport>(&mut self, conn: &T, rs: &RateSample) {
        self.round.round_start = false;
        if rs.delivered < 0 || rs.interval_us <= 0 {
            return; // not a valid observation
        }

        // See if we've reached the next RTT.
        if rs.prior_delivered >= self.round.next_rtt_delivered {
            self.round.next_rtt_delivered = conn.delivered();
            self.round.rtt_cnt += 1;
            self.round.round_start = true;
            self.packet_conservation = false;
        }

        self.lt_bw_sampling(conn, rs);

        // Divide delivered by the interval to find a (lower bound)
        // bottleneck bandwidth sample. Delivered is in packets and
        // interval_us in µs, so the ratio will be <<1 for most
        // connections; delivered is scaled up first.
        let bw = rs.delivered as u64 * BW_UNIT / rs.interval_us as u64;

        // An app-limited sample is likely to have a low delivered count
        // that reflects application behaviour rather than the available
        // network rate, and would drag the estimate down needlessly.
        // Filter such samples out unless they describe the path at
        // least as well as the current model.
        if !rs.is_app_limited || bw >= self.max_bw() {
            self.bw_filter.update(self.round.rtt_cnt as u64, bw);
        }
    }

    /// Estimate the windowed max degree of ACK aggregation, as extra
    /// data acked beyond what the bandwidth model expected over the
    /// epoch. The result provisions extra in-flight data to keep
    /// sending through inter-ACK silences.
    fn update_ack_aggregation<T: Transport>(&mut self, conn: &T, rs: &RateSample) {
        if EXTRA_ACKED_GAIN == 0 || rs.acked_sacked == 0 || rs.delivered < 0 || rs.interval_us <= 0
        {
            return;
        }

        if self.round.round_start {
            self.ack_aggr.win_rtts = (self.ack_aggr.win_rtts + 1).min(0x1F);
            if self.ack_aggr.win_rtts >= EXTRA_ACKED_WIN_RTTS {
                self.ack_aggr.win_rtts = 0;
                self.ack_aggr.win_idx = 1 - self.ack_aggr.win_idx;
                self.ack_aggr.extra_acked[self.ack_aggr.win_idx] = 0;
            }
        }

        // How many packets the model expected to be delivered over the
        // epoch.
        let epoch_us = conn
            .delivered_mstamp()
            .saturating_sub(self.ack_aggr.epoch_mstamp);
        let mut expected_acked = self.bw().saturating_mul(epoch_us) / BW_UNIT;

        // Reset the aggregation epoch if the ACK rate is below the
        // expected rate, or the epoch has absorbed enough ACKs to be
        // stale.
        if self.ack_aggr.epoch_acked <= expected_acked
            || self.ack_aggr.epoch_acked + rs.acked_sacked as u64 >= ACK_EPOCH_ACKED_RESET_THRESH
        {
            self.ack_aggr.epoch_acked = 0;
            self.ack_aggr.epoch_mstamp = conn.delivered_mstamp();
            expected_acked = 0;
        }

        // Excess data delivered beyond what was expected.
        self.ack_aggr.epoch_acked = (self.ack_aggr.epoch_acked + rs.acked_sacked as u64)
            .min(ACK_EPOCH_ACKED_RESET_THRESH - 1);
        let extra = self.ack_aggr.epoch_acked - expected_acked;
        let extra = extra.min(conn.snd_cwnd() as u64);
        if extra > self.ack_aggr.extra_acked[self.ack_aggr.win_idx] {
            self.ack_aggr.extra_acked[self.ack_aggr.win_idx] = extra;
        }
    }

    /// Estimate when the pipe is full from the change in delivery rate:
    /// STARTUP has filled the pipe once the estimated bw has grown by
    /// less than a quarter across three consecutive non-app-limited
    /// rounds.
    fn check_full_bw_reached(&mut self, rs: &RateSample) {
        if self.full_bw.reached || !self.round.round_start || rs.is_app_limited {
            return;
        }

        let bw_thresh = self.full_bw.bw.saturating_mul(FULL_BW_THRESH) >> BBR_SCALE;
        if self.max_bw() >= bw_thresh {
            // Still growing: record the new baseline.
            self.full_bw.bw = self.max_bw();
            self.full_bw.cnt = 0;
            return;
        }
        self.full_bw.cnt += 1; // another round without much growth
        self.full_bw.reached = self.full_bw.cnt >= FULL_BW_CNT;
    }

    /// If the pipe is probably full, drain the queue created during
    /// STARTUP, then enter steady state.
    fn check_drain<T: Transport>(&mut self, conn: &mut T) {
        if self.mode == Mode::Startup && self.full_bw.reached {
            self.mode = Mode::Drain;
            let inflight = self.inflight(conn, self.max_bw(), BBR_UNIT);
            conn.set_ssthresh(inflight);
            trace!("bbr enter DRAIN, inflight target {}", inflight);
        }
        // Fall through to check whether in-flight is already small.
        if self.mode == Mode::Drain
            && conn.packets_in_flight() <= self.inflight(conn, self.max_bw(), BBR_UNIT)
        {
            // The queue is estimated drained.
            self.reset_probe_bw_mode(conn);
        }
    }

    /// Leave PROBE_RTT once the floor has been held long enough:
    /// restore the cwnd saved on entry, schedule the next min_rtt
    /// window, and pick the next mode.
    fn check_probe_rtt_done<T: Transport>(&mut self, conn: &mut T) {
        let done_stamp = match self.mode {
            Mode::ProbeRtt(ProbeRtt {
                done_stamp: Some(stamp),
                ..
            }) => stamp,
            _ => return,
        };
        if conn.clock_jiffies() <= done_stamp {
            return;
        }

        self.min_rtt_stamp = conn.clock_jiffies(); // wait a while until the next PROBE_RTT
        conn.set_snd_cwnd(conn.snd_cwnd().max(self.prior_cwnd));
        self.reset_mode(conn);
        trace!("bbr exit PROBE_RTT");
    }

    /// Track the min RTT and run the PROBE_RTT lifecycle.
    ///
    /// PROBE_RTT has BBR flows cooperatively and periodically drain the
    /// bottleneck queue, so they converge on the true two-way
    /// propagation delay and keep queues small. When the 10-second
    /// min_rtt window expires, cwnd is capped at CWND_MIN_TARGET until
    /// that flight size has been held for max(200 ms, 1 round), bounding
    /// the throughput penalty to roughly 2%. Flows with natural silences
    /// inside the window pick up min RTT measurements opportunistically
    /// and skip the dip entirely.
    fn update_min_rtt<T: Transport>(&mut self, conn: &mut T, rs: &RateSample) {
        let filter_expired = conn.clock_jiffies() > self.min_rtt_stamp + MIN_RTT_WIN_SEC * HZ;

        if rs.rtt_us >= 0
            && (rs.rtt_us < self.min_rtt_us as i64 || (filter_expired && !rs.is_ack_delayed))
        {
            self.min_rtt_us = rs.rtt_us as u32;
            self.min_rtt_stamp = conn.clock_jiffies();
        }

        if PROBE_RTT_MODE_MS > 0
            && filter_expired
            && !self.idle_restart
            && !self.mode.is_probe_rtt()
        {
            self.mode = Mode::ProbeRtt(ProbeRtt {
                done_stamp: None,
                round_done: false,
            });
            // Note the cwnd so it can be restored on exit.
            self.save_cwnd(conn);
            trace!("bbr enter PROBE_RTT");
        }

        if let Mode::ProbeRtt(probe) = self.mode {
            // Ignore low rate samples during this mode.
            conn.mark_app_limited();

            // Maintain the minimum packets in flight for
            // max(200 ms, 1 round).
            if probe.done_stamp.is_none() {
                if conn.packets_in_flight() <= CWND_MIN_TARGET {
                    self.mode = Mode::ProbeRtt(ProbeRtt {
                        done_stamp: Some(
                            conn.clock_jiffies() + msecs_to_jiffies(PROBE_RTT_MODE_MS),
                        ),
                        round_done: false,
                    });
                    self.round.next_rtt_delivered = conn.delivered();
                }
            } else {
                if self.round.round_start {
                    if let Mode::ProbeRtt(ref mut p) = self.mode {
                        p.round_done = true;
                    }
                }
                if matches!(
                    self.mode,
                    Mode::ProbeRtt(ProbeRtt {
                        round_done: true,
                        ..
                    })
                ) {
                    self.check_probe_rtt_done(conn);
                }
            }
        }

        // Restart after idle ends only once a new S/ACK for data is
        // processed.
        if rs.delivered > 0 {
            self.idle_restart = false;
        }
    }

    /// Derive the gains from the current mode.
    fn update_gains(&mut self) {
        match self.mode {
            Mode::Startup => {
                self.pacing_gain = HIGH_GAIN;
                self.cwnd_gain = HIGH_GAIN;
            }
            Mode::Drain => {
                self.pacing_gain = DRAIN_GAIN; // slow, to drain
                self.cwnd_gain = HIGH_GAIN; // keep cwnd
            }
            Mode::ProbeBw(ref phase) => {
                self.pacing_gain = if self.lt.use_bw {
                    BBR_UNIT
                } else {
                    PACING_GAIN[phase.cycle_idx]
                };
                self.cwnd_gain = CWND_GAIN;
            }
            Mode::ProbeRtt(_) => {
                self.pacing_gain = BBR_UNIT;
                self.cwnd_gain = BBR_UNIT;
            }
        }
    }

    fn update_model<T: Transport>(&mut self, conn: &mut T, rs: &RateSample) {
        self.update_bw(conn, rs);
        self.update_ack_aggregation(conn, rs);
        self.update_cycle_phase(conn, rs);
        self.check_full_bw_reached(rs);
        self.check_drain(conn);
        self.update_min_rtt(conn, rs);
        self.update_gains();
    }

    /// Observe a host congestion-avoidance state change. An RTO
    /// (`Loss`) is treated as the end of a round and restarts pipe-full
    /// detection, and the long-term sampler sees it as a one-loss
    /// sample.
    pub fn set_state<T: Transport>(&mut self, conn: &mut T, new_state: CaState) {
        if new_state == CaState::Loss {
            let rs = RateSample {
                losses: 1,
                ..Default::default()
            };
            self.prev_ca_state = CaState::Loss;
            self.full_bw.bw = 0;
            self.round.round_start = true; // treat RTO like end of a round
            self.lt_bw_sampling(conn, &rs);
        }
    }

    /// Entering loss recovery: save the cwnd for when recovery exits or
    /// is undone. The transport's ssthresh is passed through unchanged.
    pub fn ssthresh<T: Transport>(&mut self, conn: &T) -> u32 {
        self.save_cwnd(conn);
        conn.ssthresh()
    }

    /// A loss turned out to be spurious: restart pipe-full detection
    /// and long-term sampling. The cwnd itself needs no undo, since BBR
    /// does not always reduce it on losses.
    pub fn undo_cwnd<T: Transport>(&mut self, conn: &T) -> u32 {
        self.full_bw.bw = 0;
        self.full_bw.cnt = 0;
        self.reset_lt_bw_sampling(conn);
        conn.snd_cwnd()
    }

    /// Provision 3 * cwnd of send buffer: BBR may slow-start even
    /// during recovery.
    pub fn sndbuf_expand(&self) -> u32 {
        3
    }

    /// A diagnostic snapshot of the model and gains.
    pub fn get_info<T: Transport>(&self, conn: &T) -> BbrInfo {
        let bw = self
            .bw()
            .saturating_mul(conn.mss() as u64)
            .saturating_mul(USEC_PER_SEC)
            >> BW_SCALE;

        BbrInfo {
            bw_bytes_per_sec: bw,
            min_rtt_us: self.min_rtt_us,
            pacing_gain: self.pacing_gain,
            cwnd_gain: self.cwnd_gain,
        }
    }
}

impl Default for Bbr {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialized form of the model state exposed for diagnostics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BbrInfo {
    /// Estimated path bandwidth, in bytes per second.
    pub bw_bytes_per_sec: u64,

    /// Current minimum RTT estimate, in µs.
    pub min_rtt_us: u32,

    /// Current pacing gain, scaled by 2^8.
    pub pacing_gain: u32,

    /// Current cwnd gain, scaled by 2^8.
    pub cwnd_gain: u32,
}
