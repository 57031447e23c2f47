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

//! BBR (Bottleneck Bandwidth and Round-trip propagation time) congestion
//! control for TCP-style transports.
//!
//! BBR computes the sending rate from the delivery rate (throughput)
//! estimated from ACKs. On each ACK it updates an explicit model of the
//! network path:
//!
//! ```text
//! bottleneck_bandwidth = windowed_max(delivered / elapsed, 10 round trips)
//! min_rtt              = windowed_min(rtt, 10 seconds)
//! ```
//!
//! and derives two control outputs from the model:
//!
//! ```text
//! pacing_rate = pacing_gain * bottleneck_bandwidth
//! cwnd        = max(cwnd_gain * bottleneck_bandwidth * min_rtt, 4)
//! ```
//!
//! The core does not react directly to packet losses or delays; any
//! reaction is mediated through the model, including an explicit model of
//! token-bucket traffic policers.
//!
//! This crate is only the control loop. The host transport produces the
//! per-ACK [`RateSample`], exposes its counters and clocks through the
//! [`Transport`] capability trait, and consumes the pacing rate and
//! congestion window the core writes back. Per-packet departure
//! scheduling, loss detection, and socket management stay on the host
//! side.
//!
//! See "BBR: Congestion-Based Congestion Control", Cardwell et al.,
//! ACM Queue, Vol. 14 No. 5, 2016, and the discussion list at
//! <https://groups.google.com/g/bbr-dev>.

#[path = "congestion_control/congestion_control.rs"]
pub mod congestion_control;

pub use crate::congestion_control::Bbr;
pub use crate::congestion_control::BbrInfo;
pub use crate::congestion_control::CaState;
pub use crate::congestion_control::CwndEvent;
pub use crate::congestion_control::RateSample;
pub use crate::congestion_control::Transport;
