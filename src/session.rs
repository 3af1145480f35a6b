/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! The transport contract behind the RTP stage.
//!
//! The stage does not care how packets reach the network; any backend
//! implementing [`RtpSession`] works. [`UdpRtpSession`] is the bundled
//! UDP backend.

pub mod udp;

use crate::{error::SessionResult, message::SrTiming};
use bytes::Bytes;
use std::time::Duration;

pub use udp::UdpRtpSession;

/// One RTP packet as delivered by a session backend.
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub ssrc: u32,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub marker: bool,
    pub payload: Bytes,
}

/// Snapshot of one source that delivered data since the previous poll:
/// identity and reception statistics plus the drained packets.
#[derive(Debug, Clone)]
pub struct SourceReport {
    pub ssrc: u32,
    /// RTCP SDES canonical name, empty until one was received.
    pub cname: Bytes,
    /// RFC 3550 interarrival jitter, in timestamp units.
    pub jitter_units: f64,
    /// Seconds per timestamp tick when the payload clock rate is known.
    pub timestamp_unit: Option<f64>,
    /// Unit estimated from consecutive sender reports.
    pub estimated_timestamp_unit: Option<f64>,
    /// Timing of the most recent sender report with a nonzero NTP time.
    pub sender_report: Option<SrTiming>,
    pub packets: Vec<RtpPacket>,
}

pub trait RtpSession: Send {
    /// Collects everything received since the previous poll, grouped by
    /// source. Sources without new packets are not reported.
    fn poll(&mut self) -> SessionResult<Vec<SourceReport>>;

    /// Sends one RTP packet. The backend owns sequence numbers and the
    /// timestamp clock; `timestamp_increment` advances the clock after the
    /// packet is stamped.
    fn send(
        &mut self,
        payload: &[u8],
        payload_type: u8,
        marker: bool,
        timestamp_increment: u32,
    ) -> SessionResult<()>;

    /// The delay between the sampling instant of outgoing media and its
    /// transmission, so the backend can keep sender report timing honest.
    fn set_pre_transmission_delay(&mut self, delay: Duration) -> SessionResult<()> {
        let _ = delay;
        Ok(())
    }

    fn is_active(&self) -> bool;
}
