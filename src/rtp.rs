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

//! The RTP transmission stage: the packet pump between a chain and an
//! [`RtpSession`] backend.
//!
//! As a sink it consumes `RtpSend` messages and hands their payloads to the
//! session; as a source it polls the session once per iteration and emits
//! one `RtpReceive` message per incoming packet, annotated with the source's
//! CNAME, jitter and sender report timing for the synchronizer downstream.

use crate::{
    error::{SessionError, StageError, StageResult},
    message::{Message, MessageBody, RtpReceivePacket, SystemEvent},
    queue::OutputQueue,
    session::{RtpPacket, RtpSession, SourceReport},
    stage::{Stage, StageCtx},
};
use std::{
    collections::HashMap,
    time::{Duration, SystemTime},
};
use tracing::debug;

/// Payload-specific validation hooked into the stage per payload type.
/// Implementations check that an incoming packet actually carries the
/// expected framing and may pin down the stream's timestamp unit.
pub trait PacketDecoder: Send {
    /// Returns false to drop the packet. A dropped packet is a transient
    /// data issue, never an error.
    fn validate(&mut self, packet: &RtpPacket) -> bool;

    /// Seconds per timestamp tick, when the payload type implies it.
    fn timestamp_unit(&self, packet: &RtpPacket) -> Option<f64> {
        let _ = packet;
        None
    }
}

/// Accepts any non-empty payload of a fixed-clock-rate format.
pub struct FixedRateDecoder {
    clock_rate: u32,
}

impl FixedRateDecoder {
    pub fn new(clock_rate: u32) -> Self {
        FixedRateDecoder { clock_rate }
    }
}

impl PacketDecoder for FixedRateDecoder {
    fn validate(&mut self, packet: &RtpPacket) -> bool {
        !packet.payload.is_empty()
    }

    fn timestamp_unit(&self, _packet: &RtpPacket) -> Option<f64> {
        Some(1.0 / f64::from(self.clock_rate))
    }
}

type SourceIdFn = Box<dyn Fn(&RtpPacket, &SourceReport) -> u64 + Send>;

/// The maximum believable age of an outgoing message's sampling instant.
/// Older instants are assumed bogus and not reported to the session.
const MAX_PRE_TRANSMISSION_DELAY: Duration = Duration::from_secs(10);

pub struct RtpStage {
    session: Box<dyn RtpSession>,
    queue: OutputQueue,
    prev_pull_iteration: i64,
    sending_enabled: bool,
    silent_timestamp_increment: u32,
    source_id_fn: SourceIdFn,
    decoders: HashMap<u8, Box<dyn PacketDecoder>>,
}

impl RtpStage {
    pub fn new(session: Box<dyn RtpSession>) -> Self {
        RtpStage {
            session,
            queue: OutputQueue::new(),
            prev_pull_iteration: -1,
            sending_enabled: true,
            silent_timestamp_increment: 0,
            source_id_fn: Box::new(|packet, _| u64::from(packet.ssrc)),
            decoders: HashMap::new(),
        }
    }

    /// Controls whether `RtpSend` messages are actually transmitted. While
    /// disabled they are dropped silently, the push-to-talk idiom.
    pub fn set_sending_enabled(&mut self, enabled: bool) {
        self.sending_enabled = enabled;
    }

    pub fn sending_enabled(&self) -> bool {
        self.sending_enabled
    }

    /// Timestamp advance for intervals in which no outbound message arrived.
    /// How (and whether) the increment is applied on silence is up to the
    /// session backend.
    pub fn set_silent_timestamp_increment(&mut self, increment: u32) {
        self.silent_timestamp_increment = increment;
    }

    pub fn silent_timestamp_increment(&self) -> u32 {
        self.silent_timestamp_increment
    }

    /// Replaces the mapping from incoming packets to 64-bit source ids. The
    /// default is the packet's SSRC, zero-extended.
    pub fn set_source_id_fn<F>(&mut self, source_id_fn: F)
    where
        F: Fn(&RtpPacket, &SourceReport) -> u64 + Send + 'static,
    {
        self.source_id_fn = Box::new(source_id_fn);
    }

    pub fn register_decoder(&mut self, payload_type: u8, decoder: Box<dyn PacketDecoder>) {
        self.decoders.insert(payload_type, decoder);
    }

    pub fn session(&self) -> &dyn RtpSession {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> &mut dyn RtpSession {
        self.session.as_mut()
    }

    fn process_new_packets(&mut self, iteration: i64) -> StageResult<()> {
        if iteration == self.prev_pull_iteration {
            return Ok(());
        }
        self.prev_pull_iteration = iteration;
        self.queue.check_iteration(iteration);

        let reports = self.session.poll()?;
        let received_at = SystemTime::now();

        for report in reports {
            let source_unit = report
                .timestamp_unit
                .or(report.estimated_timestamp_unit);
            let jitter = source_unit
                .map(|unit| Duration::from_secs_f64(report.jitter_units.abs() * unit))
                .unwrap_or_default();

            for packet in &report.packets {
                let mut unit = source_unit;
                if let Some(decoder) = self.decoders.get_mut(&packet.payload_type) {
                    if !decoder.validate(packet) {
                        debug!(
                            "Dropping invalid packet of payload type {} from source {:08x}.",
                            packet.payload_type, packet.ssrc
                        );
                        continue;
                    }
                    if let Some(decoder_unit) = decoder.timestamp_unit(packet) {
                        unit = Some(decoder_unit);
                    }
                }

                let mut msg = Message::rtp_receive(RtpReceivePacket {
                    ssrc: packet.ssrc,
                    payload_type: packet.payload_type,
                    sequence: packet.sequence,
                    timestamp: packet.timestamp,
                    marker: packet.marker,
                    payload: packet.payload.clone(),
                    cname: report.cname.clone(),
                    jitter,
                    timestamp_unit: unit,
                    sr_timing: report.sender_report.clone(),
                });
                msg.set_source_id((self.source_id_fn)(packet, &report));
                msg.set_sampling_instant(received_at);
                if let Some(unit) = unit {
                    msg.set_timestamp_unit(unit);
                }
                self.queue.enqueue(msg);
            }
        }
        Ok(())
    }
}

impl Stage for RtpStage {
    fn name(&self) -> &str {
        "RtpStage"
    }

    fn push(&mut self, _ctx: &StageCtx<'_>, msg: Message) -> StageResult<()> {
        if !self.session.is_active() {
            return Err(StageError::Session(SessionError::Inactive));
        }

        let msg_type = msg.message_type();
        let subtype = msg.subtype();
        let sampling_instant = msg.sampling_instant();

        match msg.into_body() {
            MessageBody::System(SystemEvent::WaitTime | SystemEvent::IsTime) => Ok(()),
            MessageBody::RtpSend(packet) => {
                if !self.sending_enabled {
                    return Ok(());
                }
                if let Some(instant) = sampling_instant {
                    if let Ok(delay) = SystemTime::now().duration_since(instant) {
                        if delay > Duration::ZERO && delay <= MAX_PRE_TRANSMISSION_DELAY {
                            self.session.set_pre_transmission_delay(delay)?;
                        }
                    }
                }
                self.session.send(
                    &packet.payload,
                    packet.payload_type,
                    packet.marker,
                    packet.timestamp_increment,
                )?;
                Ok(())
            }
            _ => Err(StageError::BadMessage { msg_type, subtype }),
        }
    }

    fn pull(&mut self, ctx: &StageCtx<'_>) -> StageResult<Option<Message>> {
        if !self.session.is_active() {
            return Err(StageError::Session(SessionError::Inactive));
        }
        self.process_new_packets(ctx.iteration)?;
        Ok(self.queue.pull(ctx.iteration))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::SessionResult;
    use bytes::Bytes;

    use std::sync::{Arc, Mutex};

    type SentLog = Arc<Mutex<Vec<(Vec<u8>, u8, bool, u32)>>>;

    struct ScriptedSession {
        reports: Vec<Vec<SourceReport>>,
        sent: SentLog,
        pre_transmission_delay: Arc<Mutex<Option<Duration>>>,
        active: bool,
    }

    impl ScriptedSession {
        fn new(reports: Vec<Vec<SourceReport>>) -> Self {
            ScriptedSession {
                reports,
                sent: Arc::default(),
                pre_transmission_delay: Arc::default(),
                active: true,
            }
        }

        fn sent_log(&self) -> SentLog {
            Arc::clone(&self.sent)
        }

        fn delay_slot(&self) -> Arc<Mutex<Option<Duration>>> {
            Arc::clone(&self.pre_transmission_delay)
        }
    }

    impl RtpSession for ScriptedSession {
        fn poll(&mut self) -> SessionResult<Vec<SourceReport>> {
            if self.reports.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(self.reports.remove(0))
            }
        }

        fn send(
            &mut self,
            payload: &[u8],
            payload_type: u8,
            marker: bool,
            timestamp_increment: u32,
        ) -> SessionResult<()> {
            self.sent.lock().expect("sent log lock").push((
                payload.to_vec(),
                payload_type,
                marker,
                timestamp_increment,
            ));
            Ok(())
        }

        fn set_pre_transmission_delay(&mut self, delay: Duration) -> SessionResult<()> {
            *self.pre_transmission_delay.lock().expect("delay lock") = Some(delay);
            Ok(())
        }

        fn is_active(&self) -> bool {
            self.active
        }
    }

    fn packet(ssrc: u32, payload_type: u8, payload: &[u8]) -> RtpPacket {
        RtpPacket {
            ssrc,
            payload_type,
            sequence: 1,
            timestamp: 160,
            marker: false,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    fn report(ssrc: u32, packets: Vec<RtpPacket>) -> SourceReport {
        SourceReport {
            ssrc,
            cname: Bytes::from_static(b"test@host"),
            jitter_units: 80.0,
            timestamp_unit: Some(1.0 / 8000.0),
            estimated_timestamp_unit: None,
            sender_report: None,
            packets,
        }
    }

    fn ctx(iteration: i64) -> StageCtx<'static> {
        StageCtx {
            chain_id: 1,
            chain_name: "test",
            iteration,
        }
    }

    #[test]
    fn received_packets_become_messages_until_none() {
        let reports = vec![vec![report(
            7,
            vec![packet(7, 0, b"one"), packet(7, 0, b"two")],
        )]];
        let mut stage = RtpStage::new(Box::new(ScriptedSession::new(reports)));

        let first = stage.pull(&ctx(1)).expect("pull").expect("first message");
        assert_eq!(first.source_id(), 7);
        let MessageBody::RtpReceive(received) = first.body() else {
            panic!("not an rtp receive message");
        };
        assert_eq!(received.payload, Bytes::from_static(b"one"));
        assert_eq!(received.cname, Bytes::from_static(b"test@host"));
        assert_eq!(received.jitter, Duration::from_secs_f64(80.0 / 8000.0));

        assert!(stage.pull(&ctx(1)).expect("pull").is_some());
        assert!(stage.pull(&ctx(1)).expect("pull").is_none());
        // restart after the none sentinel
        assert!(stage.pull(&ctx(1)).expect("pull").is_some());
    }

    #[test]
    fn decoder_rejects_are_dropped_silently() {
        struct RejectEmpty;
        impl PacketDecoder for RejectEmpty {
            fn validate(&mut self, packet: &RtpPacket) -> bool {
                !packet.payload.is_empty()
            }
        }

        let reports = vec![vec![report(7, vec![packet(7, 96, b""), packet(7, 96, b"ok")])]];
        let mut stage = RtpStage::new(Box::new(ScriptedSession::new(reports)));
        stage.register_decoder(96, Box::new(RejectEmpty));

        let first = stage.pull(&ctx(1)).expect("pull").expect("valid packet");
        let MessageBody::RtpReceive(received) = first.body() else {
            panic!("not an rtp receive message");
        };
        assert_eq!(received.payload, Bytes::from_static(b"ok"));
        assert!(stage.pull(&ctx(1)).expect("pull").is_none());
    }

    #[test]
    fn send_messages_reach_the_session_with_their_delay() {
        let session = ScriptedSession::new(Vec::new());
        let sent = session.sent_log();
        let delay = session.delay_slot();
        let mut stage = RtpStage::new(Box::new(session));

        let mut msg = Message::rtp_send(crate::message::RtpSendPacket {
            payload: Bytes::from_static(b"data"),
            payload_type: 96,
            marker: true,
            timestamp_increment: 160,
        });
        msg.set_sampling_instant(SystemTime::now() - Duration::from_millis(20));

        stage.push(&ctx(1), msg).expect("push");

        let sent = sent.lock().expect("sent log lock");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], (b"data".to_vec(), 96, true, 160));
        let delay = delay.lock().expect("delay lock").expect("delay reported");
        assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_secs(1));
    }

    #[test]
    fn sending_disabled_drops_silently() {
        let session = ScriptedSession::new(Vec::new());
        let sent = session.sent_log();
        let mut stage = RtpStage::new(Box::new(session));
        stage.set_sending_enabled(false);
        let msg = Message::rtp_send(crate::message::RtpSendPacket {
            payload: Bytes::from_static(b"data"),
            payload_type: 96,
            marker: false,
            timestamp_increment: 160,
        });
        stage.push(&ctx(1), msg).expect("push succeeds");
        assert!(sent.lock().expect("sent log lock").is_empty());
    }

    #[test]
    fn non_rtp_media_messages_are_rejected() {
        let mut stage = RtpStage::new(Box::new(ScriptedSession::new(Vec::new())));
        let frame = crate::message::RawAudioFrame::new(
            crate::message::SampleEncoding::U8,
            8000,
            1,
            4,
            Bytes::from_static(&[0, 1, 2, 3]),
        )
        .expect("valid frame");
        let result = stage.push(&ctx(1), Message::raw_audio(frame));
        assert!(matches!(result, Err(StageError::BadMessage { .. })));
    }

    #[test]
    fn ticks_are_accepted() {
        let mut stage = RtpStage::new(Box::new(ScriptedSession::new(Vec::new())));
        stage
            .push(&ctx(1), Message::system(SystemEvent::IsTime))
            .expect("tick");
        stage
            .push(&ctx(1), Message::system(SystemEvent::WaitTime))
            .expect("tick");
    }
}
