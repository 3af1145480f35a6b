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

//! The messages passed between the stages of a chain.
//!
//! Every message carries a type tag (one bit per media family) and a dense
//! subtype within that family. Connections filter on both tags, see
//! [`Message::matches`]. Payloads are refcounted [`Bytes`], so cloning a
//! message shares the payload buffer; use [`Message::copy`] when a message
//! has to outlive the iteration that produced it.

use crate::error::{MessageError, MessageResult};
use bytes::Bytes;
use std::time::{Duration, SystemTime};

pub const MESSAGE_TYPE_SYSTEM: u32 = 0x0000_0001;
pub const MESSAGE_TYPE_AUDIO_RAW: u32 = 0x0000_0002;
pub const MESSAGE_TYPE_AUDIO_ENCODED: u32 = 0x0000_0004;
pub const MESSAGE_TYPE_VIDEO_RAW: u32 = 0x0000_0008;
pub const MESSAGE_TYPE_VIDEO_ENCODED: u32 = 0x0000_0010;
pub const MESSAGE_TYPE_RTP: u32 = 0x0000_0020;
pub const MESSAGE_TYPE_ALL: u32 = 0xffff_ffff;

pub const RTP_SUBTYPE_SEND: u32 = 1;
pub const RTP_SUBTYPE_RECEIVE: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SystemEvent {
    /// Instructs the chain start stage to block until the next period boundary.
    WaitTime = 1,
    /// Emitted by timing stages to signal the start of a new period.
    IsTime = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SampleEncoding {
    U8 = 1,
    S8 = 2,
    S16Le = 3,
    S16Be = 4,
    U16Le = 5,
    U16Be = 6,
    F32 = 7,
    F64 = 8,
}

impl SampleEncoding {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleEncoding::U8 | SampleEncoding::S8 => 1,
            SampleEncoding::S16Le
            | SampleEncoding::S16Be
            | SampleEncoding::U16Le
            | SampleEncoding::U16Be => 2,
            SampleEncoding::F32 => 4,
            SampleEncoding::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, SampleEncoding::F32 | SampleEncoding::F64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AudioCodec {
    Opus = 1,
    Speex = 2,
    Silk = 3,
    Gsm = 4,
    ALaw = 5,
    MuLaw = 6,
    Lpc = 7,
    L16 = 8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PixelFormat {
    Yuv420p = 1,
    Rgb24 = 2,
}

impl PixelFormat {
    pub fn frame_size(self, width: u32, height: u32) -> Option<usize> {
        let width = width as usize;
        let height = height as usize;
        match self {
            PixelFormat::Yuv420p => {
                let luma = width.checked_mul(height)?;
                let chroma = width.div_ceil(2).checked_mul(height.div_ceil(2))?;
                luma.checked_add(chroma.checked_mul(2)?)
            }
            PixelFormat::Rgb24 => width.checked_mul(height)?.checked_mul(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum VideoCodec {
    H264 = 1,
}

/// Media attributes shared by all message families: the originating source,
/// the wallclock instant the first contained sample was produced, and, for
/// audio, the duration of one timestamp tick in seconds.
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    pub source_id: u64,
    pub sampling_instant: Option<SystemTime>,
    pub timestamp_unit: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RawAudioFrame {
    pub encoding: SampleEncoding,
    pub sampling_rate: u32,
    pub channels: u16,
    pub frames: u32,
    pub payload: Bytes,
}

impl RawAudioFrame {
    pub fn new(
        encoding: SampleEncoding,
        sampling_rate: u32,
        channels: u16,
        frames: u32,
        payload: Bytes,
    ) -> MessageResult<Self> {
        let expected = (frames as usize)
            .checked_mul(channels as usize)
            .and_then(|samples| samples.checked_mul(encoding.bytes_per_sample()))
            .ok_or(MessageError::FrameDimensionsOverflow)?;
        if expected != payload.len() {
            return Err(MessageError::PayloadSizeMismatch {
                expected,
                actual: payload.len(),
            });
        }
        Ok(RawAudioFrame {
            encoding,
            sampling_rate,
            channels,
            frames,
            payload,
        })
    }

    pub fn samples(&self) -> usize {
        self.frames as usize * self.channels as usize
    }
}

#[derive(Debug, Clone)]
pub struct EncodedAudioFrame {
    pub codec: AudioCodec,
    pub sampling_rate: u32,
    pub channels: u16,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub struct RawVideoFrame {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub payload: Bytes,
}

impl RawVideoFrame {
    pub fn new(
        format: PixelFormat,
        width: u32,
        height: u32,
        payload: Bytes,
    ) -> MessageResult<Self> {
        let expected = format
            .frame_size(width, height)
            .ok_or(MessageError::FrameDimensionsOverflow)?;
        if expected != payload.len() {
            return Err(MessageError::PayloadSizeMismatch {
                expected,
                actual: payload.len(),
            });
        }
        Ok(RawVideoFrame {
            format,
            width,
            height,
            payload,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EncodedVideoFrame {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
pub struct RtpSendPacket {
    pub payload: Bytes,
    pub payload_type: u8,
    pub marker: bool,
    pub timestamp_increment: u32,
}

/// The `(wallclock, RTP timestamp)` pair from the most recent RTCP sender
/// report of a source, relating the remote clock to the RTP timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrTiming {
    pub wallclock: SystemTime,
    pub rtp_timestamp: u32,
}

#[derive(Debug, Clone)]
pub struct RtpReceivePacket {
    pub ssrc: u32,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub marker: bool,
    pub payload: Bytes,
    pub cname: Bytes,
    pub jitter: Duration,
    pub timestamp_unit: Option<f64>,
    pub sr_timing: Option<SrTiming>,
}

#[derive(Debug, Clone)]
pub enum MessageBody {
    System(SystemEvent),
    RawAudio(RawAudioFrame),
    EncodedAudio(EncodedAudioFrame),
    RawVideo(RawVideoFrame),
    EncodedVideo(EncodedVideoFrame),
    RtpSend(RtpSendPacket),
    RtpReceive(RtpReceivePacket),
}

#[derive(Debug, Clone)]
pub struct Message {
    info: MediaInfo,
    body: MessageBody,
}

impl Message {
    pub fn new(body: MessageBody) -> Self {
        Message {
            info: MediaInfo::default(),
            body,
        }
    }

    pub fn system(event: SystemEvent) -> Self {
        Message::new(MessageBody::System(event))
    }

    pub fn raw_audio(frame: RawAudioFrame) -> Self {
        Message::new(MessageBody::RawAudio(frame))
    }

    pub fn encoded_audio(frame: EncodedAudioFrame) -> Self {
        Message::new(MessageBody::EncodedAudio(frame))
    }

    pub fn raw_video(frame: RawVideoFrame) -> Self {
        Message::new(MessageBody::RawVideo(frame))
    }

    pub fn encoded_video(frame: EncodedVideoFrame) -> Self {
        Message::new(MessageBody::EncodedVideo(frame))
    }

    pub fn rtp_send(packet: RtpSendPacket) -> Self {
        Message::new(MessageBody::RtpSend(packet))
    }

    pub fn rtp_receive(packet: RtpReceivePacket) -> Self {
        Message::new(MessageBody::RtpReceive(packet))
    }

    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    pub fn into_body(self) -> MessageBody {
        self.body
    }

    pub fn message_type(&self) -> u32 {
        match &self.body {
            MessageBody::System(_) => MESSAGE_TYPE_SYSTEM,
            MessageBody::RawAudio(_) => MESSAGE_TYPE_AUDIO_RAW,
            MessageBody::EncodedAudio(_) => MESSAGE_TYPE_AUDIO_ENCODED,
            MessageBody::RawVideo(_) => MESSAGE_TYPE_VIDEO_RAW,
            MessageBody::EncodedVideo(_) => MESSAGE_TYPE_VIDEO_ENCODED,
            MessageBody::RtpSend(_) | MessageBody::RtpReceive(_) => MESSAGE_TYPE_RTP,
        }
    }

    pub fn subtype(&self) -> u32 {
        match &self.body {
            MessageBody::System(event) => *event as u32,
            MessageBody::RawAudio(frame) => frame.encoding as u32,
            MessageBody::EncodedAudio(frame) => frame.codec as u32,
            MessageBody::RawVideo(frame) => frame.format as u32,
            MessageBody::EncodedVideo(frame) => frame.codec as u32,
            MessageBody::RtpSend(_) => RTP_SUBTYPE_SEND,
            MessageBody::RtpReceive(_) => RTP_SUBTYPE_RECEIVE,
        }
    }

    /// The connection filter: a message traverses an edge if both its type
    /// and its subtype have at least one bit in common with the edge's masks.
    pub fn matches(&self, type_mask: u32, subtype_mask: u32) -> bool {
        self.message_type() & type_mask != 0 && self.subtype() & subtype_mask != 0
    }

    pub fn media_info(&self) -> &MediaInfo {
        &self.info
    }

    pub fn source_id(&self) -> u64 {
        self.info.source_id
    }

    pub fn set_source_id(&mut self, source_id: u64) {
        self.info.source_id = source_id;
    }

    pub fn sampling_instant(&self) -> Option<SystemTime> {
        self.info.sampling_instant
    }

    pub fn set_sampling_instant(&mut self, instant: SystemTime) {
        self.info.sampling_instant = Some(instant);
    }

    pub fn timestamp_unit(&self) -> Option<f64> {
        self.info.timestamp_unit
    }

    pub fn set_timestamp_unit(&mut self, unit: f64) {
        self.info.timestamp_unit = Some(unit);
    }

    /// Carries over source id, sampling instant and timestamp unit from
    /// another message. Type, subtype and payload are not touched.
    pub fn copy_media_info_from(&mut self, other: &Message) {
        self.info = other.info.clone();
    }

    /// A deep clone whose payload no longer shares the emitting stage's
    /// buffer. Required when a message is kept across iterations.
    pub fn copy(&self) -> Message {
        let body = match &self.body {
            MessageBody::System(event) => MessageBody::System(*event),
            MessageBody::RawAudio(frame) => MessageBody::RawAudio(RawAudioFrame {
                payload: detach(&frame.payload),
                ..frame.clone()
            }),
            MessageBody::EncodedAudio(frame) => MessageBody::EncodedAudio(EncodedAudioFrame {
                payload: detach(&frame.payload),
                ..frame.clone()
            }),
            MessageBody::RawVideo(frame) => MessageBody::RawVideo(RawVideoFrame {
                payload: detach(&frame.payload),
                ..frame.clone()
            }),
            MessageBody::EncodedVideo(frame) => MessageBody::EncodedVideo(EncodedVideoFrame {
                payload: detach(&frame.payload),
                ..frame.clone()
            }),
            MessageBody::RtpSend(packet) => MessageBody::RtpSend(RtpSendPacket {
                payload: detach(&packet.payload),
                ..packet.clone()
            }),
            MessageBody::RtpReceive(packet) => MessageBody::RtpReceive(RtpReceivePacket {
                payload: detach(&packet.payload),
                cname: detach(&packet.cname),
                ..packet.clone()
            }),
        };
        Message {
            info: self.info.clone(),
            body,
        }
    }
}

fn detach(payload: &Bytes) -> Bytes {
    Bytes::copy_from_slice(payload)
}

#[cfg(test)]
mod test {
    use super::*;

    fn audio_message() -> Message {
        let frame = RawAudioFrame::new(
            SampleEncoding::S16Le,
            48_000,
            2,
            4,
            Bytes::from(vec![0u8; 16]),
        )
        .expect("valid frame");
        Message::raw_audio(frame)
    }

    #[test]
    fn type_bits_are_distinct_single_bits() {
        let bits = [
            MESSAGE_TYPE_SYSTEM,
            MESSAGE_TYPE_AUDIO_RAW,
            MESSAGE_TYPE_AUDIO_ENCODED,
            MESSAGE_TYPE_VIDEO_RAW,
            MESSAGE_TYPE_VIDEO_ENCODED,
            MESSAGE_TYPE_RTP,
        ];
        for (i, a) in bits.iter().enumerate() {
            assert_eq!(a.count_ones(), 1);
            for b in &bits[i + 1..] {
                assert_eq!(a & b, 0);
            }
        }
    }

    #[test]
    fn raw_audio_payload_size_is_validated() {
        let result = RawAudioFrame::new(
            SampleEncoding::S16Le,
            48_000,
            2,
            4,
            Bytes::from(vec![0u8; 15]),
        );
        assert!(matches!(
            result,
            Err(MessageError::PayloadSizeMismatch {
                expected: 16,
                actual: 15
            })
        ));
    }

    #[test]
    fn filter_requires_both_masks_to_match() {
        let msg = audio_message();
        assert!(msg.matches(MESSAGE_TYPE_ALL, MESSAGE_TYPE_ALL));
        assert!(msg.matches(MESSAGE_TYPE_AUDIO_RAW, MESSAGE_TYPE_ALL));
        assert!(msg.matches(
            MESSAGE_TYPE_AUDIO_RAW | MESSAGE_TYPE_SYSTEM,
            SampleEncoding::S16Le as u32
        ));
        assert!(!msg.matches(MESSAGE_TYPE_AUDIO_ENCODED, MESSAGE_TYPE_ALL));
        assert!(!msg.matches(MESSAGE_TYPE_AUDIO_RAW, SampleEncoding::F32 as u32));
        assert!(!msg.matches(0, MESSAGE_TYPE_ALL));
    }

    #[test]
    fn copy_detaches_the_payload() {
        let msg = audio_message();
        let copy = msg.copy();
        let MessageBody::RawAudio(original) = msg.body() else {
            panic!("not an audio message");
        };
        let MessageBody::RawAudio(copied) = copy.body() else {
            panic!("not an audio message");
        };
        assert_eq!(original.payload, copied.payload);
        assert_ne!(original.payload.as_ptr(), copied.payload.as_ptr());
    }

    #[test]
    fn media_info_carryover_keeps_tags_and_payload() {
        let mut source = audio_message();
        source.set_source_id(42);
        source.set_timestamp_unit(1.0 / 48_000.0);
        source.set_sampling_instant(SystemTime::UNIX_EPOCH);

        let mut sink = Message::system(SystemEvent::IsTime);
        sink.copy_media_info_from(&source);

        assert_eq!(sink.source_id(), 42);
        assert_eq!(sink.sampling_instant(), Some(SystemTime::UNIX_EPOCH));
        assert_eq!(sink.message_type(), MESSAGE_TYPE_SYSTEM);
        assert_eq!(sink.subtype(), SystemEvent::IsTime as u32);
    }

    #[test]
    fn yuv_frame_size_rounds_chroma_up() {
        assert_eq!(PixelFormat::Yuv420p.frame_size(4, 4), Some(24));
        assert_eq!(PixelFormat::Yuv420p.frame_size(5, 5), Some(43));
        assert_eq!(PixelFormat::Rgb24.frame_size(2, 2), Some(12));
    }
}
