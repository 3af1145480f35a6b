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

use crate::{
    error::{StageError, StageResult},
    message::{Message, MessageBody, RawAudioFrame, SampleEncoding},
    queue::MessageTransform,
    stage::StageCtx,
};
use bytes::Bytes;

/// Converts raw audio between sample encodings through a normalized f64
/// intermediate. Wrap it in a [`TransformStage`](crate::queue::TransformStage)
/// to use it in a chain.
pub struct SampleConverter {
    destination: SampleEncoding,
}

impl SampleConverter {
    pub fn new(destination: SampleEncoding) -> Self {
        SampleConverter { destination }
    }
}

impl MessageTransform for SampleConverter {
    fn name(&self) -> &str {
        "SampleConverter"
    }

    fn transform(&mut self, _ctx: &StageCtx<'_>, msg: &Message) -> StageResult<Option<Message>> {
        let MessageBody::RawAudio(frame) = msg.body() else {
            return Err(StageError::BadMessage {
                msg_type: msg.message_type(),
                subtype: msg.subtype(),
            });
        };

        if frame.encoding == self.destination {
            return Ok(Some(msg.clone()));
        }

        let source_width = frame.encoding.bytes_per_sample();
        let mut converted =
            Vec::with_capacity(frame.samples() * self.destination.bytes_per_sample());
        for sample in frame.payload.chunks_exact(source_width) {
            let value = read_sample(frame.encoding, sample);
            write_sample(self.destination, value, &mut converted);
        }

        let out_frame = RawAudioFrame::new(
            self.destination,
            frame.sampling_rate,
            frame.channels,
            frame.frames,
            Bytes::from(converted),
        )?;
        let mut out = Message::raw_audio(out_frame);
        out.copy_media_info_from(msg);
        Ok(Some(out))
    }
}

fn read_sample(encoding: SampleEncoding, bytes: &[u8]) -> f64 {
    match encoding {
        SampleEncoding::U8 => (f64::from(bytes[0]) - 128.0) / 128.0,
        SampleEncoding::S8 => f64::from(bytes[0] as i8) / 128.0,
        SampleEncoding::S16Le => f64::from(i16::from_le_bytes([bytes[0], bytes[1]])) / 32_768.0,
        SampleEncoding::S16Be => f64::from(i16::from_be_bytes([bytes[0], bytes[1]])) / 32_768.0,
        SampleEncoding::U16Le => {
            (f64::from(u16::from_le_bytes([bytes[0], bytes[1]])) - 32_768.0) / 32_768.0
        }
        SampleEncoding::U16Be => {
            (f64::from(u16::from_be_bytes([bytes[0], bytes[1]])) - 32_768.0) / 32_768.0
        }
        SampleEncoding::F32 => f64::from(f32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ])),
        SampleEncoding::F64 => f64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]),
    }
}

fn write_sample(encoding: SampleEncoding, value: f64, out: &mut Vec<u8>) {
    let value = value.clamp(-1.0, 1.0);
    match encoding {
        SampleEncoding::U8 => out.push((value * 127.0 + 128.0) as u8),
        SampleEncoding::S8 => out.push((value * 127.0) as i8 as u8),
        SampleEncoding::S16Le => out.extend_from_slice(&((value * 32_767.0) as i16).to_le_bytes()),
        SampleEncoding::S16Be => out.extend_from_slice(&((value * 32_767.0) as i16).to_be_bytes()),
        SampleEncoding::U16Le => {
            out.extend_from_slice(&((value * 32_767.0 + 32_768.0) as u16).to_le_bytes())
        }
        SampleEncoding::U16Be => {
            out.extend_from_slice(&((value * 32_767.0 + 32_768.0) as u16).to_be_bytes())
        }
        SampleEncoding::F32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
        SampleEncoding::F64 => out.extend_from_slice(&value.to_le_bytes()),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{queue::TransformStage, stage::Stage};

    fn ctx(iteration: i64) -> StageCtx<'static> {
        StageCtx {
            chain_id: 1,
            chain_name: "test",
            iteration,
        }
    }

    fn float_frame(samples: &[f32]) -> Message {
        let mut payload = Vec::new();
        for sample in samples {
            payload.extend_from_slice(&sample.to_le_bytes());
        }
        let frame = RawAudioFrame::new(
            SampleEncoding::F32,
            48_000,
            1,
            samples.len() as u32,
            Bytes::from(payload),
        )
        .expect("valid frame");
        Message::raw_audio(frame)
    }

    #[test]
    fn float_to_s16be_and_back_preserves_values() {
        let mut to_s16 = SampleConverter::new(SampleEncoding::S16Be);
        let mut to_f32 = SampleConverter::new(SampleEncoding::F32);

        let original = [0.0f32, 0.5, -0.5, 0.999];
        let msg = float_frame(&original);
        let s16 = to_s16
            .transform(&ctx(1), &msg)
            .expect("convert")
            .expect("message");
        let back = to_f32
            .transform(&ctx(1), &s16)
            .expect("convert")
            .expect("message");

        let MessageBody::RawAudio(frame) = back.body() else {
            panic!("not raw audio");
        };
        for (i, expected) in original.iter().enumerate() {
            let sample = f32::from_le_bytes([
                frame.payload[i * 4],
                frame.payload[i * 4 + 1],
                frame.payload[i * 4 + 2],
                frame.payload[i * 4 + 3],
            ]);
            assert!(
                (sample - expected).abs() < 1.0 / 16_384.0,
                "sample {i}: {sample} vs {expected}"
            );
        }
    }

    #[test]
    fn media_info_is_carried_over() {
        let mut converter = SampleConverter::new(SampleEncoding::U8);
        let mut msg = float_frame(&[0.25, -0.25]);
        msg.set_source_id(99);
        msg.set_timestamp_unit(1.0 / 48_000.0);

        let out = converter
            .transform(&ctx(1), &msg)
            .expect("convert")
            .expect("message");
        assert_eq!(out.source_id(), 99);
        assert_eq!(out.timestamp_unit(), Some(1.0 / 48_000.0));
        assert_eq!(out.subtype(), SampleEncoding::U8 as u32);
    }

    #[test]
    fn same_encoding_passes_through() {
        let mut converter = SampleConverter::new(SampleEncoding::F32);
        let msg = float_frame(&[0.1]);
        let out = converter
            .transform(&ctx(1), &msg)
            .expect("convert")
            .expect("message");
        let (MessageBody::RawAudio(a), MessageBody::RawAudio(b)) = (msg.body(), out.body()) else {
            panic!("not raw audio");
        };
        assert_eq!(a.payload, b.payload);
    }

    #[test]
    fn wrapped_in_a_transform_stage_it_queues_one_output_per_input() {
        let mut stage = TransformStage::new(SampleConverter::new(SampleEncoding::S16Le));
        stage.push(&ctx(1), float_frame(&[0.5])).expect("push");
        assert!(stage.pull(&ctx(1)).expect("pull").is_some());
        assert!(stage.pull(&ctx(1)).expect("pull").is_none());
    }

    #[test]
    fn non_audio_input_is_an_error() {
        let mut converter = SampleConverter::new(SampleEncoding::S16Le);
        let msg = Message::system(crate::message::SystemEvent::IsTime);
        assert!(matches!(
            converter.transform(&ctx(1), &msg),
            Err(StageError::BadMessage { .. })
        ));
    }
}
