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
    message::{Message, MessageBody, RawAudioFrame, SampleEncoding, SystemEvent},
    stage::{Stage, StageCtx},
};
use bytes::Bytes;
use std::f64::consts::TAU;

/// Stereo test-tone source: one cosine per channel, regenerated for every
/// `IsTime` tick, emitted as one float frame block per iteration.
pub struct FrequencyGenerator {
    left_frequency: f64,
    right_frequency: f64,
    left_amplitude: f64,
    right_amplitude: f64,
    sampling_rate: u32,
    frames_per_block: usize,
    current_time: f64,
    time_per_sample: f64,
    block: Option<Message>,
    got_msg: bool,
}

impl FrequencyGenerator {
    pub fn new(
        left_frequency: f64,
        right_frequency: f64,
        left_amplitude: f64,
        right_amplitude: f64,
        sampling_rate: u32,
        interval: std::time::Duration,
    ) -> Self {
        let frames_per_block =
            (f64::from(sampling_rate) * interval.as_secs_f64() + 0.5) as usize;
        FrequencyGenerator {
            left_frequency,
            right_frequency,
            left_amplitude,
            right_amplitude,
            sampling_rate,
            frames_per_block,
            current_time: 0.0,
            time_per_sample: 1.0 / f64::from(sampling_rate),
            block: None,
            got_msg: false,
        }
    }
}

impl Stage for FrequencyGenerator {
    fn name(&self) -> &str {
        "FrequencyGenerator"
    }

    fn push(&mut self, _ctx: &StageCtx<'_>, msg: Message) -> StageResult<()> {
        if !matches!(msg.body(), MessageBody::System(SystemEvent::IsTime)) {
            return Err(StageError::BadMessage {
                msg_type: msg.message_type(),
                subtype: msg.subtype(),
            });
        }

        let mut samples = Vec::with_capacity(self.frames_per_block * 2 * 4);
        for _ in 0..self.frames_per_block {
            let left =
                (self.left_amplitude * (TAU * self.left_frequency * self.current_time).cos()) as f32;
            let right = (self.right_amplitude
                * (TAU * self.right_frequency * self.current_time).cos()) as f32;
            samples.extend_from_slice(&left.to_le_bytes());
            samples.extend_from_slice(&right.to_le_bytes());
            self.current_time += self.time_per_sample;
        }

        let frame = RawAudioFrame::new(
            SampleEncoding::F32,
            self.sampling_rate,
            2,
            self.frames_per_block as u32,
            Bytes::from(samples),
        )?;
        self.block = Some(Message::raw_audio(frame));
        self.got_msg = false;
        Ok(())
    }

    fn pull(&mut self, _ctx: &StageCtx<'_>) -> StageResult<Option<Message>> {
        if self.got_msg {
            self.got_msg = false;
            Ok(None)
        } else {
            self.got_msg = true;
            Ok(self.block.clone())
        }
    }
}
