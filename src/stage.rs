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

//! The stage contract every media-processing unit implements.
//!
//! Stages are owned by the application and handed to chains as
//! [`SharedStage`] handles. The mutex in the handle is the stage lock: the
//! chain worker holds it for the duration of a single `push`, `pull` or
//! `process_feedback` call, and controller threads may take the same lock to
//! adjust stage parameters while the chain is running.

use crate::{error::StageResult, message::Message};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

/// Identity of the chain currently driving a stage, plus the iteration
/// counter of its worker loop. Iterations start at 1 and increase strictly
/// monotonically for the lifetime of a worker.
#[derive(Debug, Clone, Copy)]
pub struct StageCtx<'a> {
    pub chain_id: u64,
    pub chain_name: &'a str,
    pub iteration: i64,
}

pub trait Stage: Send {
    /// Persistent stage name used in error reports.
    fn name(&self) -> &str;

    /// Feeds one message into the stage. A stage may buffer the message for
    /// later pulls, transform it, or process and discard it.
    fn push(&mut self, ctx: &StageCtx<'_>, msg: Message) -> StageResult<()>;

    /// Retrieves the next output message. `Ok(None)` signals the end of this
    /// round's output; the stage must then be able to restart the sequence
    /// from the first message, so that several outgoing connections can each
    /// drain the full set.
    fn pull(&mut self, ctx: &StageCtx<'_>) -> StageResult<Option<Message>>;

    /// Accumulates feedback travelling backwards through the chain. Called at
    /// most once per reverse pass; the default does nothing.
    fn process_feedback(
        &mut self,
        ctx: &StageCtx<'_>,
        feedback_id: i64,
        feedback: &mut Feedback,
    ) -> StageResult<()> {
        let _ = (ctx, feedback_id, feedback);
        Ok(())
    }
}

pub type SharedStage = Arc<Mutex<dyn Stage>>;

pub fn shared<S: Stage + 'static>(stage: S) -> SharedStage {
    Arc::new(Mutex::new(stage))
}

/// The accumulator passed along feedback edges in reverse scheduling order.
/// Downstream stages add the delay they introduce; upstream stages read the
/// total to, for example, time playback or feed the synchronizer.
#[derive(Debug, Clone, Default)]
pub struct Feedback {
    playback_delay: Duration,
}

impl Feedback {
    pub fn new() -> Self {
        Feedback::default()
    }

    pub fn add_playback_delay(&mut self, delay: Duration) {
        self.playback_delay += delay;
    }

    pub fn set_playback_delay(&mut self, delay: Duration) {
        self.playback_delay = delay;
    }

    pub fn playback_delay(&self) -> Duration {
        self.playback_delay
    }
}
