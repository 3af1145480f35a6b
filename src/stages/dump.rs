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
    error::StageResult,
    message::Message,
    stage::{Stage, StageCtx},
};
use tracing::debug;

/// Debugging sink: accepts everything, counts it, and logs the tags.
#[derive(Default)]
pub struct MessageDump {
    count: u64,
}

impl MessageDump {
    pub fn new() -> Self {
        MessageDump::default()
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Stage for MessageDump {
    fn name(&self) -> &str {
        "MessageDump"
    }

    fn push(&mut self, ctx: &StageCtx<'_>, msg: Message) -> StageResult<()> {
        self.count += 1;
        debug!(
            "[{}] message {}: iteration {}, type 0x{:08x}, subtype {}, source {}",
            ctx.chain_name,
            self.count,
            ctx.iteration,
            msg.message_type(),
            msg.subtype(),
            msg.source_id()
        );
        Ok(())
    }

    fn pull(&mut self, _ctx: &StageCtx<'_>) -> StageResult<Option<Message>> {
        Ok(None)
    }
}
