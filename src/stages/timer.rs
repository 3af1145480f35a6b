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

//! Timing stages. Placed at the start of a chain they decide when each
//! iteration runs: the chain worker pushes `WaitTime` into them and they
//! block until the next period boundary, then emit one `IsTime` message.

use crate::{
    error::{StageError, StageResult},
    message::{Message, MessageBody, SystemEvent},
    stage::{Stage, StageCtx},
};
use std::{
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

/// Periodic timing authority. Sleeps until `start + iteration × interval`,
/// so individual iterations may jitter but the average rate stays exact.
pub struct IntervalTimer {
    interval: Duration,
    driver: Option<(u64, Instant)>,
    got_msg: bool,
}

impl IntervalTimer {
    pub fn new(interval: Duration) -> Self {
        IntervalTimer {
            interval,
            driver: None,
            got_msg: false,
        }
    }

    /// Forgets the driving chain and the time base, so the timer can be
    /// reused in a restarted or different chain.
    pub fn reset(&mut self) {
        self.driver = None;
        self.got_msg = false;
    }
}

impl Stage for IntervalTimer {
    fn name(&self) -> &str {
        "IntervalTimer"
    }

    fn push(&mut self, ctx: &StageCtx<'_>, msg: Message) -> StageResult<()> {
        let (chain_id, start) = *self
            .driver
            .get_or_insert_with(|| (ctx.chain_id, Instant::now()));
        if chain_id != ctx.chain_id {
            return Err(StageError::WrongChain(ctx.chain_name.to_owned()));
        }

        if !matches!(msg.body(), MessageBody::System(SystemEvent::WaitTime)) {
            return Err(StageError::BadMessage {
                msg_type: msg.message_type(),
                subtype: msg.subtype(),
            });
        }

        let target = start + self.interval.mul_f64(ctx.iteration as f64);
        let now = Instant::now();
        if target > now {
            thread::sleep(target - now);
        }

        self.got_msg = false;
        Ok(())
    }

    fn pull(&mut self, ctx: &StageCtx<'_>) -> StageResult<Option<Message>> {
        match self.driver {
            Some((chain_id, _)) if chain_id == ctx.chain_id => {}
            _ => return Err(StageError::WrongChain(ctx.chain_name.to_owned())),
        }

        if self.got_msg {
            self.got_msg = false;
            Ok(None)
        } else {
            self.got_msg = true;
            Ok(Some(Message::system(SystemEvent::IsTime)))
        }
    }
}

struct Signal {
    pending: Mutex<bool>,
    condvar: Condvar,
}

/// Timing stage driven by another chain: its paired [`TriggerStage`] is
/// placed as a sink in the producing chain, and every `count` messages
/// pushed into the trigger release one iteration here. The safety timeout
/// keeps this chain alive if the producing chain stalls or dies.
pub struct InterChainTimer {
    signal: Arc<Signal>,
    safety_timeout: Duration,
    got_msg: bool,
}

impl InterChainTimer {
    pub fn new(count: u32, safety_timeout: Duration) -> (Self, TriggerStage) {
        let signal = Arc::new(Signal {
            pending: Mutex::new(false),
            condvar: Condvar::new(),
        });
        let timer = InterChainTimer {
            signal: Arc::clone(&signal),
            safety_timeout,
            got_msg: false,
        };
        let trigger = TriggerStage {
            signal,
            target_count: count.max(1),
            counter: 0,
        };
        (timer, trigger)
    }
}

impl Stage for InterChainTimer {
    fn name(&self) -> &str {
        "InterChainTimer"
    }

    fn push(&mut self, _ctx: &StageCtx<'_>, msg: Message) -> StageResult<()> {
        if !matches!(msg.body(), MessageBody::System(SystemEvent::WaitTime)) {
            return Err(StageError::BadMessage {
                msg_type: msg.message_type(),
                subtype: msg.subtype(),
            });
        }

        let guard = self
            .signal
            .pending
            .lock()
            .map_err(|_| StageError::Poisoned)?;
        let (mut guard, _timeout) = self
            .signal
            .condvar
            .wait_timeout_while(guard, self.safety_timeout, |pending| !*pending)
            .map_err(|_| StageError::Poisoned)?;
        *guard = false;

        self.got_msg = false;
        Ok(())
    }

    fn pull(&mut self, _ctx: &StageCtx<'_>) -> StageResult<Option<Message>> {
        if self.got_msg {
            self.got_msg = false;
            Ok(None)
        } else {
            self.got_msg = true;
            Ok(Some(Message::system(SystemEvent::IsTime)))
        }
    }
}

/// The producing-chain end of an [`InterChainTimer`]. Accepts any message
/// and counts it; no output.
pub struct TriggerStage {
    signal: Arc<Signal>,
    target_count: u32,
    counter: u32,
}

impl Stage for TriggerStage {
    fn name(&self) -> &str {
        "InterChainTimer::Trigger"
    }

    fn push(&mut self, _ctx: &StageCtx<'_>, _msg: Message) -> StageResult<()> {
        self.counter += 1;
        if self.counter >= self.target_count {
            self.counter = 0;
            let mut pending = self
                .signal
                .pending
                .lock()
                .map_err(|_| StageError::Poisoned)?;
            *pending = true;
            self.signal.condvar.notify_one();
        }
        Ok(())
    }

    fn pull(&mut self, _ctx: &StageCtx<'_>) -> StageResult<Option<Message>> {
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ctx(chain_id: u64, iteration: i64) -> StageCtx<'static> {
        StageCtx {
            chain_id,
            chain_name: "test",
            iteration,
        }
    }

    #[test]
    fn interval_timer_paces_iterations() {
        let mut timer = IntervalTimer::new(Duration::from_millis(20));
        let started = Instant::now();
        for iteration in 1..=3 {
            timer
                .push(&ctx(1, iteration), Message::system(SystemEvent::WaitTime))
                .expect("wait");
            assert!(timer.pull(&ctx(1, iteration)).expect("pull").is_some());
            assert!(timer.pull(&ctx(1, iteration)).expect("pull").is_none());
        }
        assert!(started.elapsed() >= Duration::from_millis(55));
    }

    #[test]
    fn interval_timer_rejects_a_second_chain() {
        let mut timer = IntervalTimer::new(Duration::from_millis(1));
        timer
            .push(&ctx(1, 1), Message::system(SystemEvent::WaitTime))
            .expect("first chain");
        assert!(matches!(
            timer.push(&ctx(2, 1), Message::system(SystemEvent::WaitTime)),
            Err(StageError::WrongChain(_))
        ));
    }

    #[test]
    fn interval_timer_rejects_non_waittime_messages() {
        let mut timer = IntervalTimer::new(Duration::from_millis(1));
        assert!(matches!(
            timer.push(&ctx(1, 1), Message::system(SystemEvent::IsTime)),
            Err(StageError::BadMessage { .. })
        ));
    }

    #[test]
    fn trigger_releases_the_interchain_timer() {
        let (mut timer, mut trigger) = InterChainTimer::new(2, Duration::from_secs(1));

        trigger
            .push(&ctx(1, 1), Message::system(SystemEvent::IsTime))
            .expect("first trigger");
        trigger
            .push(&ctx(1, 1), Message::system(SystemEvent::IsTime))
            .expect("second trigger");

        let started = Instant::now();
        timer
            .push(&ctx(2, 1), Message::system(SystemEvent::WaitTime))
            .expect("wait");
        // signal was already pending, so the wait returns without timing out
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(timer.pull(&ctx(2, 1)).expect("pull").is_some());
    }

    #[test]
    fn interchain_timer_times_out_without_trigger() {
        let (mut timer, _trigger) = InterChainTimer::new(1, Duration::from_millis(30));
        let started = Instant::now();
        timer
            .push(&ctx(1, 1), Message::system(SystemEvent::WaitTime))
            .expect("wait");
        assert!(started.elapsed() >= Duration::from_millis(25));
    }
}
