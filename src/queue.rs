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

//! Building blocks for stages that emit zero or more messages per input and
//! keep per-source state, e.g. one decoder instance per SSRC.
//!
//! [`OutputQueue`] holds the pending output of the current iteration and
//! replays it once per outgoing connection; leftovers are discarded when the
//! iteration advances. The state map is swept lazily: at most once per
//! expiration interval, entries idle for longer than the interval are
//! evicted.

use crate::{
    error::{QueueError, QueueResult, StageResult},
    message::Message,
    stage::{Stage, StageCtx},
};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tracing::debug;

pub struct StateEntry<S> {
    state: S,
    last_update: Instant,
}

impl<S> StateEntry<S> {
    fn new(state: S) -> Self {
        StateEntry {
            state,
            last_update: Instant::now(),
        }
    }

    pub fn get(&self) -> &S {
        &self.state
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.state
    }

    /// Refreshes the idle timer. Call this whenever the state was used for an
    /// active source, otherwise the entry will eventually be evicted.
    pub fn touch(&mut self) {
        self.last_update = Instant::now();
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }
}

pub struct OutputQueue<S = ()> {
    messages: Vec<Message>,
    cursor: usize,
    prev_iteration: i64,
    states: HashMap<u64, StateEntry<S>>,
    expiration: Option<Duration>,
    last_expire_check: Instant,
}

impl<S> OutputQueue<S> {
    pub fn new() -> Self {
        OutputQueue {
            messages: Vec::new(),
            cursor: 0,
            prev_iteration: -1,
            states: HashMap::new(),
            expiration: None,
            last_expire_check: Instant::now(),
        }
    }

    /// A queue whose per-source states are evicted after being idle for
    /// `delay`. The sweep itself runs at most once per `delay`.
    pub fn with_expiration(delay: Duration) -> Self {
        let mut queue = OutputQueue::new();
        queue.expiration = Some(delay);
        queue
    }

    /// Discards the previous iteration's unread messages when the iteration
    /// advances, and triggers the state sweep. Call this at the top of `push`
    /// before enqueueing new output.
    pub fn check_iteration(&mut self, iteration: i64) {
        if iteration != self.prev_iteration {
            self.prev_iteration = iteration;
            self.messages.clear();
            self.cursor = 0;
            if self.expiration.is_some() {
                self.expire();
            }
        }
    }

    pub fn enqueue(&mut self, msg: Message) {
        self.messages.push(msg);
    }

    /// FIFO drain with replay: yields the queued messages in order, then
    /// `None`, then starts over from the first message.
    pub fn pull(&mut self, iteration: i64) -> Option<Message> {
        self.check_iteration(iteration);
        if self.cursor >= self.messages.len() {
            self.cursor = 0;
            None
        } else {
            let msg = self.messages[self.cursor].clone();
            self.cursor += 1;
            Some(msg)
        }
    }

    pub fn find_state(&mut self, source_id: u64) -> Option<&mut StateEntry<S>> {
        self.states.get_mut(&source_id)
    }

    pub fn add_state(&mut self, source_id: u64, state: S) -> QueueResult<()> {
        if self.states.contains_key(&source_id) {
            return Err(QueueError::StateExists(source_id));
        }
        self.states.insert(source_id, StateEntry::new(state));
        Ok(())
    }

    pub fn remove_state(&mut self, source_id: u64) -> Option<S> {
        self.states.remove(&source_id).map(|entry| entry.state)
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.cursor = 0;
        self.states.clear();
    }

    fn expire(&mut self) {
        let Some(delay) = self.expiration else {
            return;
        };
        let now = Instant::now();
        if now.duration_since(self.last_expire_check) < delay {
            return;
        }
        self.states.retain(|source_id, entry| {
            let keep = now.duration_since(entry.last_update) <= delay;
            if !keep {
                debug!("Evicting idle state for source {source_id}.");
            }
            keep
        });
        self.last_expire_check = now;
    }
}

impl<S> Default for OutputQueue<S> {
    fn default() -> Self {
        OutputQueue::new()
    }
}

/// The simple one-in/zero-or-one-out variant: implement [`MessageTransform`]
/// and wrap it in a [`TransformStage`] to get the queue boilerplate for free.
pub trait MessageTransform: Send {
    fn name(&self) -> &str;

    fn transform(&mut self, ctx: &StageCtx<'_>, msg: &Message) -> StageResult<Option<Message>>;
}

pub struct TransformStage<T> {
    inner: T,
    queue: OutputQueue,
}

impl<T: MessageTransform> TransformStage<T> {
    pub fn new(inner: T) -> Self {
        TransformStage {
            inner,
            queue: OutputQueue::new(),
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T: MessageTransform> Stage for TransformStage<T> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn push(&mut self, ctx: &StageCtx<'_>, msg: Message) -> StageResult<()> {
        self.queue.check_iteration(ctx.iteration);
        if let Some(out) = self.inner.transform(ctx, &msg)? {
            self.queue.enqueue(out);
        }
        Ok(())
    }

    fn pull(&mut self, ctx: &StageCtx<'_>) -> StageResult<Option<Message>> {
        Ok(self.queue.pull(ctx.iteration))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::SystemEvent;
    use std::thread;

    fn msg() -> Message {
        Message::system(SystemEvent::IsTime)
    }

    #[test]
    fn pull_replays_after_none() {
        let mut queue: OutputQueue = OutputQueue::new();
        queue.check_iteration(1);
        queue.enqueue(msg());
        queue.enqueue(msg());

        assert!(queue.pull(1).is_some());
        assert!(queue.pull(1).is_some());
        assert!(queue.pull(1).is_none());
        // the next consumer starts over from the first message
        assert!(queue.pull(1).is_some());
        assert!(queue.pull(1).is_some());
        assert!(queue.pull(1).is_none());
    }

    #[test]
    fn new_iteration_discards_leftovers() {
        let mut queue: OutputQueue = OutputQueue::new();
        queue.check_iteration(1);
        queue.enqueue(msg());
        queue.enqueue(msg());
        assert!(queue.pull(1).is_some());

        assert!(queue.pull(2).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn duplicate_state_is_rejected() {
        let mut queue: OutputQueue<u32> = OutputQueue::new();
        queue.add_state(7, 1).expect("first add");
        assert!(matches!(
            queue.add_state(7, 2),
            Err(QueueError::StateExists(7))
        ));
        assert_eq!(queue.find_state(7).map(|entry| *entry.get()), Some(1));
    }

    #[test]
    fn idle_states_expire_within_two_intervals() {
        let delay = Duration::from_millis(40);
        let mut queue: OutputQueue<u32> = OutputQueue::with_expiration(delay);
        queue.check_iteration(1);
        queue.add_state(1, 0).expect("add");

        // still present before the idle delay has passed
        thread::sleep(Duration::from_millis(10));
        queue.check_iteration(2);
        assert!(queue.find_state(1).is_some());

        // gone at the latest after twice the delay (lazy sweep)
        thread::sleep(Duration::from_millis(90));
        queue.check_iteration(3);
        assert!(queue.find_state(1).is_none());
    }

    #[test]
    fn touched_states_survive_the_sweep() {
        let delay = Duration::from_millis(40);
        let mut queue: OutputQueue<u32> = OutputQueue::with_expiration(delay);
        queue.check_iteration(1);
        queue.add_state(1, 0).expect("add");

        for iteration in 2..8 {
            thread::sleep(Duration::from_millis(15));
            queue.check_iteration(iteration);
            let entry = queue.find_state(1).expect("state still present");
            entry.touch();
        }
        assert_eq!(queue.state_count(), 1);
    }
}
