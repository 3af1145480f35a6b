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

//! A chain is a directed graph of stages with a designated start stage and a
//! worker thread that pumps messages along its connections.
//!
//! Each iteration begins with a `WaitTime` system message pushed into the
//! start stage, which blocks until the period boundary; the start stage is
//! the chain's timing authority. The worker then visits every connection in
//! topological order, draining the source with `pull` until it yields no
//! more and pushing each message that passes the connection's filter into
//! the sink. Feedback connections are skipped in the forward pass and walked
//! in reverse afterwards, threading one [`Feedback`] accumulator through the
//! stages they touch.

use crate::{
    error::{ChainError, ChainResult, StageError},
    message::{MESSAGE_TYPE_ALL, Message, SystemEvent},
    stage::{Feedback, SharedStage, Stage, StageCtx},
    utils::{panic_to_string, set_realtime_priority},
};
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::Duration,
};
use tracing::{error, info, instrument};

pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_CHAIN_ID: AtomicU64 = AtomicU64::new(1);

/// A directed link between two stages. Equality is the full five-tuple:
/// endpoints, feedback flag and both filter masks.
#[derive(Clone)]
pub struct Connection {
    source: SharedStage,
    sink: SharedStage,
    feedback: bool,
    type_mask: u32,
    subtype_mask: u32,
    source_name: String,
    sink_name: String,
}

impl Connection {
    pub fn new(source: SharedStage, sink: SharedStage) -> Self {
        let source_name = stage_name(&source);
        let sink_name = stage_name(&sink);
        Connection {
            source,
            sink,
            feedback: false,
            type_mask: MESSAGE_TYPE_ALL,
            subtype_mask: MESSAGE_TYPE_ALL,
            source_name,
            sink_name,
        }
    }

    /// Marks this connection as a feedback edge. It will not carry messages
    /// in the forward pass; instead the reverse pass calls `process_feedback`
    /// on its endpoints.
    pub fn feedback(mut self) -> Self {
        self.feedback = true;
        self
    }

    /// Restricts the messages travelling over this connection to those whose
    /// type and subtype each share at least one bit with the given masks.
    pub fn filter(mut self, type_mask: u32, subtype_mask: u32) -> Self {
        self.type_mask = type_mask;
        self.subtype_mask = subtype_mask;
        self
    }

    pub fn is_feedback(&self) -> bool {
        self.feedback
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn sink_name(&self) -> &str {
        &self.sink_name
    }

    fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.source, &other.source)
            && Arc::ptr_eq(&self.sink, &other.sink)
            && self.feedback == other.feedback
            && self.type_mask == other.type_mask
            && self.subtype_mask == other.subtype_mask
    }
}

fn stage_name(stage: &SharedStage) -> String {
    stage
        .lock()
        .map(|guard| guard.name().to_owned())
        .unwrap_or_else(|_| "<poisoned>".to_owned())
}

fn stage_key(stage: &SharedStage) -> usize {
    Arc::as_ptr(stage) as *const () as usize
}

fn lock_stage(stage: &SharedStage) -> Result<MutexGuard<'_, dyn Stage + 'static>, StageError> {
    stage.lock().map_err(|_| StageError::Poisoned)
}

/// The execution plan derived from the input connection list: forward
/// connections in scheduling order, and feedback connections in append order
/// (they are traversed back to front at run time).
struct Ordered {
    forward: Vec<Connection>,
    feedback: Vec<Connection>,
}

struct Shared {
    ordered: Mutex<Arc<Ordered>>,
    stop: AtomicBool,
}

#[derive(Debug, Clone)]
pub struct ChainFailure {
    pub stage: String,
    pub message: String,
}

/// Delivered to the exit handler exactly once when the worker exits, either
/// after `stop` (no failure) or after a stage error or panic.
#[derive(Debug, Clone)]
pub struct ChainExit {
    pub chain: String,
    pub failure: Option<ChainFailure>,
}

type ExitHandler = Arc<dyn Fn(ChainExit) + Send + Sync>;

struct WorkerHandle {
    thread: thread::JoinHandle<()>,
    exited: Receiver<()>,
}

pub struct Chain {
    name: Arc<str>,
    id: u64,
    start: Option<SharedStage>,
    start_name: String,
    inputs: Vec<Connection>,
    shared: Arc<Shared>,
    worker: Option<WorkerHandle>,
    exit_handler: Option<ExitHandler>,
    realtime: bool,
}

impl Chain {
    pub fn new(name: &str) -> Self {
        Chain {
            name: Arc::from(name),
            id: NEXT_CHAIN_ID.fetch_add(1, Ordering::Relaxed),
            start: None,
            start_name: String::new(),
            inputs: Vec::new(),
            shared: Arc::new(Shared {
                ordered: Mutex::new(Arc::new(Ordered {
                    forward: Vec::new(),
                    feedback: Vec::new(),
                })),
                stop: AtomicBool::new(false),
            }),
            worker: None,
            exit_handler: None,
            realtime: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The stage that receives the `WaitTime` message and thereby controls
    /// the chain's timing.
    pub fn set_start(&mut self, stage: SharedStage) {
        self.start_name = stage_name(&stage);
        self.start = Some(stage);
    }

    /// Requests FIFO realtime scheduling for the worker thread.
    pub fn set_realtime(&mut self, realtime: bool) {
        self.realtime = realtime;
    }

    pub fn set_exit_handler<F>(&mut self, handler: F)
    where
        F: Fn(ChainExit) + Send + Sync + 'static,
    {
        self.exit_handler = Some(Arc::new(handler));
    }

    pub fn add_connection(&mut self, connection: Connection) -> ChainResult<()> {
        if self.inputs.iter().any(|c| c.same_as(&connection)) {
            return Err(ChainError::DuplicateConnection);
        }
        self.inputs.push(connection);
        Ok(())
    }

    pub fn delete_connection(&mut self, connection: &Connection) -> ChainResult<()> {
        let index = self
            .inputs
            .iter()
            .position(|c| c.same_as(connection))
            .ok_or(ChainError::NoSuchConnection)?;
        self.inputs.remove(index);
        Ok(())
    }

    pub fn clear(&mut self) -> ChainResult<()> {
        if self.is_running() {
            return Err(ChainError::Running);
        }
        self.inputs.clear();
        self.start = None;
        self.start_name.clear();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.thread.is_finished())
    }

    #[instrument(skip(self), fields(chain = %self.name))]
    pub fn start(&mut self) -> ChainResult<()> {
        if self.is_running() {
            return Err(ChainError::AlreadyRunning);
        }
        self.worker = None;

        let start = self.start.clone().ok_or(ChainError::NoStartStage)?;
        let ordered = order_connections(&self.inputs, &start)?;
        *lock_ordered(&self.shared) = Arc::new(ordered);
        self.shared.stop.store(false, Ordering::SeqCst);

        let (exit_tx, exit_rx) = bounded(1);
        let worker = Worker {
            shared: Arc::clone(&self.shared),
            start,
            start_name: self.start_name.clone(),
            chain_id: self.id,
            chain_name: Arc::clone(&self.name),
            exit_handler: self.exit_handler.clone(),
            exit_tx,
            realtime: self.realtime,
        };
        let thread = thread::Builder::new()
            .name(format!("chain-{}", self.name))
            .spawn(move || worker.run())?;
        self.worker = Some(WorkerHandle {
            thread,
            exited: exit_rx,
        });

        info!("Chain '{}' started.", self.name);
        Ok(())
    }

    /// Cooperative stop: the worker finishes its current iteration and
    /// exits. If it is stuck inside a blocking stage for longer than
    /// [`STOP_TIMEOUT`], the worker is left behind and an error is returned;
    /// it will still invoke the exit handler if it ever resumes.
    #[instrument(skip(self), fields(chain = %self.name))]
    pub fn stop(&mut self) -> ChainResult<()> {
        let Some(worker) = self.worker.as_ref() else {
            return Err(ChainError::NotRunning);
        };
        self.shared.stop.store(true, Ordering::SeqCst);

        match worker.exited.recv_timeout(STOP_TIMEOUT) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(worker) = self.worker.take() {
                    worker.thread.join().ok();
                }
                info!("Chain '{}' stopped.", self.name);
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                error!(
                    "Chain '{}' worker refused to exit within {STOP_TIMEOUT:?}.",
                    self.name
                );
                Err(ChainError::StopTimeout(STOP_TIMEOUT))
            }
        }
    }

    /// Re-derives the execution order from the current connection list and
    /// swaps it in. A running worker picks the new order up at its next
    /// iteration boundary.
    pub fn rebuild(&mut self) -> ChainResult<()> {
        let start = self.start.clone().ok_or(ChainError::NoStartStage)?;
        let ordered = order_connections(&self.inputs, &start)?;
        *lock_ordered(&self.shared) = Arc::new(ordered);
        info!("Chain '{}' rebuilt.", self.name);
        Ok(())
    }
}

fn lock_ordered(shared: &Shared) -> MutexGuard<'_, Arc<Ordered>> {
    shared
        .ordered
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Derives the execution plan: rejects cycles in the non-feedback subgraph,
/// then repeatedly appends every connection whose source stage has been
/// reached, starting from the start stage. Connections that can never be
/// appended indicate stages unreachable from the start.
fn order_connections(inputs: &[Connection], start: &SharedStage) -> ChainResult<Ordered> {
    check_acyclic(inputs)?;

    let mut marked: HashSet<usize> = HashSet::new();
    marked.insert(stage_key(start));

    let mut appended = vec![false; inputs.len()];
    let mut forward = Vec::new();
    let mut feedback = Vec::new();
    let mut remaining = inputs.len();

    loop {
        let mut progress = false;
        for (i, connection) in inputs.iter().enumerate() {
            if appended[i] || !marked.contains(&stage_key(&connection.source)) {
                continue;
            }
            appended[i] = true;
            remaining -= 1;
            progress = true;
            marked.insert(stage_key(&connection.sink));
            if connection.feedback {
                feedback.push(connection.clone());
            } else {
                forward.push(connection.clone());
            }
        }
        if !progress {
            break;
        }
    }

    if remaining > 0 {
        let mut names = Vec::new();
        for (i, connection) in inputs.iter().enumerate() {
            if appended[i] {
                continue;
            }
            for name in [&connection.source_name, &connection.sink_name] {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        return Err(ChainError::UnreachableStages(names));
    }

    Ok(Ordered { forward, feedback })
}

/// Kahn's algorithm over the non-feedback subgraph. Cycles are only legal
/// through feedback edges.
fn check_acyclic(inputs: &[Connection]) -> ChainResult<()> {
    let mut indegree: HashMap<usize, usize> = HashMap::new();
    let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();

    for connection in inputs.iter().filter(|c| !c.feedback) {
        let source = stage_key(&connection.source);
        let sink = stage_key(&connection.sink);
        indegree.entry(source).or_insert(0);
        *indegree.entry(sink).or_insert(0) += 1;
        adjacency.entry(source).or_default().push(sink);
    }

    let mut queue: VecDeque<usize> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(node, _)| *node)
        .collect();
    let mut visited = 0;

    while let Some(node) = queue.pop_front() {
        visited += 1;
        if let Some(sinks) = adjacency.get(&node) {
            for sink in sinks {
                if let Some(degree) = indegree.get_mut(sink) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*sink);
                    }
                }
            }
        }
    }

    if visited != indegree.len() {
        return Err(ChainError::Cycle);
    }
    Ok(())
}

struct Worker {
    shared: Arc<Shared>,
    start: SharedStage,
    start_name: String,
    chain_id: u64,
    chain_name: Arc<str>,
    exit_handler: Option<ExitHandler>,
    exit_tx: Sender<()>,
    realtime: bool,
}

impl Worker {
    fn run(self) {
        if self.realtime {
            set_realtime_priority();
        }

        let failure = match catch_unwind(AssertUnwindSafe(|| self.iteration_loop())) {
            Ok(failure) => failure,
            Err(panic) => Some(ChainFailure {
                stage: self.start_name.clone(),
                message: format!("worker panicked: {}", panic_to_string(panic)),
            }),
        };

        match &failure {
            Some(failure) => error!(
                "Chain '{}' stopped after error in stage '{}': {}",
                self.chain_name, failure.stage, failure.message
            ),
            None => info!("Chain '{}' worker exited.", self.chain_name),
        }

        if let Some(handler) = &self.exit_handler {
            let exit = ChainExit {
                chain: self.chain_name.to_string(),
                failure,
            };
            if catch_unwind(AssertUnwindSafe(|| handler(exit))).is_err() {
                error!("Chain '{}' exit handler panicked.", self.chain_name);
            }
        }

        self.exit_tx.send(()).ok();
    }

    fn iteration_loop(&self) -> Option<ChainFailure> {
        let mut iteration: i64 = 1;
        while !self.shared.stop.load(Ordering::SeqCst) {
            if let Err(failure) = self.iterate(iteration) {
                return Some(failure);
            }
            iteration += 1;
        }
        None
    }

    fn iterate(&self, iteration: i64) -> Result<(), ChainFailure> {
        let ordered = Arc::clone(&lock_ordered(&self.shared));
        let ctx = StageCtx {
            chain_id: self.chain_id,
            chain_name: &self.chain_name,
            iteration,
        };

        // The timing push: the start stage blocks here until the period
        // boundary.
        {
            let mut start = lock_stage(&self.start).map_err(|e| fail(&self.start_name, e))?;
            start
                .push(&ctx, Message::system(SystemEvent::WaitTime))
                .map_err(|e| fail(&self.start_name, e))?;
        }

        for connection in &ordered.forward {
            let mut source =
                lock_stage(&connection.source).map_err(|e| fail(&connection.source_name, e))?;
            loop {
                match source.pull(&ctx) {
                    Ok(Some(msg)) => {
                        if !msg.matches(connection.type_mask, connection.subtype_mask) {
                            continue;
                        }
                        drop(source);
                        {
                            let mut sink = lock_stage(&connection.sink)
                                .map_err(|e| fail(&connection.sink_name, e))?;
                            sink.push(&ctx, msg)
                                .map_err(|e| fail(&connection.sink_name, e))?;
                        }
                        source = lock_stage(&connection.source)
                            .map_err(|e| fail(&connection.source_name, e))?;
                    }
                    Ok(None) => break,
                    Err(e) => return Err(fail(&connection.source_name, e)),
                }
            }
        }

        if !ordered.feedback.is_empty() {
            let mut feedback = Feedback::new();
            let mut visited: HashSet<usize> = HashSet::new();
            for (position, connection) in ordered.feedback.iter().rev().enumerate() {
                for (stage, name) in [
                    (&connection.source, &connection.source_name),
                    (&connection.sink, &connection.sink_name),
                ] {
                    if !visited.insert(stage_key(stage)) {
                        continue;
                    }
                    let mut guard = lock_stage(stage).map_err(|e| fail(name, e))?;
                    guard
                        .process_feedback(&ctx, position as i64, &mut feedback)
                        .map_err(|e| fail(name, e))?;
                }
            }
        }

        Ok(())
    }
}

fn fail(stage: &str, error: StageError) -> ChainFailure {
    ChainFailure {
        stage: stage.to_owned(),
        message: error.to_string(),
    }
}
