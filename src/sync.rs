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

//! Inter-stream playback synchronization.
//!
//! Streams that announce the same RTCP CNAME share a sender-side clock.
//! For every such group this module reconstructs, per stream, the remote
//! wallclock time of the sample currently being played out, and derives how
//! much extra delay each stream needs so that all of them play content of
//! the same remote age. The stream with the oldest content sets the pace;
//! every other stream is delayed to match it. Offsets only change when the
//! spread within a group exceeds a tolerance, so small wobbles do not cause
//! audible re-synchronization.
//!
//! The synchronizer may be shared by several chains, each with its own
//! worker thread; a single internal mutex guards all tables.

use crate::{
    error::{SyncError, SyncResult},
    time::unix_seconds,
};
use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant, SystemTime},
};
use tracing::debug;

pub type StreamId = u64;

const RECALCULATION_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_TOLERANCE: Duration = Duration::from_millis(100);

struct StreamTiming {
    sr_wallclock: f64,
    sr_rtp_timestamp: u32,
    last_rtp_timestamp: u32,
    output_stream_offset: f64,
    total_component_delay: f64,
    last_update: Instant,
}

struct StreamRecord {
    group: u64,
    timestamp_unit: f64,
    timing: Option<StreamTiming>,
    sync_offset: f64,
    pending_adjustment: f64,
    remote_wallclock: f64,
}

impl StreamRecord {
    fn new(group: u64, timestamp_unit: f64) -> Self {
        StreamRecord {
            group,
            timestamp_unit,
            timing: None,
            sync_offset: 0.0,
            pending_adjustment: 0.0,
            remote_wallclock: 0.0,
        }
    }

    /// Estimated remote wallclock time of the sample this stream plays out
    /// right now: the sender report anchor, advanced by the timestamp
    /// progress since the report and the local time since that information
    /// arrived, minus everything that delays playback behind reception.
    fn calculate_remote_wallclock(&mut self) {
        let Some(timing) = &self.timing else {
            return;
        };
        let ticks = timing
            .last_rtp_timestamp
            .wrapping_sub(timing.sr_rtp_timestamp) as i32;
        let timestamp_progress = f64::from(ticks) * self.timestamp_unit;
        let info_age = timing.last_update.elapsed().as_secs_f64();

        self.remote_wallclock = timing.sr_wallclock + timestamp_progress + info_age
            - timing.output_stream_offset
            - timing.total_component_delay
            - self.sync_offset;
    }
}

struct Group {
    cname: Vec<u8>,
    members: Vec<StreamId>,
    changed: bool,
    last_calculation: Option<Instant>,
}

struct Tables {
    next_stream_id: StreamId,
    next_group_id: u64,
    streams: HashMap<StreamId, StreamRecord>,
    groups: HashMap<u64, Group>,
    by_cname: HashMap<Vec<u8>, u64>,
    tolerance: f64,
}

impl Tables {
    fn new() -> Self {
        Tables {
            next_stream_id: 1,
            next_group_id: 1,
            streams: HashMap::new(),
            groups: HashMap::new(),
            by_cname: HashMap::new(),
            tolerance: DEFAULT_TOLERANCE.as_secs_f64(),
        }
    }
}

pub struct RtpSynchronizer {
    tables: Mutex<Tables>,
}

impl RtpSynchronizer {
    pub fn new() -> Self {
        RtpSynchronizer {
            tables: Mutex::new(Tables::new()),
        }
    }

    /// Maximum de-synchronization tolerated between streams of one group
    /// before offsets are adjusted.
    pub fn set_tolerance(&self, tolerance: Duration) {
        self.lock().tolerance = tolerance.as_secs_f64();
    }

    pub fn clear(&self) {
        let mut tables = self.lock();
        let tolerance = tables.tolerance;
        *tables = Tables::new();
        tables.tolerance = tolerance;
    }

    /// Registers a stream under its RTCP CNAME, joining the group of other
    /// streams with the same name. `timestamp_unit` is in seconds per RTP
    /// timestamp tick.
    pub fn register(&self, cname: &[u8], timestamp_unit: f64) -> SyncResult<StreamId> {
        if cname.is_empty() {
            return Err(SyncError::InvalidCname);
        }
        let mut tables = self.lock();

        let group_id = match tables.by_cname.get(cname) {
            Some(id) => *id,
            None => {
                let id = tables.next_group_id;
                tables.next_group_id += 1;
                tables.by_cname.insert(cname.to_vec(), id);
                tables.groups.insert(
                    id,
                    Group {
                        cname: cname.to_vec(),
                        members: Vec::new(),
                        changed: false,
                        last_calculation: None,
                    },
                );
                id
            }
        };

        let stream_id = tables.next_stream_id;
        tables.next_stream_id += 1;
        tables
            .streams
            .insert(stream_id, StreamRecord::new(group_id, timestamp_unit));
        if let Some(group) = tables.groups.get_mut(&group_id) {
            group.members.push(stream_id);
            group.changed = true;
        }

        debug!("Registered stream {stream_id} in group {group_id}.");
        Ok(stream_id)
    }

    pub fn unregister(&self, stream_id: StreamId) -> SyncResult<()> {
        let mut tables = self.lock();
        let record = tables
            .streams
            .remove(&stream_id)
            .ok_or(SyncError::UnknownStream(stream_id))?;

        let mut drop_group = false;
        if let Some(group) = tables.groups.get_mut(&record.group) {
            group.members.retain(|member| *member != stream_id);
            group.changed = true;
            drop_group = group.members.is_empty();
        }
        if drop_group {
            if let Some(group) = tables.groups.remove(&record.group) {
                tables.by_cname.remove(&group.cname);
            }
        }
        Ok(())
    }

    /// Stores the latest synchronization inputs for a stream: the most
    /// recent sender report pair, the most recently seen RTP timestamp, and
    /// the local delays between reception and playback.
    pub fn set_stream_info(
        &self,
        stream_id: StreamId,
        sr_wallclock: SystemTime,
        sr_rtp_timestamp: u32,
        current_rtp_timestamp: u32,
        output_stream_offset: Duration,
        total_component_delay: Duration,
    ) -> SyncResult<()> {
        let mut tables = self.lock();
        let record = tables
            .streams
            .get_mut(&stream_id)
            .ok_or(SyncError::UnknownStream(stream_id))?;
        record.timing = Some(StreamTiming {
            sr_wallclock: unix_seconds(sr_wallclock),
            sr_rtp_timestamp,
            last_rtp_timestamp: current_rtp_timestamp,
            output_stream_offset: output_stream_offset.as_secs_f64(),
            total_component_delay: total_component_delay.as_secs_f64(),
            last_update: Instant::now(),
        });
        Ok(())
    }

    /// The additional playback delay the caller should insert for this
    /// stream. Unknown streams and single-stream groups always get zero.
    pub fn synchronization_offset(&self, stream_id: StreamId) -> Duration {
        let mut tables = self.lock();
        let Some(record) = tables.streams.get(&stream_id) else {
            return Duration::ZERO;
        };
        let group_id = record.group;

        let recalculate = tables.groups.get(&group_id).is_some_and(|group| {
            group.changed
                || group
                    .last_calculation
                    .is_none_or(|at| at.elapsed() > RECALCULATION_INTERVAL)
        });

        if recalculate {
            let tolerance = tables.tolerance;
            recalculate_group(&mut tables, group_id, tolerance);
        }

        tables
            .streams
            .get(&stream_id)
            .map(|record| Duration::from_secs_f64(record.sync_offset.max(0.0)))
            .unwrap_or(Duration::ZERO)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RtpSynchronizer {
    fn default() -> Self {
        RtpSynchronizer::new()
    }
}

fn recalculate_group(tables: &mut Tables, group_id: u64, tolerance: f64) {
    let members = match tables.groups.get_mut(&group_id) {
        Some(group) => {
            group.changed = false;
            group.last_calculation = Some(Instant::now());
            group.members.clone()
        }
        None => return,
    };

    // Remote wallclock reconstruction for every stream with info; the spread
    // between the fastest and slowest pipeline decides whether to act.
    let mut min_remote: Option<f64> = None;
    let mut max_remote: Option<f64> = None;
    for member in &members {
        let Some(record) = tables.streams.get_mut(member) else {
            continue;
        };
        if record.timing.is_none() {
            continue;
        }
        record.calculate_remote_wallclock();
        let remote = record.remote_wallclock;
        min_remote = Some(min_remote.map_or(remote, |current| current.min(remote)));
        max_remote = Some(max_remote.map_or(remote, |current| current.max(remote)));
    }
    let (Some(min_remote), Some(max_remote)) = (min_remote, max_remote) else {
        return;
    };

    for member in &members {
        if let Some(record) = tables.streams.get_mut(member) {
            if record.timing.is_some() {
                record.pending_adjustment = record.remote_wallclock - min_remote;
            }
        }
    }

    let spread = max_remote - min_remote;
    if spread <= tolerance {
        debug!("Group {group_id} spread {spread:.4} s within tolerance, offsets unchanged.");
        return;
    }

    // Fold the adjustments in, then rebase so the slowest stream sits at
    // offset zero.
    let mut min_offset: Option<f64> = None;
    for member in &members {
        if let Some(record) = tables.streams.get_mut(member) {
            if record.timing.is_some() {
                record.sync_offset += record.pending_adjustment;
                min_offset =
                    Some(min_offset.map_or(record.sync_offset, |current| {
                        current.min(record.sync_offset)
                    }));
            }
        }
    }
    let Some(min_offset) = min_offset else {
        return;
    };
    for member in &members {
        if let Some(record) = tables.streams.get_mut(member) {
            if record.timing.is_some() {
                record.sync_offset -= min_offset;
            }
        }
    }

    debug!("Group {group_id} re-synchronized, spread was {spread:.4} s.");
}

#[cfg(test)]
mod test {
    use super::*;

    const UNIT_48K: f64 = 1.0 / 48_000.0;

    fn wallclock(seconds: f64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs_f64(seconds)
    }

    fn close(a: Duration, b: Duration) -> bool {
        let a = a.as_secs_f64();
        let b = b.as_secs_f64();
        (a - b).abs() < 0.005
    }

    #[test]
    fn single_stream_groups_stay_at_zero() {
        let sync = RtpSynchronizer::new();
        let id = sync.register(b"solo@host", UNIT_48K).expect("register");
        sync.set_stream_info(
            id,
            wallclock(100.0),
            0,
            48_000,
            Duration::ZERO,
            Duration::ZERO,
        )
        .expect("info");
        assert_eq!(sync.synchronization_offset(id), Duration::ZERO);
    }

    #[test]
    fn the_stream_running_ahead_is_delayed_to_the_slowest() {
        let sync = RtpSynchronizer::new();
        let one = sync.register(b"host@example", UNIT_48K).expect("register");
        let two = sync.register(b"host@example", UNIT_48K).expect("register");

        // Both streams currently show timestamp 48000; stream two's sender
        // report anchors it 0.2 s later in remote time, so its pipeline
        // delivers fresher content and has to wait for stream one.
        sync.set_stream_info(
            one,
            wallclock(100.0),
            0,
            48_000,
            Duration::ZERO,
            Duration::ZERO,
        )
        .expect("info one");
        sync.set_stream_info(
            two,
            wallclock(100.2),
            0,
            48_000,
            Duration::ZERO,
            Duration::ZERO,
        )
        .expect("info two");

        let offset_one = sync.synchronization_offset(one);
        let offset_two = sync.synchronization_offset(two);

        assert!(close(offset_one, Duration::ZERO), "got {offset_one:?}");
        assert!(
            close(offset_two, Duration::from_millis(200)),
            "got {offset_two:?}"
        );
        assert_eq!(offset_one.min(offset_two), offset_one);
    }

    #[test]
    fn differences_within_tolerance_leave_offsets_unchanged() {
        let sync = RtpSynchronizer::new();
        let one = sync.register(b"host@example", UNIT_48K).expect("register");
        let two = sync.register(b"host@example", UNIT_48K).expect("register");

        sync.set_stream_info(
            one,
            wallclock(100.0),
            0,
            48_000,
            Duration::ZERO,
            Duration::ZERO,
        )
        .expect("info one");
        sync.set_stream_info(
            two,
            wallclock(100.05),
            0,
            48_000,
            Duration::ZERO,
            Duration::ZERO,
        )
        .expect("info two");

        assert_eq!(sync.synchronization_offset(one), Duration::ZERO);
        assert_eq!(sync.synchronization_offset(two), Duration::ZERO);
    }

    #[test]
    fn after_adjustment_the_group_minimum_is_zero() {
        let sync = RtpSynchronizer::new();
        let ids: Vec<_> = (0..3)
            .map(|_| sync.register(b"trio@host", UNIT_48K).expect("register"))
            .collect();
        for (i, id) in ids.iter().enumerate() {
            sync.set_stream_info(
                *id,
                wallclock(100.0 + 0.3 * i as f64),
                0,
                48_000,
                Duration::ZERO,
                Duration::ZERO,
            )
            .expect("info");
        }

        let offsets: Vec<_> = ids
            .iter()
            .map(|id| sync.synchronization_offset(*id))
            .collect();
        let min = offsets.iter().min().copied().unwrap_or_default();
        assert!(close(min, Duration::ZERO));
        assert!(close(offsets[1], Duration::from_millis(300)));
        assert!(close(offsets[2], Duration::from_millis(600)));
    }

    #[test]
    fn register_unregister_leaves_tables_unchanged() {
        let sync = RtpSynchronizer::new();
        let keep = sync.register(b"keep@host", UNIT_48K).expect("register");

        let transient = sync.register(b"gone@host", UNIT_48K).expect("register");
        sync.unregister(transient).expect("unregister");

        {
            let tables = sync.lock();
            assert_eq!(tables.streams.len(), 1);
            assert_eq!(tables.groups.len(), 1);
            assert_eq!(tables.by_cname.len(), 1);
        }
        assert_eq!(sync.synchronization_offset(keep), Duration::ZERO);
        assert!(matches!(
            sync.unregister(transient),
            Err(SyncError::UnknownStream(_))
        ));
    }

    #[test]
    fn empty_cname_is_rejected() {
        let sync = RtpSynchronizer::new();
        assert!(matches!(
            sync.register(b"", UNIT_48K),
            Err(SyncError::InvalidCname)
        ));
    }

    #[test]
    fn playback_delays_shift_the_remote_clock_back() {
        let sync = RtpSynchronizer::new();
        let one = sync.register(b"delay@host", UNIT_48K).expect("register");
        let two = sync.register(b"delay@host", UNIT_48K).expect("register");

        // Stream two is anchored 0.3 s ahead but already buffers 0.3 s of
        // playback delay, so both pipelines present equally old content.
        sync.set_stream_info(
            one,
            wallclock(100.0),
            0,
            48_000,
            Duration::ZERO,
            Duration::ZERO,
        )
        .expect("info one");
        sync.set_stream_info(
            two,
            wallclock(100.3),
            0,
            48_000,
            Duration::from_millis(150),
            Duration::from_millis(150),
        )
        .expect("info two");

        assert_eq!(sync.synchronization_offset(one), Duration::ZERO);
        assert_eq!(sync.synchronization_offset(two), Duration::ZERO);
    }
}
