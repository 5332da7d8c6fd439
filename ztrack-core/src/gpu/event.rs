//
// Licensed to the Apache Software Foundation (ASF) under one or more
// contributor license agreements.  See the NOTICE file distributed with
// this work for additional information regarding copyright ownership.
// The ASF licenses this file to You under the Apache License, Version 2.0
// (the "License"); you may not use this file except in compliance with
// the License.  You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Synchronization object bound to one completion slot.
//!
//! Completion is observed by polling: the GPU (or a host signal) replaces the
//! reserved sentinel in each packet with real data, and the host compares
//! against the sentinel. Nothing here takes a lock on completion memory; the
//! owner serializes `reset()` against outstanding waits.
//!
//! Slot layout in timestamp mode: kernel-split groups back to back, each group
//! `packets_used` packets of four fields (context-start, global-start,
//! context-end, global-end). In flag mode only the first field is used.

use std::sync::Arc;
use std::time::Instant;

use crate::error::{Result, Status, ZtrackError};
use crate::gpu::memory::{CompletionSlot, PacketField};
use crate::gpu::pool::PoolShared;
use crate::gpu::timestamp::{
    AggregatedTimestamps, KernelTimestamp, PacketTimestamps, TimestampResult, aggregate,
};
use crate::platform::STATE_SIGNALED;

/// `wait()` timeout meaning "poll until complete".
pub const WAIT_INFINITE: u64 = u64::MAX;

/// Visibility domain an event is signaled in or waited from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EventScope {
    /// No cross-device guarantee; explicit cache maintenance needed.
    #[default]
    None,
    Device,
    /// Host and device caches are coherent for this event.
    Host,
}

impl EventScope {
    fn host_coherent(self) -> bool {
        matches!(self, EventScope::Host)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventDesc {
    pub index: u32,
    pub signal_scope: EventScope,
    pub wait_scope: EventScope,
}

impl EventDesc {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            signal_scope: EventScope::None,
            wait_scope: EventScope::None,
        }
    }

    pub fn with_scopes(mut self, signal: EventScope, wait: EventScope) -> Self {
        self.signal_scope = signal;
        self.wait_scope = wait;
        self
    }
}

/// How a dispatch will write completion: one entry per kernel split, each the
/// number of packets that split writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchDescriptor {
    pub packets_per_split: Vec<u32>,
}

impl DispatchDescriptor {
    pub fn single(packets: u32) -> Self {
        Self {
            packets_per_split: vec![packets],
        }
    }

    pub fn splits(packets_per_split: &[u32]) -> Self {
        Self {
            packets_per_split: packets_per_split.to_vec(),
        }
    }
}

/// GPU addresses the dispatch must write for one packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketTargets {
    pub split: u32,
    pub packet: u32,
    pub context_start: u64,
    pub global_start: u64,
    pub context_end: u64,
    pub global_end: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchTargets {
    Flag { address: u64 },
    Timestamps(Vec<PacketTargets>),
}

/// Result of a per-packet timestamp query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PacketQuery {
    /// Requested count was 0 or too large; this many packets are in use.
    Count(u32),
    Timestamps(Vec<TimestampResult>),
}

/// Spin briefly, then yield. Bounded per check.
struct PollBackoff {
    spins: u32,
}

impl PollBackoff {
    const SPIN_LIMIT: u32 = 64;

    fn new() -> Self {
        Self { spins: 1 }
    }

    fn snooze(&mut self) {
        if self.spins <= Self::SPIN_LIMIT {
            for _ in 0..self.spins {
                std::hint::spin_loop();
            }
            self.spins *= 2;
        } else {
            std::thread::yield_now();
        }
    }
}

pub struct Event {
    pool: Arc<PoolShared>,
    index: u32,
    slot: CompletionSlot,
    timestamp_mode: bool,
    signal_scope: EventScope,
    wait_scope: EventScope,
    kernel_count: u32,
    /// `packets_used[g]` for every possible group; only `..kernel_count` is live.
    packets_used: Vec<u32>,
    last_aggregate: Option<AggregatedTimestamps>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("index", &self.index)
            .field("timestamp_mode", &self.timestamp_mode)
            .field("kernel_count", &self.kernel_count)
            .field("packets_used", &&self.packets_used[..self.kernel_count as usize])
            .finish()
    }
}

impl Event {
    pub(crate) fn bind(pool: Arc<PoolShared>, slot: CompletionSlot, desc: EventDesc) -> Self {
        let max_split = pool.caps().max_kernel_split as usize;
        let timestamp_mode = pool.is_timestamp_pool();
        Self {
            pool,
            index: desc.index,
            slot,
            timestamp_mode,
            signal_scope: desc.signal_scope,
            wait_scope: desc.wait_scope,
            kernel_count: 1,
            packets_used: vec![1; max_split],
            last_aggregate: None,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn is_timestamp_event(&self) -> bool {
        self.timestamp_mode
    }

    pub fn kernel_count(&self) -> u32 {
        self.kernel_count
    }

    pub fn packets_used(&self, split: u32) -> Option<u32> {
        (split < self.kernel_count).then(|| self.packets_used[split as usize])
    }

    /// Sum of packets over every active kernel split.
    pub fn packets_in_use(&self) -> u32 {
        self.packets_used[..self.kernel_count as usize].iter().sum()
    }

    /// CPU address of the slot the GPU writes.
    pub fn completion_address(&self) -> usize {
        self.slot.cpu_address()
    }

    pub fn gpu_address(&self) -> u64 {
        self.slot.gpu_address()
    }

    /// View over this event's slot for the dispatch or host-signal collaborator.
    pub fn completion_slot(&self) -> CompletionSlot {
        self.slot.clone()
    }

    /// GPU address where the packets of the last active kernel split begin.
    pub fn next_packet_address(&self) -> u64 {
        let preceding: u32 = self.packets_used[..self.kernel_count as usize - 1]
            .iter()
            .sum();
        self.gpu_address() + preceding as u64 * self.slot.tag_width().packet_size() as u64
    }

    /// Set the packet count of the current (last) kernel split.
    pub fn set_packets_in_use(&mut self, packets: u32) -> Result<()> {
        self.check_packet_count(packets)?;
        let current = self.kernel_count as usize - 1;
        self.packets_used[current] = packets;
        Ok(())
    }

    fn check_packet_count(&self, packets: u32) -> Result<()> {
        let max = self.pool.caps().max_packets_per_split;
        if !(1..=max).contains(&packets) {
            return Err(ZtrackError::InvalidInput(format!(
                "packets per split must be 1..={}, got {}",
                max, packets
            )));
        }
        Ok(())
    }

    fn needs_flush(&self) -> bool {
        !self.signal_scope.host_coherent() || !self.slot.host_coherent()
    }

    fn needs_invalidate(&self) -> bool {
        !self.wait_scope.host_coherent() || !self.slot.host_coherent()
    }

    /// Absolute packet indices of every in-use packet, group by group.
    fn live_packets(&self) -> impl Iterator<Item = usize> + '_ {
        let total = self.packets_in_use() as usize;
        0..total
    }

    fn flush_packets(&self, packets: usize) -> Result<()> {
        if self.needs_flush() {
            self.slot
                .flush(packets * self.slot.tag_width().packet_size())?;
        }
        Ok(())
    }

    /// Return every packet to the cleared state.
    ///
    /// Idempotent. The whole slot footprint is cleared so any later dispatch
    /// layout starts from the sentinel. In timestamp mode every possible kernel
    /// split becomes active with the platform-preferred packet count; a
    /// dispatch narrows that with [`Event::apply_dispatch`].
    pub fn reset(&mut self) -> Result<()> {
        crate::profile_scope!("Event::Reset");
        let caps = self.pool.caps();
        let footprint = (caps.max_kernel_split * caps.max_packets_per_split) as usize;
        let cleared = self.slot.tag_width().cleared();
        if self.timestamp_mode {
            self.kernel_count = caps.max_kernel_split;
            let preferred = caps.preferred_packet_count;
            self.packets_used.iter_mut().for_each(|p| *p = preferred);
            for packet in 0..footprint {
                for field in PacketField::ALL {
                    self.slot.write_field(packet, field, cleared)?;
                }
            }
        } else {
            self.kernel_count = 1;
            self.packets_used.iter_mut().for_each(|p| *p = 1);
            self.slot
                .write_field(0, PacketField::ContextStart, cleared)?;
        }
        self.last_aggregate = None;
        self.flush_packets(if self.timestamp_mode { footprint } else { 1 })
    }

    /// Adopt a dispatch layout and hand back the addresses the GPU must write.
    pub fn apply_dispatch(&mut self, dispatch: &DispatchDescriptor) -> Result<DispatchTargets> {
        let splits = &dispatch.packets_per_split;
        let max_split = self.pool.caps().max_kernel_split;
        if splits.is_empty() || splits.len() > max_split as usize {
            return Err(ZtrackError::InvalidInput(format!(
                "dispatch must use 1..={} kernel splits, got {}",
                max_split,
                splits.len()
            )));
        }
        for &packets in splits {
            self.check_packet_count(packets)?;
        }

        if !self.timestamp_mode {
            // One flag in the slot: a second split would complete it early.
            if splits.len() > 1 || splits[0] != 1 {
                return Err(ZtrackError::Unsupported(
                    "multi-packet completion requires a timestamp event".to_string(),
                ));
            }
            return Ok(DispatchTargets::Flag {
                address: self.slot.field_gpu_address(0, PacketField::ContextStart)?,
            });
        }

        self.kernel_count = splits.len() as u32;
        self.packets_used[..splits.len()].copy_from_slice(splits);
        self.last_aggregate = None;

        let mut targets = Vec::with_capacity(self.packets_in_use() as usize);
        let mut packet_index = 0usize;
        for (split, &packets) in splits.iter().enumerate() {
            for packet in 0..packets {
                targets.push(PacketTargets {
                    split: split as u32,
                    packet,
                    context_start: self
                        .slot
                        .field_gpu_address(packet_index, PacketField::ContextStart)?,
                    global_start: self
                        .slot
                        .field_gpu_address(packet_index, PacketField::GlobalStart)?,
                    context_end: self
                        .slot
                        .field_gpu_address(packet_index, PacketField::ContextEnd)?,
                    global_end: self
                        .slot
                        .field_gpu_address(packet_index, PacketField::GlobalEnd)?,
                });
                packet_index += 1;
            }
        }
        log::trace!(
            "Event {}: dispatch layout {:?} ({} packets)",
            self.index,
            splits,
            targets.len()
        );
        Ok(DispatchTargets::Timestamps(targets))
    }

    /// Host-side completion.
    pub fn signal(&self) -> Result<()> {
        crate::profile_scope!("Event::HostSignal");
        if self.timestamp_mode {
            self.write_all_timestamps(STATE_SIGNALED)
        } else {
            self.slot
                .write_field(0, PacketField::ContextStart, STATE_SIGNALED)?;
            self.flush_packets(1)
        }
    }

    /// Host writes `value` into every field of every in-use packet.
    pub fn host_set_timestamps(&self, value: u64) -> Result<()> {
        if !self.timestamp_mode {
            return Err(ZtrackError::Unsupported(
                "event was not created in a timestamp pool".to_string(),
            ));
        }
        self.write_all_timestamps(self.slot.tag_width().data_value(value))
    }

    fn write_all_timestamps(&self, value: u64) -> Result<()> {
        for packet in self.live_packets() {
            for field in PacketField::ALL {
                self.slot.write_field(packet, field, value)?;
            }
        }
        self.flush_packets(self.packets_in_use() as usize)
    }

    /// Non-blocking completion check. Always re-reads completion memory.
    pub fn query_status(&self) -> Result<Status> {
        self.slot.check_accessible()?;
        if self.needs_invalidate() {
            self.slot.invalidate()?;
        }
        let cleared = self.slot.tag_width().cleared();
        if self.timestamp_mode {
            for packet in self.live_packets() {
                if self.slot.read_field(packet, PacketField::ContextEnd)? == cleared {
                    return Ok(Status::NotReady);
                }
            }
            Ok(Status::Ready)
        } else if self.slot.read_field(0, PacketField::ContextStart)? == cleared {
            Ok(Status::NotReady)
        } else {
            Ok(Status::Ready)
        }
    }

    /// Spin-poll until complete or until `timeout_ns` of wall-clock time
    /// elapsed. `0` is a single check, [`WAIT_INFINITE`] never times out.
    /// `NotReady` on timeout is not an error.
    pub fn wait(&self, timeout_ns: u64) -> Result<Status> {
        crate::profile_scope!("Event::HostSynchronize");
        if timeout_ns == 0 {
            return self.query_status();
        }

        let start = Instant::now();
        let mut backoff = PollBackoff::new();
        loop {
            let status = self.query_status()?;
            if status.is_ready() {
                return Ok(status);
            }

            backoff.snooze();

            if timeout_ns == WAIT_INFINITE {
                continue;
            }
            if start.elapsed().as_nanos() >= u128::from(timeout_ns) {
                return Ok(status);
            }
        }
    }

    fn read_packet(&self, packet: usize) -> Result<PacketTimestamps> {
        Ok(PacketTimestamps {
            global_start: self.slot.read_field(packet, PacketField::GlobalStart)?,
            global_end: self.slot.read_field(packet, PacketField::GlobalEnd)?,
            context_start: self.slot.read_field(packet, PacketField::ContextStart)?,
            context_end: self.slot.read_field(packet, PacketField::ContextEnd)?,
        })
    }

    /// Aggregated kernel timestamps, or `None` while not complete.
    pub fn read_timestamp(&mut self) -> Result<Option<TimestampResult>> {
        if !self.timestamp_mode {
            return Err(ZtrackError::Unsupported(
                "event was not created in a timestamp pool".to_string(),
            ));
        }
        if !self.query_status()?.is_ready() {
            return Ok(None);
        }

        let mut groups = Vec::with_capacity(self.kernel_count as usize);
        let mut packet_index = 0usize;
        for &packets in &self.packets_used[..self.kernel_count as usize] {
            let group = (packet_index..packet_index + packets as usize)
                .map(|p| self.read_packet(p))
                .collect::<Result<Vec<_>>>()?;
            packet_index += packets as usize;
            groups.push(group);
        }
        let agg = aggregate(groups.iter().map(Vec::as_slice)).ok_or_else(|| {
            ZtrackError::InvalidInput("event has no packets in use".to_string())
        })?;
        self.last_aggregate = Some(agg);
        Ok(Some(agg.to_result(self.pool.caps().single_clock_domain)))
    }

    /// Last aggregate computed by [`Event::read_timestamp`] since the last reset.
    pub fn last_aggregate(&self) -> Option<AggregatedTimestamps> {
        self.last_aggregate
    }

    /// Raw per-packet timestamps of the first kernel split.
    ///
    /// `count == 0` or a count above the split's packets returns the number of
    /// packets in use instead.
    pub fn query_packet_timestamps(&self, count: u32) -> Result<PacketQuery> {
        let caps = self.pool.caps();
        if caps.is_subdevice || !caps.static_partitioning {
            return Err(ZtrackError::Unsupported(
                "per-packet timestamps need a root device with static partitioning".to_string(),
            ));
        }
        if !self.timestamp_mode {
            return Err(ZtrackError::Unsupported(
                "event was not created in a timestamp pool".to_string(),
            ));
        }
        if count == 0 || count > self.packets_used[0] {
            return Ok(PacketQuery::Count(self.packets_in_use()));
        }
        self.slot.check_accessible()?;
        if self.needs_invalidate() {
            self.slot.invalidate()?;
        }
        let results = (0..count as usize)
            .map(|p| {
                self.read_packet(p).map(|t| TimestampResult {
                    global: KernelTimestamp {
                        kernel_start: t.global_start,
                        kernel_end: t.global_end,
                    },
                    context: KernelTimestamp {
                        kernel_start: t.context_start,
                        kernel_end: t.context_end,
                    },
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(PacketQuery::Timestamps(results))
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}
