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

//! Completion record pool.
//!
//! A fixed number of equally sized slots carved out of one CPU/GPU-visible
//! allocation. Slot `i` lives at `base + i * slot_size`. Each slot is owned by
//! at most one live [`Event`]; the pool only keeps an occupancy record so a
//! second event can't bind the same index. Dropping the event frees the slot.

use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{Result, ZtrackError};
use crate::gpu::event::{Event, EventDesc};
use crate::gpu::memory::{CACHE_LINE_SIZE, CompletionMemory, CompletionSlot, HostCompletionBuffer};
use crate::platform::DeviceCapabilities;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolDesc {
    pub slot_count: u32,
    /// Events record per-packet timestamps instead of a single flag.
    pub timestamp: bool,
    /// Pool memory came from another process; events are not reset on creation.
    pub imported: bool,
}

impl PoolDesc {
    pub fn flags(slot_count: u32) -> Self {
        Self {
            slot_count,
            timestamp: false,
            imported: false,
        }
    }

    pub fn timestamps(slot_count: u32) -> Self {
        Self {
            slot_count,
            timestamp: true,
            imported: false,
        }
    }
}

/// CPU and GPU address of one slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotAddress {
    pub cpu: usize,
    pub gpu: u64,
}

pub(crate) struct PoolShared {
    memory: Arc<dyn CompletionMemory>,
    desc: PoolDesc,
    slot_size: usize,
    caps: DeviceCapabilities,
    occupied: Mutex<Vec<bool>>,
}

impl PoolShared {
    pub(crate) fn caps(&self) -> &DeviceCapabilities {
        &self.caps
    }

    pub(crate) fn is_timestamp_pool(&self) -> bool {
        self.desc.timestamp
    }

    fn check_index(&self, index: u32) -> Result<()> {
        if index >= self.desc.slot_count {
            return Err(ZtrackError::InvalidInput(format!(
                "Event slot {} out of range (max: {})",
                index,
                self.desc.slot_count.saturating_sub(1)
            )));
        }
        Ok(())
    }

    fn slot_view(&self, index: u32) -> Result<CompletionSlot> {
        self.check_index(index)?;
        CompletionSlot::new(
            self.memory.clone(),
            index as usize * self.slot_size,
            self.slot_size,
            self.caps.tag_width,
        )
    }

    fn claim(&self, index: u32) -> Result<CompletionSlot> {
        let slot = self.slot_view(index)?;
        let mut occupied = self.occupied.lock().unwrap_or_else(PoisonError::into_inner);
        if occupied[index as usize] {
            return Err(ZtrackError::InvalidInput(format!(
                "Event slot {} is already bound to a live event",
                index
            )));
        }
        occupied[index as usize] = true;
        Ok(slot)
    }

    pub(crate) fn release(&self, index: u32) {
        let mut occupied = self.occupied.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = occupied.get_mut(index as usize) {
            *entry = false;
        }
    }
}

/// Pool of completion slots sharing one backing allocation.
#[derive(Clone)]
pub struct CompletionPool {
    shared: Arc<PoolShared>,
}

impl CompletionPool {
    /// Create a pool over caller-provided completion memory.
    ///
    /// Slot size is the per-event footprint implied by `caps`, rounded up to a
    /// cache line so flushing one slot never touches its neighbour.
    pub fn new(
        memory: Arc<dyn CompletionMemory>,
        desc: PoolDesc,
        caps: DeviceCapabilities,
    ) -> Result<Self> {
        caps.validate()?;
        if desc.slot_count == 0 {
            return Err(ZtrackError::InvalidInput(
                "pool slot_count must be at least 1".to_string(),
            ));
        }
        let slot_size = Self::slot_size_for(&caps);
        let required = slot_size
            .checked_mul(desc.slot_count as usize)
            .ok_or_else(|| {
                ZtrackError::InvalidInput(format!(
                    "pool size overflow: {} slots of {} bytes",
                    desc.slot_count, slot_size
                ))
            })?;
        if memory.size() < required {
            return Err(ZtrackError::InvalidInput(format!(
                "completion memory of {} bytes cannot hold {} slots of {} bytes",
                memory.size(),
                desc.slot_count,
                slot_size
            )));
        }
        log::debug!(
            "CompletionPool: {} slots x {} bytes ({} mode) at gpu 0x{:x}",
            desc.slot_count,
            slot_size,
            if desc.timestamp { "timestamp" } else { "flag" },
            memory.gpu_address()
        );
        let occupied = Mutex::new(vec![false; desc.slot_count as usize]);
        Ok(Self {
            shared: Arc::new(PoolShared {
                memory,
                desc,
                slot_size,
                caps,
                occupied,
            }),
        })
    }

    /// Create a pool backed by freshly allocated host memory.
    pub fn with_host_memory(desc: PoolDesc, caps: DeviceCapabilities) -> Result<Self> {
        let bytes = Self::slot_size_for(&caps)
            .checked_mul(desc.slot_count.max(1) as usize)
            .ok_or_else(|| {
                ZtrackError::OutOfHostMemory(format!(
                    "pool of {} slots overflows the address space",
                    desc.slot_count
                ))
            })?;
        let memory = HostCompletionBuffer::new(bytes)?.with_coherency(caps.host_coherent);
        Self::new(Arc::new(memory), desc, caps)
    }

    /// Bytes one slot occupies for `caps`; size memory passed to [`Self::new`] with it.
    pub fn slot_size_for(caps: &DeviceCapabilities) -> usize {
        caps.event_footprint().div_ceil(CACHE_LINE_SIZE) * CACHE_LINE_SIZE
    }

    pub fn slot_count(&self) -> u32 {
        self.shared.desc.slot_count
    }

    pub fn slot_size(&self) -> usize {
        self.shared.slot_size
    }

    pub fn is_timestamp_pool(&self) -> bool {
        self.shared.desc.timestamp
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.shared.caps
    }

    pub fn gpu_base_address(&self) -> u64 {
        self.shared.memory.gpu_address()
    }

    /// Addresses of slot `index`: `base + index * slot_size`.
    pub fn slot_address(&self, index: u32) -> Result<SlotAddress> {
        let slot = self.shared.slot_view(index)?;
        Ok(SlotAddress {
            cpu: slot.cpu_address(),
            gpu: slot.gpu_address(),
        })
    }

    /// Whether a live event is bound to `index`. Out-of-range indices are never in use.
    pub fn is_slot_in_use(&self, index: u32) -> bool {
        let occupied = self.shared.occupied.lock().unwrap_or_else(PoisonError::into_inner);
        occupied.get(index as usize).copied().unwrap_or(false)
    }

    /// Bind a new event to `desc.index`. The event is reset unless the pool
    /// was imported.
    pub fn create_event(&self, desc: EventDesc) -> Result<Event> {
        let slot = self.shared.claim(desc.index)?;
        let mut event = Event::bind(self.shared.clone(), slot, desc);
        if !self.shared.desc.imported {
            event.reset()?;
        }
        log::trace!("CompletionPool: event bound to slot {}", desc.index);
        Ok(event)
    }
}
