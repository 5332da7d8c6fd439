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

//! Per-family device capabilities.
//!
//! Behavior that differs between hardware generations is described by a
//! [`DeviceCapabilities`] value picked once when the device is initialized and
//! then held by the pool and its events.

use crate::error::{Result, ZtrackError};

/// Value written by the host (or a GPU post-sync op) when an event is signaled.
pub const STATE_SIGNALED: u64 = 0;
/// Reserved "not yet complete" pattern for 32-bit packet fields. Wider fields
/// use the all-ones pattern of their width, see [`TagWidth::cleared`].
pub const STATE_CLEARED: u64 = 0xFFFF_FFFF;
/// Baseline written by `reset()`.
pub const STATE_INITIAL: u64 = STATE_CLEARED;

/// Width of one completion packet field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagWidth {
    U32,
    U64,
}

impl TagWidth {
    pub const fn bytes(self) -> usize {
        match self {
            TagWidth::U32 => 4,
            TagWidth::U64 => 8,
        }
    }

    /// Bytes of one packet: context-start, global-start, context-end, global-end.
    pub const fn packet_size(self) -> usize {
        4 * self.bytes()
    }

    /// [`STATE_CLEARED`] widened to this width: all ones.
    pub const fn cleared(self) -> u64 {
        match self {
            TagWidth::U32 => STATE_CLEARED,
            TagWidth::U64 => u64::MAX,
        }
    }

    /// Clamp a host-supplied data value so it can never alias the sentinel.
    pub fn data_value(self, value: u64) -> u64 {
        let value = value & self.cleared();
        if value == self.cleared() {
            self.cleared() - 1
        } else {
            value
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpuFamily {
    Gen9,
    Gen12Lp,
    XeHp,
    XeHpg,
    Xe2Hpg,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceCapabilities {
    pub family: GpuFamily,
    pub tag_width: TagWidth,
    /// Upper bound on kernel-split groups tracked by one event.
    pub max_kernel_split: u32,
    /// Upper bound on packets per kernel-split group.
    pub max_packets_per_split: u32,
    /// Packets per group assumed after `reset()` until a dispatch narrows it.
    pub preferred_packet_count: u32,
    /// Only the global clock is meaningful; context results mirror it.
    pub single_clock_domain: bool,
    /// CPU caches snoop GPU writes to completion memory.
    pub host_coherent: bool,
    /// Root device splits work across tiles; per-packet queries need it.
    pub static_partitioning: bool,
    pub is_subdevice: bool,
}

impl DeviceCapabilities {
    pub fn for_family(family: GpuFamily) -> Self {
        let (tag_width, preferred, single_clock, coherent) = match family {
            GpuFamily::Gen9 => (TagWidth::U32, 1, false, true),
            GpuFamily::Gen12Lp => (TagWidth::U32, 1, true, true),
            GpuFamily::XeHp => (TagWidth::U64, 4, false, false),
            GpuFamily::XeHpg => (TagWidth::U64, 2, false, false),
            GpuFamily::Xe2Hpg => (TagWidth::U64, 2, false, false),
        };
        Self {
            family,
            tag_width,
            max_kernel_split: 3,
            max_packets_per_split: 16,
            preferred_packet_count: preferred,
            single_clock_domain: single_clock,
            host_coherent: coherent,
            static_partitioning: true,
            is_subdevice: false,
        }
    }

    pub fn packet_size(&self) -> usize {
        self.tag_width.packet_size()
    }

    /// Bytes a single event may touch: every packet of every split.
    pub fn event_footprint(&self) -> usize {
        self.max_kernel_split as usize * self.max_packets_per_split as usize * self.packet_size()
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_kernel_split == 0 {
            return Err(ZtrackError::InvalidInput(
                "max_kernel_split must be at least 1".to_string(),
            ));
        }
        if self.max_packets_per_split == 0 {
            return Err(ZtrackError::InvalidInput(
                "max_packets_per_split must be at least 1".to_string(),
            ));
        }
        if !(1..=self.max_packets_per_split).contains(&self.preferred_packet_count) {
            return Err(ZtrackError::InvalidInput(format!(
                "preferred_packet_count must be 1..={}, got {}",
                self.max_packets_per_split, self.preferred_packet_count
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_never_a_data_value() {
        assert_eq!(TagWidth::U32.data_value(STATE_CLEARED), STATE_CLEARED - 1);
        assert_eq!(TagWidth::U64.data_value(u64::MAX), u64::MAX - 1);
        assert_eq!(TagWidth::U32.data_value(0x1_0000_0005), 5);
        assert_eq!(TagWidth::U64.data_value(0x1_0000_0005), 0x1_0000_0005);
    }

    #[test]
    fn cleared_pattern_is_widened_to_tag_width() {
        assert_eq!(TagWidth::U32.cleared(), STATE_CLEARED);
        assert_eq!(TagWidth::U64.cleared(), u64::MAX);
        // A 64-bit timestamp equal to the 32-bit pattern is ordinary data.
        assert_eq!(TagWidth::U64.data_value(STATE_CLEARED), STATE_CLEARED);
    }

    #[test]
    fn static_partitioning_enabled_by_default() {
        for family in [
            GpuFamily::Gen9,
            GpuFamily::Gen12Lp,
            GpuFamily::XeHp,
            GpuFamily::XeHpg,
            GpuFamily::Xe2Hpg,
        ] {
            let caps = DeviceCapabilities::for_family(family);
            assert!(caps.static_partitioning);
            assert!(!caps.is_subdevice);
        }
    }

    #[test]
    fn single_clock_domain_only_on_gen12lp() {
        assert!(DeviceCapabilities::for_family(GpuFamily::Gen12Lp).single_clock_domain);
        assert!(!DeviceCapabilities::for_family(GpuFamily::XeHp).single_clock_domain);
    }

    #[test]
    fn footprint_and_validation() {
        let caps = DeviceCapabilities::for_family(GpuFamily::XeHp);
        assert_eq!(caps.packet_size(), 32);
        assert_eq!(caps.event_footprint(), 3 * 16 * 32);
        assert!(caps.validate().is_ok());

        let bad = DeviceCapabilities {
            preferred_packet_count: 17,
            ..caps
        };
        assert!(bad.validate().is_err());
    }
}
