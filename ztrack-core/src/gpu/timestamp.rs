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

//! Timestamp aggregation across kernel splits and packets.
//!
//! One dispatch may fan out across several kernel splits and several packets
//! per split. Profiling reports a single {start, end} per clock domain: the
//! earliest start and the latest end over every packet. min/max are
//! commutative and associative, so packet layout never changes the result.

/// Raw values of one completion packet.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketTimestamps {
    pub global_start: u64,
    pub global_end: u64,
    pub context_start: u64,
    pub context_end: u64,
}

/// {start, end} of one clock domain.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KernelTimestamp {
    pub kernel_start: u64,
    pub kernel_end: u64,
}

/// Query result: two clock domains.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TimestampResult {
    pub global: KernelTimestamp,
    pub context: KernelTimestamp,
}

/// Aggregated values across every packet considered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AggregatedTimestamps {
    pub global_start: u64,
    pub global_end: u64,
    pub context_start: u64,
    pub context_end: u64,
}

impl AggregatedTimestamps {
    /// Identity element: folding any packet into it yields that packet.
    pub const EMPTY: AggregatedTimestamps = AggregatedTimestamps {
        global_start: u64::MAX,
        global_end: 0,
        context_start: u64::MAX,
        context_end: 0,
    };

    pub fn accumulate(self, packet: &PacketTimestamps) -> Self {
        Self {
            global_start: self.global_start.min(packet.global_start),
            global_end: self.global_end.max(packet.global_end),
            context_start: self.context_start.min(packet.context_start),
            context_end: self.context_end.max(packet.context_end),
        }
    }

    pub fn merge(self, other: Self) -> Self {
        Self {
            global_start: self.global_start.min(other.global_start),
            global_end: self.global_end.max(other.global_end),
            context_start: self.context_start.min(other.context_start),
            context_end: self.context_end.max(other.context_end),
        }
    }

    /// Fill a query result. On single-clock-domain hardware the context
    /// domain is not meaningful and mirrors the global values.
    pub fn to_result(self, single_clock_domain: bool) -> TimestampResult {
        let global = KernelTimestamp {
            kernel_start: self.global_start,
            kernel_end: self.global_end,
        };
        let context = if single_clock_domain {
            global
        } else {
            KernelTimestamp {
                kernel_start: self.context_start,
                kernel_end: self.context_end,
            }
        };
        TimestampResult { global, context }
    }
}

/// Reduce the packets of every kernel-split group.
///
/// Returns `None` when no packet is supplied.
pub fn aggregate<'a, G>(groups: G) -> Option<AggregatedTimestamps>
where
    G: IntoIterator<Item = &'a [PacketTimestamps]>,
{
    let mut seen = false;
    let agg = groups
        .into_iter()
        .flatten()
        .fold(AggregatedTimestamps::EMPTY, |acc, packet| {
            seen = true;
            acc.accumulate(packet)
        });
    seen.then_some(agg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(gs: u64, ge: u64, cs: u64, ce: u64) -> PacketTimestamps {
        PacketTimestamps {
            global_start: gs,
            global_end: ge,
            context_start: cs,
            context_end: ce,
        }
    }

    #[test]
    fn two_packets_one_group() {
        let packets = [packet(100, 200, 110, 190), packet(90, 210, 120, 180)];
        let agg = aggregate([&packets[..]]).unwrap();
        assert_eq!(agg.global_start, 90);
        assert_eq!(agg.global_end, 210);
        assert_eq!(agg.context_start, 110);
        assert_eq!(agg.context_end, 190);
    }

    #[test]
    fn layout_across_splits_does_not_matter() {
        let all = [
            packet(100, 200, 110, 190),
            packet(90, 210, 120, 180),
            packet(95, 260, 105, 250),
            packet(130, 140, 131, 139),
        ];
        let flat = aggregate([&all[..]]).unwrap();
        let split = aggregate([&all[..1], &all[1..3], &all[3..]]).unwrap();

        let mut reversed = all;
        reversed.reverse();
        let rev = aggregate([&reversed[2..], &reversed[..2]]).unwrap();

        assert_eq!(flat, split);
        assert_eq!(flat, rev);
    }

    #[test]
    fn every_permutation_of_three_packets_agrees() {
        let p = [
            packet(5, 50, 6, 49),
            packet(3, 40, 7, 60),
            packet(8, 70, 2, 30),
        ];
        let expected = aggregate([&p[..]]).unwrap();
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        for order in orders {
            let permuted = order.map(|i| p[i]);
            assert_eq!(aggregate([&permuted[..]]).unwrap(), expected);
        }
    }

    #[test]
    fn merge_matches_single_pass() {
        let a = [packet(10, 20, 11, 19)];
        let b = [packet(5, 15, 12, 25)];
        let merged = aggregate([&a[..]]).unwrap().merge(aggregate([&b[..]]).unwrap());
        assert_eq!(merged, aggregate([&a[..], &b[..]]).unwrap());
    }

    #[test]
    fn empty_input() {
        let none: [&[PacketTimestamps]; 0] = [];
        assert!(aggregate(none).is_none());
        assert!(aggregate([&[][..]]).is_none());
    }

    #[test]
    fn single_clock_domain_mirrors_global() {
        let agg = aggregate([&[packet(1, 9, 2, 8)][..]]).unwrap();
        let r = agg.to_result(true);
        assert_eq!(r.context, r.global);
        assert_eq!(r.global.kernel_start, 1);
        assert_eq!(r.global.kernel_end, 9);

        let r = agg.to_result(false);
        assert_eq!(r.context.kernel_start, 2);
        assert_eq!(r.context.kernel_end, 8);
    }
}
