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

//! Host waits against a thread standing in for the GPU writer.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ztrack_core::gpu::{CompletionMemory, PacketField};
use ztrack_core::{
    CompletionPool, DeviceCapabilities, DispatchDescriptor, DispatchTargets, EventDesc,
    EventScope, GpuFamily, HostCompletionBuffer, PoolDesc, Status, WAIT_INFINITE, ZtrackError,
};

#[test]
fn wait_infinite_returns_after_gpu_writes_flag() {
    let pool = CompletionPool::with_host_memory(
        PoolDesc::flags(4),
        DeviceCapabilities::for_family(GpuFamily::Gen12Lp),
    )
    .unwrap();
    let event = pool
        .create_event(EventDesc::new(2).with_scopes(EventScope::Host, EventScope::Host))
        .unwrap();
    assert!(pool.is_slot_in_use(2));
    assert_eq!(event.query_status().unwrap(), Status::NotReady);

    let slot = event.completion_slot();
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        slot.write_field(0, PacketField::ContextStart, 0).unwrap();
    });

    assert_eq!(event.wait(WAIT_INFINITE).unwrap(), Status::Ready);
    writer.join().unwrap();

    drop(event);
    assert!(!pool.is_slot_in_use(2));
}

#[test]
fn timestamps_written_from_another_thread_aggregate() {
    let caps = DeviceCapabilities::for_family(GpuFamily::XeHp);
    let pool = CompletionPool::with_host_memory(PoolDesc::timestamps(2), caps).unwrap();
    let mut event = pool.create_event(EventDesc::new(0)).unwrap();
    let DispatchTargets::Timestamps(targets) = event
        .apply_dispatch(&DispatchDescriptor::splits(&[2, 2]))
        .unwrap()
    else {
        panic!("timestamp pool must hand out per-packet targets");
    };
    assert_eq!(targets.len(), 4);
    assert_eq!(targets[0].context_start, event.gpu_address());

    let slot = event.completion_slot();
    let writer = thread::spawn(move || {
        let packets = [
            (100u64, 200u64, 110u64, 190u64),
            (90, 210, 120, 180),
            (300, 400, 310, 390),
            (250, 420, 260, 410),
        ];
        for (i, (gs, ge, cs, ce)) in packets.into_iter().enumerate() {
            thread::sleep(Duration::from_millis(2));
            slot.write_field(i, PacketField::GlobalStart, gs).unwrap();
            slot.write_field(i, PacketField::ContextStart, cs).unwrap();
            slot.write_field(i, PacketField::GlobalEnd, ge).unwrap();
            slot.write_field(i, PacketField::ContextEnd, ce).unwrap();
        }
    });

    assert_eq!(event.wait(WAIT_INFINITE).unwrap(), Status::Ready);
    writer.join().unwrap();

    let result = event.read_timestamp().unwrap().unwrap();
    assert_eq!(result.global.kernel_start, 90);
    assert_eq!(result.global.kernel_end, 420);
    assert_eq!(result.context.kernel_start, 110);
    assert_eq!(result.context.kernel_end, 410);

    event.reset().unwrap();
    assert_eq!(event.query_status().unwrap(), Status::NotReady);
    assert!(event.read_timestamp().unwrap().is_none());
}

#[test]
fn slot_addresses_follow_pool_layout() {
    let caps = DeviceCapabilities::for_family(GpuFamily::Xe2Hpg);
    let slot_size = CompletionPool::slot_size_for(&caps);
    let memory = Arc::new(
        HostCompletionBuffer::new(slot_size * 3)
            .unwrap()
            .with_gpu_base(0x10_0000)
            .with_coherency(false),
    );
    let pool = CompletionPool::new(memory.clone(), PoolDesc::timestamps(3), caps).unwrap();
    assert_eq!(pool.gpu_base_address(), 0x10_0000);

    let event = pool.create_event(EventDesc::new(1)).unwrap();
    assert_eq!(event.gpu_address(), 0x10_0000 + slot_size as u64);
    assert_eq!(
        event.completion_address(),
        memory.cpu_ptr().as_ptr() as usize + slot_size
    );
    assert_eq!(pool.slot_address(1).unwrap().gpu, event.gpu_address());

    assert!(matches!(
        pool.create_event(EventDesc::new(1)),
        Err(ZtrackError::InvalidInput(_))
    ));
    assert!(matches!(
        pool.create_event(EventDesc::new(3)),
        Err(ZtrackError::InvalidInput(_))
    ));
}
