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

//! Host-side completion tracking for GPU command submission.
//!
//! Events live in slots of a [`gpu::CompletionPool`]; the device writes
//! completion data (a flag, or per-packet timestamps) into the slot and the
//! host polls it. A [`submission::SubmissionController`] watches
//! direct-submission contexts and parks rings that stopped receiving work.

pub mod config;
pub mod error;
pub mod gpu;
pub mod platform;
pub mod submission;
#[doc(hidden)]
#[macro_use]
pub mod profiling;

pub use config::MonitorConfig;
pub use error::{Result, ResultCode, Status, ZtrackError, to_result_code};
pub use gpu::{
    CompletionPool, DispatchDescriptor, DispatchTargets, Event, EventDesc, EventScope,
    HostCompletionBuffer, PoolDesc, TimestampResult, WAIT_INFINITE,
};
pub use platform::{
    DeviceCapabilities, GpuFamily, STATE_CLEARED, STATE_INITIAL, STATE_SIGNALED, TagWidth,
};
pub use submission::{
    ContextEntry, ContextId, CpuClock, EngineFamily, SubmissionContext, SubmissionController,
};
