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

//! What the submission controller needs from a direct-submission context.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::error::Result;

/// Stable identity of a registered context.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Engine class a context submits to. Only compute engines share the
/// adaptive timeout budget across sub-devices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineFamily {
    Compute,
    Copy,
    Render,
}

/// A command-submission context whose ring the controller may stop.
///
/// Implementations are called from the controller thread while other threads
/// keep submitting, so every method takes `&self`.
pub trait SubmissionContext: Send + Sync {
    fn id(&self) -> ContextId;

    /// Monotonic count of work items submitted so far.
    fn task_count(&self) -> Result<u64>;

    fn engine(&self) -> EngineFamily;

    /// Bit `n` set means the context runs on sub-device `n`.
    fn device_mask(&self) -> u32 {
        1
    }

    /// Park the ring buffer. The submitter resumes it on its next submission.
    fn stop_ring(&self) -> Result<()>;
}

/// Monotonic time source for timeout adaptation.
pub trait CpuClock: Send + Sync {
    /// Time since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

/// Process-wide monotonic clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl CpuClock for MonotonicClock {
    fn now(&self) -> Duration {
        static ORIGIN: OnceLock<Instant> = OnceLock::new();
        ORIGIN.get_or_init(Instant::now).elapsed()
    }
}
