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

//! Scope timing for hot paths, reported through `log` at trace level.

use std::time::Instant;

#[doc(hidden)]
pub struct ScopeTimer {
    name: &'static str,
    start: Instant,
}

impl ScopeTimer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }
}

impl Drop for ScopeTimer {
    fn drop(&mut self) {
        if log::log_enabled!(log::Level::Trace) {
            log::trace!("[profile] {} took {:?}", self.name, self.start.elapsed());
        }
    }
}

#[macro_export]
#[doc(hidden)]
macro_rules! profile_scope {
    ($name:expr) => {
        let _profile_guard = $crate::profiling::ScopeTimer::new($name);
    };
}
