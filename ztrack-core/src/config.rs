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

//! Submission monitor configuration.
//!
//! Built once at controller start and held by value. Nothing in the hot path
//! consults the environment.
//!
//! **Env:** `ZTRACK_MONITOR_ENABLED` (0/1/true/false), `ZTRACK_MONITOR_TIMEOUT_US`,
//! `ZTRACK_MONITOR_MAX_TIMEOUT_US`, `ZTRACK_MONITOR_DIVISOR`,
//! `ZTRACK_MONITOR_MIN_TIMEOUT_US`. Unset or unparsable => default.

use std::time::Duration;

use crate::error::{Result, ZtrackError};

pub const DEFAULT_TIMEOUT_US: u64 = 5_000;
pub const DEFAULT_MAX_TIMEOUT_US: u64 = 200_000;
pub const DEFAULT_MIN_TIMEOUT_US: u64 = 10;
pub const DEFAULT_DIVISOR: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorConfig {
    pub enabled: bool,
    /// Sleep between sampling passes before any adaptation.
    pub timeout: Duration,
    /// Adaptation never grows the sleep beyond this.
    pub max_timeout: Duration,
    /// Affinity scaling never shrinks the sleep below this.
    pub min_timeout: Duration,
    /// Applied once per additional compute-engine affinity group.
    pub divisor: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_micros(DEFAULT_TIMEOUT_US),
            max_timeout: Duration::from_micros(DEFAULT_MAX_TIMEOUT_US),
            min_timeout: Duration::from_micros(DEFAULT_MIN_TIMEOUT_US),
            divisor: DEFAULT_DIVISOR,
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    let s = std::env::var(name).ok()?;
    let s = s.trim();
    if s == "1" || s.eq_ignore_ascii_case("true") {
        Some(true)
    } else if s == "0" || s.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

impl MonitorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_bool("ZTRACK_MONITOR_ENABLED").unwrap_or(defaults.enabled),
            timeout: env_u64("ZTRACK_MONITOR_TIMEOUT_US")
                .map(Duration::from_micros)
                .unwrap_or(defaults.timeout),
            max_timeout: env_u64("ZTRACK_MONITOR_MAX_TIMEOUT_US")
                .map(Duration::from_micros)
                .unwrap_or(defaults.max_timeout),
            min_timeout: env_u64("ZTRACK_MONITOR_MIN_TIMEOUT_US")
                .map(Duration::from_micros)
                .unwrap_or(defaults.min_timeout),
            divisor: env_u64("ZTRACK_MONITOR_DIVISOR")
                .and_then(|d| u32::try_from(d).ok())
                .unwrap_or(defaults.divisor),
        }
    }

    /// Validate: divisor >= 1, 0 < min <= timeout <= max.
    pub fn validate(&self) -> Result<()> {
        if self.divisor == 0 {
            return Err(ZtrackError::InvalidInput(
                "monitor divisor must be at least 1".to_string(),
            ));
        }
        if self.min_timeout.is_zero() {
            return Err(ZtrackError::InvalidInput(
                "monitor min_timeout must be non-zero".to_string(),
            ));
        }
        if self.timeout < self.min_timeout {
            return Err(ZtrackError::InvalidInput(format!(
                "monitor timeout {:?} below min_timeout {:?}",
                self.timeout, self.min_timeout
            )));
        }
        if self.max_timeout < self.timeout {
            return Err(ZtrackError::InvalidInput(format!(
                "monitor max_timeout {:?} below timeout {:?}",
                self.max_timeout, self.timeout
            )));
        }
        Ok(())
    }
}
