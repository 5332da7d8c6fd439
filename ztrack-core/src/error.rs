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

//! Error taxonomy and result codes.
//!
//! Polling outcomes are not errors: [`Status::NotReady`] is a retry signal.
//! Everything in [`ZtrackError`] is returned to the immediate caller and is
//! never retried internally.

/// Outcome of a non-blocking or bounded poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ready,
    NotReady,
}

impl Status {
    pub fn is_ready(self) -> bool {
        matches!(self, Status::Ready)
    }

    pub fn result_code(self) -> ResultCode {
        match self {
            Status::Ready => ResultCode::Success,
            Status::NotReady => ResultCode::NotReady,
        }
    }
}

/// Stable result codes surfaced to callers of the driver API.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ResultCode {
    Success = 0,
    NotReady = 1,
    DeviceLost = 0x7000_0001,
    OutOfHostMemory = 0x7000_0002,
    OutOfDeviceMemory = 0x7000_0003,
    UnsupportedFeature = 0x7800_0003,
    InvalidArgument = 0x7800_0004,
}

#[derive(Debug, thiserror::Error)]
pub enum ZtrackError {
    /// Caller contract violation: bad slot, bad handle, double registration.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Backing memory or engine became inaccessible.
    #[error("Device lost: {0}")]
    DeviceLost(String),

    #[error("Unsupported feature: {0}")]
    Unsupported(String),

    #[error("Out of host memory: {0}")]
    OutOfHostMemory(String),

    #[error("Out of device memory: {0}")]
    OutOfDeviceMemory(String),

    #[error("Failed to spawn monitor thread: {0}")]
    Thread(#[from] std::io::Error),
}

impl ZtrackError {
    pub fn result_code(&self) -> ResultCode {
        match self {
            Self::InvalidInput(_) => ResultCode::InvalidArgument,
            Self::DeviceLost(_) => ResultCode::DeviceLost,
            Self::Unsupported(_) => ResultCode::UnsupportedFeature,
            Self::OutOfHostMemory(_) | Self::Thread(_) => ResultCode::OutOfHostMemory,
            Self::OutOfDeviceMemory(_) => ResultCode::OutOfDeviceMemory,
        }
    }
}

pub type Result<T> = std::result::Result<T, ZtrackError>;

/// Collapse a poll result into the code a C-style caller expects.
pub fn to_result_code(result: &Result<Status>) -> ResultCode {
    match result {
        Ok(status) => status.result_code(),
        Err(e) => e.result_code(),
    }
}
