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

//! Direct-submission controller: one background thread that samples every
//! registered context's task counter and stops rings that went idle.
//!
//! The sampling period adapts. A context that stayed idle longer than the
//! current period stretches it (x1.5, capped at the maximum); an idle stretch
//! longer than the maximum snaps it back to the base. Each additional
//! compute context on the busiest sub-device divides both period and base by
//! the configured divisor, never below the floor.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};

use crate::config::MonitorConfig;
use crate::error::{Result, ZtrackError};
use crate::submission::context::{
    ContextId, CpuClock, EngineFamily, MonotonicClock, SubmissionContext,
};

const SUBDEVICE_SLOTS: usize = u32::BITS as usize;

/// Stretch factor applied to an idle period that outlived the timeout.
const TIMEOUT_GROWTH_NUM: u64 = 3;
const TIMEOUT_GROWTH_DEN: u64 = 2;

/// Per-context sampling state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContextEntry {
    /// `None` until the first sampling pass sees the context.
    pub last_task_count: Option<u64>,
    pub is_stopped: bool,
}

struct Registered {
    context: Arc<dyn SubmissionContext>,
    state: ContextEntry,
}

/// Registry-wide adaptive timeout, all values in microseconds.
#[derive(Debug)]
struct TimeoutState {
    timeout_us: u64,
    base_us: u64,
    max_us: u64,
    min_us: u64,
    divisor: u64,
    last_stop_us: u64,
    max_ccs_count: u32,
    ccs_per_subdevice: [u32; SUBDEVICE_SLOTS],
}

impl TimeoutState {
    fn new(config: &MonitorConfig, now_us: u64) -> Self {
        let timeout_us = config.timeout.as_micros() as u64;
        Self {
            timeout_us,
            base_us: timeout_us,
            max_us: config.max_timeout.as_micros() as u64,
            min_us: config.min_timeout.as_micros() as u64,
            divisor: config.divisor as u64,
            last_stop_us: now_us,
            max_ccs_count: 1,
            ccs_per_subdevice: [0; SUBDEVICE_SLOTS],
        }
    }

    fn on_stop(&mut self, now_us: u64) {
        let elapsed = now_us.saturating_sub(self.last_stop_us);
        let previous = self.timeout_us;
        if elapsed > self.max_us {
            self.timeout_us = self.base_us;
        } else if elapsed > self.timeout_us {
            let grown = elapsed.saturating_mul(TIMEOUT_GROWTH_NUM) / TIMEOUT_GROWTH_DEN;
            self.timeout_us = grown.min(self.max_us);
        }
        self.last_stop_us = now_us;
        if previous != self.timeout_us {
            log::debug!(
                "SubmissionController: timeout {}us -> {}us (idle {}us)",
                previous,
                self.timeout_us,
                elapsed
            );
        }
    }

    fn on_register(&mut self, engine: EngineFamily, device_mask: u32) {
        if engine != EngineFamily::Compute {
            return;
        }
        for (subdevice, count) in self.ccs_per_subdevice.iter_mut().enumerate() {
            if device_mask & (1 << subdevice) != 0 {
                *count += 1;
            }
        }
        let busiest = self.ccs_per_subdevice.iter().copied().max().unwrap_or(0);
        if busiest > self.max_ccs_count {
            self.max_ccs_count = busiest;
            if self.divisor > 1 {
                self.timeout_us = (self.timeout_us / self.divisor).max(self.min_us);
                self.base_us = (self.base_us / self.divisor).max(self.min_us);
                log::debug!(
                    "SubmissionController: {} compute contexts per sub-device, timeout {}us",
                    busiest,
                    self.timeout_us
                );
            }
        }
    }
}

struct Registry {
    entries: BTreeMap<ContextId, Registered>,
    timeouts: TimeoutState,
}

struct Shared {
    registry: Mutex<Registry>,
    keep_controlling: AtomicBool,
    clock: Arc<dyn CpuClock>,
}

enum Control {
    Start,
    Stop,
}

enum Sample {
    Changed,
    Idle,
    Unchanged,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Run a context callback, turning a panic into an error so one broken
/// context cannot take the controller thread down.
fn isolated<T>(id: ContextId, what: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(ZtrackError::InvalidInput(format!(
            "{} {} panicked: {}",
            id,
            what,
            panic_message(payload.as_ref())
        )))
    })
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_us(&self) -> u64 {
        self.clock.now().as_micros() as u64
    }

    fn timeout(&self) -> Duration {
        Duration::from_micros(self.lock().timeouts.timeout_us)
    }

    /// One sampling pass. Context callbacks run without the registry lock,
    /// so they may register or unregister contexts themselves.
    fn check_new_submissions(&self) {
        crate::profile_scope!("SubmissionController::Check");
        let contexts: Vec<(ContextId, Arc<dyn SubmissionContext>)> = self
            .lock()
            .entries
            .iter()
            .map(|(id, r)| (*id, Arc::clone(&r.context)))
            .collect();

        for (id, context) in contexts {
            let count = match isolated(id, "task_count", || context.task_count()) {
                Ok(count) => count,
                Err(e) => {
                    log::warn!("SubmissionController: skipping {}: {}", id, e);
                    continue;
                }
            };

            let sample = {
                let mut registry = self.lock();
                let Some(entry) = registry.entries.get_mut(&id) else {
                    continue;
                };
                if entry.state.last_task_count != Some(count) {
                    entry.state.last_task_count = Some(count);
                    entry.state.is_stopped = false;
                    Sample::Changed
                } else if entry.state.is_stopped {
                    Sample::Unchanged
                } else {
                    Sample::Idle
                }
            };
            log::trace!("SubmissionController: {} task count {}", id, count);

            if !matches!(sample, Sample::Idle) {
                continue;
            }
            if let Err(e) = isolated(id, "stop_ring", || context.stop_ring()) {
                log::warn!("SubmissionController: failed to stop {}: {}", id, e);
                continue;
            }
            let now_us = self.now_us();
            let mut registry = self.lock();
            let Registry { entries, timeouts } = &mut *registry;
            if let Some(entry) = entries.get_mut(&id) {
                entry.state.is_stopped = true;
                timeouts.on_stop(now_us);
                log::trace!("SubmissionController: stopped ring of {}", id);
            }
        }
    }
}

fn controller_loop(shared: Arc<Shared>, control_rx: Receiver<Control>) {
    // Wait for start_controlling(); a stop or a dropped sender ends the thread.
    match control_rx.recv() {
        Ok(Control::Start) => {}
        Ok(Control::Stop) | Err(_) => return,
    }
    log::debug!("SubmissionController: started");

    while shared.keep_controlling.load(Ordering::Acquire) {
        match control_rx.recv_timeout(shared.timeout()) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(Control::Start) => continue,
            Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break,
        }
        if !shared.keep_controlling.load(Ordering::Acquire) {
            break;
        }
        shared.check_new_submissions();
    }
    log::debug!("SubmissionController: stopped");
}

/// Monitors direct-submission contexts and stops idle rings.
pub struct SubmissionController {
    shared: Arc<Shared>,
    control_tx: Sender<Control>,
    join: Option<thread::JoinHandle<()>>,
    max_timeout: Duration,
    divisor: u32,
}

impl SubmissionController {
    /// Build from configuration with the monotonic clock. `Ok(None)` when the
    /// monitor is disabled.
    pub fn from_config(config: MonitorConfig) -> Result<Option<Self>> {
        if !config.enabled {
            log::debug!("SubmissionController: disabled by configuration");
            return Ok(None);
        }
        Self::with_clock(config, Arc::new(MonotonicClock)).map(Some)
    }

    /// Spawn the controller thread. Sampling starts at [`Self::start_controlling`].
    pub fn with_clock(config: MonitorConfig, clock: Arc<dyn CpuClock>) -> Result<Self> {
        config.validate()?;
        let now_us = clock.now().as_micros() as u64;
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry {
                entries: BTreeMap::new(),
                timeouts: TimeoutState::new(&config, now_us),
            }),
            keep_controlling: AtomicBool::new(true),
            clock,
        });
        let (control_tx, control_rx) = unbounded();
        let thread_shared = Arc::clone(&shared);
        let join = thread::Builder::new()
            .name("ztrack-submission-controller".into())
            .spawn(move || controller_loop(thread_shared, control_rx))?;
        log::debug!(
            "SubmissionController: timeout {:?}, max {:?}, divisor {}",
            config.timeout,
            config.max_timeout,
            config.divisor
        );
        Ok(Self {
            shared,
            control_tx,
            join: Some(join),
            max_timeout: config.max_timeout,
            divisor: config.divisor,
        })
    }

    /// Release the controller thread into its sampling loop. Repeated calls
    /// are ignored.
    pub fn start_controlling(&self) {
        let _ = self.control_tx.send(Control::Start);
    }

    /// Add a context to the sampling set. Thread-safe, callable while the
    /// thread runs. A new compute context may shrink the timeout.
    ///
    /// # Arguments
    /// * `context` - Context to monitor, keyed by its [`ContextId`]
    ///
    /// `InvalidInput` if a context with the same id is already registered;
    /// the registry is left unchanged.
    pub fn register(&self, context: Arc<dyn SubmissionContext>) -> Result<()> {
        let id = context.id();
        let engine = context.engine();
        let mask = context.device_mask();
        let mut registry = self.shared.lock();
        if registry.entries.contains_key(&id) {
            return Err(ZtrackError::InvalidInput(format!(
                "{} is already registered",
                id
            )));
        }
        registry.entries.insert(
            id,
            Registered {
                context,
                state: ContextEntry::default(),
            },
        );
        registry.timeouts.on_register(engine, mask);
        log::debug!("SubmissionController: registered {} ({:?})", id, engine);
        Ok(())
    }

    /// Remove a context. Safe during a sampling pass: the pass skips ids that
    /// disappeared. The timeout is not re-expanded.
    ///
    /// `InvalidInput` if `id` is not registered; the registry is left
    /// unchanged.
    pub fn unregister(&self, id: ContextId) -> Result<()> {
        let mut registry = self.shared.lock();
        if registry.entries.remove(&id).is_none() {
            return Err(ZtrackError::InvalidInput(format!(
                "{} is not registered",
                id
            )));
        }
        log::debug!("SubmissionController: unregistered {}", id);
        Ok(())
    }

    /// Run one sampling pass on the calling thread.
    pub fn check_new_submissions(&self) {
        self.shared.check_new_submissions();
    }

    /// Snapshot of one context's sampling state.
    pub fn entry(&self, id: ContextId) -> Option<ContextEntry> {
        self.shared.lock().entries.get(&id).map(|r| r.state)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current adaptive sampling period.
    pub fn timeout(&self) -> Duration {
        self.shared.timeout()
    }

    pub fn max_timeout(&self) -> Duration {
        self.max_timeout
    }

    pub fn divisor(&self) -> u32 {
        self.divisor
    }

    /// Stop the thread and wait for it. Idempotent.
    pub fn shutdown(&mut self) {
        self.shared.keep_controlling.store(false, Ordering::Release);
        let _ = self.control_tx.send(Control::Stop);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::warn!("SubmissionController: controller thread panicked");
            }
        }
    }
}

impl Drop for SubmissionController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[derive(Default)]
    struct ManualClock {
        micros: AtomicU64,
    }

    impl ManualClock {
        fn advance_us(&self, us: u64) {
            self.micros.fetch_add(us, Ordering::SeqCst);
        }
    }

    impl CpuClock for ManualClock {
        fn now(&self) -> Duration {
            Duration::from_micros(self.micros.load(Ordering::SeqCst))
        }
    }

    struct MockContext {
        id: ContextId,
        engine: EngineFamily,
        mask: u32,
        tasks: AtomicU64,
        stops: AtomicU64,
        fail: AtomicBool,
        panic: AtomicBool,
    }

    impl MockContext {
        fn new(id: u64, engine: EngineFamily, mask: u32) -> Arc<Self> {
            Arc::new(Self {
                id: ContextId(id),
                engine,
                mask,
                tasks: AtomicU64::new(0),
                stops: AtomicU64::new(0),
                fail: AtomicBool::new(false),
                panic: AtomicBool::new(false),
            })
        }

        fn ccs(id: u64) -> Arc<Self> {
            Self::new(id, EngineFamily::Compute, 1)
        }

        fn set_tasks(&self, n: u64) {
            self.tasks.store(n, Ordering::SeqCst);
        }

        fn stops(&self) -> u64 {
            self.stops.load(Ordering::SeqCst)
        }
    }

    impl SubmissionContext for MockContext {
        fn id(&self) -> ContextId {
            self.id
        }

        fn task_count(&self) -> Result<u64> {
            if self.panic.load(Ordering::SeqCst) {
                panic!("task counter exploded");
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(ZtrackError::DeviceLost("ring unmapped".to_string()));
            }
            Ok(self.tasks.load(Ordering::SeqCst))
        }

        fn engine(&self) -> EngineFamily {
            self.engine
        }

        fn device_mask(&self) -> u32 {
            self.mask
        }

        fn stop_ring(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(timeout_us: u64, max_us: u64, divisor: u32) -> MonitorConfig {
        MonitorConfig {
            enabled: true,
            timeout: Duration::from_micros(timeout_us),
            max_timeout: Duration::from_micros(max_us),
            min_timeout: Duration::from_micros(10),
            divisor,
        }
    }

    fn controller(cfg: MonitorConfig) -> (SubmissionController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let ctrl = SubmissionController::with_clock(cfg, clock.clone()).unwrap();
        (ctrl, clock)
    }

    #[test]
    fn idle_context_is_stopped_once() {
        let (ctrl, _clock) = controller(config(5000, 200_000, 1));
        let ctx = MockContext::ccs(1);
        ctx.set_tasks(5);
        ctrl.register(ctx.clone()).unwrap();
        assert_eq!(ctrl.entry(ContextId(1)), Some(ContextEntry::default()));

        ctrl.check_new_submissions();
        let entry = ctrl.entry(ContextId(1)).unwrap();
        assert_eq!(entry.last_task_count, Some(5));
        assert!(!entry.is_stopped);

        ctrl.check_new_submissions();
        assert!(ctrl.entry(ContextId(1)).unwrap().is_stopped);
        assert_eq!(ctx.stops(), 1);

        ctrl.check_new_submissions();
        assert_eq!(ctx.stops(), 1);

        ctx.set_tasks(6);
        ctrl.check_new_submissions();
        let entry = ctrl.entry(ContextId(1)).unwrap();
        assert_eq!(entry.last_task_count, Some(6));
        assert!(!entry.is_stopped);
    }

    #[test]
    fn timeout_adapts_to_idle_stretches() {
        let (ctrl, clock) = controller(config(5000, 200_000, 1));
        let ctx = MockContext::ccs(1);
        ctrl.register(ctx.clone()).unwrap();

        ctrl.check_new_submissions();
        clock.advance_us(5500);
        ctrl.check_new_submissions();
        assert_eq!(ctrl.timeout(), Duration::from_micros(8250));

        ctx.set_tasks(1);
        ctrl.check_new_submissions();
        clock.advance_us(1000);
        ctrl.check_new_submissions();
        assert_eq!(ctrl.timeout(), Duration::from_micros(8250));

        ctx.set_tasks(2);
        ctrl.check_new_submissions();
        clock.advance_us(150_000);
        ctrl.check_new_submissions();
        assert_eq!(ctrl.timeout(), ctrl.max_timeout());

        ctx.set_tasks(3);
        ctrl.check_new_submissions();
        clock.advance_us(300_000);
        ctrl.check_new_submissions();
        assert_eq!(ctrl.timeout(), Duration::from_micros(5000));
    }

    #[test]
    fn divisor_four_scales_per_compute_context() {
        let (ctrl, _clock) = controller(config(5000, 200_000, 4));
        assert_eq!(ctrl.divisor(), 4);
        let expected = [5000, 1250, 312, 78];
        for (i, want) in expected.iter().enumerate() {
            ctrl.register(MockContext::ccs(i as u64)).unwrap();
            assert_eq!(ctrl.timeout(), Duration::from_micros(*want));
        }
    }

    #[test]
    fn divisor_five_scales_and_unregister_keeps_timeout() {
        let (ctrl, _clock) = controller(config(5000, 200_000, 5));
        for id in 0..3 {
            ctrl.register(MockContext::ccs(id)).unwrap();
        }
        assert_eq!(ctrl.timeout(), Duration::from_micros(200));
        ctrl.unregister(ContextId(2)).unwrap();
        ctrl.unregister(ContextId(1)).unwrap();
        assert_eq!(ctrl.timeout(), Duration::from_micros(200));
    }

    #[test]
    fn copy_engines_and_other_subdevices_do_not_scale() {
        let (ctrl, _clock) = controller(config(5000, 200_000, 4));
        ctrl.register(MockContext::ccs(0)).unwrap();
        ctrl.register(MockContext::new(1, EngineFamily::Copy, 1)).unwrap();
        ctrl.register(MockContext::new(2, EngineFamily::Render, 1)).unwrap();
        ctrl.register(MockContext::new(3, EngineFamily::Compute, 0b10))
            .unwrap();
        assert_eq!(ctrl.timeout(), Duration::from_micros(5000));

        ctrl.register(MockContext::new(4, EngineFamily::Compute, 0b11))
            .unwrap();
        assert_eq!(ctrl.timeout(), Duration::from_micros(1250));
    }

    #[test]
    fn scaling_is_clamped_at_floor() {
        let mut cfg = config(5000, 200_000, 4);
        cfg.min_timeout = Duration::from_micros(100);
        let (ctrl, clock) = controller(cfg);
        for id in 0..4 {
            ctrl.register(MockContext::ccs(id)).unwrap();
        }
        assert_eq!(ctrl.timeout(), Duration::from_micros(100));

        // Reset goes back to the scaled base, not the configured timeout.
        ctrl.check_new_submissions();
        clock.advance_us(300_000);
        ctrl.check_new_submissions();
        assert_eq!(ctrl.timeout(), Duration::from_micros(100));
    }

    #[test]
    fn duplicate_and_unknown_registrations_are_rejected() {
        let (ctrl, _clock) = controller(config(5000, 200_000, 1));
        let ctx = MockContext::ccs(9);
        ctrl.register(ctx.clone()).unwrap();
        assert!(matches!(
            ctrl.register(ctx),
            Err(ZtrackError::InvalidInput(_))
        ));
        assert_eq!(ctrl.len(), 1);
        assert!(matches!(
            ctrl.unregister(ContextId(10)),
            Err(ZtrackError::InvalidInput(_))
        ));
        ctrl.unregister(ContextId(9)).unwrap();
        assert!(ctrl.is_empty());
    }

    #[test]
    fn failing_and_panicking_contexts_are_isolated() {
        let (ctrl, _clock) = controller(config(5000, 200_000, 1));
        let broken = MockContext::ccs(1);
        broken.fail.store(true, Ordering::SeqCst);
        let exploding = MockContext::ccs(2);
        exploding.panic.store(true, Ordering::SeqCst);
        let healthy = MockContext::ccs(3);
        for ctx in [&broken, &exploding, &healthy] {
            ctrl.register(ctx.clone()).unwrap();
        }

        ctrl.check_new_submissions();
        ctrl.check_new_submissions();

        assert_eq!(ctrl.entry(ContextId(1)), Some(ContextEntry::default()));
        assert_eq!(ctrl.entry(ContextId(2)), Some(ContextEntry::default()));
        assert!(ctrl.entry(ContextId(3)).unwrap().is_stopped);
        assert_eq!(healthy.stops(), 1);
    }

    #[test]
    fn disabled_config_yields_no_controller() {
        let mut cfg = config(5000, 200_000, 1);
        cfg.enabled = false;
        assert!(SubmissionController::from_config(cfg).unwrap().is_none());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = config(5000, 1000, 1);
        assert!(SubmissionController::from_config(cfg).is_err());
    }

    #[test]
    fn shutdown_before_start_does_not_hang() {
        let (mut ctrl, _clock) = controller(config(5000, 200_000, 1));
        ctrl.shutdown();
        ctrl.shutdown();
    }

    #[test]
    fn shutdown_after_start_joins_thread() {
        let (ctrl, _clock) = controller(config(50_000_000, 100_000_000, 1));
        ctrl.start_controlling();
        ctrl.start_controlling();
        drop(ctrl);
    }
}
