//! # Fiber Runtime
//!
//! One runtime per OS thread, created by [`thread_init`] and torn down by
//! [`thread_shutdown`]. Every public operation acts on the runtime bound to
//! the calling OS thread.
//!
//! ## Locking
//!
//! Scheduler state sits behind a spin lock. Every path that takes it first
//! masks the timer interrupt with an [`InterruptGuard`], and the lock is
//! always released before a context switch. The interrupt handler only
//! uses `try_lock`: a tick that finds the lock taken is dropped and
//! counted, never waited on.
//!
//! ## Signal masks across switches
//!
//! A guard stores the mask of the context that created it. A fiber that
//! switched away voluntarily gets its mask back when its guard drops after
//! being resumed; a fiber preempted inside the signal handler gets it back
//! from `sigreturn`. Fresh fibers unmask the interrupt in `fiber_main`.
//!
//! ## Fiber code and the timer
//!
//! The timer can fire between any two instructions of a fiber. Fiber code
//! that may be preempted must not allocate or take process-wide locks such
//! as stdout's: the next fiber could need the same lock on the same OS
//! thread. Runtime operations themselves run with the interrupt masked.

use crate::config::RuntimeConfig;
use crate::context::{self, Switch, SwitchReason};
use crate::diagnostics::FiberSnapshot;
use crate::scheduler::metrics::{MetricsSnapshot, SchedulerMetrics};
use crate::scheduler::{Current, RunSummary, Scheduler};
use crate::sync::WaitOutcome;
use crate::thread::{FiberEntry, FiberState};
use crate::{ExecError, ExecResult, FiberId, SemaphoreId};
use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};
use spin::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use strand_hal::interrupts::{self, InterruptGuard, PeriodicTimer};

thread_local! {
    /// Runtime bound to this OS thread (null = none)
    static RUNTIME: Cell<*mut Runtime> = const { Cell::new(ptr::null_mut()) };
}

/// Per-thread runtime
#[derive(Debug)]
struct Runtime {
    /// Configuration given at init
    config: RuntimeConfig,
    /// Scheduling state
    scheduler: Mutex<Scheduler>,
    /// Counters, updated without the scheduler lock
    metrics: SchedulerMetrics,
    /// Timer interrupt source, `None` without preemption
    timer: Mutex<Option<PeriodicTimer>>,
    /// The host is inside `run_threads`
    running: AtomicBool,
}

impl Runtime {
    fn new(config: RuntimeConfig) -> ExecResult<Self> {
        // The timer targets the OS thread that creates it.
        let timer = if config.preemption {
            Some(PeriodicTimer::new()?)
        } else {
            None
        };

        Ok(Self {
            scheduler: Mutex::new(Scheduler::new(&config, fiber_main)),
            metrics: SchedulerMetrics::new(),
            timer: Mutex::new(timer),
            running: AtomicBool::new(false),
            config,
        })
    }

    fn record(&self, switch: &Switch) {
        self.metrics.record_context_switch();
        match switch.reason {
            SwitchReason::Yield => self.metrics.record_yield(),
            SwitchReason::Preemption => self.metrics.record_preemption(),
            SwitchReason::Blocked => self.metrics.record_block(),
            SwitchReason::Exit => self.metrics.record_exit(),
            SwitchReason::Dispatch => {}
        }
    }

    fn arm_timer(&self) -> ExecResult<()> {
        let quantum = self.scheduler.lock().quantum();
        if let Some(timer) = self.timer.lock().as_mut() {
            timer.arm(quantum)?;
            log::debug!("timer armed with a {:?} quantum", quantum);
        }
        Ok(())
    }

    fn disarm_timer(&self) {
        if let Some(timer) = self.timer.lock().as_mut() {
            if let Err(e) = timer.disarm() {
                log::warn!("failed to disarm the timer: {}", e);
            }
        }
    }
}

/// Runtime bound to the calling OS thread
fn runtime() -> ExecResult<&'static Runtime> {
    let runtime = RUNTIME.get();
    if runtime.is_null() {
        return Err(ExecError::NotInitialized);
    }
    // SAFETY: the pointer comes from `Box::into_raw` in `thread_init_with`
    // and is only freed by `thread_shutdown`, which refuses to run while the
    // scheduler loop (and so any fiber) is active.
    Ok(unsafe { &*runtime })
}

/// Run `f` on the scheduler state with the timer interrupt masked
pub(crate) fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> ExecResult<R> {
    let runtime = runtime()?;
    let _guard = InterruptGuard::new();
    let mut scheduler = runtime.scheduler.lock();
    Ok(f(&mut *scheduler))
}

/// Perform a decided switch
///
/// The caller holds an [`InterruptGuard`] and no scheduler lock.
fn switch_now(runtime: &Runtime, switch: Switch) {
    runtime.record(&switch);
    // SAFETY: the lock is released, the interrupt is masked and both
    // contexts live in the boxed runtime.
    unsafe { switch.perform() }
}

/// Timer interrupt entry
fn on_tick() {
    let runtime = RUNTIME.get();
    if runtime.is_null() {
        return;
    }
    // SAFETY: see `runtime()`; the handler runs on the owning OS thread.
    let runtime = unsafe { &*runtime };
    runtime.metrics.record_tick();

    let switch = match runtime.scheduler.try_lock() {
        Some(mut scheduler) => {
            if scheduler.current() == Current::Host {
                return;
            }
            scheduler.switch_thread(SwitchReason::Preemption)
        }
        None => {
            runtime.metrics.record_skipped_tick();
            return;
        }
    };

    if let Some(switch) = switch {
        switch_now(runtime, switch);
    }
}

/// First code run on every fiber stack
extern "C" fn fiber_main() -> ! {
    let started = runtime().ok().and_then(|runtime| {
        let _guard = InterruptGuard::new();
        let mut scheduler = runtime.scheduler.lock();
        let id = scheduler.current_fiber()?;
        let entry = scheduler.take_current_entry()?;
        Some((runtime, id, entry))
    });
    let Some((runtime, id, entry)) = started else {
        context::fatal(format_args!("fiber started without a runtime or entry"));
    };

    interrupts::enable();
    if panic::catch_unwind(AssertUnwindSafe(entry)).is_err() {
        let _guard = InterruptGuard::new();
        runtime.scheduler.lock().mark_panicked(id);
        log::error!("{} panicked; treating it as exited", id);
    }

    thread_exit()
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Bind a runtime configured from the environment to the calling OS thread
///
/// See [`RuntimeConfig::from_env`].
pub fn thread_init() -> ExecResult<()> {
    thread_init_with(RuntimeConfig::from_env())
}

/// Bind a runtime with an explicit configuration to the calling OS thread
pub fn thread_init_with(config: RuntimeConfig) -> ExecResult<()> {
    config.validate()?;
    if !RUNTIME.get().is_null() {
        return Err(ExecError::AlreadyInitialized);
    }

    let runtime = Box::new(Runtime::new(config)?);
    log::info!(
        "runtime initialized: {} fibers, {} semaphores, quantum {:?}, preemption {}",
        runtime.config.max_threads,
        runtime.config.max_semaphores,
        runtime.config.quantum,
        if runtime.config.preemption { "on" } else { "off" }
    );
    RUNTIME.set(Box::into_raw(runtime));
    Ok(())
}

/// Tear down the runtime of the calling OS thread
///
/// Releases every stack, including those of fibers that never finished.
/// Must be called from the host, outside [`run_threads`].
pub fn thread_shutdown() -> ExecResult<()> {
    let runtime = runtime()?;
    if runtime.running.load(Ordering::Acquire) {
        return Err(ExecError::NotHost);
    }

    let _guard = InterruptGuard::new();
    // SAFETY: the slot held a pointer from `Box::into_raw`; clearing it
    // first means no later lookup can observe the freed runtime.
    let runtime = unsafe { Box::from_raw(RUNTIME.replace(ptr::null_mut())) };

    {
        let scheduler = runtime.scheduler.lock();
        let threads = scheduler.threads();
        let unfinished = threads.len() - threads.count_by_state(FiberState::Exit);
        if unfinished > 0 {
            log::warn!("shutting down with {} unfinished fiber(s)", unfinished);
        }
        log::info!(
            "runtime shut down: {} fiber(s), {} context switch(es)",
            threads.len(),
            runtime.metrics.context_switches()
        );
    }

    drop(runtime);
    Ok(())
}

// =============================================================================
// Fibers
// =============================================================================

/// Create a fiber running `entry`
///
/// The fiber is appended to the run queue and starts on a later scheduling
/// decision. Returning from `entry` is the same as calling [`thread_exit`].
pub fn thread_create(name: &str, entry: fn(), stack_size: usize) -> ExecResult<FiberId> {
    thread_spawn(name, entry, stack_size)
}

/// Create a fiber running an arbitrary closure
pub fn thread_spawn<F>(name: &str, entry: F, stack_size: usize) -> ExecResult<FiberId>
where
    F: FnOnce() + 'static,
{
    with_scheduler(|scheduler| {
        let entry: FiberEntry = Box::new(entry);
        scheduler.create(name, entry, stack_size)
    })?
}

/// Terminate the calling fiber
///
/// The control block stays in the table for [`thread_state`]; the stack is
/// released later by the host.
///
/// # Panics
/// Panics when called from the host or on a thread without a runtime.
pub fn thread_exit() -> ! {
    let runtime = match runtime() {
        Ok(runtime) => runtime,
        Err(_) => panic!("thread_exit() called on a thread without a runtime"),
    };

    let _guard = InterruptGuard::new();
    let switch = {
        let mut scheduler = runtime.scheduler.lock();
        if scheduler.exit_current().is_none() {
            drop(scheduler);
            panic!("thread_exit() called from the host");
        }
        scheduler.switch_thread(SwitchReason::Exit)
    };

    if let Some(switch) = switch {
        switch_now(runtime, switch);
    }
    context::fatal(format_args!("an exited fiber was resumed"))
}

/// Give up the CPU to the next runnable fiber
///
/// No-op on the host or when no other fiber is runnable.
pub fn thread_yield() {
    let Ok(runtime) = runtime() else {
        return;
    };

    let _guard = InterruptGuard::new();
    let switch = {
        let mut scheduler = runtime.scheduler.lock();
        if scheduler.current_fiber().is_none() {
            return;
        }
        scheduler.switch_thread(SwitchReason::Yield)
    };

    if let Some(switch) = switch {
        switch_now(runtime, switch);
    }
}

/// The calling fiber, `None` on the host
pub fn current_fiber() -> Option<FiberId> {
    with_scheduler(|scheduler| scheduler.current_fiber()).ok().flatten()
}

// =============================================================================
// Scheduling
// =============================================================================

/// Run fibers until none is runnable or a stop is requested
///
/// Arms the timer interrupt (when preemption is enabled) for the duration
/// of the call. Fibers still blocked when it returns resume on a later
/// call once something signals their semaphore.
pub fn run_threads() -> ExecResult<RunSummary> {
    let runtime = runtime()?;
    if current_fiber().is_some() {
        return Err(ExecError::NotHost);
    }
    if runtime.running.swap(true, Ordering::AcqRel) {
        return Err(ExecError::AlreadyRunning);
    }

    let result = dispatch_loop(runtime);
    runtime.disarm_timer();
    runtime.running.store(false, Ordering::Release);
    result
}

fn dispatch_loop(runtime: &Runtime) -> ExecResult<RunSummary> {
    let started = Instant::now();
    let before = runtime.metrics.snapshot();

    {
        let _guard = InterruptGuard::new();
        if runtime.scheduler.lock().take_stop_request() {
            log::debug!("discarding a stop request made outside the loop");
        }
    }
    if runtime.config.preemption {
        interrupts::install(on_tick)?;
        runtime.arm_timer()?;
    }
    log::info!("scheduler loop started");

    let mut stopped = false;
    loop {
        let _guard = InterruptGuard::new();
        let switch = {
            let mut scheduler = runtime.scheduler.lock();
            scheduler.reap_exited();
            if scheduler.take_stop_request() {
                stopped = true;
                None
            } else {
                scheduler.switch_thread(SwitchReason::Dispatch)
            }
        };

        match switch {
            Some(switch) => switch_now(runtime, switch),
            None => break,
        }
    }

    let mut summary = RunSummary {
        elapsed: started.elapsed(),
        stopped,
        ..RunSummary::default()
    };
    {
        let _guard = InterruptGuard::new();
        let scheduler = runtime.scheduler.lock();
        scheduler.summarize(&mut summary);
        debug_assert!(scheduler.is_consistent());
    }
    summary.metrics = runtime.metrics.snapshot().since(&before);

    log::info!(
        "scheduler loop returned after {:?}: {} exited, {} blocked, {} runnable{}",
        summary.elapsed,
        summary.exited,
        summary.blocked,
        summary.runnable,
        if summary.stopped { " (stopped)" } else { "" }
    );
    Ok(summary)
}

/// Ask the scheduler loop to return to the host
///
/// Takes effect at the next scheduling decision; the running fiber goes
/// back to the run queue.
pub fn stop_threads() {
    if with_scheduler(Scheduler::request_stop).is_err() {
        log::debug!("stop_threads(): no runtime on this thread");
    }
}

/// Set the timer period
///
/// Interval and first expiry are both set to `quantum` (clamped to the
/// supported range). Callable at any time; a running timer is re-armed.
pub fn set_quantum_size(quantum: Duration) {
    let Ok(runtime) = runtime() else {
        log::debug!("set_quantum_size(): no runtime on this thread");
        return;
    };

    let _guard = InterruptGuard::new();
    let quantum = runtime.scheduler.lock().set_quantum(quantum);
    if runtime.running.load(Ordering::Acquire) {
        if let Some(timer) = runtime.timer.lock().as_mut() {
            if let Err(e) = timer.arm(quantum) {
                log::warn!("set_quantum_size(): re-arming the timer failed: {}", e);
            }
        }
    }
    log::debug!("quantum set to {:?}", quantum);
}

/// Counters of the calling thread's runtime
pub fn metrics() -> MetricsSnapshot {
    runtime()
        .map(|runtime| runtime.metrics.snapshot())
        .unwrap_or_default()
}

// =============================================================================
// Semaphores
// =============================================================================

/// Create a counting semaphore
///
/// `initial` is the number of units available up front and must not be
/// negative; a negative value fails with [`ExecError::InvalidArgument`].
pub fn create_semaphore(initial: i32) -> ExecResult<SemaphoreId> {
    with_scheduler(|scheduler| scheduler.create_semaphore(initial))?
}

/// Take a unit, blocking the calling fiber while none is available
///
/// Unknown or destroyed handles are ignored. The host cannot block: it
/// only takes a unit that is available.
pub fn semaphore_wait(id: SemaphoreId) {
    let Ok(runtime) = runtime() else {
        log::debug!("semaphore_wait({}): no runtime on this thread", id);
        return;
    };

    let _guard = InterruptGuard::new();
    let switch = {
        let mut scheduler = runtime.scheduler.lock();
        match scheduler.semaphore_wait(id) {
            WaitOutcome::Blocked => scheduler.switch_thread(SwitchReason::Blocked),
            _ => None,
        }
    };

    if let Some(switch) = switch {
        switch_now(runtime, switch);
    }
}

/// Return a unit, releasing the oldest waiter
///
/// Unknown or destroyed handles are ignored. Never switches.
pub fn semaphore_signal(id: SemaphoreId) {
    if with_scheduler(|scheduler| scheduler.semaphore_signal(id)).is_err() {
        log::debug!("semaphore_signal({}): no runtime on this thread", id);
    }
}

/// Destroy a semaphore
///
/// Fails with [`ExecError::SemaphoreBusy`] while fibers wait on it.
pub fn destroy_semaphore(id: SemaphoreId) -> ExecResult<()> {
    with_scheduler(|scheduler| scheduler.destroy_semaphore(id))?
}

/// Current value of a live semaphore
pub fn semaphore_value(id: SemaphoreId) -> Option<i32> {
    with_scheduler(|scheduler| scheduler.semaphores().get(id).map(|sem| sem.count()))
        .ok()
        .flatten()
}

/// Number of fibers blocked on a live semaphore
pub fn semaphore_waiters(id: SemaphoreId) -> Option<usize> {
    with_scheduler(|scheduler| scheduler.semaphores().get(id).map(|sem| sem.waiters()))
        .ok()
        .flatten()
}

// =============================================================================
// Reporting
// =============================================================================

/// Snapshot of every fiber ever created, in creation order
pub fn thread_state() -> Vec<FiberSnapshot> {
    with_scheduler(|scheduler| scheduler.snapshot()).unwrap_or_default()
}
