//! # Strand Demo - Bounded Buffer
//!
//! Two producers and two consumers share a ring buffer guarded by three
//! semaphores, while a CPU-bound fiber spins next to them. With the timer
//! enabled the spinner is preempted; without it (`STRAND_PREEMPTION=off`)
//! it runs its whole budget in one go.
//!
//! Fiber bodies only touch atomics: a preempted fiber must not hold the
//! allocator or stdout lock.

use anyhow::{ensure, Context as _, Result};
use flexi_logger::Logger;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use strand_execution::{
    create_semaphore, destroy_semaphore, metrics, run_threads, semaphore_signal, semaphore_wait,
    thread_init, thread_shutdown, thread_spawn, thread_state, thread_yield, SemaphoreId,
    StateTable,
};

/// Ring buffer slots
const SLOTS: usize = 4;
/// Items produced by each producer
const ITEMS_PER_PRODUCER: u64 = 1_000;
/// Producer and consumer count
const WORKERS: u64 = 2;
/// CPU time burned by the spinner
const SPIN_BUDGET: Duration = Duration::from_millis(50);

static RING: [AtomicU64; SLOTS] = [const { AtomicU64::new(0) }; SLOTS];
static HEAD: AtomicUsize = AtomicUsize::new(0);
static TAIL: AtomicUsize = AtomicUsize::new(0);
static PRODUCED_SUM: AtomicU64 = AtomicU64::new(0);
static CONSUMED_SUM: AtomicU64 = AtomicU64::new(0);

/// Semaphores of the bounded buffer
#[derive(Debug, Clone, Copy)]
struct Buffer {
    empty: SemaphoreId,
    full: SemaphoreId,
    lock: SemaphoreId,
}

impl Buffer {
    fn new() -> Result<Self> {
        Ok(Self {
            empty: create_semaphore(SLOTS as i32)?,
            full: create_semaphore(0)?,
            lock: create_semaphore(1)?,
        })
    }

    fn put(&self, value: u64) {
        semaphore_wait(self.empty);
        semaphore_wait(self.lock);
        let slot = HEAD.fetch_add(1, Ordering::Relaxed) % SLOTS;
        RING[slot].store(value, Ordering::Relaxed);
        semaphore_signal(self.lock);
        semaphore_signal(self.full);
    }

    fn take(&self) -> u64 {
        semaphore_wait(self.full);
        semaphore_wait(self.lock);
        let slot = TAIL.fetch_add(1, Ordering::Relaxed) % SLOTS;
        let value = RING[slot].load(Ordering::Relaxed);
        semaphore_signal(self.lock);
        semaphore_signal(self.empty);
        value
    }

    fn destroy(self) -> Result<()> {
        destroy_semaphore(self.empty)?;
        destroy_semaphore(self.full)?;
        destroy_semaphore(self.lock)?;
        Ok(())
    }
}

fn producer(buffer: Buffer, base: u64) {
    for i in 0..ITEMS_PER_PRODUCER {
        let value = base + i;
        buffer.put(value);
        PRODUCED_SUM.fetch_add(value, Ordering::Relaxed);
        if i % 64 == 0 {
            thread_yield();
        }
    }
}

fn consumer(buffer: Buffer) {
    for _ in 0..ITEMS_PER_PRODUCER {
        let value = buffer.take();
        CONSUMED_SUM.fetch_add(value, Ordering::Relaxed);
    }
}

fn spinner() {
    let until = Instant::now() + SPIN_BUDGET;
    while Instant::now() < until {
        std::hint::spin_loop();
    }
}

fn main() -> Result<()> {
    let _logger = Logger::try_with_env_or_str("info")?
        .start()
        .context("failed to start the logger")?;

    thread_init().context("failed to initialize the runtime")?;
    let buffer = Buffer::new()?;

    thread_spawn("spinner", spinner, 0)?;
    for n in 0..WORKERS {
        thread_spawn(
            &format!("producer-{}", n),
            move || producer(buffer, n * ITEMS_PER_PRODUCER),
            0,
        )?;
        thread_spawn(&format!("consumer-{}", n), move || consumer(buffer), 0)?;
    }

    let summary = run_threads()?;

    println!("{}", StateTable(&thread_state()));
    println!("{:#?}", summary);
    log::info!("lifetime counters: {:?}", metrics());

    ensure!(!summary.is_deadlocked(), "fibers left blocked: {}", summary.blocked);
    let (produced, consumed) = (
        PRODUCED_SUM.load(Ordering::Relaxed),
        CONSUMED_SUM.load(Ordering::Relaxed),
    );
    ensure!(
        produced == consumed,
        "produced {} but consumed {}",
        produced,
        consumed
    );

    buffer.destroy()?;
    thread_shutdown()?;
    Ok(())
}
