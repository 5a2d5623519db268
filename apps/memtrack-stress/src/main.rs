//! Memtrack stress driver
//!
//! Hammers dirty range trackers and a virtual range cache from several
//! threads: writers record GPU writes and close batches, flushers wait for and
//! flush ranges (sometimes through trackers that were already replaced), a
//! retire thread signals completed batches, and buffers are periodically
//! replaced through range inheritance and self migration.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p memtrack-stress --release -- [OPTIONS]
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod config;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam::channel::{self, Sender};
use memtrack_core::{MultiRange, Range};
use memtrack_gpu::{
    CallbackBuffer, DirtyRangeTracker, SyncContext, SyncTimeline, TrackedBuffer, UnmapEvent,
    VirtualRangeCache,
};
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::StressConfig;

/// Base of the fake physical address space the cache resolves into.
const PHYSICAL_BASE: u64 = 0x1_0000_0000;

#[derive(Debug, Default)]
struct Counters {
    flushes: AtomicU64,
    flushed_bytes: AtomicU64,
    releases: AtomicU64,
    migrations: AtomicU64,
}

/// Summary sent by each worker when it finishes.
#[derive(Debug)]
struct WorkerReport {
    name: String,
    operations: usize,
    elapsed: Duration,
}

/// One buffer slot whose tracker gets replaced over time.
struct Slot {
    range: Range,
    tracker: RwLock<Arc<DirtyRangeTracker>>,
    /// Previous tracker, kept to exercise flush forwarding.
    retired: RwLock<Option<Arc<DirtyRangeTracker>>>,
}

struct Shared {
    config: StressConfig,
    timeline: Arc<SyncTimeline>,
    slots: Vec<Slot>,
    cache: VirtualRangeCache,
    counters: Arc<Counters>,
}

impl Shared {
    fn new(config: StressConfig) -> Self {
        let timeline = Arc::new(SyncTimeline::new());
        let counters = Arc::new(Counters::default());
        let slots = (0..config.buffers as u64)
            .map(|index| {
                let range = Range::new(index * config.buffer_size, config.buffer_size);
                let tracker = DirtyRangeTracker::new(
                    timeline.clone(),
                    make_buffer(range, &counters),
                );
                Slot {
                    range,
                    tracker: RwLock::new(tracker),
                    retired: RwLock::new(None),
                }
            })
            .collect();

        let cache = VirtualRangeCache::new(|address: u64, size: u64| {
            MultiRange::new(PHYSICAL_BASE + address, size)
        });

        Self {
            config,
            timeline,
            slots,
            cache,
            counters,
        }
    }

    fn context(&self) -> Arc<dyn SyncContext> {
        self.timeline.clone()
    }

    /// Replace the tracker in `slot`, handing its ranges to a new one.
    fn migrate(&self, slot: &Slot) {
        // Held across the takeover so two writers never replace the same tracker.
        let mut current = slot.tracker.write();
        let old = Arc::clone(&current);
        let new = DirtyRangeTracker::new(self.context(), make_buffer(slot.range, &self.counters));

        let mut reregistered = 0usize;
        new.inherit_ranges(&old, |_, _| reregistered += 1);
        *current = Arc::clone(&new);
        drop(current);
        *slot.retired.write() = Some(old);

        self.counters.migrations.fetch_add(1, Ordering::Relaxed);
        debug!(tracker = %new.id(), reregistered, "replaced buffer");
    }
}

fn make_buffer(range: Range, counters: &Arc<Counters>) -> Arc<dyn TrackedBuffer> {
    let flushed = Arc::clone(counters);
    let released = Arc::clone(counters);
    Arc::new(
        CallbackBuffer::new(range, move |_, size, _| {
            flushed.flushes.fetch_add(1, Ordering::Relaxed);
            flushed.flushed_bytes.fetch_add(size, Ordering::Relaxed);
        })
        .with_release(move || {
            released.releases.fetch_add(1, Ordering::Relaxed);
        }),
    )
}

/// Small deterministic generator for addresses and sizes.
struct Lcg(u64);

impl Lcg {
    fn next_u64(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound.max(1)
    }
}

fn writer(shared: &Shared, index: usize, reports: &Sender<WorkerReport>) {
    let config = &shared.config;
    let mut rng = Lcg(config.seed ^ (index as u64).wrapping_mul(0x9e37_79b9));
    let start = Instant::now();
    let mut batches = 0usize;

    for operation in 0..config.operations {
        let slot = &shared.slots[rng.below(config.buffers as u64) as usize];
        let offset = rng.below(config.buffer_size);
        let size = (rng.below(0x400) + 1).min(config.buffer_size - offset);

        let tracker = slot.tracker.read().clone();
        tracker.signal_modified(slot.range.address + offset, size);

        let lookup = shared
            .cache
            .try_get_or_add_range(slot.range.address + offset, size);
        debug_assert_eq!(lookup.range.total_size(), size);

        if operation % config.batch_length == config.batch_length - 1 {
            shared.timeline.create_sync();
            batches += 1;
            if batches % config.migrate_every == 0 {
                if rng.below(2) == 0 {
                    shared.migrate(slot);
                } else {
                    let snapshot = make_buffer(slot.range, &shared.counters);
                    tracker.self_migration(snapshot);
                }
            }
        }
    }

    let _ = reports.send(WorkerReport {
        name: format!("writer-{index}"),
        operations: config.operations,
        elapsed: start.elapsed(),
    });
}

fn flusher(shared: &Shared, index: usize, reports: &Sender<WorkerReport>) {
    let config = &shared.config;
    let mut rng = Lcg(config.seed.rotate_left(17) ^ index as u64);
    let start = Instant::now();

    for operation in 0..config.operations {
        let slot = &shared.slots[rng.below(config.buffers as u64) as usize];
        let offset = rng.below(config.buffer_size);
        let size = (rng.below(0x1000) + 1).min(config.buffer_size - offset);

        let retired = slot.retired.read().clone();
        let tracker = match retired {
            Some(old) if operation % 4 == 0 => old,
            _ => slot.tracker.read().clone(),
        };
        tracker.wait_for_and_flush_ranges(slot.range.address + offset, size);

        if operation % 256 == 0 {
            let mut event = UnmapEvent::new(slot.range.address + offset, size);
            shared.cache.memory_unmapped_handler(&mut event);
            event.run_remap_actions();
        }
    }

    let _ = reports.send(WorkerReport {
        name: format!("flusher-{index}"),
        operations: config.operations,
        elapsed: start.elapsed(),
    });
}

fn run(config: StressConfig) -> anyhow::Result<()> {
    info!(?config, "starting stress run");
    let shared = Arc::new(Shared::new(config));
    let stop = Arc::new(AtomicBool::new(false));
    let (report_tx, report_rx) = channel::unbounded::<WorkerReport>();

    let retirer = {
        let timeline = Arc::clone(&shared.timeline);
        let stop = Arc::clone(&stop);
        thread::Builder::new()
            .name("retire".into())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    timeline.signal_all();
                    thread::sleep(Duration::from_micros(100));
                }
                timeline.signal_all();
            })
            .context("failed to spawn retire thread")?
    };

    let mut workers = Vec::new();
    for index in 0..shared.config.writers {
        let shared = Arc::clone(&shared);
        let reports = report_tx.clone();
        workers.push(
            thread::Builder::new()
                .name(format!("writer-{index}"))
                .spawn(move || writer(&shared, index, &reports))
                .context("failed to spawn writer thread")?,
        );
    }
    for index in 0..shared.config.flushers {
        let shared = Arc::clone(&shared);
        let reports = report_tx.clone();
        workers.push(
            thread::Builder::new()
                .name(format!("flusher-{index}"))
                .spawn(move || flusher(&shared, index, &reports))
                .context("failed to spawn flusher thread")?,
        );
    }
    drop(report_tx);

    for report in &report_rx {
        let rate = report.operations as f64 / report.elapsed.as_secs_f64().max(f64::EPSILON);
        info!(
            worker = %report.name,
            operations = report.operations,
            elapsed_ms = report.elapsed.as_millis(),
            ops_per_sec = rate as u64,
            "worker finished"
        );
    }

    let mut panicked = 0;
    for worker in workers {
        if worker.join().is_err() {
            panicked += 1;
        }
    }
    stop.store(true, Ordering::Release);
    if retirer.join().is_err() {
        panicked += 1;
    }
    if panicked > 0 {
        anyhow::bail!("{panicked} stress threads panicked");
    }

    // Drain what is left so every closed batch ends up flushed.
    shared.timeline.create_sync();
    shared.timeline.signal_all();
    for slot in &shared.slots {
        let tracker = slot.tracker.read().clone();
        tracker.wait_for_and_flush_ranges(slot.range.address, slot.range.size);
        if tracker.has_ranges() {
            warn!(tracker = %tracker.id(), "ranges left dirty after final flush");
        }
    }

    let counters = &shared.counters;
    info!(
        flushes = counters.flushes.load(Ordering::Relaxed),
        flushed_bytes = counters.flushed_bytes.load(Ordering::Relaxed),
        migrations = counters.migrations.load(Ordering::Relaxed),
        releases = counters.releases.load(Ordering::Relaxed),
        pending_migrations = shared.timeline.pending_migrations(),
        cached_ranges = shared.cache.len(),
        "stress run complete"
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = StressConfig::from_args(std::env::args())?;
    run(config)
}

fn print_help() {
    eprintln!(
        "Memtrack stress driver

USAGE:
    cargo run -p memtrack-stress --release -- [OPTIONS]

OPTIONS:
    --buffers <N>        Number of tracked buffers (default: 8)
    --buffer-size <N>    Size of each buffer in bytes (default: 1048576)
    --writers <N>        Writer threads (default: 4)
    --flushers <N>       Flusher threads (default: 2)
    --operations <N>     Operations per thread (default: 20000)
    --batch-length <N>   Writes per closed batch (default: 64)
    --migrate-every <N>  Batches between buffer replacements (default: 16)
    --seed <N>           Address generator seed (default: 42)
    -h, --help           Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG             Set log level (e.g., info, debug, trace)"
    );
}
