//! Engine counters.
//!
//! Sharded counters exposed through `metriken` for Prometheus exposition.
//! Each thread writes to its own shard so reactor threads never contend on
//! a cache line; reads aggregate across shards.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use metriken::{metric, Metric, Value};

const SLOTS: usize = 16;
const NUM_SHARDS: usize = 32;

thread_local! {
    /// Shard for this thread; lazily derived from a TLS address when the
    /// embedder never assigned one.
    static SHARD_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Pin the calling thread to a metrics shard. Reactor threads should call
/// this once at startup for deterministic shard assignment.
pub fn set_thread_shard(id: usize) {
    SHARD_ID.set(Some(id % NUM_SHARDS));
}

#[inline]
fn shard_index() -> usize {
    SHARD_ID.get().unwrap_or_else(|| {
        thread_local! {
            static PROBE: u8 = const { 0 };
        }
        let id = PROBE.with(|p| p as *const u8 as usize) % NUM_SHARDS;
        SHARD_ID.set(Some(id));
        id
    })
}

#[repr(C, align(128))]
struct Shard {
    slots: [AtomicU64; SLOTS],
}

/// Sharded storage for up to [`SLOTS`] counters.
pub struct CounterGroup {
    shards: [Shard; NUM_SHARDS],
}

impl CounterGroup {
    #[allow(clippy::declare_interior_mutable_const)]
    const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        const SHARD: Shard = Shard {
            slots: [ZERO; SLOTS],
        };
        CounterGroup {
            shards: [SHARD; NUM_SHARDS],
        }
    }

    #[inline]
    fn add(&self, slot: usize, value: u64) {
        debug_assert!(slot < SLOTS);
        self.shards[shard_index()].slots[slot].fetch_add(value, Ordering::Relaxed);
    }

    fn value(&self, slot: usize) -> u64 {
        self.shards
            .iter()
            .map(|s| s.slots[slot].load(Ordering::Relaxed))
            .sum()
    }
}

/// A counter occupying one slot of a [`CounterGroup`]; registered with
/// `metriken` via the `#[metric]` statics below.
pub struct Counter {
    group: &'static CounterGroup,
    slot: usize,
}

impl Counter {
    const fn new(group: &'static CounterGroup, slot: usize) -> Self {
        Counter { group, slot }
    }

    /// Increment by 1.
    #[inline]
    pub fn increment(&self) {
        self.group.add(self.slot, 1);
    }

    /// Add a value.
    #[inline]
    pub fn add(&self, value: u64) {
        self.group.add(self.slot, value);
    }

    /// Aggregate value across all shards.
    pub fn value(&self) -> u64 {
        self.group.value(self.slot)
    }
}

impl Metric for Counter {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn value(&self) -> Option<Value<'_>> {
        Some(Value::Counter(Counter::value(self)))
    }
}

// One group per subsystem, 16 slots each.
static CONN: CounterGroup = CounterGroup::new();
static IO: CounterGroup = CounterGroup::new();
static TLS: CounterGroup = CounterGroup::new();

/// Counter slot indices for connection lifecycle metrics.
mod conn {
    pub const ATTEMPTED: usize = 0;
    pub const FAILED: usize = 1;
    pub const CONNECT_TIMEOUTS: usize = 2;
    pub const WRITE_TIMEOUTS: usize = 3;
}

/// Counter slot indices for data-path metrics.
mod io {
    pub const APP_BYTES_SENT: usize = 0;
    pub const APP_BYTES_RECEIVED: usize = 1;
    pub const WRITES_QUEUED: usize = 2;
    pub const WRITES_COMPLETED: usize = 3;
    pub const WRITES_FAILED: usize = 4;
}

/// Counter slot indices for TLS metrics.
mod tls {
    pub const HANDSHAKES_STARTED: usize = 0;
    pub const HANDSHAKES_COMPLETED: usize = 1;
    pub const HANDSHAKES_FAILED: usize = 2;
    pub const RENEGOTIATIONS_REJECTED: usize = 3;
    pub const CLIENT_HELLOS_PARSED: usize = 4;
}

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "wireline/connects/attempted",
    description = "Total connect() attempts"
)]
pub static CONNECTS_ATTEMPTED: Counter = Counter::new(&CONN, conn::ATTEMPTED);

#[metric(
    name = "wireline/connects/failed",
    description = "Connects that ended in the error state"
)]
pub static CONNECTS_FAILED: Counter = Counter::new(&CONN, conn::FAILED);

#[metric(
    name = "wireline/timeouts/connect",
    description = "Connect attempts that timed out"
)]
pub static CONNECT_TIMEOUTS: Counter = Counter::new(&CONN, conn::CONNECT_TIMEOUTS);

#[metric(
    name = "wireline/timeouts/write",
    description = "Pending writes that timed out"
)]
pub static WRITE_TIMEOUTS: Counter = Counter::new(&CONN, conn::WRITE_TIMEOUTS);

// ── Data path ────────────────────────────────────────────────────

#[metric(
    name = "wireline/bytes/app_sent",
    description = "Application bytes handed to the kernel"
)]
pub static APP_BYTES_SENT: Counter = Counter::new(&IO, io::APP_BYTES_SENT);

#[metric(
    name = "wireline/bytes/app_received",
    description = "Application bytes delivered to read callbacks"
)]
pub static APP_BYTES_RECEIVED: Counter = Counter::new(&IO, io::APP_BYTES_RECEIVED);

#[metric(
    name = "wireline/writes/queued",
    description = "Write submissions that could not complete inline"
)]
pub static WRITES_QUEUED: Counter = Counter::new(&IO, io::WRITES_QUEUED);

#[metric(
    name = "wireline/writes/completed",
    description = "Queued writes that completed"
)]
pub static WRITES_COMPLETED: Counter = Counter::new(&IO, io::WRITES_COMPLETED);

#[metric(name = "wireline/writes/failed", description = "Writes that failed")]
pub static WRITES_FAILED: Counter = Counter::new(&IO, io::WRITES_FAILED);

// ── TLS ──────────────────────────────────────────────────────────

#[metric(
    name = "wireline/handshakes/started",
    description = "TLS handshakes started"
)]
pub static HANDSHAKES_STARTED: Counter = Counter::new(&TLS, tls::HANDSHAKES_STARTED);

#[metric(
    name = "wireline/handshakes/completed",
    description = "TLS handshakes completed"
)]
pub static HANDSHAKES_COMPLETED: Counter = Counter::new(&TLS, tls::HANDSHAKES_COMPLETED);

#[metric(
    name = "wireline/handshakes/failed",
    description = "TLS handshakes that failed"
)]
pub static HANDSHAKES_FAILED: Counter = Counter::new(&TLS, tls::HANDSHAKES_FAILED);

#[metric(
    name = "wireline/renegotiations/rejected",
    description = "Peer renegotiation attempts rejected"
)]
pub static RENEGOTIATIONS_REJECTED: Counter = Counter::new(&TLS, tls::RENEGOTIATIONS_REJECTED);

#[metric(
    name = "wireline/client_hello/parsed",
    description = "Inbound ClientHellos parsed"
)]
pub static CLIENT_HELLOS_PARSED: Counter = Counter::new(&TLS, tls::CLIENT_HELLOS_PARSED);
