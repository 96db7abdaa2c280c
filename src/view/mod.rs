//! The view engine: a background worker per view, pulling from an upstream
//! `Subscribable` and dispatching each change by `RecordAction`. Every view
//! is itself a `Subscribable`, so views stack into arbitrary DAGs.

pub mod select;
pub mod sum;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{trace, warn};
use parking_lot::Mutex;

use crate::record::{Record, RecordAction};
use crate::subscribable::Subscribable;

/// Initial backoff between polls when a view's worker sees no new upstream
/// changes. Doubles on every empty poll, resets on the first non-empty one.
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
/// Ceiling on the exponential backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// The per-action reaction a concrete view provides. Implemented by
/// `SelectView` and `SumView`; dispatched from the worker loop below.
pub(crate) trait ViewCallbacks: Send + Sync {
    fn on_insert(&self, record: &Record);
    fn on_delete(&self, record: &Record);
    fn on_erase(&self, time: i64, erased: &[Record]);
}

// RecordAction is a closed three-variant enum, so this match is already
// exhaustive at compile time — a future action variant would fail to build
// here rather than silently falling through a `_ => {}` arm.
fn apply_changes(callbacks: &dyn ViewCallbacks, changes: Vec<Record>) {
    for record in changes {
        match record.action() {
            RecordAction::Insert => callbacks.on_insert(&record),
            RecordAction::Delete => callbacks.on_delete(&record),
            RecordAction::Erase => callbacks.on_erase(record.time(), record.erased_records()),
        }
    }
}

/// Takes `callbacks` as a `Weak` reference, not an owning `Arc`: the view
/// that owns this worker is itself the callback target, so an owning
/// reference here would keep the view alive forever, and `free`/`Drop`
/// (which live on the view) would never run to ask the worker to stop. The
/// worker instead upgrades on every batch and quietly exits once the view
/// is gone.
fn worker_loop(
    upstream: Arc<dyn Subscribable>,
    callbacks: Weak<dyn ViewCallbacks>,
    exit_request: Arc<AtomicBool>,
) {
    let mut checkpoint = None;
    let mut timeout = INITIAL_BACKOFF;

    while !exit_request.load(Ordering::Acquire) {
        let (new_checkpoint, changes) = upstream.subscribe(checkpoint, Some(timeout));
        if Some(new_checkpoint) == checkpoint {
            let next = (timeout * 2).min(MAX_BACKOFF);
            if next != timeout {
                trace!("view worker backing off from {:?} to {:?}", timeout, next);
            }
            timeout = next;
        } else {
            timeout = INITIAL_BACKOFF;
            checkpoint = Some(new_checkpoint);
            let Some(cb) = callbacks.upgrade() else {
                break;
            };
            apply_changes(cb.as_ref(), changes);
        }
    }
    if let Some(cp) = checkpoint {
        upstream.unsubscribe(cp);
    }
}

/// Shared plumbing every view embeds: its own `Substrate` (so it is itself a
/// `Subscribable`) plus the worker thread pulling from its upstream.
pub(crate) struct ViewBase {
    exit_request: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ViewBase {
    pub fn new() -> Self {
        ViewBase {
            exit_request: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Spawns the worker thread. Called once, after the concrete view has
    /// finished initializing its own state — the worker may start invoking
    /// callbacks the instant it is spawned.
    pub fn start(&self, upstream: Arc<dyn Subscribable>, callbacks: Weak<dyn ViewCallbacks>) {
        let exit_request = self.exit_request.clone();
        let handle = std::thread::spawn(move || worker_loop(upstream, callbacks, exit_request));
        *self.handle.lock() = Some(handle);
    }

    /// Signals the worker to exit and joins it. Idempotent.
    pub fn stop_worker(&self) {
        self.exit_request.store(true, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("view worker thread panicked");
            }
        }
    }
}

impl Drop for ViewBase {
    fn drop(&mut self) {
        self.stop_worker();
    }
}
