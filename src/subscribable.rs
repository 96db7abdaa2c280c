//! The subscribable change-log substrate: an append-only history with
//! opaque checkpoint tokens, reference-counted so history can be truncated,
//! and a condition-variable-driven pull API with timeout.
//!
//! This is the component that carries the concurrency, ordering and
//! composition invariants for the rest of the crate (SPEC_FULL.md §4.C).
//! Both `Table` and every `View` embed one of these and implement the
//! public `Subscribable` trait by delegating to it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};
use rand::Rng;
use rustc_hash::FxHashMap;

use crate::column::Schema;
use crate::record::Record;

/// Identifies a Subscribable for record-ownership and equality purposes.
/// Purely informational — not a live reference to the owning value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscribableId(u64);

static NEXT_SUBSCRIBABLE_ID: AtomicU64 = AtomicU64::new(1);

impl SubscribableId {
    fn fresh() -> Self {
        SubscribableId(NEXT_SUBSCRIBABLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn fresh_for_test() -> Self {
        Self::fresh()
    }
}

/// An opaque 64-bit checkpoint token identifying a position in a
/// Subscribable's history.
pub type Checkpoint = u64;

type Stamp = u64;

/// Public contract shared by `Table` and every `View`: pull changes since a
/// checkpoint, release a checkpoint, and drain all subscribers before
/// deallocating.
pub trait Subscribable: Send + Sync {
    /// Returns the changes since `checkpoint` along with a fresh checkpoint
    /// anchored at the newly-observed tail.
    ///
    /// If `checkpoint` is `None` or unknown, returns the entire changelog
    /// recorded so far (every INSERT/DELETE/ERASE, in emission order) with
    /// no waiting — a fresh subscriber always gets a full replay, not just
    /// the currently-live rows, and is expected to fold it the same way a
    /// windowed delta would be folded. Otherwise blocks on the internal
    /// condition variable until either new history exists or `timeout`
    /// elapses; on timeout, returns `(checkpoint, [])` without consuming a
    /// reference.
    fn subscribe(&self, checkpoint: Option<Checkpoint>, timeout: Option<Duration>)
        -> (Checkpoint, Vec<Record>);

    /// Releases a reference to `checkpoint`. Once the last subscriber on the
    /// oldest checkpoint unsubscribes, the prefix of history before it is
    /// truncated.
    fn unsubscribe(&self, checkpoint: Checkpoint);

    /// Wakes all waiters and blocks until no checkpoint remains referenced.
    fn free(&self);

    /// This Subscribable's schema.
    fn schema(&self) -> &Schema;
}

struct SubstrateState {
    history: Vec<Option<Record>>,
    /// The stamp of `history[0]`. Advances when a prefix is truncated.
    epoch: Stamp,
    checkpoint_map: FxHashMap<Checkpoint, (Stamp, u64)>,
    stamp_map: FxHashMap<Stamp, Checkpoint>,
}

impl SubstrateState {
    fn tail_stamp(&self) -> Stamp {
        self.epoch + self.history.len() as u64
    }
}

/// The concrete pull/subscribe/unsubscribe/truncation engine. Not itself a
/// `Subscribable` impl (it has no schema) — owning types embed one and
/// forward to it.
pub(crate) struct Substrate {
    id: SubscribableId,
    state: Mutex<SubstrateState>,
    cond: Condvar,
}

impl Substrate {
    pub fn new() -> Self {
        Substrate {
            id: SubscribableId::fresh(),
            state: Mutex::new(SubstrateState {
                history: Vec::new(),
                epoch: 0,
                checkpoint_map: FxHashMap::default(),
                stamp_map: FxHashMap::default(),
            }),
            cond: Condvar::new(),
        }
    }

    pub fn id(&self) -> SubscribableId {
        self.id
    }

    /// Atomically appends `records` to history and wakes all waiters.
    pub fn add_to_history(&self, records: impl IntoIterator<Item = Record>) {
        let mut state = self.state.lock();
        let before = state.history.len();
        state.history.extend(records.into_iter().map(Some));
        if state.history.len() != before {
            self.cond.notify_all();
        }
    }

    /// Replaces the history slots matching `removed` with `None` and
    /// appends `erasure` as a fresh slot, then wakes all waiters. This dual
    /// encoding lets downstream views both skip the now-absent slots and
    /// react to the erasure event (SPEC_FULL.md §4.C).
    pub fn remove_from_history(&self, removed: &[Record], erasure: Record) {
        let mut state = self.state.lock();
        for slot in state.history.iter_mut() {
            if let Some(r) = slot {
                if removed.contains(r) {
                    *slot = None;
                }
            }
        }
        if !removed.is_empty() {
            state.history.push(Some(erasure));
            debug!(
                "substrate {:?}: erased {} record(s) at history tail {}",
                self.id,
                removed.len(),
                state.tail_stamp()
            );
        }
        self.cond.notify_all();
    }

    fn generate_checkpoint(state: &SubstrateState, preferred: Option<Checkpoint>) -> Checkpoint {
        let mut candidate = preferred;
        loop {
            match candidate {
                Some(c) if !state.checkpoint_map.contains_key(&c) => return c,
                _ => candidate = Some(rand::thread_rng().gen::<u64>()),
            }
        }
    }

    /// Mints (or reuses) the checkpoint for the current history tail,
    /// incrementing its refcount.
    fn checkpoint_now(state: &mut SubstrateState, preferred: Option<Checkpoint>) -> Checkpoint {
        let stamp = state.tail_stamp();
        if let Some(&existing) = state.stamp_map.get(&stamp) {
            let entry = state
                .checkpoint_map
                .get_mut(&existing)
                .expect("stamp_map and checkpoint_map out of sync");
            entry.1 += 1;
            existing
        } else {
            let cp = Self::generate_checkpoint(state, preferred);
            state.stamp_map.insert(stamp, cp);
            state.checkpoint_map.insert(cp, (stamp, 1));
            trace!("minted checkpoint {:x} at stamp {}", cp, stamp);
            cp
        }
    }

    fn unsubscribe_locked(&self, state: &mut SubstrateState, checkpoint: Checkpoint) {
        let Some(&(stamp, refcount)) = state.checkpoint_map.get(&checkpoint) else {
            return;
        };
        if refcount > 1 {
            state.checkpoint_map.insert(checkpoint, (stamp, refcount - 1));
            return;
        }

        state.checkpoint_map.remove(&checkpoint);
        state.stamp_map.remove(&stamp);
        trace!("retired checkpoint {:x} at stamp {}", checkpoint, stamp);

        // Truncation only ever advances `epoch` up to a stamp some live
        // subscriber still references. With no subscribers left, there is
        // no "oldest live stamp" to truncate up to, so history is left
        // exactly as-is — a later fresh `subscribe(None, _)` must still see
        // every non-erased record, not an empty log.
        if let Some(oldest) = state.checkpoint_map.values().map(|&(s, _)| s).min() {
            if oldest > state.epoch {
                let diff = (oldest - state.epoch) as usize;
                state.history.drain(0..diff.min(state.history.len()));
                debug!(
                    "substrate {:?}: truncated history prefix, epoch {} -> {}",
                    self.id, state.epoch, oldest
                );
                state.epoch = oldest;
            }
        }
    }

    /// Shared implementation of `Subscribable::subscribe`. A fresh
    /// subscriber (no checkpoint, or one this substrate no longer
    /// recognizes) is replayed the full changelog recorded in `history`,
    /// read under the same lock that mints its checkpoint — so the
    /// checkpoint and the records handed back are never inconsistent with
    /// each other, even under a racing writer.
    pub fn subscribe(
        &self,
        checkpoint: Option<Checkpoint>,
        timeout: Option<Duration>,
    ) -> (Checkpoint, Vec<Record>) {
        let mut state = self.state.lock();

        let checkpoint = checkpoint.filter(|c| state.checkpoint_map.contains_key(c));

        if let Some(cp) = checkpoint {
            let target_stamp = state.checkpoint_map[&cp].0;
            if state.tail_stamp() <= target_stamp {
                match timeout {
                    None => {
                        while state.tail_stamp() <= target_stamp {
                            self.cond.wait(&mut state);
                        }
                    }
                    Some(duration) => {
                        let deadline = Instant::now() + duration;
                        loop {
                            if state.tail_stamp() > target_stamp {
                                break;
                            }
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            if remaining.is_zero() {
                                return (cp, Vec::new());
                            }
                            let timed_out = self.cond.wait_for(&mut state, remaining).timed_out();
                            if timed_out && state.tail_stamp() <= target_stamp {
                                return (cp, Vec::new());
                            }
                        }
                    }
                }
            }
        }

        let new_checkpoint = Self::checkpoint_now(&mut state, None);

        let records = match checkpoint {
            Some(cp) => {
                let old_stamp = state.checkpoint_map[&cp].0;
                let new_stamp = state.checkpoint_map[&new_checkpoint].0;
                let old_idx = (old_stamp - state.epoch) as usize;
                let new_idx = (new_stamp - state.epoch) as usize;
                let window: Vec<Record> = state.history[old_idx..new_idx]
                    .iter()
                    .filter_map(Clone::clone)
                    .collect();
                self.unsubscribe_locked(&mut state, cp);
                window
            }
            None => state.history.iter().filter_map(Clone::clone).collect(),
        };

        (new_checkpoint, records)
    }

    pub fn unsubscribe(&self, checkpoint: Checkpoint) {
        let mut state = self.state.lock();
        self.unsubscribe_locked(&mut state, checkpoint);
    }

    /// Wakes all waiters, then polls until every checkpoint has been
    /// released. Mirrors the original's `while checkpoints: cond.wait(0.1)`
    /// busy-poll (SPEC_FULL.md §5).
    pub fn free(&self) {
        {
            let _state = self.state.lock();
            self.cond.notify_all();
        }
        loop {
            let state = self.state.lock();
            if state.checkpoint_map.is_empty() {
                return;
            }
            drop(state);
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl Drop for Substrate {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column::FieldMap;

    fn insert_at(substrate: &Substrate, time: i64) -> Record {
        Record::new_insert(substrate.id(), time, FieldMap::default())
    }

    #[test]
    fn fresh_subscribe_returns_all_current_records_no_wait() {
        let sub = Substrate::new();
        sub.add_to_history([insert_at(&sub, 1), insert_at(&sub, 2)]);
        let (_, records) = sub.subscribe(None, None);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn concatenating_windows_reproduces_full_stream() {
        let sub = Substrate::new();
        sub.add_to_history([insert_at(&sub, 1)]);
        let (cp1, first) = sub.subscribe(None, None);
        assert_eq!(first.len(), 1);

        sub.add_to_history([insert_at(&sub, 2), insert_at(&sub, 3)]);
        let (_cp2, second) = sub.subscribe(Some(cp1), None);
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn timeout_with_no_new_history_does_not_shift_checkpoint() {
        let sub = Substrate::new();
        sub.add_to_history([insert_at(&sub, 1)]);
        let (cp, _) = sub.subscribe(None, None);

        let (cp2, records) = sub.subscribe(Some(cp), Some(Duration::from_millis(30)));
        assert_eq!(cp, cp2);
        assert!(records.is_empty());
    }

    #[test]
    fn truncation_advances_epoch_up_to_the_oldest_live_subscriber_only() {
        let sub = Substrate::new();
        sub.add_to_history([insert_at(&sub, 1)]);
        let (cp1, _) = sub.subscribe(None, None);
        sub.add_to_history([insert_at(&sub, 2)]);
        let (cp2, _) = sub.subscribe(Some(cp1), None);

        sub.unsubscribe(cp1);
        {
            // cp2 is still live and anchored at stamp 2; nothing before it
            // can be dropped yet.
            let state = sub.state.lock();
            assert_eq!(state.history.len(), 2);
            assert_eq!(state.epoch, 0);
        }
        sub.unsubscribe(cp2);
        {
            // No live subscriber references anything anymore, but that is
            // not license to drop history: a later fresh subscriber must
            // still see it all.
            let state = sub.state.lock();
            assert_eq!(state.history.len(), 2);
        }
    }

    #[test]
    fn fresh_subscribe_after_last_unsubscribe_still_sees_full_history() {
        let sub = Substrate::new();
        sub.add_to_history([insert_at(&sub, 1), insert_at(&sub, 2)]);
        let (cp, _) = sub.subscribe(None, None);
        sub.unsubscribe(cp);

        let (_, records) = sub.subscribe(None, None);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn erase_leaves_none_slot_and_appends_erasure_record() {
        let sub = Substrate::new();
        let r = insert_at(&sub, 1);
        sub.add_to_history([r.clone()]);
        let erasure = Record::new_erasure(sub.id(), 1, vec![r.clone()]);
        sub.remove_from_history(&[r], erasure);

        let (_, records) = sub.subscribe(None, None);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action(), crate::record::RecordAction::Erase);
    }
}
