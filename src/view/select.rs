//! `SELECT`: projects a subset of fields from rows matching every supplied
//! predicate, as of a fixed logical time.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::column::{FieldMap, Schema};
use crate::error::RetrodbError;
use crate::predicate::Predicate;
use crate::record::Record;
use crate::subscribable::{Checkpoint, Subscribable, Substrate};
use crate::view::{ViewBase, ViewCallbacks};

struct SelectState {
    /// The upstream INSERT records currently matched, in the order they
    /// were matched. Index-aligned with `emitted`.
    matched: Vec<Record>,
    /// This view's own INSERT records, one per entry in `matched` — the
    /// records actually handed downstream.
    emitted: Vec<Record>,
}

/// A retroactively-updated projection: rows from `upstream` whose time is
/// no later than `time` and that satisfy every predicate, narrowed to
/// `fields`.
pub struct SelectView {
    schema: Schema,
    time: i64,
    fields: Vec<String>,
    predicates: Vec<Box<dyn Predicate>>,
    state: Mutex<SelectState>,
    substrate: Substrate,
    base: ViewBase,
}

impl SelectView {
    /// Builds a `SELECT` view over `fields` of `upstream`'s rows, as of
    /// `time`, keeping only rows that satisfy every predicate in
    /// `predicates`. Spawns the worker thread before returning.
    pub fn new(
        upstream: Arc<dyn Subscribable>,
        time: i64,
        fields: &[&str],
        predicates: Vec<Box<dyn Predicate>>,
    ) -> Result<Arc<Self>, RetrodbError> {
        upstream
            .schema()
            .validate_fields(fields.iter().copied())?;

        let schema_fields = fields
            .iter()
            .map(|f| (f.to_string(), upstream.schema().get(f).unwrap().clone()))
            .collect();
        let schema = Schema::new(schema_fields)?;

        for predicate in &predicates {
            predicate.before_query();
        }

        let view = Arc::new(SelectView {
            schema,
            time,
            fields: fields.iter().map(|f| f.to_string()).collect(),
            predicates,
            state: Mutex::new(SelectState {
                matched: Vec::new(),
                emitted: Vec::new(),
            }),
            substrate: Substrate::new(),
            base: ViewBase::new(),
        });

        let dyn_view: Arc<dyn ViewCallbacks> = view.clone();
        let callbacks: std::sync::Weak<dyn ViewCallbacks> = Arc::downgrade(&dyn_view);
        view.base.start(upstream, callbacks);
        Ok(view)
    }

    /// The logical time this view is computed as of.
    pub fn time(&self) -> i64 {
        self.time
    }

    /// The fields this view projects, in declaration order.
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// The currently-matched rows, each as a `(field, value)` map over just
    /// the projected fields.
    pub fn rows(&self) -> Vec<FieldMap> {
        self.state
            .lock()
            .emitted
            .iter()
            .map(|r| r.values().clone())
            .collect()
    }

    fn project(&self, record: &Record) -> FieldMap {
        self.fields
            .iter()
            .filter_map(|f| record.get(f).map(|v| (f.clone(), v.clone())))
            .collect()
    }
}

impl ViewCallbacks for SelectView {
    fn on_insert(&self, record: &Record) {
        if record.time() > self.time {
            return;
        }
        if self.predicates.iter().any(|p| !p.on_record(record)) {
            return;
        }

        let emit = Record::new_insert(self.substrate.id(), record.time(), self.project(record));
        let mut state = self.state.lock();
        state.matched.push(record.clone());
        state.emitted.push(emit.clone());
        drop(state);
        self.substrate.add_to_history([emit]);
    }

    fn on_delete(&self, record: &Record) {
        if record.time() > self.time {
            return;
        }
        let Some(partner) = record.inversion() else {
            return;
        };

        let mut state = self.state.lock();
        let Some(idx) = state.matched.iter().position(|r| *r == partner) else {
            return;
        };
        state.matched.remove(idx);
        let own = state.emitted.remove(idx);
        drop(state);

        match own.delete(self.time) {
            Ok(drecord) => self.substrate.add_to_history([drecord]),
            Err(_) => {
                // `own` was built by `on_insert` above and is always an
                // INSERT, so `delete` cannot fail here.
            }
        }
    }

    fn on_erase(&self, time: i64, erased: &[Record]) {
        if time > self.time {
            return;
        }

        // `erased` may contain records that are value-equal to each other
        // (same owner/action/time/values); consume one `pool` entry per
        // matched row so a duplicate in `matched` only gets erased once.
        let mut pool: Vec<Record> = erased.to_vec();
        let mut state = self.state.lock();
        let mut own_erased = Vec::new();
        let mut i = 0;
        while i < state.matched.len() {
            if let Some(pos) = pool.iter().position(|r| *r == state.matched[i]) {
                pool.remove(pos);
                state.matched.remove(i);
                own_erased.push(state.emitted.remove(i));
            } else {
                i += 1;
            }
        }
        drop(state);

        if !own_erased.is_empty() {
            let erasure = Record::new_erasure(self.substrate.id(), time, own_erased.clone());
            self.substrate.remove_from_history(&own_erased, erasure);
        }
    }
}

impl Subscribable for SelectView {
    fn subscribe(
        &self,
        checkpoint: Option<Checkpoint>,
        timeout: Option<Duration>,
    ) -> (Checkpoint, Vec<Record>) {
        self.substrate.subscribe(checkpoint, timeout)
    }

    fn unsubscribe(&self, checkpoint: Checkpoint) {
        self.substrate.unsubscribe(checkpoint)
    }

    fn free(&self) {
        self.base.stop_worker();
        self.substrate.free();
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }
}
