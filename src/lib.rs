#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

//! A retroactively-updatable, in-memory relational store with
//! incrementally-maintained materialized views.
//!
//! Rows are mutated at an explicit logical time rather than "now": a
//! [`Table`] can have a record inserted, deleted, or erased as of any
//! timestamp the caller supplies, including one already in the past. Every
//! mutation is recorded on an append-only, checkpointed changelog
//! ([`Subscribable`]); [`SelectView`] and [`SumView`] subscribe to that log
//! and incrementally maintain their own materialized result, which is
//! itself a [`Subscribable`] that further views can stack on top of.
//!
//! ```no_run
//! use std::sync::Arc;
//! use retrodb::{FieldMap, IntColumn, Scalar, Schema, Table};
//!
//! let schema = Schema::new(vec![("amount".to_string(), Arc::new(IntColumn) as _)]).unwrap();
//! let table = Table::new(schema);
//!
//! let mut values = FieldMap::default();
//! values.insert("amount".to_string(), Scalar::Int(5));
//! table.insert(0, values).unwrap();
//!
//! let total = table.sum(10, "amount").unwrap();
//! ```

mod column;
mod error;
mod predicate;
mod record;
mod subscribable;
mod table;
mod view;

pub use column::{
    BoolColumn, ColumnType, FieldMap, FloatColumn, IntColumn, Scalar, Schema, StringColumn,
};
pub use error::RetrodbError;
pub use predicate::{Predicate, Where};
pub use record::{Record, RecordAction};
pub use subscribable::{Checkpoint, Subscribable};
pub use table::Table;
pub use view::select::SelectView;
pub use view::sum::SumView;
