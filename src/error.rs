//! Error kinds raised synchronously by the store's public API.
//!
//! Every fallible operation returns `Result<_, RetrodbError>`; nothing in
//! this crate panics on a caller-triggered condition. Internal invariant
//! violations (a checkpoint that vanishes from one map but not the other,
//! for example) still panic, matching how the corpus treats "this should be
//! structurally impossible" states.

use thiserror::Error;

/// The error type for every fallible operation in this crate.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RetrodbError {
    /// A schema could not be constructed, e.g. a duplicate field name.
    #[error("table init failed: {0}")]
    TableInit(String),

    /// A mutator received a field that is not part of the schema.
    #[error("field(s) not in schema: {0}")]
    InvalidField(String),

    /// A view was requested over a field whose column type does not satisfy
    /// the view's required capability (e.g. `SUM` over a non-numeric field).
    #[error("field `{field}` is not compatible with this view's requirements")]
    TypeIncompatible {
        /// The offending field name.
        field: String,
    },

    /// A view's upstream argument is not a `Subscribable`.
    #[error("view upstream is not a valid Subscribable: {0}")]
    ViewInit(String),

    /// A view's materialized value was read before its worker produced a
    /// result. Only reachable if a `View` subclass omits the initialization
    /// step the lifecycle (SPEC_FULL.md §4.E) requires before `start()`.
    #[error("view value read before initialization")]
    ValueUninitialized,

    /// `delete` was called on a record that cannot be deleted: an ERASE
    /// record (irreversible by construction) or a record that is itself
    /// already a DELETE.
    #[error("cannot delete a non-INSERT record")]
    ErasureUndeletable,
}
