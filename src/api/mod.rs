//! Purpose: Define the stable public Rust API boundary for countmerge.
//! Exports: Core types and operations needed by the CLI and library callers.
//! Role: Public, additive-only surface; hides internal storage modules.
//! Invariants: This module is the only public path to storage primitives.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::format::{STORE_FORMAT_VERSION, SUPPORTED_STORE_FORMAT_VERSIONS};
pub use crate::core::merge::{
    Anomaly, AnomalyKind, DEFAULT_PROGRESS_EVERY, DEFAULT_TRANSCRIPT_PREFIX, MAX_MERGE_DEPTH,
    MergeObserver, MergeOptions, MergeReport, MergeScope, NullObserver, merge_nested,
    merge_stores, merge_transcript,
};
pub use crate::core::store::{CountStore, StoreMode};
pub use crate::core::value::{Value, ValueShape};
