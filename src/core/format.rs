//! Purpose: Centralize store format versioning and migration guidance.
//! Exports: `STORE_FORMAT_VERSION`, `SUPPORTED_STORE_FORMAT_VERSIONS`, `store_version_error`.
//! Role: Shared policy for gating on-disk compatibility across open/validation paths.
//! Invariants: Version list is additive; bump only for incompatible on-disk changes.
//! Invariants: Migration guidance stays actionable and stable for users.

use crate::core::error::{Error, ErrorKind};

pub const STORE_FORMAT_VERSION: u32 = 1;
pub const SUPPORTED_STORE_FORMAT_VERSIONS: &[u32] = &[STORE_FORMAT_VERSION];

pub fn store_version_error(detected: u32) -> Error {
    let supported = SUPPORTED_STORE_FORMAT_VERSIONS
        .iter()
        .map(|version| version.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Error::new(ErrorKind::Usage)
        .with_message(format!(
            "unsupported store format version {detected} (supported: {supported})"
        ))
        .with_hint(
            "Upgrade countmerge or rebuild the store (dump/load). Run `countmerge info <store>` for details.",
        )
}
