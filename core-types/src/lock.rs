// Copyright (c) James Kassemi, SC, US. All rights reserved.

//! Deterministic mapping from string keys to 32-bit advisory-lock tokens.
//!
//! Two distinct keys may hash to the same token; that only makes unrelated
//! writers serialize, it never weakens exclusion for writers that share a
//! key.

use chrono::NaiveDate;

/// Serializes every archival/purge pass.
pub const GLOBAL_CLEANUP_LOCK: &str = "global_cleanup_lock";
/// Serializes the Saturday archival window across instances.
pub const SATURDAY_ARCHIVAL_LOCK: &str = "saturday_archival_lock";

/// Derive the advisory-lock token for a key. Deterministic across process
/// restarts, no I/O, always non-negative.
pub fn derive_lock_id(key: &str) -> i32 {
    (crc32fast::hash(key.as_bytes()) & 0x7fff_ffff) as i32
}

/// Lock key for one (symbol, expiration) serialization domain.
pub fn group_lock_key(symbol: &str, expiration: NaiveDate) -> String {
    format!("{}_{}", symbol, expiration.format("%Y-%m-%d"))
}
