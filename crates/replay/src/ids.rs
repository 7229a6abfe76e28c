//! Generated identifiers and timestamps

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;

/// Largest integer an IEEE-754 double represents exactly (2^53 - 1).
pub const MAX_SAFE_INTEGER: u64 = 9_007_199_254_740_991;

/// Time-ordered numeric ids: `unix_ms * 1000 + rand(0..1000)`.
///
/// Ids stay below [`MAX_SAFE_INTEGER`] so UIs that parse route params as
/// numbers keep every digit. Within one generator ids strictly increase, so
/// two ids drawn in the same millisecond never collide.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next_at(Utc::now().timestamp_millis().max(0) as u64)
    }

    pub fn next_at(&self, unix_ms: u64) -> u64 {
        let candidate = unix_ms * 1_000 + rand::thread_rng().gen_range(0..1_000);
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let next = candidate.max(last + 1);
            match self
                .last
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }
}

/// RFC 3339 UTC timestamp with `:` and `.` replaced by `-`, safe for file names.
pub fn fs_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-")
}
