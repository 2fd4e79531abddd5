use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;

static SEQ: AtomicU64 = AtomicU64::new(0);

/// Produce a fresh task id: `"<utc nanos>-<rand hex>-<seq>"`.
///
/// The sequence number is process-wide, so two ids from one process never
/// collide even when the clock stands still. When the OS random source is
/// unavailable the random segment is dropped: `"<utc nanos>-<seq>"`.
pub fn next_id() -> String {
    let mut r = [0u8; 2];
    let salt = OsRng.try_fill_bytes(&mut r).ok().map(|_| r);
    format_id(&timestamp(), salt, SEQ.fetch_add(1, Ordering::Relaxed) + 1)
}

fn timestamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%.9f").to_string()
}

fn format_id(now: &str, salt: Option<[u8; 2]>, n: u64) -> String {
    match salt {
        Some([a, b]) => format!("{now}-{a:02x}{b:02x}-{n}"),
        None => format!("{now}-{n}"),
    }
}
