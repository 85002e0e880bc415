//! Small shared helpers that don't deserve their own module.

use rand::Rng;
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch, used for
/// XADD's `*` auto-generated ids.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the epoch")
        .as_millis() as i64
}

/// A fresh 40-character hex replication ID, in the shape real Redis uses
/// for `master_replid`.
pub fn generate_replid() -> String {
    let mut rng = rand::thread_rng();
    (0..40)
        .map(|_| {
            let n: u8 = rng.gen_range(0..16);
            std::char::from_digit(n as u32, 16).unwrap()
        })
        .collect()
}
