pub mod chp;
pub mod cft;
pub mod ltc;

use std::time::{SystemTime, UNIX_EPOCH};

/// A monotonically-unique-enough task id derived from wall-clock time with
/// sub-microsecond padding, matching `int(time.time() * 10000000)` in
/// `original_source/lib/long_term_cmd.py`.
pub fn new_task_id() -> i64 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
    (now.as_nanos() / 100) as i64
}
