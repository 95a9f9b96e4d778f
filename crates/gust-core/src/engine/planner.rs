//! Byte-range partitioning for the concurrent engine.

use gust_types::{ChunkStatus, RuntimeConfig};

/// Partitions `[0, total - 1]` into contiguous inclusive ranges.
///
/// The chunk count is the connection cap or however many chunks of at
/// least `min_chunk` fit, whichever is smaller. Every chunk gets
/// `total / n` bytes except the last, which absorbs the remainder, so
/// all chunks but the last are at least `min_chunk` long.
pub fn plan_chunks(total: u64, runtime: &RuntimeConfig) -> Vec<ChunkStatus> {
    debug_assert!(total > 0, "cannot plan chunks for an empty resource");

    let by_size = (total / runtime.min_chunk()).max(1);
    let n = by_size.min(u64::from(runtime.connections())).max(1);
    let base = total / n;

    (0..n)
        .map(|i| {
            let start = i * base;
            let end = if i == n - 1 { total - 1 } else { (i + 1) * base - 1 };
            ChunkStatus::new(i as u32, start, end)
        })
        .collect()
}
