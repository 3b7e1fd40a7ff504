//! Size/time bounded batching of a record stream

use futures_util::{Stream, StreamExt};
use std::time::Duration;
use tokio::time::Instant;

/// Maximum records per transaction
pub const MAX_BATCH_SIZE: usize = 100;

/// Maximum time spent filling one batch
pub const MAX_BATCH_WAIT: Duration = Duration::from_secs(1);

/// Collect up to `max` items from `stream`, waiting at most `window` after
/// the call started
///
/// Returns `None` once the stream has ended and nothing was collected. An
/// empty vector means the window elapsed without any item.
pub async fn collect_batch<S>(stream: &mut S, max: usize, window: Duration) -> Option<Vec<S::Item>>
where
    S: Stream + Unpin,
{
    let deadline = Instant::now() + window;
    let mut batch = Vec::new();

    while batch.len() < max {
        match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(Some(item)) => batch.push(item),
            Ok(None) if batch.is_empty() => return None,
            Ok(None) | Err(_) => break,
        }
    }

    Some(batch)
}
