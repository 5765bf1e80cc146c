use crate::error::{Error, Result};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use std::future::Future;
use std::time::{Duration, Instant};

/// Retry `action` until `predicate` accepts its result or `timeout` passes.
pub async fn wait_for_result<F, Fut, T, P>(mut action: F, predicate: P, timeout: Duration) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = T>,
    P: Fn(&T) -> bool,
{
    let start = Instant::now();
    let interval = Duration::from_millis(10);

    while start.elapsed() < timeout {
        let result = action().await;
        if predicate(&result) {
            return Some(result);
        }
        tokio::time::sleep(interval).await;
    }
    None
}

/// Drain `items`, failing if that takes longer than `timeout`.
pub async fn collect_within<T>(items: BoxStream<'static, Result<T>>, timeout: Duration) -> Result<Vec<T>> {
    match tokio::time::timeout(timeout, items.try_collect::<Vec<T>>()).await {
        Ok(collected) => collected,
        Err(_) => Err(Error::Timeout),
    }
}

/// Entries `(key, key)` for keys in `[0, count)`.
pub fn numbered_entries(count: u64) -> impl Iterator<Item = (u64, u64)> {
    (0..count).map(|key| (key, key))
}
