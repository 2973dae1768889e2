//! Shared utility functions.

use std::time::{Duration, Instant};

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run synchronous store work off the async runtime.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

/// Call `attempt` every `interval` until it yields a value or `timeout`
/// elapses. `attempt` always runs at least once.
pub fn poll_until<T, F>(timeout: Duration, interval: Duration, mut attempt: F) -> Result<Option<T>>
where
    F: FnMut() -> Result<Option<T>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = attempt()? {
            return Ok(Some(value));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        std::thread::sleep(interval.min(deadline - now));
    }
}
