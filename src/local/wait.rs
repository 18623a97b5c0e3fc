//! Waiting for tokens on local limiters.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::LocalLimiter;

/// Poll `limiter` until it hands out a token or `cancel` completes.
///
/// Returns `true` if a token was taken. The limiter's lock is only held
/// inside each poll, never across the sleep.
pub(crate) async fn wait_for_token<L, F>(limiter: &L, cancel: F) -> bool
where
    L: LocalLimiter + ?Sized,
    F: Future<Output = ()>,
{
    tokio::pin!(cancel);

    loop {
        let (taken, retry_in) = limiter.try_take_with_duration();
        if taken {
            return true;
        }

        trace!(retry_in = ?retry_in, "Waiting for next token");

        tokio::select! {
            biased;
            _ = &mut cancel => {
                debug!("Wait cancelled before a token was available");
                return false;
            }
            _ = tokio::time::sleep(retry_in) => {}
        }
    }
}

/// Run [`wait_for_token`] on a new task and call `callback` once a token
/// has been taken. The callback is dropped without being called if `cancel`
/// wins.
pub(crate) fn spawn_wait<L, F, C>(limiter: Arc<L>, cancel: F, callback: C) -> JoinHandle<()>
where
    L: LocalLimiter + ?Sized + 'static,
    F: Future<Output = ()> + Send + 'static,
    C: FnOnce() + Send + 'static,
{
    tokio::spawn(async move {
        if wait_for_token(limiter.as_ref(), cancel).await {
            callback();
        }
    })
}
