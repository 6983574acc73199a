use std::task::{Context, Poll};

use futures::future::LocalBoxFuture;
use futures::task::{LocalSpawn, LocalSpawnExt, noop_waker_ref};

use crate::error::{Result, StackError};

/// Poll `future` once inline; hand it to `spawner` only if it suspends.
///
/// Returns `Ok(Some(_))` when it finished inline and `Ok(None)` once it was
/// spawned. Failures after spawning go to `on_late_error`.
pub(crate) fn drive<T: 'static>(
    spawner: &dyn LocalSpawn,
    mut future: LocalBoxFuture<'static, Result<T>>,
    on_late_error: impl FnOnce(StackError) + 'static,
) -> Result<Option<T>> {
    let mut cx = Context::from_waker(noop_waker_ref());
    match future.as_mut().poll(&mut cx) {
        Poll::Ready(result) => result.map(Some),
        Poll::Pending => {
            spawner.spawn_local(async move {
                if let Err(err) = future.await {
                    on_late_error(err);
                }
            })?;
            Ok(None)
        }
    }
}
