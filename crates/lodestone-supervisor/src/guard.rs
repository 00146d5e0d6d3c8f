//! Guarded handler invocation.
//!
//! Every call into a backend runs on its own task under a timeout. A panic
//! or a timeout inside a handler surfaces as `HandlerFault`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use lodestone_core::{Error, Result};
use tokio::sync::futures::Notified;
use tracing::warn;

/// Result of a cancellable invocation.
#[derive(Debug)]
pub(crate) enum Outcome<T> {
    Done(Result<T>),
    /// A kill fired while the handler was running; the task was aborted.
    Cancelled,
}

pub(crate) async fn guarded<T, F>(label: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut task = tokio::spawn(fut);
    match tokio::time::timeout(timeout, &mut task).await {
        Ok(joined) => flatten(label, joined),
        Err(_) => {
            task.abort();
            warn!(%label, ?timeout, "handler call timed out");
            Err(Error::handler_fault(format!(
                "{label} timed out after {timeout:?}"
            )))
        }
    }
}

/// Like [`guarded`], but gives up as soon as `cancel` fires.
pub(crate) async fn cancellable<T, F>(
    label: &str,
    timeout: Duration,
    fut: F,
    cancel: Pin<&mut Notified<'_>>,
) -> Outcome<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let mut task = tokio::spawn(fut);
    tokio::select! {
        joined = tokio::time::timeout(timeout, &mut task) => match joined {
            Ok(joined) => Outcome::Done(flatten(label, joined)),
            Err(_) => {
                task.abort();
                warn!(%label, ?timeout, "handler call timed out");
                Outcome::Done(Err(Error::handler_fault(format!(
                    "{label} timed out after {timeout:?}"
                ))))
            }
        },
        _ = cancel => {
            task.abort();
            Outcome::Cancelled
        }
    }
}

fn flatten<T>(
    label: &str,
    joined: std::result::Result<Result<T>, tokio::task::JoinError>,
) -> Result<T> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            warn!(%label, "handler panicked");
            Err(Error::handler_fault(format!("{label} panicked")))
        }
        Err(e) => Err(Error::handler_fault(format!("{label} was aborted: {e}"))),
    }
}
