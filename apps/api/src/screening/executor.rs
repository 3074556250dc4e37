//! Bounded task executor: runs homogeneous work items with at most `P`
//! in flight and reports every dispatched item exactly once.
//!
//! Cancellation stops dispatching further items. Items already admitted are
//! never interrupted; they finish and still reach the result callback.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Why an item did not produce a value.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemError<E> {
    /// The worker returned an error.
    Failed(E),
    /// The worker panicked; the payload is the panic message when available.
    Panicked(String),
}

impl<E: std::fmt::Display> std::fmt::Display for ItemError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ItemError::Failed(e) => write!(f, "{e}"),
            ItemError::Panicked(msg) => write!(f, "worker panicked: {msg}"),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// Items whose worker was started (each got exactly one callback).
    pub dispatched: usize,
    /// Items never started because cancellation was observed first.
    pub skipped: usize,
}

impl ExecutionSummary {
    pub fn was_cancelled(&self) -> bool {
        self.skipped > 0
    }
}

/// Runs `worker` over `items` with at most `max_parallel` concurrent
/// invocations, awaiting `on_result` once per dispatched item.
///
/// A slot is acquired before an item starts and released when its worker
/// returns, so a slow callback does not hold a slot. `cancel` is checked
/// right before each item would start. Returns only after every callback
/// has completed.
pub async fn run_bounded<T, R, E, W, Fut, C, CFut>(
    items: Vec<T>,
    max_parallel: usize,
    cancel: &CancellationToken,
    worker: W,
    on_result: C,
) -> ExecutionSummary
where
    T: Clone + Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
    W: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
    C: Fn(T, Result<R, ItemError<E>>) -> CFut + Send + Sync + 'static,
    CFut: Future<Output = ()> + Send + 'static,
{
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(max_parallel.max(1)));
    let worker = Arc::new(worker);
    let on_result = Arc::new(on_result);
    let mut in_flight = JoinSet::new();
    let mut dispatched = 0usize;

    for item in items {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => break,
            },
        };

        if cancel.is_cancelled() {
            drop(permit);
            break;
        }

        dispatched += 1;
        let worker = Arc::clone(&worker);
        let on_result = Arc::clone(&on_result);

        in_flight.spawn(async move {
            // Run the worker in its own task so a panic surfaces as a JoinError
            // and the item is still reported.
            let work = tokio::spawn((*worker)(item.clone()));
            let outcome = match work.await {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(ItemError::Failed(e)),
                Err(join_err) => Err(ItemError::Panicked(panic_message(join_err))),
            };
            drop(permit);
            (*on_result)(item, outcome).await;
        });
    }

    let skipped = total - dispatched;
    if skipped > 0 {
        debug!("Executor stopped dispatching: {dispatched} started, {skipped} skipped");
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            // Only the callback itself can get here.
            error!("Result callback task failed: {e}");
        }
    }

    ExecutionSummary {
        dispatched,
        skipped,
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "task was aborted".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => {
            if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic payload".to_string()
            }
        }
        Err(_) => "task failed".to_string(),
    }
}
