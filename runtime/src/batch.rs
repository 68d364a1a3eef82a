//! Ordered and unordered fan-out over a stream of items.
//!
//! [`run_batched`] drives each item through a per-item function and returns
//! the errors it collected. It never looks inside items and never aggregates
//! per-item results; callers keep their own totals.
//!
//! - **Ordered**: one item at a time, in stream order. A per-item `Err` is
//!   collected and ends the run; an [`ItemOutcome`] may also report an error
//!   without stopping, or stop without an error.
//! - **Unordered**: up to `batch_size` items are pulled, then run
//!   concurrently; the next batch starts once the whole batch settled. Every
//!   error is collected and the run continues.
//!
//! Cancellation is not an item error: [`HookError::Aborted`] (from the signal
//! or from a per-item function) ends the run immediately and is returned as
//! `Err`. Items of an unordered batch that were already started are allowed
//! to settle; no later batch starts.

use collection_hooks_core::{HookError, Result};
use futures::future::join_all;
use futures::{Stream, StreamExt};
use std::future::Future;

use crate::abort::AbortSignal;
use crate::metrics::{BATCH_ERRORS_TOTAL, BATCH_ITEMS_TOTAL};

/// Whether the run should go on after an item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemFlow {
    /// Pull the next item
    Continue,
    /// Stop pulling items
    Break,
}

/// What a per-item function reports.
#[derive(Debug)]
pub struct ItemOutcome {
    /// Continue or stop
    pub flow: ItemFlow,
    /// An error to collect
    pub error: Option<HookError>,
}

impl ItemOutcome {
    /// Item done, keep going.
    #[must_use]
    pub const fn proceed() -> Self {
        Self {
            flow: ItemFlow::Continue,
            error: None,
        }
    }

    /// Item done, stop the run.
    #[must_use]
    pub const fn stop() -> Self {
        Self {
            flow: ItemFlow::Break,
            error: None,
        }
    }

    /// Collect `error` and keep going.
    #[must_use]
    pub const fn failed(error: HookError) -> Self {
        Self {
            flow: ItemFlow::Continue,
            error: Some(error),
        }
    }
}

enum Settled {
    Next,
    Stop,
}

fn settle(result: Result<ItemOutcome>, ordered: bool, errors: &mut Vec<HookError>) -> Result<Settled> {
    match result {
        Ok(outcome) => {
            if let Some(error) = outcome.error {
                errors.push(error);
            }
            Ok(match outcome.flow {
                ItemFlow::Continue => Settled::Next,
                ItemFlow::Break => Settled::Stop,
            })
        },
        Err(error) if error.is_cancellation() => Err(error),
        Err(error) => {
            errors.push(error);
            Ok(if ordered { Settled::Stop } else { Settled::Next })
        },
    }
}

/// Run `per_item` over `first_item` (if any) followed by every item of `items`.
///
/// # Errors
///
/// [`HookError::Aborted`] on cancellation, or the error of the item stream
/// itself. Per-item errors are returned in the `Ok` list, in the order they
/// were observed.
///
/// # Example
///
/// ```
/// use collection_hooks_core::HookError;
/// use collection_hooks_runtime::abort::AbortSignal;
/// use collection_hooks_runtime::batch::{run_batched, ItemOutcome};
/// use futures::stream;
///
/// # tokio_test::block_on(async {
/// let items = stream::iter([1, 2, 3].map(Ok));
/// let errors = run_batched(
///     |n: i32| async move {
///         if n == 2 {
///             return Err(HookError::listener("before.insert", "two"));
///         }
///         Ok(ItemOutcome::proceed())
///     },
///     items,
///     true,
///     10,
///     &AbortSignal::new(),
///     None,
/// )
/// .await
/// .unwrap();
/// assert_eq!(errors.len(), 1);
/// # });
/// ```
pub async fn run_batched<T, S, F, Fut>(
    mut per_item: F,
    items: S,
    ordered: bool,
    batch_size: usize,
    signal: &AbortSignal,
    first_item: Option<T>,
) -> Result<Vec<HookError>>
where
    S: Stream<Item = Result<T>>,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<ItemOutcome>>,
{
    let mut items = std::pin::pin!(items);
    let mut errors = Vec::new();
    let mut pending_first = first_item;
    signal.check()?;

    if ordered {
        loop {
            signal.check()?;
            let item = match pending_first.take() {
                Some(item) => item,
                None => match items.next().await {
                    Some(item) => item?,
                    None => break,
                },
            };
            signal.check()?;
            metrics::counter!(BATCH_ITEMS_TOTAL).increment(1);
            let settled = settle(per_item(item).await, true, &mut errors)?;
            signal.check()?;
            if matches!(settled, Settled::Stop) {
                break;
            }
        }
    } else {
        let batch_size = batch_size.max(1);
        let mut batch: Vec<T> = Vec::with_capacity(batch_size.min(64));
        batch.extend(pending_first.take());
        let mut exhausted = false;
        while !exhausted {
            while batch.len() < batch_size {
                signal.check()?;
                match items.next().await {
                    Some(item) => batch.push(item?),
                    None => {
                        exhausted = true;
                        break;
                    },
                }
            }
            if batch.is_empty() {
                break;
            }
            signal.check()?;
            tracing::debug!(size = batch.len(), "dispatching batch");
            metrics::counter!(BATCH_ITEMS_TOTAL).increment(batch.len() as u64);
            let settled = join_all(batch.drain(..).map(&mut per_item)).await;
            signal.check()?;

            let mut stop = false;
            for result in settled {
                if matches!(settle(result, false, &mut errors)?, Settled::Stop) {
                    stop = true;
                }
            }
            if stop {
                break;
            }
        }
    }

    if !errors.is_empty() {
        metrics::counter!(BATCH_ERRORS_TOTAL).increment(errors.len() as u64);
    }
    Ok(errors)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn numbers(count: u32) -> impl Stream<Item = Result<u32>> {
        stream::iter((1..=count).map(Ok))
    }

    fn failing_on_two(seen: Arc<Mutex<Vec<u32>>>) -> impl FnMut(u32) -> futures::future::BoxFuture<'static, Result<ItemOutcome>> {
        move |n| {
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(u64::from(4 - n))).await;
                seen.lock().unwrap().push(n);
                if n == 2 {
                    return Err(HookError::listener("before.insert", "item two"));
                }
                Ok(ItemOutcome::proceed())
            })
        }
    }

    #[tokio::test]
    async fn test_ordered_stops_at_failing_item() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let errors = run_batched(failing_on_two(Arc::clone(&seen)), numbers(3), true, 10, &AbortSignal::new(), None)
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), [1, 2]);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("item two"));
    }

    #[tokio::test]
    async fn test_unordered_runs_every_item() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let errors = run_batched(failing_on_two(Arc::clone(&seen)), numbers(3), false, 3, &AbortSignal::new(), None)
            .await
            .unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, [1, 2, 3]);
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn test_reported_errors_do_not_stop_ordered_run() {
        let errors = run_batched(
            |n: u32| async move {
                Ok(if n % 2 == 0 {
                    ItemOutcome::failed(HookError::listener("before.delete", n))
                } else {
                    ItemOutcome::proceed()
                })
            },
            numbers(5),
            true,
            1,
            &AbortSignal::new(),
            None,
        )
        .await
        .unwrap();
        assert_eq!(errors.len(), 2);
    }

    #[tokio::test]
    async fn test_break_stops_run() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        run_batched(
            move |n: u32| {
                recorder.lock().unwrap().push(n);
                async move { Ok(if n == 3 { ItemOutcome::stop() } else { ItemOutcome::proceed() }) }
            },
            numbers(10),
            true,
            1,
            &AbortSignal::new(),
            Some(0),
        )
        .await
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), [0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_abort_mid_batch_lets_batch_settle_and_starts_no_more() {
        let signal = AbortSignal::new();
        let started = Arc::new(Mutex::new(Vec::new()));
        let finished = Arc::new(Mutex::new(Vec::new()));
        let per_item = {
            let signal = signal.clone();
            let started = Arc::clone(&started);
            let finished = Arc::clone(&finished);
            move |n: u32| {
                let signal = signal.clone();
                let finished = Arc::clone(&finished);
                started.lock().unwrap().push(n);
                async move {
                    if n == 2 {
                        signal.abort("caller gone");
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    finished.lock().unwrap().push(n);
                    Ok(ItemOutcome::proceed())
                }
            }
        };

        let err = run_batched(per_item, numbers(9), false, 3, &signal, None)
            .await
            .unwrap_err();

        assert!(err.is_cancellation());
        assert_eq!(started.lock().unwrap().len(), 3);
        assert_eq!(finished.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_cancellation_from_item_is_not_collected() {
        let err = run_batched(
            |n: u32| async move {
                if n == 1 {
                    return Err(HookError::aborted("inner"));
                }
                Ok(ItemOutcome::proceed())
            },
            numbers(3),
            false,
            3,
            &AbortSignal::new(),
            None,
        )
        .await
        .unwrap_err();
        assert!(err.is_cancellation());
    }

    #[tokio::test]
    async fn test_stream_errors_propagate() {
        let items = stream::iter([Ok(1), Err(HookError::Serialization("bad cursor".into()))]);
        let err = run_batched(|_: u32| async { Ok(ItemOutcome::proceed()) }, items, true, 1, &AbortSignal::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HookError::Serialization(_)));
    }
}
