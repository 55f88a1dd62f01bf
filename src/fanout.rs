use std::future::Future;

use futures_util::future::join_all;

use crate::error::IndexedFailure;
use crate::{CourierError, Result};

/// Runs every request concurrently and waits for all of them.
///
/// No request is cut short by another's failure. With no failures the
/// results come back in input order; a single failure is returned as-is;
/// several failures are folded into [`CourierError::Aggregate`].
pub async fn all<T, I, F>(requests: I) -> Result<Vec<T>>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = Result<T>>,
{
    let outcomes = join_all(requests).await;

    let mut data = Vec::with_capacity(outcomes.len());
    let mut failures = Vec::new();
    for (index, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(value) => data.push(value),
            Err(error) => failures.push(IndexedFailure { index, error }),
        }
    }

    match failures.len() {
        0 => Ok(data),
        1 => Err(failures.remove(0).error),
        _ => Err(CourierError::Aggregate { failures }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;

    use super::all;
    use crate::{CourierError, Result};

    fn succeed(value: u32, delay_ms: u64) -> BoxFuture<'static, Result<u32>> {
        async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Ok(value)
        }
        .boxed()
    }

    fn fail(message: &str) -> BoxFuture<'static, Result<u32>> {
        let message = message.to_owned();
        async move { Err(CourierError::Interceptor(message)) }.boxed()
    }

    #[tokio::test(start_paused = true)]
    async fn results_keep_input_order() {
        let data = all(vec![succeed(1, 30), succeed(2, 10), succeed(3, 20)])
            .await
            .expect("must succeed");
        assert_eq!(data, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn single_failure_is_surfaced_unwrapped() {
        let err = all(vec![succeed(1, 0), fail("f2 broke"), succeed(3, 0)])
            .await
            .expect_err("must fail");
        match err {
            CourierError::Interceptor(message) => assert_eq!(message, "f2 broke"),
            other => panic!("expected the member error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn multiple_failures_are_aggregated_with_indices() {
        let err = all(vec![fail("first"), succeed(2, 0), fail("third")])
            .await
            .expect_err("must fail");
        let message = err.to_string();
        match err {
            CourierError::Aggregate { failures } => {
                let indices: Vec<usize> = failures.iter().map(|f| f.index).collect();
                assert_eq!(indices, vec![0, 2]);
            }
            other => panic!("expected aggregate error, got {other:?}"),
        }
        assert!(message.contains("[0] interceptor error: first"));
        assert!(message.contains("[2] interceptor error: third"));
    }

    #[tokio::test(start_paused = true)]
    async fn every_member_runs_to_completion() {
        let finished = Arc::new(AtomicUsize::new(0));
        let requests = (0..3).map(|index| {
            let finished = finished.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10 * index)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                if index == 0 {
                    Err(CourierError::Interceptor("early".to_owned()))
                } else {
                    Ok(index)
                }
            }
        });

        assert!(all(requests).await.is_err());
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_input_is_ok() {
        let data: Vec<u32> = all(Vec::<BoxFuture<'static, Result<u32>>>::new())
            .await
            .expect("must succeed");
        assert!(data.is_empty());
    }
}
