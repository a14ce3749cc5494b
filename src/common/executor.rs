use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::common::{ExecutionContext, ExecutionError};
use crate::logging;

type LeafFn =
    Arc<dyn Fn(ExecutionContext) -> BoxFuture<'static, Result<(), ExecutionError>> + Send + Sync>;
type PredicateFn = Arc<dyn Fn(&ExecutionContext) -> bool + Send + Sync>;

/// A deferred unit of work over an [`ExecutionContext`].
///
/// Every stage of a job lifecycle (pull, create, start, exec, copy, remove,
/// close, each step) is an `Executor`; jobs are assembled purely by
/// combinator composition, which is what gives teardown its guarantee: a
/// `finally` stage runs on success, failure and cancellation alike.
pub struct Executor {
    inner: Inner,
}

enum Inner {
    Leaf(LeafFn),
    Sequence(Vec<Executor>),
    Guard {
        executor: Box<Executor>,
        predicate: PredicateFn,
    },
    Finally {
        executor: Box<Executor>,
        cleanup: Box<Executor>,
    },
}

impl Executor {
    /// Wrap an async closure as a leaf executor.
    pub fn from_fn<F, Fut>(f: F) -> Executor
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ExecutionError>> + Send + 'static,
    {
        Executor {
            inner: Inner::Leaf(Arc::new(
                move |ctx| -> BoxFuture<'static, Result<(), ExecutionError>> {
                    Box::pin(f(ctx))
                },
            )),
        }
    }

    /// An executor that does nothing and succeeds.
    pub fn ok() -> Executor {
        Executor::from_fn(|_| async { Ok(()) })
    }

    /// An executor that always fails with the given error message.
    pub fn fail(message: impl Into<String>) -> Executor {
        let message = message.into();
        Executor::from_fn(move |_| {
            let message = message.clone();
            async move { Err(ExecutionError::Step(message)) }
        })
    }

    /// Short-circuit sequential composition: the first failing stage stops
    /// the stages after it.
    pub fn pipeline(stages: Vec<Executor>) -> Executor {
        Executor {
            inner: Inner::Sequence(stages),
        }
    }

    /// Run `self`, and if it succeeded, run `next`.
    pub fn then(self, next: Executor) -> Executor {
        Executor {
            inner: Inner::Sequence(vec![self, next]),
        }
    }

    /// Run `cleanup` after `self` no matter how `self` ended. Cleanup runs
    /// under a detached context so outer cancellation cannot skip it; a
    /// cleanup failure is logged and never shadows the primary result.
    pub fn finally(self, cleanup: Executor) -> Executor {
        Executor {
            inner: Inner::Finally {
                executor: Box::new(self),
                cleanup: Box::new(cleanup),
            },
        }
    }

    /// Run `self` only when the predicate holds; otherwise succeed.
    pub fn if_cond(
        self,
        predicate: impl Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
    ) -> Executor {
        Executor {
            inner: Inner::Guard {
                executor: Box::new(self),
                predicate: Arc::new(predicate),
            },
        }
    }

    /// Run `self` only when the flag is true; otherwise succeed.
    pub fn if_bool(self, flag: bool) -> Executor {
        self.if_cond(move |_| flag)
    }

    /// Drive the executor tree to completion.
    pub fn run<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<(), ExecutionError>> {
        Box::pin(async move {
            match &self.inner {
                Inner::Leaf(f) => {
                    if ctx.is_cancelled() {
                        return Err(ExecutionError::Cancelled);
                    }
                    f(ctx.clone()).await
                }
                Inner::Sequence(stages) => {
                    for stage in stages {
                        if ctx.is_cancelled() {
                            return Err(ExecutionError::Cancelled);
                        }
                        stage.run(ctx).await?;
                    }
                    Ok(())
                }
                Inner::Guard {
                    executor,
                    predicate,
                } => {
                    if predicate(ctx) {
                        executor.run(ctx).await
                    } else {
                        Ok(())
                    }
                }
                Inner::Finally { executor, cleanup } => {
                    let result = executor.run(ctx).await;
                    let detached = ctx.detached();
                    if let Err(cleanup_err) = cleanup.run(&detached).await {
                        logging::warning(&format!("Cleanup failed: {}", cleanup_err));
                    }
                    result
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn counting(counter: Arc<AtomicUsize>) -> Executor {
        Executor::from_fn(move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_pipeline_runs_stages_in_order() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pipeline = Executor::pipeline(vec![
            counting(counter.clone()),
            counting(counter.clone()),
            counting(counter.clone()),
        ]);

        let ctx = ExecutionContext::new();
        pipeline.run(&ctx).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_pipeline_short_circuits_on_failure() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pipeline = Executor::pipeline(vec![
            counting(counter.clone()),
            Executor::fail("boom"),
            counting(counter.clone()),
        ]);

        let ctx = ExecutionContext::new();
        let err = pipeline.run(&ctx).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Step(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_finally_runs_after_failure_and_keeps_primary_error() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let executor = Executor::fail("primary").finally(counting(cleaned.clone()));

        let ctx = ExecutionContext::new();
        let err = executor.run(&ctx).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Step(msg) if msg == "primary"));
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_finally_failure_does_not_shadow_success() {
        let executor = Executor::ok().finally(Executor::fail("cleanup broke"));

        let ctx = ExecutionContext::new();
        assert!(executor.run(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_finally_runs_under_cancellation() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));
        let executor = Executor::pipeline(vec![counting(ran.clone())])
            .finally(counting(cleaned.clone()));

        let token = CancellationToken::new();
        token.cancel();
        let ctx = ExecutionContext::with_cancel(token);

        let err = executor.run(&ctx).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));
        assert_eq!(ran.load(Ordering::SeqCst), 0, "cancelled stage must not run");
        assert_eq!(cleaned.load(Ordering::SeqCst), 1, "cleanup must still run");
    }

    #[tokio::test]
    async fn test_if_bool_skips_executor() {
        let counter = Arc::new(AtomicUsize::new(0));
        let ctx = ExecutionContext::new();

        counting(counter.clone()).if_bool(false).run(&ctx).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        counting(counter.clone()).if_bool(true).run(&ctx).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_then_propagates_first_failure() {
        let counter = Arc::new(AtomicUsize::new(0));
        let executor = Executor::fail("first").then(counting(counter.clone()));

        let ctx = ExecutionContext::new();
        assert!(executor.run(&ctx).await.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
