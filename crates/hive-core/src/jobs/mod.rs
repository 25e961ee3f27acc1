//! Background jobs run under a taskvisor supervisor.
//!
//! A job is a single pass of some periodic work (a health sweep, a queue
//! cleanup, a heartbeat). The supervisor owns the schedule: it restarts the
//! job after each pass and backs off after a failure.

use std::{future::Future, sync::Arc, time::Duration};

use taskvisor::{
    BackoffPolicy, JitterPolicy, RestartPolicy, Supervisor, SupervisorConfig, TaskError,
    TaskFn, TaskRef, TaskSpec,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exponential backoff with equal jitter, from `first` up to `max`.
pub fn backoff(first: Duration, max: Duration) -> BackoffPolicy {
    BackoffPolicy {
        jitter: JitterPolicy::Equal,
        first,
        max: max.max(first),
        factor: 2.0,
    }
}

/// Runs `task` again `period` after each successful pass.
pub fn periodic(
    task: TaskRef,
    period: Duration,
    backoff: BackoffPolicy,
    timeout: Option<Duration>,
) -> TaskSpec {
    TaskSpec::new(
        task,
        RestartPolicy::Always {
            interval: Some(period),
        },
        backoff,
        timeout,
    )
}

/// Restarts `task` only after a failure.
pub fn until_success(task: TaskRef, backoff: BackoffPolicy, timeout: Option<Duration>) -> TaskSpec {
    TaskSpec::new(task, RestartPolicy::OnFailure, backoff, timeout)
}

/// Wraps `body` into a task.
///
/// An `Err` from the body becomes [`TaskError::Fail`] so the supervisor backs
/// off. Once `stop` is cancelled the task reports [`TaskError::Canceled`] and
/// is not run again.
pub fn job<F, Fut>(name: &'static str, stop: CancellationToken, body: F) -> TaskRef
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    let body = Arc::new(body);
    TaskFn::arc(name, move |ctx: CancellationToken| {
        let body = Arc::clone(&body);
        let stop = stop.clone();

        async move {
            if ctx.is_cancelled() || stop.is_cancelled() {
                return Err(TaskError::Canceled);
            }
            tokio::select! {
                _ = ctx.cancelled() => Err(TaskError::Canceled),
                _ = stop.cancelled() => Err(TaskError::Canceled),
                res = body() => res.map_err(|reason| {
                    warn!(job = name, %reason, "job failed");
                    TaskError::Fail { reason }
                }),
            }
        }
    })
}

/// Runs `specs` under a fresh supervisor until `stop` is cancelled or every
/// job has finished.
pub fn spawn(specs: Vec<TaskSpec>, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let sup = Supervisor::builder(SupervisorConfig::default()).build();
        tokio::select! {
            res = sup.run(specs) => match res {
                Ok(()) => debug!("jobs finished"),
                Err(e) => warn!(error = %e, "job supervisor exited"),
            },
            _ = stop.cancelled() => debug!("jobs stopped"),
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn periodic_job_repeats_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let stop = CancellationToken::new();

        let counter = Arc::clone(&runs);
        let task = job("count", stop.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        let handle = spawn(
            vec![periodic(
                task,
                Duration::from_secs(1),
                backoff(Duration::from_millis(100), Duration::from_secs(1)),
                None,
            )],
            stop.clone(),
        );

        tokio::time::sleep(Duration::from_millis(3500)).await;
        stop.cancel();
        handle.await.unwrap();

        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 3, "ran {seen} times");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_job_is_retried_until_success() {
        let runs = Arc::new(AtomicUsize::new(0));
        let stop = CancellationToken::new();

        let counter = Arc::clone(&runs);
        let task = job("flaky", stop.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err("not yet".to_string()),
                    _ => Ok(()),
                }
            }
        });
        let handle = spawn(
            vec![until_success(
                task,
                backoff(Duration::from_millis(100), Duration::from_millis(400)),
                None,
            )],
            stop.clone(),
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        stop.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn backoff_max_never_below_first() {
        let policy = backoff(Duration::from_secs(2), Duration::from_secs(1));
        assert_eq!(policy.first, Duration::from_secs(2));
        assert_eq!(policy.max, Duration::from_secs(2));
    }
}
