use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{RecvTimeoutError, channel};
use std::thread;
use std::time::{Duration, Instant};

use crate::action::{Action, ActionContext, CancelToken};
use crate::error::TaskFailure;
use crate::utils::panic_message;

/// Runs `actions` in order on a dedicated thread and waits for them.
///
/// The calling worker wakes up every `poll` to check the deadline and the
/// run-wide `cancel` flag. When either fires, the action's own token is set
/// and the worker returns at once. The action thread is left to notice the
/// token on its own, its late result is discarded.
pub(crate) fn supervise(
    actions: Vec<Arc<dyn Action>>,
    ctx: ActionContext,
    timeout: Option<Duration>,
    poll: Duration,
    cancel: &CancelToken,
) -> Result<(), TaskFailure> {
    let token = ctx.token.clone();
    let span = tracing::Span::current();
    let (tx, rx) = channel();

    let name = format!("tsumiki-action-{}", ctx.task_id());
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || {
            let _enter = span.enter();
            let result = catch_unwind(AssertUnwindSafe(|| {
                actions.iter().try_for_each(|action| action.execute(&ctx))
            }));
            // the receiver is gone when the task was already given up on
            let _ = tx.send(result);
        })
        .map_err(TaskFailure::Spawn)?;

    let started = Instant::now();
    loop {
        let wait = match timeout {
            Some(limit) => {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    token.cancel();
                    return Err(TaskFailure::TimeoutExceeded(limit));
                }
                poll.min(limit - elapsed)
            }
            None => poll,
        };

        match rx.recv_timeout(wait) {
            Ok(result) => {
                let _ = handle.join();
                return match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(TaskFailure::Action(e)),
                    Err(panic) => Err(TaskFailure::Panicked(panic_message(panic.as_ref()))),
                };
            }
            Err(RecvTimeoutError::Timeout) => {
                if cancel.is_cancelled() {
                    token.cancel();
                    return Err(TaskFailure::Cancelled);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(TaskFailure::Panicked("action thread exited without a result".into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::core::ArcStr;
    use crate::fingerprint::Snapshot;

    const POLL: Duration = Duration::from_millis(5);

    fn context(token: CancelToken) -> ActionContext {
        ActionContext::new(ArcStr::from("t"), Arc::new(Snapshot::default()), Vec::new(), None, token)
    }

    fn action<F>(f: F) -> Arc<dyn Action>
    where
        F: Fn(&ActionContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    #[test]
    fn test_runs_actions_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (first, second) = (calls.clone(), calls.clone());
        let actions = vec![
            action(move |_| {
                assert_eq!(first.fetch_add(1, Ordering::SeqCst), 0);
                Ok(())
            }),
            action(move |_| {
                assert_eq!(second.fetch_add(1, Ordering::SeqCst), 1);
                Ok(())
            }),
        ];

        supervise(actions, context(CancelToken::new()), None, POLL, &CancelToken::new()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_first_failure_stops() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let actions = vec![
            action(|_| anyhow::bail!("broken")),
            action(move |_| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
        ];

        let result = supervise(actions, context(CancelToken::new()), None, POLL, &CancelToken::new());
        assert!(matches!(result, Err(TaskFailure::Action(_))));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panic() {
        let actions = vec![action(|_| panic!("boom"))];
        let result = supervise(actions, context(CancelToken::new()), None, POLL, &CancelToken::new());

        match result {
            Err(TaskFailure::Panicked(message)) => assert_eq!(message, "boom"),
            other => panic!("expected a panic, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_sets_token() {
        let token = CancelToken::new();
        let actions = vec![action(|ctx| {
            while !ctx.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        })];

        let started = Instant::now();
        let result = supervise(
            actions,
            context(token.clone()),
            Some(Duration::from_millis(30)),
            POLL,
            &CancelToken::new(),
        );

        assert!(matches!(result, Err(TaskFailure::TimeoutExceeded(_))));
        assert!(token.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_cancel() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let actions = vec![action(|_| {
            thread::sleep(Duration::from_millis(200));
            Ok(())
        })];

        let result = supervise(actions, context(CancelToken::new()), None, POLL, &cancel);
        assert!(matches!(result, Err(TaskFailure::Cancelled)));
    }
}
