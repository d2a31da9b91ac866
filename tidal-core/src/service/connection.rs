//! Single-attempt service connection state machine.
//!
//! All state lives in one [`Inner`] behind a mutex, so transitions are
//! linearizable. The start call runs on its own task; callers only hold a
//! shared future over its outcome, so dropping a caller never drops the
//! in-flight start. The task is aborted once the last waiter leaves or a
//! disconnect preempts the attempt, and its late result is discarded by
//! attempt number. A panicking start counts as a failed attempt.
//!
//! While connected, the starter's [`ServiceStarter::watch`] future runs on a
//! watcher task and turns a dead handle into `Disconnected`.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::AbortHandle;

use super::{
    ConnectionState, ConnectionStateKind, ServiceError, ServiceStarter, ServiceStatus,
    StateTransition,
};
use crate::panic_message;

const TRANSITION_CHANNEL_CAPACITY: usize = 64;

/// Final result of one attempt as seen by its waiters.
#[derive(Debug, Clone)]
enum AttemptOutcome<H> {
    Connected(H),
    Failed(ServiceError),
    Disconnected,
    Abandoned,
}

type SharedOutcome<H> = Shared<BoxFuture<'static, AttemptOutcome<H>>>;

struct PendingAttempt<H> {
    attempt: u64,
    outcome: SharedOutcome<H>,
    resolve: Option<oneshot::Sender<AttemptOutcome<H>>>,
    waiters: usize,
    task: AbortHandle,
}

impl<H> PendingAttempt<H> {
    fn finish(mut self, outcome: AttemptOutcome<H>) {
        self.task.abort();
        if let Some(resolve) = self.resolve.take() {
            let _ = resolve.send(outcome);
        }
    }
}

struct Inner<H> {
    state: ConnectionState<H>,
    attempt: u64,
    pending: Option<PendingAttempt<H>>,
    /// Liveness watcher of the current handle
    watcher: Option<AbortHandle>,
    consecutive_failures: u32,
    last_failure: Option<(String, DateTime<Utc>)>,
}

struct ConnectionCore<S: ServiceStarter> {
    label: String,
    starter: S,
    inner: Mutex<Inner<S::Handle>>,
    state_tx: watch::Sender<ConnectionState<S::Handle>>,
    transitions: broadcast::Sender<StateTransition>,
}

/// Manages acquisition of a handle to one background service.
///
/// Cloning yields another reference to the same state machine.
pub struct ServiceConnection<S: ServiceStarter> {
    core: Arc<ConnectionCore<S>>,
}

impl<S: ServiceStarter> Clone for ServiceConnection<S> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<S: ServiceStarter> ServiceConnection<S> {
    pub fn new(label: impl Into<String>, starter: S) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);

        Self {
            core: Arc::new(ConnectionCore {
                label: label.into(),
                starter,
                inner: Mutex::new(Inner {
                    state: ConnectionState::Idle,
                    attempt: 0,
                    pending: None,
                    watcher: None,
                    consecutive_failures: 0,
                    last_failure: None,
                }),
                state_tx,
                transitions,
            }),
        }
    }

    /// Returns the live handle, starting or joining a connection attempt.
    ///
    /// Dropping the returned future leaves the attempt running for other
    /// waiters; when the last waiter goes away the attempt is abandoned and
    /// the state reverts to `Idle`.
    ///
    /// # Errors
    ///
    /// - `ServiceError::StartFailed` / `ServiceError::NoHandle` - If this attempt failed
    /// - `ServiceError::Disconnected` - If a disconnect preempted this attempt
    pub async fn acquire(&self) -> Result<S::Handle, ServiceError> {
        let (attempt, outcome) = {
            let mut guard = self.core.inner.lock();
            let inner = &mut *guard;

            match (&inner.state, inner.pending.as_mut()) {
                (ConnectionState::Connected(handle), _) => return Ok(handle.clone()),
                (ConnectionState::Connecting, Some(pending)) => {
                    pending.waiters += 1;
                    tracing::debug!(
                        "{}: joining connection attempt #{} ({} waiters)",
                        self.core.label,
                        pending.attempt,
                        pending.waiters
                    );
                    (pending.attempt, pending.outcome.clone())
                }
                _ => ConnectionCore::begin_attempt(&self.core, inner),
            }
        };

        let mut waiter = WaiterGuard {
            core: &self.core,
            attempt,
            armed: true,
        };
        let outcome = outcome.await;
        waiter.armed = false;

        match outcome {
            AttemptOutcome::Connected(handle) => Ok(handle),
            AttemptOutcome::Failed(error) => Err(error),
            AttemptOutcome::Disconnected => Err(ServiceError::Disconnected),
            AttemptOutcome::Abandoned => Err(ServiceError::Abandoned),
        }
    }

    /// External signal that the service or its binding died.
    ///
    /// Forces `Disconnected` from `Connected` and preempts an in-flight
    /// attempt, failing every waiter of it. Ignored in other states.
    pub fn on_disconnected(&self) {
        let mut guard = self.core.inner.lock();
        let inner = &mut *guard;

        match inner.state.kind() {
            ConnectionStateKind::Connected | ConnectionStateKind::Connecting => {
                if let Some(pending) = inner.pending.take() {
                    pending.finish(AttemptOutcome::Disconnected);
                }
                if let Some(watcher) = inner.watcher.take() {
                    watcher.abort();
                }
                tracing::info!("{}: service disconnected", self.core.label);
                self.core.transition(inner, ConnectionState::Disconnected);
            }
            state => {
                tracing::debug!(
                    "{}: ignoring disconnect signal while {}",
                    self.core.label,
                    state
                );
            }
        }
    }

    /// Current handle without starting an attempt.
    pub fn current_handle(&self) -> Option<S::Handle> {
        self.core.inner.lock().state.handle().cloned()
    }

    pub fn state(&self) -> ConnectionState<S::Handle> {
        self.core.inner.lock().state.clone()
    }

    /// Read-only stream of states; only the latest value is retained.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState<S::Handle>> {
        self.core.state_tx.subscribe()
    }

    /// Every applied transition, in order.
    pub fn transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.core.transitions.subscribe()
    }

    pub fn status(&self) -> ServiceStatus {
        let inner = self.core.inner.lock();
        let (last_failure, last_failure_at) = match &inner.last_failure {
            Some((reason, at)) => (Some(reason.clone()), Some(*at)),
            None => (None, None),
        };

        ServiceStatus {
            state: inner.state.kind(),
            attempt: inner.attempt,
            consecutive_failures: inner.consecutive_failures,
            last_failure,
            last_failure_at,
        }
    }

    pub fn label(&self) -> &str {
        &self.core.label
    }
}

impl<S: ServiceStarter> ConnectionCore<S> {
    /// Moves to `Connecting` and spawns the start call. Caller holds the lock.
    fn begin_attempt(
        core: &Arc<Self>,
        inner: &mut Inner<S::Handle>,
    ) -> (u64, SharedOutcome<S::Handle>) {
        inner.attempt += 1;
        let attempt = inner.attempt;

        let (resolve, receiver) = oneshot::channel();
        let outcome: SharedOutcome<S::Handle> = receiver
            .map(|received| received.unwrap_or(AttemptOutcome::Abandoned))
            .boxed()
            .shared();

        let task_core = Arc::clone(core);
        let task = tokio::spawn(async move {
            let result = AssertUnwindSafe(task_core.starter.start())
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    let reason = panic_message(payload.as_ref());
                    Err(ServiceError::StartFailed {
                        reason: format!("starter panicked: {reason}"),
                    })
                });
            task_core.complete(attempt, result);
        });

        inner.pending = Some(PendingAttempt {
            attempt,
            outcome: outcome.clone(),
            resolve: Some(resolve),
            waiters: 1,
            task: task.abort_handle(),
        });
        tracing::info!("{}: starting connection attempt #{}", core.label, attempt);
        core.transition(inner, ConnectionState::Connecting);

        (attempt, outcome)
    }

    /// Applies the start call's result if its attempt is still current.
    fn complete(self: &Arc<Self>, attempt: u64, result: Result<S::Handle, ServiceError>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let is_current = inner
            .pending
            .as_ref()
            .is_some_and(|pending| pending.attempt == attempt);
        if !is_current {
            tracing::debug!(
                "{}: discarding result of stale attempt #{}",
                self.label,
                attempt
            );
            return;
        }
        let Some(pending) = inner.pending.take() else {
            return;
        };

        let outcome = match result {
            Ok(handle) => {
                inner.consecutive_failures = 0;
                tracing::info!("{}: connected on attempt #{}", self.label, attempt);
                self.transition(inner, ConnectionState::Connected(handle.clone()));
                self.watch_handle(inner, attempt, &handle);
                AttemptOutcome::Connected(handle)
            }
            Err(error) => {
                let reason = error.to_string();
                inner.consecutive_failures += 1;
                inner.last_failure = Some((reason.clone(), Utc::now()));
                tracing::warn!(
                    "{}: attempt #{} failed ({} consecutive): {}",
                    self.label,
                    attempt,
                    inner.consecutive_failures,
                    reason
                );
                self.transition(inner, ConnectionState::Failed(reason));
                AttemptOutcome::Failed(error)
            }
        };

        pending.finish(outcome);
    }

    /// Spawns the watcher that reports `handle` dying. Caller holds the lock.
    fn watch_handle(
        self: &Arc<Self>,
        inner: &mut Inner<S::Handle>,
        attempt: u64,
        handle: &S::Handle,
    ) {
        let liveness = self.starter.watch(handle);
        let core: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            liveness.await;
            if let Some(core) = core.upgrade() {
                core.handle_lost(attempt);
            }
        });

        if let Some(previous) = inner.watcher.replace(task.abort_handle()) {
            previous.abort();
        }
    }

    /// Moves to `Disconnected` if `attempt`'s handle is still the live one.
    fn handle_lost(&self, attempt: u64) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.attempt != attempt || inner.state.kind() != ConnectionStateKind::Connected {
            return;
        }

        inner.watcher = None;
        tracing::warn!(
            "{}: handle from attempt #{} is no longer usable",
            self.label,
            attempt
        );
        self.transition(inner, ConnectionState::Disconnected);
    }

    /// Drops one waiter; abandons the attempt when none remain.
    fn release_waiter(&self, attempt: u64) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let Some(pending) = inner.pending.as_mut() else {
            return;
        };
        if pending.attempt != attempt {
            return;
        }

        pending.waiters = pending.waiters.saturating_sub(1);
        if pending.waiters > 0 {
            return;
        }

        if let Some(pending) = inner.pending.take() {
            pending.finish(AttemptOutcome::Abandoned);
        }
        tracing::debug!(
            "{}: attempt #{} abandoned by all waiters",
            self.label,
            attempt
        );
        self.transition(inner, ConnectionState::Idle);
    }

    fn transition(&self, inner: &mut Inner<S::Handle>, next: ConnectionState<S::Handle>) {
        let from = inner.state.kind();
        let to = next.kind();
        debug_assert!(
            from.can_transition_to(to),
            "illegal transition {from} -> {to}"
        );

        inner.state = next.clone();
        self.state_tx.send_replace(next);

        let event = StateTransition {
            from,
            to,
            attempt: inner.attempt,
        };
        let _ = self.transitions.send(event);
        tracing::debug!("{}: {} -> {} (attempt #{})", self.label, from, to, inner.attempt);
    }
}

impl<S: ServiceStarter> Drop for ConnectionCore<S> {
    fn drop(&mut self) {
        if let Some(watcher) = self.inner.get_mut().watcher.take() {
            watcher.abort();
        }
    }
}

/// Counts a waiter out if its `acquire` future is dropped early.
struct WaiterGuard<'a, S: ServiceStarter> {
    core: &'a ConnectionCore<S>,
    attempt: u64,
    armed: bool,
}

impl<S: ServiceStarter> Drop for WaiterGuard<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.core.release_waiter(self.attempt);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::test_support::{ScriptedStarter, StartStep};

    fn drain(receiver: &mut broadcast::Receiver<StateTransition>) -> Vec<ConnectionStateKind> {
        let mut seen = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            seen.push(event.to);
        }
        seen
    }

    #[tokio::test]
    async fn test_failed_start_then_successful_retry() {
        let starter = ScriptedStarter::new(vec![
            StartStep::Fail("no binder".to_string()),
            StartStep::Succeed(7),
        ]);
        let connection = ServiceConnection::new("test", starter);
        let mut events = connection.transitions();

        let first = connection.acquire().await;
        assert!(matches!(first, Err(ServiceError::StartFailed { .. })));
        assert!(matches!(connection.state(), ConnectionState::Failed(_)));

        let status = connection.status();
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.last_failure.unwrap().contains("no binder"));

        assert_eq!(connection.acquire().await.unwrap(), 7);
        assert_eq!(connection.state(), ConnectionState::Connected(7));
        assert_eq!(connection.status().consecutive_failures, 0);

        use ConnectionStateKind::*;
        assert_eq!(
            drain(&mut events),
            vec![Connecting, Failed, Connecting, Connected]
        );
    }

    #[tokio::test]
    async fn test_panicking_start_fails_attempt() {
        let starter = ScriptedStarter::new(vec![StartStep::Panic, StartStep::Succeed(5)]);
        let connection = ServiceConnection::new("test", starter);

        let first = tokio::time::timeout(Duration::from_secs(1), connection.acquire())
            .await
            .unwrap();
        match first {
            Err(ServiceError::StartFailed { reason }) => {
                assert!(reason.contains("service binder crashed"), "{reason}");
            }
            other => panic!("expected start failure, got {other:?}"),
        }
        assert!(matches!(connection.state(), ConnectionState::Failed(_)));
        assert_eq!(connection.status().consecutive_failures, 1);

        assert_eq!(connection.acquire().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_lost_handle_moves_to_disconnected() {
        let starter = ScriptedStarter::new(vec![StartStep::Succeed(1), StartStep::Succeed(2)]);
        let lost = starter.lost_handle();
        let connection = ServiceConnection::new("test", starter);
        let mut events = connection.transitions();

        assert_eq!(connection.acquire().await.unwrap(), 1);
        lost.notify_one();

        let mut states = connection.subscribe();
        tokio::time::timeout(
            Duration::from_secs(1),
            states.wait_for(|state| *state == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(connection.current_handle(), None);

        assert_eq!(connection.acquire().await.unwrap(), 2);

        use ConnectionStateKind::*;
        assert_eq!(
            drain(&mut events),
            vec![Connecting, Connected, Disconnected, Connecting, Connected]
        );
    }

    #[tokio::test]
    async fn test_connected_acquire_reuses_handle() {
        let starter = ScriptedStarter::new(vec![StartStep::Succeed(1)]);
        let calls = starter.calls();
        let connection = ServiceConnection::new("test", starter);

        assert_eq!(connection.acquire().await.unwrap(), 1);
        assert_eq!(connection.acquire().await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_while_connected() {
        let starter = ScriptedStarter::new(vec![StartStep::Succeed(1), StartStep::Succeed(2)]);
        let connection = ServiceConnection::new("test", starter);

        assert_eq!(connection.acquire().await.unwrap(), 1);
        connection.on_disconnected();

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(connection.current_handle(), None);

        // Next acquisition starts over from Connecting
        assert_eq!(connection.acquire().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_fails_pending_waiter() {
        let starter = ScriptedStarter::new(vec![StartStep::Hang]);
        let connection = ServiceConnection::new("test", starter);

        let waiter = tokio::spawn({
            let connection = connection.clone();
            async move { connection.acquire().await }
        });
        let mut states = connection.subscribe();
        states
            .wait_for(|state| *state == ConnectionState::Connecting)
            .await
            .unwrap();

        connection.on_disconnected();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(ServiceError::Disconnected));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_joins_single_attempt() {
        let starter = ScriptedStarter::new(vec![StartStep::Delay(Duration::from_millis(50), 9)]);
        let calls = starter.calls();
        let connection = ServiceConnection::new("test", starter);

        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let connection = connection.clone();
                tokio::spawn(async move { connection.acquire().await })
            })
            .collect();

        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), 9);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_last_waiter_cancel_reverts_to_idle() {
        let starter = ScriptedStarter::new(vec![StartStep::Hang, StartStep::Succeed(3)]);
        let connection = ServiceConnection::new("test", starter);

        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), connection.acquire()).await;
        assert!(cancelled.is_err());
        assert_eq!(connection.state(), ConnectionState::Idle);

        assert_eq!(connection.acquire().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_cancelling_one_waiter_keeps_attempt_for_others() {
        let starter = ScriptedStarter::new(vec![StartStep::Delay(Duration::from_millis(80), 4)]);
        let connection = ServiceConnection::new("test", starter);

        let patient = tokio::spawn({
            let connection = connection.clone();
            async move { connection.acquire().await }
        });
        let mut states = connection.subscribe();
        states
            .wait_for(|state| *state == ConnectionState::Connecting)
            .await
            .unwrap();

        let impatient =
            tokio::time::timeout(Duration::from_millis(10), connection.acquire()).await;
        assert!(impatient.is_err());
        assert_eq!(connection.state(), ConnectionState::Connecting);

        assert_eq!(patient.await.unwrap().unwrap(), 4);
        assert_eq!(connection.state(), ConnectionState::Connected(4));
    }

    #[tokio::test]
    async fn test_status_reports_attempts() {
        let starter = ScriptedStarter::new(vec![
            StartStep::Fail("first".to_string()),
            StartStep::Fail("second".to_string()),
        ]);
        let connection = ServiceConnection::new("test", starter);

        let _ = connection.acquire().await;
        let _ = connection.acquire().await;

        let status = connection.status();
        assert_eq!(status.attempt, 2);
        assert_eq!(status.consecutive_failures, 2);
        assert_eq!(status.state, ConnectionStateKind::Failed);
        assert!(status.last_failure_at.is_some());
        assert!(status.describe().contains("second"));
    }
}
