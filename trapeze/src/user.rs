use crate::behavior::Behavior;
use crate::context::{InFlight, UserContext, UserEnv};
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, trace, Instrument};
use trapeze_core::SpawnError;

/// Lifecycle of a virtual user. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum UserState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl UserState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => UserState::Created,
            1 => UserState::Running,
            2 => UserState::Stopping,
            _ => UserState::Stopped,
        }
    }
}

#[derive(Debug)]
pub(crate) struct UserShared {
    state: AtomicU8,
    in_flight: Arc<ArcSwapOption<InFlight>>,
    spawn_error: ArcSwapOption<SpawnError>,
}

impl UserShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(UserState::Created as u8),
            in_flight: Arc::default(),
            spawn_error: ArcSwapOption::empty(),
        }
    }

    fn state(&self) -> UserState {
        UserState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move forward to `next`. Never moves backwards.
    fn advance(&self, next: UserState) {
        self.state.fetch_max(next as u8, Ordering::AcqRel);
    }
}

/// Handle to one virtual user task, owned by the scheduler.
pub(crate) struct VirtualUser {
    id: u64,
    shared: Arc<UserShared>,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl VirtualUser {
    pub fn spawn(id: u64, behavior: Arc<dyn Behavior>, env: &UserEnv) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let shared = Arc::new(UserShared::new());
        let ctx = env.context(id, shared.in_flight.clone());

        let handle = tokio::spawn(
            run(ctx, behavior, shared.clone(), stop_rx, env.think_time).in_current_span(),
        );

        Self {
            id,
            shared,
            stop_tx,
            handle,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> UserState {
        self.shared.state()
    }

    /// Ask the user to stop at its next iteration boundary.
    pub fn signal_stop(&self) {
        if self.state() < UserState::Stopping {
            trace!("Signalling user {} to stop", self.id);
        }
        self.stop_tx.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn spawn_error(&self) -> Option<SpawnError> {
        self.shared
            .spawn_error
            .load_full()
            .map(|err| err.as_ref().clone())
    }

    /// Claim the in-flight transaction, if any. Whoever claims it records it.
    pub fn take_in_flight(&self) -> Option<Arc<InFlight>> {
        self.shared.in_flight.swap(None)
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    pub async fn wait(&mut self) -> Result<(), JoinError> {
        (&mut self.handle).await
    }
}

fn stop_requested(stop_rx: &watch::Receiver<bool>) -> bool {
    // A dropped sender means the scheduler is gone.
    *stop_rx.borrow() || stop_rx.has_changed().is_err()
}

async fn run(
    mut ctx: UserContext,
    behavior: Arc<dyn Behavior>,
    shared: Arc<UserShared>,
    mut stop_rx: watch::Receiver<bool>,
    think_time: Option<Duration>,
) {
    if let Err(source) = behavior.on_start(&mut ctx).await {
        shared.spawn_error.store(Some(Arc::new(SpawnError {
            user: ctx.id(),
            source,
        })));
        shared.advance(UserState::Stopped);
        return;
    }

    shared.advance(UserState::Running);
    debug!("User {} running", ctx.id());

    while !stop_requested(&stop_rx) {
        behavior.run(&mut ctx).await;
        ctx.iterations += 1;

        match think_time {
            Some(pause) => {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = stop_rx.changed() => {}
                }
            }
            None => tokio::task::yield_now().await,
        }
    }

    shared.advance(UserState::Stopping);
    behavior.on_stop(&mut ctx).await;
    shared.advance(UserState::Stopped);
    debug!("User {} stopped after {} iterations", ctx.id(), ctx.iterations());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{harness, MockTransport};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use trapeze_core::HookError;

    #[derive(Default)]
    struct Counting {
        fail_start: bool,
        runs: AtomicUsize,
        stops: AtomicUsize,
        pause: Option<Duration>,
    }

    #[async_trait]
    impl Behavior for Counting {
        async fn on_start(&self, _ctx: &mut UserContext) -> Result<(), HookError> {
            if self.fail_start {
                Err(HookError::new("login refused"))
            } else {
                Ok(())
            }
        }

        async fn run(&self, _ctx: &mut UserContext) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if let Some(pause) = self.pause {
                tokio::time::sleep(pause).await;
            }
        }

        async fn on_stop(&self, _ctx: &mut UserContext) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle() {
        let (env, _aggregator, _) = harness(MockTransport::new());
        let behavior = Arc::new(Counting {
            pause: Some(Duration::from_millis(100)),
            ..Default::default()
        });

        let mut user = VirtualUser::spawn(1, behavior.clone(), &env);
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(user.state(), UserState::Running);

        user.signal_stop();
        user.wait().await.unwrap();

        assert_eq!(user.state(), UserState::Stopped);
        assert_eq!(behavior.runs.load(Ordering::SeqCst), 5);
        assert_eq!(behavior.stops.load(Ordering::SeqCst), 1);
        assert!(user.spawn_error().is_none());
    }

    #[tokio::test]
    async fn failed_start_reports_spawn_error() {
        let (env, _aggregator, _) = harness(MockTransport::new());
        let behavior = Arc::new(Counting {
            fail_start: true,
            ..Default::default()
        });

        let mut user = VirtualUser::spawn(4, behavior.clone(), &env);
        user.wait().await.unwrap();

        assert_eq!(user.state(), UserState::Stopped);
        let err = user.spawn_error().unwrap();
        assert_eq!(err.user, 4);
        assert_eq!(err.to_string(), "Virtual user 4 failed to start: login refused");
        assert_eq!(behavior.runs.load(Ordering::SeqCst), 0);
        assert_eq!(behavior.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cuts_think_time_short() {
        let (mut env, _aggregator, _) = harness(MockTransport::new());
        env.think_time = Some(Duration::from_secs(60));
        let behavior = Arc::new(Counting::default());

        let mut user = VirtualUser::spawn(0, behavior.clone(), &env);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let before = tokio::time::Instant::now();
        user.signal_stop();
        user.wait().await.unwrap();

        assert!(before.elapsed() < Duration::from_secs(1));
        assert_eq!(behavior.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_before_first_poll_runs_no_iteration() {
        let (env, _aggregator, _) = harness(MockTransport::new());
        let behavior = Arc::new(Counting::default());

        let mut user = VirtualUser::spawn(0, behavior.clone(), &env);
        user.signal_stop();
        user.wait().await.unwrap();

        assert_eq!(behavior.runs.load(Ordering::SeqCst), 0);
        assert_eq!(behavior.stops.load(Ordering::SeqCst), 1);
    }
}
