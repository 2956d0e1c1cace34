//! Reverse tunnel lifecycle.
//!
//! [`TunnelController`] owns at most one tunnel session. State changes are
//! serialized through a short-lived mutex that is never held across the
//! transport's network I/O; the transitional `Opening` and `Closing`
//! states keep concurrent callers from stacking a second open or close.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dockhand_core::TunnelConfig;

use crate::error::TunnelError;

/// Lower bound between two watchdog checks.
const MIN_WATCHDOG_TICK: Duration = Duration::from_millis(50);

/// Records when traffic last crossed the tunnel.
#[derive(Debug, Clone)]
pub struct ActivityTimer {
    last: Arc<Mutex<Instant>>,
}

impl ActivityTimer {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Reset the idle clock to zero.
    pub fn touch(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Time since the last [`touch`](Self::touch).
    pub fn idle_for(&self) -> Duration {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

impl Default for ActivityTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Establishes tunnel sessions.
#[async_trait]
pub trait TunnelTransport: Send + Sync {
    /// Connect and register with the tunnel server. The session must
    /// [`touch`](ActivityTimer::touch) `activity` whenever traffic flows.
    async fn open(
        &self,
        config: &TunnelConfig,
        activity: ActivityTimer,
    ) -> Result<Box<dyn TunnelSession>, TunnelError>;
}

/// A live tunnel.
#[async_trait]
pub trait TunnelSession: Send {
    /// False once the session ended on its own, for instance because the
    /// server dropped it. An ended session still has to be closed.
    fn is_alive(&self) -> bool {
        true
    }

    async fn close(self: Box<Self>) -> Result<(), TunnelError>;
}

enum State {
    Closed,
    Opening { close_requested: bool },
    Open {
        session: Box<dyn TunnelSession>,
        config: TunnelConfig,
    },
    Closing,
}

/// Owns the single reverse tunnel of an edge agent.
pub struct TunnelController {
    transport: Arc<dyn TunnelTransport>,
    state: Mutex<State>,
    activity: ActivityTimer,
    sleep_interval: Duration,
}

impl TunnelController {
    /// `sleep_interval` is how long the tunnel may stay idle before the
    /// watchdog closes it.
    pub fn new(transport: Arc<dyn TunnelTransport>, sleep_interval: Duration) -> Self {
        Self {
            transport,
            state: Mutex::new(State::Closed),
            activity: ActivityTimer::new(),
            sleep_interval,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a session is open and still alive.
    pub fn is_open(&self) -> bool {
        matches!(&*self.state(), State::Open { session, .. } if session.is_alive())
    }

    /// Whether the open session ended without being closed.
    fn has_ended(&self) -> bool {
        matches!(&*self.state(), State::Open { session, .. } if !session.is_alive())
    }

    /// Configuration of the open tunnel, if any.
    pub fn current_config(&self) -> Option<TunnelConfig> {
        match &*self.state() {
            State::Open { config, .. } => Some(config.clone()),
            _ => None,
        }
    }

    pub fn activity(&self) -> &ActivityTimer {
        &self.activity
    }

    pub fn idle_for(&self) -> Duration {
        self.activity.idle_for()
    }

    /// Open a tunnel with `config`. Does nothing while a live tunnel is
    /// open or a transition is in progress; an ended session is replaced.
    ///
    /// On failure the tunnel stays closed.
    pub async fn create_tunnel(&self, config: TunnelConfig) -> Result<(), TunnelError> {
        let ended = {
            let mut state = self.state();
            let ended = match std::mem::replace(&mut *state, State::Closed) {
                State::Closed => None,
                State::Open { session, .. } if !session.is_alive() => Some(session),
                other => {
                    *state = other;
                    debug!("tunnel already open or in transition, ignoring open request");
                    return Ok(());
                }
            };
            *state = State::Opening {
                close_requested: false,
            };
            ended
        };

        if let Some(ended) = ended {
            info!("previous tunnel session ended, reopening");
            if let Err(e) = ended.close().await {
                debug!(error = %e, "teardown of ended session failed");
            }
        }

        let opened = self.transport.open(&config, self.activity.clone()).await;

        let session = {
            let mut state = self.state();
            match opened {
                Err(e) => {
                    *state = State::Closed;
                    return Err(e);
                }
                Ok(session) => {
                    if matches!(*state, State::Opening { close_requested: true }) {
                        *state = State::Closing;
                        session
                    } else {
                        self.activity.touch();
                        info!(
                            server = %config.server_address,
                            remote_port = config.remote_port,
                            "tunnel opened"
                        );
                        *state = State::Open { session, config };
                        return Ok(());
                    }
                }
            }
        };

        debug!("tunnel closed while opening, tearing it down");
        let result = session.close().await;
        *self.state() = State::Closed;
        result
    }

    /// Close the tunnel. Idempotent.
    ///
    /// The tunnel is closed afterwards even when teardown reports an error.
    pub async fn close_tunnel(&self) -> Result<(), TunnelError> {
        let session = {
            let mut state = self.state();
            match std::mem::replace(&mut *state, State::Closed) {
                State::Open { session, .. } => {
                    *state = State::Closing;
                    session
                }
                State::Opening { .. } => {
                    *state = State::Opening {
                        close_requested: true,
                    };
                    return Ok(());
                }
                State::Closing => {
                    *state = State::Closing;
                    return Ok(());
                }
                State::Closed => return Ok(()),
            }
        };

        let result = session.close().await;
        *self.state() = State::Closed;
        info!("tunnel closed");
        result
    }

    /// Close the tunnel once it has been idle for the sleep interval.
    pub fn spawn_watchdog(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller.watch_idle(shutdown).await;
        })
    }

    async fn watch_idle(&self, shutdown: CancellationToken) {
        loop {
            let wait = if self.is_open() {
                self.sleep_interval.saturating_sub(self.idle_for())
            } else {
                self.sleep_interval
            };

            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("tunnel watchdog shutting down");
                    break;
                }
                _ = tokio::time::sleep(wait.max(MIN_WATCHDOG_TICK)) => {}
            }

            if self.has_ended() {
                info!("tunnel session ended, releasing it");
                if let Err(e) = self.close_tunnel().await {
                    warn!(error = %e, "failed to release ended tunnel");
                }
                continue;
            }

            let idle = self.idle_for();
            if self.is_open() && idle >= self.sleep_interval {
                info!(idle = ?idle, "tunnel idle, closing");
                if let Err(e) = self.close_tunnel().await {
                    warn!(error = %e, "failed to close idle tunnel");
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// In-memory transport counting opens and closes.
    #[derive(Default)]
    pub struct FakeTransport {
        pub opens: AtomicUsize,
        pub closes: Arc<AtomicUsize>,
        pub fail: AtomicBool,
        pub open_delay: Mutex<Duration>,
        pub last_config: Mutex<Option<TunnelConfig>>,
        pub ended: Arc<AtomicBool>,
    }

    impl FakeTransport {
        pub fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        pub fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }

        pub fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        /// Make the current session end as if the server dropped it.
        pub fn end_session(&self) {
            self.ended.store(true, Ordering::SeqCst);
        }
    }

    struct FakeSession {
        closes: Arc<AtomicUsize>,
        ended: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TunnelSession for FakeSession {
        fn is_alive(&self) -> bool {
            !self.ended.load(Ordering::SeqCst)
        }

        async fn close(self: Box<Self>) -> Result<(), TunnelError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl TunnelTransport for FakeTransport {
        async fn open(
            &self,
            config: &TunnelConfig,
            _activity: ActivityTimer,
        ) -> Result<Box<dyn TunnelSession>, TunnelError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let delay = *self.open_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(TunnelError::Handshake {
                    server: config.server_address.clone(),
                    reason: "connection refused".to_string(),
                });
            }
            *self.last_config.lock().unwrap() = Some(config.clone());
            self.ended.store(false, Ordering::SeqCst);
            Ok(Box::new(FakeSession {
                closes: self.closes.clone(),
                ended: self.ended.clone(),
            }))
        }
    }
}
