//! Cancellable repeating effects (typing indicators, progress animations).
//!
//! Every handle must be stopped on each exit path of the job that owns it.
//! Dropping a handle also stops the effect.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Handle to a running periodic effect.
#[derive(Debug)]
pub struct PeriodicHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl PeriodicHandle {
    /// Stop the effect. Idempotent; an in-progress tick finishes but no new
    /// tick starts.
    pub fn stop(&mut self) {
        if !self.token.is_cancelled() {
            trace!("Stopping periodic effect");
            self.token.cancel();
        }
        self.task.take();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for PeriodicHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Run `effect` every `interval`, first tick after one interval has elapsed.
///
/// Must be called from within a tokio runtime.
pub fn start_periodic<F, Fut>(interval: Duration, mut effect: F) -> PeriodicHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let token = CancellationToken::new();
    let child = token.clone();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = child.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if child.is_cancelled() {
                break;
            }
            effect().await;
        }
    });
    PeriodicHandle {
        token,
        task: Some(task),
    }
}

/// Cycling "base." / "base.." / "base..." frames.
#[derive(Debug, Clone)]
pub struct DotsAnimation {
    base: String,
    dots: usize,
}

impl DotsAnimation {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            dots: 1,
        }
    }

    /// Frame shown before the first tick.
    pub fn initial(&self) -> String {
        format!("{}.", self.base)
    }

    /// Advance one frame and return it.
    pub fn next_frame(&mut self) -> String {
        self.dots = (self.dots % 3) + 1;
        format!("{}{}", self.base, ".".repeat(self.dots))
    }
}
