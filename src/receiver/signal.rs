//! Stop signalling and retry backoff for listener loops

use std::time::Duration;
use tokio::sync::watch;

/// Create a connected stop trigger / signal pair
pub fn stop_channel() -> (StopTrigger, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopTrigger { tx }, StopSignal { rx })
}

/// Sending half: asks every cloned [`StopSignal`] to stop
#[derive(Debug)]
pub struct StopTrigger {
    tx: watch::Sender<bool>,
}

impl StopTrigger {
    /// Raise the stop flag
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Lower the flag so a stopped receiver can be started again
    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    /// A fresh signal observing this trigger
    pub fn subscribe(&self) -> StopSignal {
        StopSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving half, raced against every blocking await in a listener loop
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once stop has been requested (or the trigger was dropped)
    pub async fn stopped(&mut self) {
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleep for `delay`. Returns `false` if stop was requested first.
    pub async fn sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.stopped() => false,
        }
    }
}

/// Bounded backoff between reconnect attempts.
///
/// The delay starts at `base`, is multiplied by `factor` after each failure
/// and never exceeds `max`. With `factor == 1` the delay is fixed.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    factor: u32,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, factor: u32) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            factor: factor.max(1),
            current: base,
            attempts: 0,
        }
    }

    /// Fixed delay between every attempt
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, 1)
    }

    /// Delay to wait before the next attempt, advancing the policy
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempts = self.attempts.saturating_add(1);
        self.current = self.current.saturating_mul(self.factor).min(self.max);
        delay
    }

    /// Back to the base delay after a successful connection
    pub fn reset(&mut self) {
        self.current = self.base;
        self.attempts = 0;
    }

    /// Consecutive failures since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Wait out the next delay. Returns `false` if stopped while waiting.
    pub async fn wait(&mut self, stop: &mut StopSignal) -> bool {
        let delay = self.next_delay();
        tracing::debug!("Retrying in {:?} (attempt {})", delay, self.attempts);
        stop.sleep(delay).await
    }
}
