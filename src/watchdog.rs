//! Periodic reaper for instances nobody has pinged recently.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WatchdogTiming;
use crate::registry::EmulatorRegistry;

const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct IdleWatchdog {
    registry: EmulatorRegistry,
    interval: Duration,
    threshold: Duration,
}

impl IdleWatchdog {
    pub fn new(registry: EmulatorRegistry, interval: Duration, threshold: Duration) -> Self {
        Self {
            registry,
            interval,
            threshold,
        }
    }

    pub fn from_timing(registry: EmulatorRegistry, timing: &WatchdogTiming) -> Self {
        Self::new(
            registry,
            Duration::from_secs(timing.interval_secs),
            Duration::from_secs(timing.idle_threshold_secs),
        )
    }

    /// Run scans every `interval` until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // consume the immediate first tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("watchdog received cancel signal, stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.scan_once().await;
                    }
                }
            }
        })
    }

    /// Keep a watchdog running until `cancel` fires, restarting it if its
    /// task dies.
    pub fn supervise(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let result = self.clone().spawn(cancel.clone()).await;
                if cancel.is_cancelled() {
                    break;
                }
                match result {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::error!(
                            running = self.registry.len(),
                            error = %e,
                            "idle watchdog died, restarting"
                        );
                        tokio::time::sleep(RESTART_DELAY).await;
                    }
                }
            }
        })
    }

    /// Tear down every instance idle for longer than the threshold.
    /// Returns how many were removed.
    pub async fn scan_once(&self) -> usize {
        tracing::info!(running = self.registry.len(), "watchdog scan");
        let mut removed = 0;
        for id in self.registry.idle_ids(self.threshold) {
            tracing::info!(emulator = %id, "killing idle emulator");
            match self.registry.remove(id).await {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => {
                    removed += 1;
                    tracing::error!(emulator = %id, error = %e, "failed to kill idle emulator");
                }
            }
        }
        removed
    }
}
