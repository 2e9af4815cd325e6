//! Daemon driver for the control loop.
//!
//! `LoopDaemon` fires one tick per interval on a tokio runtime and stops on
//! Ctrl+C or after `max_ticks`. The loop itself stays synchronous; tokio only
//! drives scheduling and signal handling.

use std::time::Duration;

use super::control_loop::ControlLoop;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    /// Time between ticks (default: 1s).
    pub tick_interval: Duration,
    /// Stop after this many ticks (0 = unlimited).
    pub max_ticks: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            max_ticks: 0,
        }
    }
}

/// Why the daemon stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    MaxTicks,
    Signal,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

pub struct LoopDaemon<'a> {
    control: &'a mut ControlLoop,
    config: DaemonConfig,
}

impl<'a> LoopDaemon<'a> {
    pub fn new(control: &'a mut ControlLoop, config: DaemonConfig) -> Self {
        Self { control, config }
    }

    /// Tick until Ctrl+C or the tick ceiling.
    pub async fn run(&mut self) -> Shutdown {
        self.run_until(tokio::signal::ctrl_c()).await
    }

    /// Tick until `shutdown` resolves or the tick ceiling is reached.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Shutdown
    where
        F: std::future::Future,
    {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(
            interval_ms = self.config.tick_interval.as_millis() as u64,
            max_ticks = self.config.max_ticks,
            "daemon started"
        );
        let mut ticks = 0u64;
        let reason = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let status = self.control.tick();
                    ticks += 1;
                    tracing::debug!(tick = status.tick, mode = %status.mode, "daemon tick");
                    if self.config.max_ticks > 0 && ticks >= self.config.max_ticks {
                        tracing::info!(ticks, "daemon: max ticks reached, shutting down");
                        break Shutdown::MaxTicks;
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!(ticks, "daemon: received shutdown signal");
                    break Shutdown::Signal;
                }
            }
        };
        tracing::info!("daemon stopped");
        reason
    }
}
