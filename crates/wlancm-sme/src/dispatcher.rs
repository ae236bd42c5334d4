//! Event dispatcher and timeout monitor.
//!
//! Two tokio tasks share a [`MacContext`]: one drains the inbound firmware
//! event channel, the other sweeps the active command's deadline. Both
//! take the context lock for each unit of work and stop on a shared
//! shutdown signal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::context::MacContext;
use crate::transport::EventReceiver;

/// Background tasks driving a context.
pub struct SmeRuntime {
    shutdown: watch::Sender<bool>,
    dispatcher: JoinHandle<u64>,
    monitor: JoinHandle<u64>,
}

impl SmeRuntime {
    /// Spawn the dispatcher and timeout monitor on the current runtime.
    pub fn start(ctx: Arc<MacContext>, events: EventReceiver) -> Self {
        let (shutdown, signal) = watch::channel(false);
        let period = ctx.config().timeout_check_interval();

        let dispatcher = tokio::spawn(run_dispatcher(ctx.clone(), events, signal.clone()));
        let monitor = tokio::spawn(run_timeout_monitor(ctx, period, signal));

        tracing::info!(
            "SME runtime started, timeout sweep every {} ms",
            period.as_millis()
        );

        Self {
            shutdown,
            dispatcher,
            monitor,
        }
    }

    /// Signal both tasks and wait for them to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);

        let delivered = match self.dispatcher.await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("Event dispatcher ended abnormally: {}", e);
                0
            }
        };
        let expired = match self.monitor.await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("Timeout monitor ended abnormally: {}", e);
                0
            }
        };

        tracing::info!(
            "SME runtime stopped: {} events dispatched, {} commands timed out",
            delivered,
            expired
        );
    }
}

/// Drain inbound events into the context. Returns the number delivered.
async fn run_dispatcher(
    ctx: Arc<MacContext>,
    mut events: EventReceiver,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let mut delivered = 0u64;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => {
                let Some(event) = event else {
                    tracing::debug!("Event channel closed");
                    break;
                };
                tracing::trace!("Dispatching {:?}", event);
                ctx.on_event(event);
                delivered += 1;
            }
        }
    }

    delivered
}

/// Periodically expire the active command. Returns the number expired.
async fn run_timeout_monitor(
    ctx: Arc<MacContext>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut expired = 0u64;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                while ctx.check_timeouts(Instant::now()) {
                    expired += 1;
                }
            }
        }
    }

    expired
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmeConfig;
    use crate::testing::LoopbackFirmware;
    use crate::transport::event_channel;

    #[tokio::test]
    async fn test_start_and_stop() {
        let (sender, receiver) = event_channel();
        let ctx = MacContext::open(SmeConfig::default(), LoopbackFirmware::new(sender)).unwrap();

        let runtime = SmeRuntime::start(ctx.clone(), receiver);
        runtime.stop().await;

        assert!(ctx.is_open());
    }
}
