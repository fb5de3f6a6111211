//! Queue depth sampling for the backpressure signal.

use std::{sync::Arc, time::Duration};

use postrider_common::{Signal, backpressure::BackpressureSignal, internal};
use postrider_spool::{INBOUND, MailQueue};
use serde::Deserialize;
use tokio::sync::broadcast;

/// Backpressure water marks.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplerConfig {
    /// Queue depth at which new mail is refused.
    #[serde(default = "default_high_water")]
    pub high_water: usize,

    /// Queue depth at which mail is accepted again.
    #[serde(default = "default_low_water")]
    pub low_water: usize,

    /// Seconds between depth observations.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

const fn default_high_water() -> usize {
    10_000
}

const fn default_low_water() -> usize {
    5_000
}

const fn default_interval_secs() -> u64 {
    1
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            high_water: default_high_water(),
            low_water: default_low_water(),
            interval_secs: default_interval_secs(),
        }
    }
}

/// Periodically observes the inbound queue depth and feeds it through the
/// shared [`BackpressureSignal`].
#[derive(Debug)]
pub struct QueueSampler {
    queue: Arc<dyn MailQueue>,
    signal: Arc<BackpressureSignal>,
    config: SamplerConfig,
}

impl QueueSampler {
    #[must_use]
    pub const fn new(
        queue: Arc<dyn MailQueue>,
        signal: Arc<BackpressureSignal>,
        config: SamplerConfig,
    ) -> Self {
        Self {
            queue,
            signal,
            config,
        }
    }

    /// Samples until shutdown. The signal is left wherever the last
    /// observation put it; sessions stop consulting it once they drain.
    pub async fn run(self, mut shutdown: broadcast::Receiver<Signal>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        internal!(
            level = DEBUG,
            "Queue sampler running (high {}, low {})",
            self.config.high_water,
            self.config.low_water
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let depth = self.queue.count(INBOUND).await;
                    self.signal
                        .sample(depth, self.config.high_water, self.config.low_water);
                }

                _ = shutdown.recv() => {
                    internal!(level = DEBUG, "Queue sampler stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use postrider_spool::TestQueue;

    use super::*;

    async fn settle() {
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sampler_engages_and_releases_the_signal() {
        let queue = Arc::new(TestQueue::default());
        let signal = Arc::new(BackpressureSignal::new());
        let config = SamplerConfig {
            high_water: 3,
            low_water: 1,
            interval_secs: 1,
        };

        let sampler = QueueSampler::new(queue.clone(), signal.clone(), config);
        let (sender, receiver) = broadcast::channel(1);

        let handle = tokio::spawn(sampler.run(receiver));

        queue.set_count(INBOUND, 5);
        settle().await;
        assert!(signal.engaged());

        queue.set_count(INBOUND, 2);
        settle().await;
        assert!(signal.engaged(), "must stay latched between the marks");

        queue.set_count(INBOUND, 0);
        settle().await;
        assert!(!signal.engaged());

        sender.send(Signal::Shutdown).unwrap();
        handle.await.unwrap();
    }
}
