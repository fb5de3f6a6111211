use std::sync::atomic::{AtomicBool, Ordering};

/// Latched backpressure signal with hysteresis.
///
/// The heartbeat samples queue depth through [`sample`](Self::sample);
/// sessions consult [`engaged`](Self::engaged) before accepting new mail.
/// The signal engages once depth exceeds the high-water mark and only
/// releases again once depth falls below the low-water mark, so a queue
/// hovering around a single threshold cannot flap the accept path.
#[derive(Debug, Default)]
pub struct BackpressureSignal {
    engaged: AtomicBool,
}

impl BackpressureSignal {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            engaged: AtomicBool::new(false),
        }
    }

    /// Whether new mail should currently be refused.
    #[must_use]
    pub fn engaged(&self) -> bool {
        self.engaged.load(Ordering::Relaxed)
    }

    /// Feeds one queue depth observation through the hysteresis band.
    ///
    /// Returns `true` if the observation flipped the signal.
    pub fn sample(&self, depth: usize, high: usize, low: usize) -> bool {
        if !self.engaged() && depth > high {
            self.engaged.store(true, Ordering::Relaxed);
            tracing::warn!(depth, high, "Queue depth over high-water mark, refusing new mail");
            true
        } else if self.engaged() && depth < low {
            self.engaged.store(false, Ordering::Relaxed);
            tracing::info!(depth, low, "Queue depth back at low-water mark, accepting mail again");
            true
        } else {
            false
        }
    }
}
