/// Exponential backoff for re-fetching server state.
///
/// The delay starts at `initial_ms`, is multiplied by `factor` after every
/// poll that found nothing new, and never exceeds `max_ms`.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    initial_ms: u64,
    max_ms: u64,
    factor: u32,
    delay_ms: u64,
    next_due_ms: Option<u64>,
}

impl PollBackoff {
    pub fn new(initial_ms: u64, max_ms: u64, factor: u32) -> Self {
        Self {
            initial_ms,
            max_ms,
            factor: factor.max(1),
            delay_ms: initial_ms,
            next_due_ms: None,
        }
    }

    /// The window got focus back: poll now, then restart from the initial
    /// delay.
    pub fn on_focus_regained(&mut self, now_ms: u64) {
        self.delay_ms = self.initial_ms;
        self.next_due_ms = Some(now_ms);
    }

    pub fn record_poll(&mut self, now_ms: u64, changed: bool) {
        self.delay_ms = if changed {
            self.initial_ms
        } else {
            self.delay_ms
                .saturating_mul(u64::from(self.factor))
                .min(self.max_ms)
        };
        self.next_due_ms = Some(now_ms.saturating_add(self.delay_ms));
    }

    /// Never due before the first focus event or poll.
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.next_due_ms.is_some_and(|due| now_ms >= due)
    }

    pub fn current_delay(&self) -> u64 {
        self.delay_ms
    }

    pub fn stop(&mut self) {
        self.delay_ms = self.initial_ms;
        self.next_due_ms = None;
    }
}
