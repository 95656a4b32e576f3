use std::time::Duration;

/// Reconnect delays used when no schedule is configured.
pub const DEFAULT_BACKOFF_STEPS: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

/// Fixed escalating reconnect schedule, capped at its last step.
///
/// The position only moves back to the first step on [`Backoff::reset`],
/// which the transport calls after a successful handshake, never merely
/// after a dial attempt.
#[derive(Clone, Debug)]
pub struct Backoff {
    steps: Vec<Duration>,
    index: usize,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_STEPS.to_vec())
    }
}

impl Backoff {
    /// Build a schedule from `steps`. An empty list falls back to
    /// [`DEFAULT_BACKOFF_STEPS`]; out-of-order steps are sorted so the
    /// schedule never decreases.
    pub fn new(mut steps: Vec<Duration>) -> Self {
        if steps.is_empty() {
            steps = DEFAULT_BACKOFF_STEPS.to_vec();
        }
        steps.sort();
        Self { steps, index: 0 }
    }

    /// Delay before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.steps[self.index];
        self.index = (self.index + 1).min(self.steps.len() - 1);
        delay
    }

    /// Delay the next call to [`Backoff::next_delay`] will return.
    pub fn peek(&self) -> Duration {
        self.steps[self.index]
    }

    pub fn reset(&mut self) {
        self.index = 0;
    }

    pub fn steps(&self) -> &[Duration] {
        &self.steps
    }
}
