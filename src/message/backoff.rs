use std::time::Duration;

/// Provides a mechanism for managing attempting to complete an operation
/// and retrying the operation, which a backoff, if it fails.
///
/// This iterator provides an infinite stream of back off durations, where
/// the duration increases an exponential factor up to some maximum delay.
/// Upon reaching the maximum delay, that value will be returned from then
/// on. Use `Iterator::take` to bound the number of attempts.
pub struct ExponentialBackoff {
    curr: Duration,
    max: Duration,
    factor: u32,
}

impl ExponentialBackoff {
    pub fn new(start: Duration, max: Duration, factor: u32) -> ExponentialBackoff {
        ExponentialBackoff {
            curr: start,
            max,
            factor,
        }
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let this = self.curr;
        let new_next = self.curr * self.factor;

        self.curr = if new_next > self.max {
            self.max
        } else {
            new_next
        };

        Some(this)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_grows_then_saturates() {
        let delays: Vec<_> = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(500),
            2,
        )
        .take(5)
        .map(|d| d.as_millis())
        .collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }
}
