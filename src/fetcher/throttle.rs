use std::time::Duration;

use tokio::time::Instant;

/// Spaces out consecutive requests to one domain. Each domain worker owns one.
#[derive(Debug)]
pub struct DomainThrottle {
    delay: Duration,
    last: Option<Instant>,
}

impl DomainThrottle {
    pub fn new(delay: Duration) -> Self {
        Self { delay, last: None }
    }

    /// Never lowers the delay, only raises it (e.g. for a robots `Crawl-delay`).
    pub fn raise_to(&mut self, delay: Duration) {
        if delay > self.delay {
            self.delay = delay;
        }
    }

    /// Sleeps until the domain delay, or `at_least` if longer, has passed since
    /// the previous request, then marks a new one. `at_least` applies to this
    /// request only.
    pub async fn wait(&mut self, at_least: Duration) {
        if let Some(last) = self.last {
            tokio::time::sleep_until(last + self.delay.max(at_least)).await;
        }
        self.last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECS_2: Duration = Duration::from_secs(2);
    const SECS_5: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn first_request_is_immediate() {
        let mut t = DomainThrottle::new(SECS_2);
        let start = Instant::now();
        t.wait(SECS_5).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn second_request_waits_for_delay() {
        let mut t = DomainThrottle::new(SECS_2);
        t.wait(Duration::ZERO).await;
        let start = Instant::now();
        t.wait(Duration::ZERO).await;
        assert!(start.elapsed() >= SECS_2);
    }

    #[tokio::test(start_paused = true)]
    async fn raise_never_lowers() {
        let mut t = DomainThrottle::new(SECS_2);
        t.wait(Duration::ZERO).await;
        t.raise_to(Duration::from_secs(1));
        let start = Instant::now();
        t.wait(Duration::ZERO).await;
        assert!(start.elapsed() >= SECS_2);

        t.raise_to(SECS_5);
        let start = Instant::now();
        t.wait(Duration::ZERO).await;
        assert!(start.elapsed() >= SECS_5);
    }

    #[tokio::test(start_paused = true)]
    async fn per_request_delay_does_not_stick() {
        let mut t = DomainThrottle::new(SECS_2);
        t.wait(Duration::ZERO).await;
        let start = Instant::now();
        t.wait(SECS_5).await;
        assert!(start.elapsed() >= SECS_5);

        let start = Instant::now();
        t.wait(Duration::ZERO).await;
        assert!(start.elapsed() >= SECS_2 && start.elapsed() < SECS_5);
    }
}
