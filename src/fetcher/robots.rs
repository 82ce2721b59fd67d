//! Per-origin robots.txt cache. Populated on the first check for an origin and
//! dropped with the process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use texting_robots::Robot;
use tracing::{debug, warn};
use url::Url;

use super::Transport;

pub enum RobotsPolicy {
    AllowAll,
    DisallowAll,
    Rules(Robot),
}

impl RobotsPolicy {
    /// 2xx parses the rules, 4xx allows everything, anything else disallows.
    pub fn from_response(agent: &str, status: u16, body: &[u8]) -> Self {
        match status {
            200..=299 => match Robot::new(agent, body) {
                Ok(robot) => Self::Rules(robot),
                Err(e) => {
                    warn!(agent, error = %e, "Unparsable robots.txt, allowing all");
                    Self::AllowAll
                }
            },
            400..=499 => Self::AllowAll,
            _ => Self::DisallowAll,
        }
    }

    pub fn allows(&self, url: &Url) -> bool {
        match self {
            Self::AllowAll => true,
            Self::DisallowAll => false,
            Self::Rules(robot) => robot.allowed(url.as_str()),
        }
    }

    pub fn crawl_delay(&self) -> Option<Duration> {
        match self {
            Self::Rules(robot) => robot
                .delay
                .filter(|d| d.is_finite() && *d > 0.0)
                .map(|d| Duration::from_secs_f64(d as f64)),
            _ => None,
        }
    }
}

pub struct RobotsCache {
    agent: String,
    entries: Mutex<HashMap<String, Arc<RobotsPolicy>>>,
}

impl RobotsCache {
    /// `user_agent` is reduced to its product token for rule matching.
    pub fn new(user_agent: &str) -> Self {
        let agent = user_agent
            .split(['/', ' '])
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("*")
            .to_string();
        Self {
            agent,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached_origins(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Policy for `url`'s origin if it was already fetched this run.
    pub fn cached(&self, url: &Url) -> Option<Arc<RobotsPolicy>> {
        self.lookup(&url.origin().ascii_serialization())
    }

    pub async fn policy_for(&self, transport: &dyn Transport, url: &Url) -> Arc<RobotsPolicy> {
        let origin = url.origin().ascii_serialization();
        if let Some(policy) = self.lookup(&origin) {
            return policy;
        }

        let policy = Arc::new(self.fetch_policy(transport, &origin).await);
        match self.entries.lock() {
            Ok(mut entries) => Arc::clone(entries.entry(origin).or_insert(policy)),
            Err(_) => policy,
        }
    }

    fn lookup(&self, origin: &str) -> Option<Arc<RobotsPolicy>> {
        self.entries.lock().ok()?.get(origin).cloned()
    }

    async fn fetch_policy(&self, transport: &dyn Transport, origin: &str) -> RobotsPolicy {
        let robots_url = match Url::parse(&format!("{origin}/robots.txt")) {
            Ok(u) => u,
            Err(_) => return RobotsPolicy::DisallowAll,
        };
        match transport.get(&robots_url).await {
            Ok(resp) => {
                debug!(origin, status = resp.status, "Fetched robots.txt");
                RobotsPolicy::from_response(&self.agent, resp.status, &resp.body)
            }
            Err(e) => {
                warn!(origin, reason = %e, "robots.txt unreachable, disallowing origin");
                RobotsPolicy::DisallowAll
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn rules_disallow_path() {
        let txt = b"User-agent: *\nDisallow: /private/\nCrawl-delay: 3\n";
        let policy = RobotsPolicy::from_response("InsightBotCrawler", 200, txt);
        assert!(policy.allows(&url("http://news.example/a")));
        assert!(!policy.allows(&url("http://news.example/private/a")));
        assert_eq!(policy.crawl_delay(), Some(Duration::from_secs(3)));
    }

    #[test]
    fn specific_agent_block() {
        let txt = b"User-agent: InsightBotCrawler\nDisallow: /\n\nUser-agent: *\nDisallow:\n";
        let policy = RobotsPolicy::from_response("InsightBotCrawler", 200, txt);
        assert!(!policy.allows(&url("http://news.example/a")));
    }

    #[test]
    fn missing_robots_allows_all() {
        let policy = RobotsPolicy::from_response("bot", 404, b"");
        assert!(policy.allows(&url("http://news.example/anything")));
    }

    #[test]
    fn server_error_fails_closed() {
        let policy = RobotsPolicy::from_response("bot", 503, b"");
        assert!(!policy.allows(&url("http://news.example/")));
        assert!(policy.crawl_delay().is_none());
    }

    #[test]
    fn agent_is_product_token() {
        let cache = RobotsCache::new("InsightBotCrawler/0.1 (+https://example.com)");
        assert_eq!(cache.agent, "InsightBotCrawler");
    }
}
