use crate::http::{HttpRequest, HttpTransport, RawResponse};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

struct Rule {
    pattern: String,
    responses: VecDeque<RawResponse>,
}

/// Scripted transport for tests. Requests are matched against URL substring
/// patterns; a pattern stubbed multiple times answers in sequence, with the
/// last response repeating. Unmatched requests come back as the synthetic
/// network failure, like an unreachable server.
pub(crate) struct MockTransport {
    rules: Mutex<Vec<Rule>>,
    seen: Mutex<Vec<HttpRequest>>,
    latency: StdDuration,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rules: Mutex::new(vec![]),
            seen: Mutex::new(vec![]),
            latency: StdDuration::ZERO,
        })
    }

    /// A transport where every response takes `latency`, so tests can hold
    /// requests in flight.
    pub fn with_latency(latency: StdDuration) -> Arc<Self> {
        Arc::new(Self {
            rules: Mutex::new(vec![]),
            seen: Mutex::new(vec![]),
            latency,
        })
    }

    pub fn stub(&self, pattern: &str, response: RawResponse) {
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.iter_mut().find(|rule| rule.pattern == pattern) {
            rule.responses.push_back(response);
        } else {
            rules.push(Rule {
                pattern: pattern.to_string(),
                responses: VecDeque::from([response]),
            });
        }
    }

    pub fn status(status: u16) -> RawResponse {
        RawResponse {
            status,
            body: String::new(),
            set_cookies: vec![],
        }
    }

    pub fn json(status: u16, body: &str) -> RawResponse {
        RawResponse {
            status,
            body: body.to_string(),
            set_cookies: vec![],
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.url.contains(pattern))
            .count()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> RawResponse {
        self.seen.lock().unwrap().push(request.clone());
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut() {
            if request.url.contains(&rule.pattern) {
                return if rule.responses.len() > 1 {
                    rule.responses.pop_front().unwrap_or_default()
                } else {
                    rule.responses.front().cloned().unwrap_or_default()
                };
            }
        }
        RawResponse::network_failure()
    }
}
