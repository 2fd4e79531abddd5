use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use beacon_core::task::Method;
use reqwest::{Client, StatusCode};

use crate::scheduler::LoopTask;

/// Per-request timeout shared by every task.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// `User-Agent` sent with every scheduled call.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Result of one scheduled call. `run` is the task's counter after this attempt.
#[derive(Debug)]
pub enum Outcome {
    /// The target answered, whatever the status.
    Response { status: StatusCode, run: u64 },
    /// No response: bad URL, connect error, timeout.
    Failed { error: String, run: u64 },
}

impl Outcome {
    /// Counter value after this attempt.
    pub fn run(&self) -> u64 {
        match self {
            Outcome::Response { run, .. } | Outcome::Failed { run, .. } => *run,
        }
    }
}

/// Issues task calls through one pooled client; cheap to clone.
#[derive(Clone)]
pub struct HttpExecutor {
    client: Client,
}

impl HttpExecutor {
    /// Executor with the default [`REQUEST_TIMEOUT`].
    pub fn new() -> Result<Self> {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    /// Executor whose requests give up after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }

    /// Execute one call for `task` and bump its run counter.
    ///
    /// POST is sent without a body. Failures are reported, never retried.
    pub async fn execute(&self, task: &LoopTask) -> Outcome {
        let res = self.send(task).await;
        let run = task.runs.fetch_add(1, Ordering::Relaxed) + 1;
        match res {
            Ok(status) => Outcome::Response { status, run },
            Err(e) => Outcome::Failed { error: format!("{e:#}"), run },
        }
    }

    async fn send(&self, task: &LoopTask) -> Result<StatusCode> {
        let method = match task.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };
        let resp = self
            .client
            .request(method, task.url.as_str())
            .send()
            .await
            .context("request error")?;
        let status = resp.status();
        // Drain so the pooled connection can be reused; body errors don't matter.
        let _ = resp.bytes().await;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn task(m: Method, url: String) -> LoopTask {
        LoopTask {
            id: "t1".to_string(),
            method: m,
            url,
            interval: Duration::from_secs(1),
            runs: Arc::new(AtomicU64::new(0)),
        }
    }

    #[tokio::test]
    async fn get_reports_status_and_counts() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .and(header("user-agent", USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .expect(2)
            .mount(&server)
            .await;

        let exec = HttpExecutor::new().unwrap();
        let t = task(Method::Get, format!("{}/ping", server.uri()));

        match exec.execute(&t).await {
            Outcome::Response { status, run } => {
                assert_eq!(status, StatusCode::OK);
                assert_eq!(run, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(exec.execute(&t).await.run(), 2);
        assert_eq!(t.runs.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn post_is_sent_without_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let exec = HttpExecutor::new().unwrap();
        let t = task(Method::Post, format!("{}/hook", server.uri()));
        let out = exec.execute(&t).await;
        assert!(matches!(out, Outcome::Response { status, run: 1 } if status == StatusCode::NO_CONTENT));

        let received = server.received_requests().await.unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].body.is_empty());
    }

    #[tokio::test]
    async fn error_status_is_a_completed_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let exec = HttpExecutor::new().unwrap();
        let t = task(Method::Get, server.uri());
        let out = exec.execute(&t).await;
        assert!(matches!(out, Outcome::Response { status, run: 1 } if status == StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn transport_failure_is_reported_not_retried() {
        // Bind then drop a listener so the port is known to refuse connections.
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let exec = HttpExecutor::new().unwrap();
        let t = task(Method::Get, format!("http://127.0.0.1:{port}/"));
        match exec.execute(&t).await {
            Outcome::Failed { error, run } => {
                assert_eq!(run, 1);
                assert!(error.contains("request error"), "{error}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_target_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let exec = HttpExecutor::with_timeout(Duration::from_millis(200)).unwrap();
        let t = task(Method::Get, server.uri());
        assert!(matches!(exec.execute(&t).await, Outcome::Failed { run: 1, .. }));
    }
}
