//! Single check attempts.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use vigil_core::{Monitor, MonitorKind, MonitorStatus};

/// Future returned by [`Checker::check`].
pub type CheckFuture<'a> = Pin<Box<dyn Future<Output = CheckOutcome> + Send + 'a>>;

/// Result of one check attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    /// Observed status.
    pub status: MonitorStatus,
    /// Time to answer, when the target answered.
    pub latency_ms: Option<u64>,
    /// Failure detail.
    pub message: Option<String>,
}

impl CheckOutcome {
    /// A successful answer, degraded when slower than `degraded_after`.
    pub fn answered(latency: Duration, degraded_after: Option<Duration>) -> Self {
        let status = match degraded_after {
            Some(limit) if latency > limit => MonitorStatus::Degraded,
            _ => MonitorStatus::Available,
        };
        Self {
            status,
            latency_ms: Some(latency.as_millis() as u64),
            message: None,
        }
    }

    /// A failed attempt.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: MonitorStatus::Unavailable,
            latency_ms: None,
            message: Some(message.into()),
        }
    }
}

/// Performs one attempt against a monitored service.
///
/// Implementations never fail: every problem maps to a status.
pub trait Checker: Send + Sync {
    /// Check `monitor` once.
    fn check<'a>(&'a self, monitor: &'a Monitor) -> CheckFuture<'a>;
}

/// Checker for the built-in HTTP and TCP monitor kinds.
#[derive(Debug, Clone)]
pub struct NetworkChecker {
    http: reqwest::Client,
}

impl NetworkChecker {
    /// Create a checker with its own connection pool.
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    async fn check_http(&self, monitor: &Monitor) -> CheckOutcome {
        let MonitorKind::Http {
            url,
            method,
            expected_status,
            body_contains,
            ..
        } = &monitor.kind
        else {
            return CheckOutcome::failed("not an HTTP monitor");
        };

        let method = match reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes()) {
            Ok(method) => method,
            Err(_) => return CheckOutcome::failed(format!("invalid method {}", method)),
        };

        let started = Instant::now();
        let response = match self
            .http
            .request(method, url)
            .timeout(monitor.timeout())
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return CheckOutcome::failed(format!("timed out after {:?}", monitor.timeout()))
            }
            Err(e) => return CheckOutcome::failed(e.to_string()),
        };

        let code = response.status().as_u16();
        let accepted = if expected_status.is_empty() {
            response.status().is_success()
        } else {
            expected_status.contains(&code)
        };
        if !accepted {
            return CheckOutcome::failed(format!("unexpected status {}", code));
        }

        if let Some(needle) = body_contains {
            match response.text().await {
                Ok(body) if body.contains(needle.as_str()) => {}
                Ok(_) => return CheckOutcome::failed(format!("body does not contain {:?}", needle)),
                Err(e) => return CheckOutcome::failed(e.to_string()),
            }
        }

        CheckOutcome::answered(started.elapsed(), monitor.kind.degraded_after())
    }

    async fn check_tcp(&self, monitor: &Monitor) -> CheckOutcome {
        let MonitorKind::Tcp { host, port, .. } = &monitor.kind else {
            return CheckOutcome::failed("not a TCP monitor");
        };

        let started = Instant::now();
        match tokio::time::timeout(monitor.timeout(), TcpStream::connect((host.as_str(), *port)))
            .await
        {
            Ok(Ok(_stream)) => {
                CheckOutcome::answered(started.elapsed(), monitor.kind.degraded_after())
            }
            Ok(Err(e)) => CheckOutcome::failed(format!("connect {}:{}: {}", host, port, e)),
            Err(_) => CheckOutcome::failed(format!("timed out after {:?}", monitor.timeout())),
        }
    }
}

impl Default for NetworkChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl Checker for NetworkChecker {
    fn check<'a>(&'a self, monitor: &'a Monitor) -> CheckFuture<'a> {
        Box::pin(async move {
            match &monitor.kind {
                MonitorKind::Http { .. } => self.check_http(monitor).await,
                MonitorKind::Tcp { .. } => self.check_tcp(monitor).await,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn tcp_monitor(port: u16) -> Monitor {
        let mut m = Monitor::new(
            "tcp",
            MonitorKind::Tcp {
                host: "127.0.0.1".into(),
                port,
                degraded_after_ms: None,
            },
        );
        m.timeout_secs = 2;
        m
    }

    #[test]
    fn slow_answer_is_degraded() {
        let outcome =
            CheckOutcome::answered(Duration::from_millis(900), Some(Duration::from_millis(500)));
        assert_eq!(outcome.status, MonitorStatus::Degraded);
        assert_eq!(outcome.latency_ms, Some(900));

        let outcome = CheckOutcome::answered(Duration::from_millis(100), None);
        assert_eq!(outcome.status, MonitorStatus::Available);
    }

    #[tokio::test]
    async fn tcp_connect_is_available() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let outcome = NetworkChecker::new().check(&tcp_monitor(port)).await;
        assert_eq!(outcome.status, MonitorStatus::Available);
    }

    #[tokio::test]
    async fn closed_port_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let outcome = NetworkChecker::new().check(&tcp_monitor(port)).await;
        assert_eq!(outcome.status, MonitorStatus::Unavailable);
        assert!(outcome.message.is_some());
    }

    #[tokio::test]
    async fn http_status_and_body_rules() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await;
                let body = "service ok";
                let reply = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(reply.as_bytes()).await;
            }
        });

        let checker = NetworkChecker::new();
        let http = |expected_status: Vec<u16>, body_contains: Option<&str>| {
            let mut m = Monitor::new(
                "http",
                MonitorKind::Http {
                    url: format!("http://{}/health", addr),
                    method: "get".into(),
                    expected_status,
                    body_contains: body_contains.map(str::to_string),
                    degraded_after_ms: None,
                },
            );
            m.timeout_secs = 2;
            m
        };

        let ok = checker.check(&http(vec![], Some("ok"))).await;
        assert_eq!(ok.status, MonitorStatus::Available);

        let wrong_body = checker.check(&http(vec![], Some("maintenance"))).await;
        assert_eq!(wrong_body.status, MonitorStatus::Unavailable);

        let wrong_status = checker.check(&http(vec![204], None)).await;
        assert_eq!(wrong_status.status, MonitorStatus::Unavailable);
        assert_eq!(wrong_status.message.as_deref(), Some("unexpected status 200"));
    }
}
