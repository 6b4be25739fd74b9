use std::time::{Duration, Instant};

use reqwest::StatusCode;

use crate::{error::AppResult, ledger::models::TickStatus};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeOutcome {
    pub status: TickStatus,
    /// Whole milliseconds from request start to response (or failure)
    pub latency_ms: f64,
}

/// HTTP reachability check
pub struct Prober {
    client: reqwest::Client,
}

impl Prober {
    pub fn new(timeout: Duration) -> AppResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// `Good` only for an HTTP 200; any other status, transport error or
    /// timeout is `Bad`.
    pub async fn probe(&self, url: &str) -> ProbeOutcome {
        let started = Instant::now();
        let result = self.client.get(url).send().await;
        let latency_ms = started.elapsed().as_millis() as f64;

        let status = match result {
            Ok(response) if response.status() == StatusCode::OK => TickStatus::Good,
            _ => TickStatus::Bad,
        };

        ProbeOutcome { status, latency_ms }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxumStatus, routing::get, Router};
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_ok_is_good_everything_else_bad() {
        let base = serve(
            Router::new()
                .route("/ok", get(|| async { "up" }))
                .route("/created", get(|| async { (AxumStatus::CREATED, "made") }))
                .route("/down", get(|| async { (AxumStatus::SERVICE_UNAVAILABLE, "down") })),
        )
        .await;
        let prober = Prober::new(Duration::from_secs(5)).unwrap();

        let ok = prober.probe(&format!("{}/ok", base)).await;
        assert_eq!(ok.status, TickStatus::Good);
        assert!(ok.latency_ms >= 0.0);

        let created = prober.probe(&format!("{}/created", base)).await;
        assert_eq!(created.status, TickStatus::Bad);

        let down = prober.probe(&format!("{}/down", base)).await;
        assert_eq!(down.status, TickStatus::Bad);
    }

    #[tokio::test]
    async fn test_unreachable_and_slow_targets_are_bad() {
        let prober = Prober::new(Duration::from_millis(200)).unwrap();

        let unreachable = prober.probe("http://127.0.0.1:1/").await;
        assert_eq!(unreachable.status, TickStatus::Bad);

        let base = serve(Router::new().route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                "late"
            }),
        ))
        .await;
        let slow = prober.probe(&format!("{}/slow", base)).await;
        assert_eq!(slow.status, TickStatus::Bad);
        assert!(slow.latency_ms < 2_000.0);
    }
}
