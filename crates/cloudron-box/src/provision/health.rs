// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP health probe against the app's published port.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{HealthProbe, Result};

/// Probes `http://{host}:{port}{path}`. Any status below 400 counts as healthy.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    host: String,
}

impl HttpHealthProbe {
    /// Probe apps published on 127.0.0.1.
    pub fn new() -> Result<Self> {
        Self::with_host("127.0.0.1")
    }

    /// Probe apps published on `host`.
    pub fn with_host(host: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            host: host.into(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, port: u16, path: &str) -> Result<bool> {
        let url = format!("http://{}:{}{}", self.host, port, path);
        match self.client.get(&url).send().await {
            Ok(response) => {
                let status = response.status();
                debug!(url = %url, status = status.as_u16(), "Health probe");
                Ok(!status.is_client_error() && !status.is_server_error())
            }
            // connection refused while the app is still booting
            Err(e) if e.is_connect() || e.is_timeout() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_probe_statuses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthcheck"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let port = server.address().port();
        let probe = HttpHealthProbe::new().unwrap();
        assert!(probe.probe(port, "/healthcheck").await.unwrap());
        assert!(!probe.probe(port, "/broken").await.unwrap());
    }

    #[tokio::test]
    async fn test_probe_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = HttpHealthProbe::new().unwrap();
        assert!(!probe.probe(port, "/").await.unwrap());
    }
}
