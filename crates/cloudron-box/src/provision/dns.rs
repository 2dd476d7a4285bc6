// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DNS providers.
//!
//! `caas` manages records through the box's account at the API server:
//! - `GET    {origin}/api/v1/boxes/{boxId}/dns/{name}?type=A`
//! - `POST   {origin}/api/v1/boxes/{boxId}/dns/{name}` with `{"type", "value"}`
//! - `DELETE {origin}/api/v1/boxes/{boxId}/dns/{name}?type=A`
//!
//! Every request carries the box token as `token` query parameter.
//!
//! `noop` is for boxes whose DNS is managed outside the box (wildcard records).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{DnsProvider, DnsRecord, ProvisionError, Result};

/// DNS provider backed by the API server.
pub struct CaasDnsProvider {
    client: reqwest::Client,
    api_server_origin: String,
    box_id: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct RecordResponse {
    record: WireRecord,
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    id: String,
    name: String,
    #[serde(rename = "type")]
    record_type: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct UpsertResponse {
    id: String,
}

impl CaasDnsProvider {
    /// Create a provider for `box_id` at `api_server_origin`.
    pub fn new(
        api_server_origin: impl Into<String>,
        box_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            api_server_origin: api_server_origin.into().trim_end_matches('/').to_string(),
            box_id: box_id.into(),
            token: token.into(),
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!(
            "{}/api/v1/boxes/{}/dns/{}",
            self.api_server_origin, self.box_id, suffix
        )
    }
}

fn check_status(url: &str, status: StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else {
        Err(ProvisionError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        })
    }
}

#[async_trait]
impl DnsProvider for CaasDnsProvider {
    fn provider_type(&self) -> &'static str {
        "caas"
    }

    async fn get_record(&self, name: &str, record_type: &str) -> Result<Option<DnsRecord>> {
        let url = self.url(name);
        let response = self
            .client
            .get(&url)
            .query(&[("type", record_type), ("token", self.token.as_str())])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(&url, response.status())?;

        let record = response.json::<RecordResponse>().await?.record;
        Ok(Some(DnsRecord {
            id: record.id,
            name: record.name,
            record_type: record.record_type,
            value: record.value,
        }))
    }

    async fn upsert_record(&self, name: &str, record_type: &str, value: &str) -> Result<String> {
        let url = self.url(name);
        let response = self
            .client
            .post(&url)
            .query(&[("token", &self.token)])
            .json(&json!({ "type": record_type, "value": value }))
            .send()
            .await?;
        check_status(&url, response.status())?;

        let id = response.json::<UpsertResponse>().await?.id;
        info!(name = %name, record_type = %record_type, value = %value, record_id = %id, "Upserted DNS record");
        Ok(id)
    }

    async fn delete_record(&self, name: &str, record_type: &str) -> Result<()> {
        let url = self.url(name);
        let response = self
            .client
            .delete(&url)
            .query(&[("type", record_type), ("token", self.token.as_str())])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(name = %name, "DNS record already gone");
            return Ok(());
        }
        check_status(&url, response.status())?;

        info!(name = %name, record_type = %record_type, "Deleted DNS record");
        Ok(())
    }
}

/// DNS provider that manages nothing.
///
/// Records are reported as present with a stable id derived from the name so that DNS steps
/// remain idempotent.
#[derive(Debug, Default)]
pub struct NoopDnsProvider;

#[async_trait]
impl DnsProvider for NoopDnsProvider {
    fn provider_type(&self) -> &'static str {
        "noop"
    }

    async fn get_record(&self, _name: &str, _record_type: &str) -> Result<Option<DnsRecord>> {
        Ok(None)
    }

    async fn upsert_record(&self, name: &str, record_type: &str, _value: &str) -> Result<String> {
        Ok(format!("noop-{}-{}", record_type, name))
    }

    async fn delete_record(&self, _name: &str, _record_type: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_caas_upsert_and_get() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/v1/boxes/box1/dns/blog.example.com"))
            .and(query_param("token", "secret"))
            .and(body_json(json!({ "type": "A", "value": "1.2.3.4" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "rec-1" })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v1/boxes/box1/dns/blog.example.com"))
            .and(query_param("type", "A"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "record": { "id": "rec-1", "name": "blog.example.com", "type": "A", "value": "1.2.3.4" }
            })))
            .mount(&server)
            .await;

        let dns = CaasDnsProvider::new(server.uri(), "box1", "secret").unwrap();
        let id = dns
            .upsert_record("blog.example.com", "A", "1.2.3.4")
            .await
            .unwrap();
        assert_eq!(id, "rec-1");

        let record = dns.get_record("blog.example.com", "A").await.unwrap().unwrap();
        assert_eq!(record.value, "1.2.3.4");
    }

    #[tokio::test]
    async fn test_caas_missing_record() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/boxes/box1/dns/gone.example.com"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/boxes/box1/dns/gone.example.com"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dns = CaasDnsProvider::new(server.uri(), "box1", "secret").unwrap();
        assert!(dns.get_record("gone.example.com", "A").await.unwrap().is_none());
        dns.delete_record("gone.example.com", "A").await.unwrap();
    }

    #[tokio::test]
    async fn test_caas_server_error() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dns = CaasDnsProvider::new(server.uri(), "box1", "secret").unwrap();
        let err = dns
            .upsert_record("blog.example.com", "A", "1.2.3.4")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Status { status: 500, .. }));
    }
}
