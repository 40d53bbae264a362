//! Bulk HTTP sink
//!
//! POSTs each batch as a JSON array to the food API's bulk endpoint. The
//! server owns identity resolution, so a successful response carries no
//! created identities back.

use super::{BatchReceipt, Sink, SinkFactory};
use crate::batch::Batch;
use crate::error::SinkError;
use crate::match_cache::MatchCache;
use crate::record::{Measurement, NormalizedRecord, Nutrients};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

// ============================================================================
// HTTP Sink Constants
// ============================================================================

/// Default API base URL
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3001";

/// Default bulk endpoint, appended to the base URL
pub const DEFAULT_BULK_PATH: &str = "/food-barcodes/bulk";

/// Default per-request timeout in seconds
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 60;

/// Response bodies longer than this are cut in error messages
pub const MAX_ERROR_BODY_CHARS: usize = 300;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FoodPayload<'a> {
    source_id: &'a str,
    name: &'a str,
    brand: Option<&'a str>,
    food_group: Option<&'a str>,
    calories: i32,
    is_csv_food: bool,
    #[serde(flatten)]
    nutrients: &'a Nutrients,
    measurements: &'a [Measurement],
}

#[derive(Debug, Serialize)]
struct BulkEntry<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    barcode: Option<&'a str>,
    food: FoodPayload<'a>,
}

impl<'a> From<&'a NormalizedRecord> for BulkEntry<'a> {
    fn from(record: &'a NormalizedRecord) -> Self {
        Self {
            barcode: record.barcode.as_deref(),
            food: FoodPayload {
                source_id: &record.source_id,
                name: &record.name,
                brand: record.brand.as_deref(),
                food_group: record.food_group.as_deref(),
                calories: record.calories,
                is_csv_food: record.is_csv_food,
                nutrients: &record.nutrients,
                measurements: &record.measurements,
            },
        }
    }
}

/// Cut `body` to [`MAX_ERROR_BODY_CHARS`] characters, marking the cut
pub fn truncate_body(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
        Some((cut, _)) => format!("{}... (truncated)", &body[..cut]),
        None => body.to_string(),
    }
}

/// Map a non-success response to an error class
pub fn classify_status(status: StatusCode, body: &str) -> SinkError {
    match status.as_u16() {
        401 | 403 => SinkError::Fatal(format!("unauthorized response ({})", status.as_u16())),
        code => {
            let message = format!("HTTP {code}: {}", truncate_body(body));
            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                SinkError::Transient(message)
            } else {
                SinkError::Rejected(message)
            }
        },
    }
}

/// Creates one [`HttpBulkSink`] per worker, each with its own client
#[derive(Debug, Clone)]
pub struct HttpSinkFactory {
    endpoint: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpSinkFactory {
    pub fn new(base_url: &str, bulk_path: &str, token: Option<String>, timeout: Duration) -> Self {
        let endpoint = format!("{}/{}", base_url.trim_end_matches('/'), bulk_path.trim_start_matches('/'));
        Self {
            endpoint,
            token,
            timeout,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl SinkFactory for HttpSinkFactory {
    type Sink = HttpBulkSink;

    fn name(&self) -> &'static str {
        "http"
    }

    async fn connect(&self, worker: usize) -> Result<HttpBulkSink, SinkError> {
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| SinkError::Rejected(format!("failed to build HTTP client: {e}")))?;

        debug!(worker, endpoint = %self.endpoint, "HTTP sink ready");

        Ok(HttpBulkSink {
            client,
            endpoint: self.endpoint.clone(),
            token: self.token.clone(),
        })
    }
}

#[derive(Debug)]
pub struct HttpBulkSink {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

#[async_trait]
impl Sink for HttpBulkSink {
    async fn write_batch(&mut self, batch: &Batch, _matches: &MatchCache) -> Result<BatchReceipt, SinkError> {
        let payload: Vec<BulkEntry<'_>> = batch.records().iter().map(BulkEntry::from).collect();

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| SinkError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            return Ok(BatchReceipt::default());
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, &body))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_body_short() {
        assert_eq!(truncate_body("  bad barcode \n"), "bad barcode");
    }

    #[test]
    fn test_truncate_body_long() {
        let body = "é".repeat(400);
        let cut = truncate_body(&body);
        assert!(cut.ends_with("... (truncated)"));
        assert_eq!(cut.chars().count(), MAX_ERROR_BODY_CHARS + "... (truncated)".len());
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status(StatusCode::UNAUTHORIZED, "").is_fatal());
        assert!(classify_status(StatusCode::FORBIDDEN, "").is_fatal());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert_eq!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "bad calories"),
            SinkError::Rejected("HTTP 422: bad calories".into())
        );
    }

    #[test]
    fn test_endpoint_joins_cleanly() {
        let factory = HttpSinkFactory::new("http://api:3001/", "/food-barcodes/bulk", None, Duration::from_secs(1));
        assert_eq!(factory.endpoint(), "http://api:3001/food-barcodes/bulk");
    }

    #[test]
    fn test_payload_shape() {
        let mut record = NormalizedRecord::new("0001", "Peanut Butter", 588);
        record.barcode = Some("0001".into());
        record.nutrients.protein = 25.0;

        let value = serde_json::to_value(BulkEntry::from(&record)).unwrap();
        assert_eq!(value["barcode"], "0001");
        assert_eq!(value["food"]["sourceId"], "0001");
        assert_eq!(value["food"]["isCsvFood"], false);
        assert_eq!(value["food"]["protein"], 25.0);
        assert_eq!(value["food"]["measurements"].as_array().unwrap().len(), 2);
        assert!(value["food"]["brand"].is_null());
    }
}
