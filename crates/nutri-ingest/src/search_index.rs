//! Search index rebuild
//!
//! Drops and recreates the food index with a prefix-search mapping, then
//! republishes every stored food through the `_bulk` NDJSON protocol.

use crate::config::SearchSettings;
use crate::error::IndexError;
use futures::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

/// One food as seen by the search index
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDocument {
    #[serde(skip)]
    pub id: i64,
    pub name: String,
    pub brand: Option<String>,
    pub is_csv_food: bool,
}

#[derive(Serialize)]
struct BulkAction<'a> {
    index: BulkTarget<'a>,
}

#[derive(Serialize)]
struct BulkTarget<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    errors: bool,
    #[serde(default)]
    items: Vec<Value>,
}

/// Settings and mappings for the food index.
///
/// `name` is searchable three ways: full text, exact (case-insensitive)
/// keyword, and edge n-gram prefixes of 1 to 20 characters.
pub fn index_definition() -> Value {
    json!({
        "settings": {
            "analysis": {
                "filter": {
                    "edge_ngram_filter": { "type": "edge_ngram", "min_gram": 1, "max_gram": 20 }
                },
                "normalizer": {
                    "lowercase_normalizer": { "type": "custom", "filter": ["lowercase"] }
                },
                "analyzer": {
                    "name_prefix_analyzer": {
                        "type": "custom",
                        "tokenizer": "standard",
                        "filter": ["lowercase", "edge_ngram_filter"]
                    },
                    "name_prefix_search": {
                        "type": "custom",
                        "tokenizer": "standard",
                        "filter": ["lowercase"]
                    }
                }
            }
        },
        "mappings": {
            "properties": {
                "name": {
                    "type": "text",
                    "fields": {
                        "keyword": { "type": "keyword", "normalizer": "lowercase_normalizer" },
                        "prefix": {
                            "type": "text",
                            "analyzer": "name_prefix_analyzer",
                            "search_analyzer": "name_prefix_search"
                        }
                    }
                },
                "brand": {
                    "type": "text",
                    "fields": {
                        "keyword": { "type": "keyword", "normalizer": "lowercase_normalizer" }
                    }
                },
                "isCsvFood": { "type": "boolean" }
            }
        }
    })
}

/// NDJSON body for one `_bulk` request: an action line and a source line
/// per document, newline-terminated
pub fn encode_bulk(index: &str, docs: &[IndexDocument]) -> Result<String, serde_json::Error> {
    let mut body = String::new();
    for doc in docs {
        let action = BulkAction {
            index: BulkTarget {
                index,
                id: doc.id.to_string(),
            },
        };
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(doc)?);
        body.push('\n');
    }
    Ok(body)
}

fn first_item_error(items: &[Value]) -> String {
    items
        .iter()
        .filter_map(|item| item.get("index").and_then(|op| op.get("error")))
        .map(|error| {
            error
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string())
        })
        .next()
        .unwrap_or_else(|| "unknown item error".to_string())
}

pub struct SearchIndexer {
    client: Client,
    base_url: String,
    index: String,
    chunk_size: usize,
}

impl SearchIndexer {
    pub fn new(settings: &SearchSettings) -> Result<Self, IndexError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: settings.url.trim_end_matches('/').to_string(),
            index: settings.index.clone(),
            chunk_size: settings.bulk_chunk.max(1),
        })
    }

    fn index_url(&self) -> String {
        format!("{}/{}", self.base_url, self.index)
    }

    /// Delete the index if present and create it with [`index_definition`]
    pub async fn recreate(&self) -> Result<(), IndexError> {
        let response = self.client.delete(self.index_url()).send().await?;
        let status = response.status();
        if status != StatusCode::OK && status != StatusCode::NOT_FOUND {
            return Err(IndexError::Status {
                action: "delete index",
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let response = self
            .client
            .put(self.index_url())
            .json(&index_definition())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(IndexError::Status {
                action: "create index",
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        info!(index = %self.index, "Search index recreated");
        Ok(())
    }

    /// Send one `_bulk` request; returns the number of documents indexed
    pub async fn bulk(&self, docs: &[IndexDocument]) -> Result<usize, IndexError> {
        if docs.is_empty() {
            return Ok(0);
        }

        let body = encode_bulk(&self.index, docs)?;
        let response = self
            .client
            .post(format!("{}/_bulk", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(IndexError::Status {
                action: "bulk index",
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: BulkResponse = response.json().await?;
        if parsed.errors {
            return Err(IndexError::BulkItems(first_item_error(&parsed.items)));
        }

        debug!(documents = docs.len(), "Bulk request indexed");
        Ok(docs.len())
    }

    /// Index every document from `docs` in chunks
    pub async fn publish<S, E>(&self, docs: S) -> Result<usize, IndexError>
    where
        S: Stream<Item = Result<IndexDocument, E>>,
        IndexError: From<E>,
    {
        let mut docs = std::pin::pin!(docs);
        let mut chunk = Vec::with_capacity(self.chunk_size);
        let mut indexed = 0;

        while let Some(doc) = docs.next().await {
            chunk.push(doc?);
            if chunk.len() >= self.chunk_size {
                indexed += self.bulk(&chunk).await?;
                chunk.clear();
                info!(indexed, "Indexing progress");
            }
        }
        indexed += self.bulk(&chunk).await?;

        info!(index = %self.index, indexed, "Search index rebuilt");
        Ok(indexed)
    }
}
