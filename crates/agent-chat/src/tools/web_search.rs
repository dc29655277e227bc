// agent-chat/crates/agent-chat/src/tools/web_search.rs
//! Web search through a SearXNG-compatible JSON API, with a response cache.

use async_trait::async_trait;
use moka::future::Cache;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

use super::{Tool, ToolContext, ToolError};
use crate::config::SearchSettings;

pub const CATEGORIES: [&str; 5] = ["text", "images", "news", "videos", "books"];

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("Unsupported search category: {0}")]
    UnsupportedCategory(String),
    #[error("Search request timed out: {0}")]
    Timeout(String),
    #[error("Search backend returned an error: {0}")]
    Http(String),
    #[error("Could not decode search response: {0}")]
    Decode(String),
    #[error("Unexpected search failure: {0}")]
    Unexpected(String),
}

impl SearchError {
    pub fn code(&self) -> &'static str {
        match self {
            SearchError::UnsupportedCategory(_) => "unsupported_category",
            SearchError::Timeout(_) => "timeout",
            SearchError::Http(_) => "http_error",
            SearchError::Decode(_) => "decode_error",
            SearchError::Unexpected(_) => "unexpected_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    pub query: String,
    pub category: String,
    pub backend: String,
    pub region: String,
    pub safesearch: String,
    pub timelimit: Option<String>,
    pub max_results: u32,
}

impl SearchQuery {
    /// blake3 digest over the normalized query and every parameter.
    fn cache_key(&self) -> String {
        let normalized = self.query.trim().to_lowercase();
        let max_results = self.max_results.to_string();
        let parts: [&str; 7] = [
            &normalized,
            &self.category,
            &self.backend,
            &self.region,
            &self.safesearch,
            self.timelimit.as_deref().unwrap_or(""),
            &max_results,
        ];

        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part.as_bytes());
            hasher.update(&[0x1f]);
        }
        hasher.finalize().to_hex().to_string()
    }
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub items: Vec<Value>,
    pub duration_ms: u64,
    pub cache_hit: bool,
    pub backend: String,
    pub region: String,
    pub category: String,
}

#[derive(Debug, Deserialize)]
struct SearxResponse {
    #[serde(default)]
    results: Vec<Value>,
}

pub struct SearchClient {
    base_url: String,
    http_client: reqwest::Client,
    cache: Option<Cache<String, SearchResult>>,
}

impl SearchClient {
    pub fn new(settings: &SearchSettings) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_seconds))
            .danger_accept_invalid_certs(!settings.verify_ssl);
        if let Some(proxy) = &settings.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        let cache = (settings.cache_ttl_seconds > 0 && settings.cache_maxsize > 0).then(|| {
            Cache::builder()
                .max_capacity(settings.cache_maxsize)
                .time_to_live(Duration::from_secs(settings.cache_ttl_seconds))
                .build()
        });

        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            http_client: builder.build()?,
            cache,
        })
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<SearchResult, SearchError> {
        if !CATEGORIES.contains(&query.category.as_str()) {
            return Err(SearchError::UnsupportedCategory(query.category.clone()));
        }

        let started = Instant::now();
        let key = query.cache_key();
        if let Some(cache) = &self.cache {
            if let Some(mut cached) = cache.get(&key).await {
                info!(query = %query.query, backend = %cached.backend, "Search cache hit");
                cached.cache_hit = true;
                cached.duration_ms = started.elapsed().as_millis() as u64;
                return Ok(cached);
            }
        }

        let raw = self.fetch(query).await?;
        let duration_ms = started.elapsed().as_millis() as u64;

        let items: Vec<Value> = raw
            .into_iter()
            .take(query.max_results as usize)
            .enumerate()
            .map(|(idx, item)| annotate(item, idx + 1, query))
            .collect();

        info!(
            query = %query.query,
            category = %query.category,
            result_count = items.len(),
            duration_ms,
            "Search completed"
        );

        let result = SearchResult {
            items,
            duration_ms,
            cache_hit: false,
            backend: query.backend.clone(),
            region: query.region.clone(),
            category: query.category.clone(),
        };
        if let Some(cache) = &self.cache {
            cache.insert(key, result.clone()).await;
        }
        Ok(result)
    }

    async fn fetch(&self, query: &SearchQuery) -> Result<Vec<Value>, SearchError> {
        let mut params: Vec<(&str, String)> = vec![
            ("q", query.query.clone()),
            ("format", "json".to_string()),
            ("categories", searx_category(&query.category).to_string()),
            ("language", query.region.clone()),
            ("safesearch", searx_safesearch(&query.safesearch).to_string()),
        ];
        if let Some(range) = query.timelimit.as_deref().and_then(searx_time_range) {
            params.push(("time_range", range.to_string()));
        }
        if query.backend != "auto" {
            params.push(("engines", query.backend.clone()));
        }

        let url = format!("{}/search", self.base_url);
        debug!(url = %url, query = %query.query, "Sending search request");
        let response = self
            .http_client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(SearchError::Http(format!("status {}", status)));
        }
        let body: SearxResponse = response
            .json()
            .await
            .map_err(|e| SearchError::Decode(e.to_string()))?;
        Ok(body.results)
    }
}

fn classify(err: reqwest::Error) -> SearchError {
    if err.is_timeout() {
        SearchError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() || err.is_status() {
        SearchError::Http(err.to_string())
    } else {
        SearchError::Unexpected(err.to_string())
    }
}

fn annotate(mut item: Value, rank: usize, query: &SearchQuery) -> Value {
    if let Value::Object(map) = &mut item {
        map.entry("_rank").or_insert(json!(rank));
        map.entry("_backend").or_insert(json!(query.backend));
        map.entry("_category").or_insert(json!(query.category));
        map.entry("_region").or_insert(json!(query.region));
        map.entry("_query").or_insert(json!(query.query));
    }
    item
}

fn searx_category(category: &str) -> &'static str {
    match category {
        "images" => "images",
        "news" => "news",
        "videos" => "videos",
        "books" => "books",
        _ => "general",
    }
}

fn searx_safesearch(level: &str) -> u8 {
    match level {
        "off" => 0,
        "strict" | "on" => 2,
        _ => 1,
    }
}

fn searx_time_range(limit: &str) -> Option<&'static str> {
    match limit {
        "d" | "day" => Some("day"),
        "w" | "week" => Some("week"),
        "m" | "month" => Some("month"),
        "y" | "year" => Some("year"),
        _ => None,
    }
}

/// The `search_web` tool.
pub struct WebSearchTool {
    client: std::sync::Arc<SearchClient>,
    defaults: SearchSettings,
}

impl WebSearchTool {
    pub fn new(client: std::sync::Arc<SearchClient>, defaults: SearchSettings) -> Self {
        Self { client, defaults }
    }

    fn build_query(&self, input: &Value) -> SearchQuery {
        let text = |key: &str| {
            input
                .get(key)
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        let max_results = input
            .get("max_results")
            .and_then(Value::as_u64)
            .map(|n| n.clamp(1, self.defaults.max_results.max(1) as u64) as u32)
            .unwrap_or(self.defaults.max_results);

        SearchQuery {
            query: text("query").unwrap_or_default(),
            category: text("category")
                .map(|c| c.to_lowercase())
                .unwrap_or_else(|| self.defaults.default_category.clone()),
            backend: self.defaults.default_backend.clone(),
            region: text("region").unwrap_or_else(|| self.defaults.default_region.clone()),
            safesearch: text("safesearch")
                .map(|s| s.to_lowercase())
                .unwrap_or_else(|| self.defaults.default_safesearch.clone()),
            timelimit: text("timelimit").or_else(|| self.defaults.default_timelimit.clone()),
            max_results,
        }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "search_web"
    }

    fn description(&self) -> &str {
        "Search the web for current information, news, facts, or any knowledge that requires up-to-date data. Use this when you need real-time information or recent events."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Detailed search query. Be specific about what information you need."},
                "category": {"type": "string", "enum": CATEGORIES, "description": "Result category. Defaults to text."},
                "region": {"type": "string", "description": "Region code such as us-en or de-de."},
                "safesearch": {"type": "string", "enum": ["on", "moderate", "off"]},
                "timelimit": {"type": "string", "enum": ["d", "w", "m", "y"], "description": "Restrict results to the last day, week, month or year."},
                "max_results": {"type": "integer", "minimum": 1}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: Value, _ctx: &ToolContext) -> Result<Value, ToolError> {
        let query = self.build_query(&input);
        if query.query.is_empty() {
            return Ok(json!({"success": false, "error": "Search query cannot be empty"}));
        }

        match self.client.search(&query).await {
            Ok(result) => Ok(json!({
                "success": true,
                "query": query.query,
                "result_count": result.items.len(),
                "results": result.items,
                "cache_hit": result.cache_hit,
                "duration_ms": result.duration_ms,
                "backend": result.backend,
                "region": result.region,
                "category": result.category,
            })),
            Err(err) => Ok(json!({
                "success": false,
                "query": query.query,
                "error": err.to_string(),
                "error_code": err.code(),
                "message": "Search is unavailable. Answer from existing knowledge or tell the user search failed.",
            })),
        }
    }
}
