//! Hosted web-search client.
//!
//! Fetches a small set of `{title, snippet}` results for the verbatim
//! query text. Web context is a best-effort enrichment: callers treat
//! any failure here as "omit web results for this turn" rather than
//! failing the turn.

use anyhow::{bail, Result};
use std::time::Duration;

use crate::config::WebSearchConfig;
use crate::models::WebSnippet;

/// Fetch up to `max_results` snippets for a query.
///
/// Requires the `TAVILY_API_KEY` environment variable when the provider
/// is `tavily`. The `disabled` provider is an error so misconfiguration
/// surfaces as a warning instead of silently empty context.
pub async fn fetch_snippets(config: &WebSearchConfig, query: &str) -> Result<Vec<WebSnippet>> {
    match config.provider.as_str() {
        "tavily" => fetch_tavily(config, query).await,
        "disabled" => bail!("Web search provider is disabled"),
        other => bail!("Unknown web search provider: {}", other),
    }
}

async fn fetch_tavily(config: &WebSearchConfig, query: &str) -> Result<Vec<WebSnippet>> {
    let api_key = std::env::var("TAVILY_API_KEY")
        .map_err(|_| anyhow::anyhow!("TAVILY_API_KEY not set"))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let body = serde_json::json!({
        "api_key": api_key,
        "query": query,
        "max_results": config.max_results,
    });

    let response = client
        .post(&config.url)
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        bail!("Web search API error {}: {}", status, body_text);
    }

    let json: serde_json::Value = response.json().await?;
    parse_search_response(&json, config.max_results)
}

/// Parse the search API response into snippets, capped at `max_results`.
fn parse_search_response(json: &serde_json::Value, max_results: usize) -> Result<Vec<WebSnippet>> {
    let results = json
        .get("results")
        .and_then(|r| r.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid search response: missing results array"))?;

    let snippets: Vec<WebSnippet> = results
        .iter()
        .filter_map(|item| {
            let title = item.get("title").and_then(|t| t.as_str())?;
            let content = item.get("content").and_then(|c| c.as_str())?;
            Some(WebSnippet {
                title: title.to_string(),
                snippet: content.to_string(),
            })
        })
        .take(max_results)
        .collect();

    Ok(snippets)
}
