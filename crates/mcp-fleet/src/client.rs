//! Thin HTTP client for the control plane, used by the CLI verbs.

use anyhow::{Context, Result};
use serde_json::Value;

fn base_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}")
}

/// GET an endpoint and pretty-print the JSON body.
pub async fn print_json(port: u16, path: &str) -> Result<()> {
    let url = format!("{}/{path}", base_url(port));
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("could not connect to {url} (is the server running?)"))?;
    let body: Value = response
        .json()
        .await
        .context("control plane returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

/// POST an endpoint, failing on connection errors or non-2xx responses.
pub async fn post(port: u16, path: &str) -> Result<()> {
    let url = format!("{}/{path}", base_url(port));
    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .with_context(|| format!("could not connect to {url} (is the server running?)"))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("{url} failed: {status} {body}");
    }
    Ok(())
}
