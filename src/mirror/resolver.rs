//! Download link discovery
//!
//! The provider publishes each dataset under a new URL. The current one is
//! scraped from a landing page, so the selector below is tied to that page's
//! markup and is expected to change when the layout does.

use async_trait::async_trait;
use reqwest::{Client, Url};
use scraper::{Html, Selector};
use tracing::debug;

use super::types::MirrorError;

/// Anchor inside the download confirmation block
pub const DOWNLOAD_LINK_SELECTOR: &str = r#"div[class="link-align"] a"#;

/// Finds the current dataset download URL for a discovery page
#[async_trait]
pub trait DownloadUrlResolver: Send + Sync {
    async fn resolve_download_url(&self, discovery_url: &str) -> Result<String, MirrorError>;
}

/// Resolver that fetches the discovery page and reads an anchor's `href`
pub struct HtmlAnchorResolver {
    http_client: Client,
    selector: String,
}

impl HtmlAnchorResolver {
    pub fn new(http_client: Client) -> Self {
        Self {
            http_client,
            selector: DOWNLOAD_LINK_SELECTOR.to_string(),
        }
    }

    /// Override the CSS selector used to locate the anchor
    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = selector.into();
        self
    }
}

#[async_trait]
impl DownloadUrlResolver for HtmlAnchorResolver {
    async fn resolve_download_url(&self, discovery_url: &str) -> Result<String, MirrorError> {
        debug!(url = %discovery_url, "Fetching discovery page");

        let response = self.http_client.get(discovery_url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MirrorError::Sync {
                status: Some(status.as_u16()),
                message: format!("discovery page {} returned {}", discovery_url, status),
            });
        }

        // Redirects are followed, so relative links resolve against the final URL
        let page_url = response.url().to_string();
        let body = response.text().await?;

        let url = extract_download_url(&body, &page_url, &self.selector)?;
        debug!(url = %url, "Resolved dataset download URL");
        Ok(url)
    }
}

/// Extract the first matching anchor's `href` as an absolute URL
pub fn extract_download_url(
    html: &str,
    page_url: &str,
    selector: &str,
) -> Result<String, MirrorError> {
    let resolution_error = |message: String| MirrorError::Resolution {
        url: page_url.to_string(),
        message,
    };

    let selector = Selector::parse(selector)
        .map_err(|e| resolution_error(format!("invalid selector {:?}: {}", selector, e)))?;

    let document = Html::parse_document(html);
    let anchor = document
        .select(&selector)
        .next()
        .ok_or_else(|| resolution_error("download link not found in page".to_string()))?;

    let href = anchor
        .value()
        .attr("href")
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| resolution_error("download link has no href".to_string()))?;

    let base = Url::parse(page_url)
        .map_err(|e| resolution_error(format!("invalid page URL: {}", e)))?;
    let absolute = base
        .join(href)
        .map_err(|e| resolution_error(format!("invalid href {:?}: {}", href, e)))?;

    Ok(absolute.to_string())
}
