use std::time::Duration;

use anyhow::Context;
use playsync_proto::config::ClientConfig;
use playsync_proto::protocol::{CastRequest, ItemRef, MediaPage, PlayMode, PlayRequest};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::controller::ItemLauncher;
use crate::transport::HealthProbe;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Plain HTTP side of the hub: health, media listing and play requests.
#[derive(Clone)]
pub struct HubApi {
    http: Client,
    base_url: String,
    probe_timeout: Duration,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl HubApi {
    pub fn new(base_url: &str, probe_timeout: Duration) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(probe_timeout)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            probe_timeout,
        })
    }

    pub fn from_config(config: &ClientConfig) -> anyhow::Result<Self> {
        Self::new(&config.server_url, config.probe_timeout())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn list_media(
        &self,
        query: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<MediaPage> {
        let mut params = vec![
            ("offset", offset.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            params.push(("q", q.to_string()));
        }
        let response = self
            .http
            .get(self.url("/media"))
            .query(&params)
            .send()
            .await
            .context("media listing request failed")?;
        let response = error_for_status(response).await?;
        Ok(response.json::<MediaPage>().await?)
    }

    pub async fn play(&self, item: &ItemRef) -> anyhow::Result<()> {
        self.play_many(&PlayRequest::single(item.clone())).await
    }

    /// Hand several items to the player's own playlist in one request.
    pub async fn play_many(&self, request: &PlayRequest) -> anyhow::Result<()> {
        debug!(
            "api: play {} item(s), mode {:?}",
            request.items.len(),
            request.mode
        );
        self.post("/play", request).await
    }

    pub async fn cast_url(&self, url: &str, mode: PlayMode) -> anyhow::Result<()> {
        debug!("api: cast {} ({:?})", url, mode);
        let request = CastRequest {
            url: url.to_string(),
            mode,
        };
        self.post("/cast/url", &request).await
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> anyhow::Result<()> {
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .with_context(|| format!("request to {} failed", path))?;
        error_for_status(response).await?;
        Ok(())
    }
}

async fn error_for_status(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => status.to_string(),
    };
    anyhow::bail!("hub returned {}: {}", status.as_u16(), message)
}

impl HealthProbe for HubApi {
    async fn check(&self) -> bool {
        let result = self
            .http
            .get(self.url("/health"))
            .timeout(self.probe_timeout)
            .send()
            .await;
        match result {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("api: health probe failed: {}", e);
                false
            }
        }
    }
}

impl ItemLauncher for HubApi {
    async fn launch(&self, item: &ItemRef) -> anyhow::Result<()> {
        self.play(item).await
    }
}
