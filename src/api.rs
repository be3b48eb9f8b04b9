// Control API client: connection feed and connection management

use crate::config::{ControllerInfo, Transport};
use crate::stream::SnapshotStream;
use anyhow::{Context, Result};
use reqwest::{RequestBuilder, Url};
use std::time::Duration;
#[cfg(feature = "transport-websocket")]
use tokio_tungstenite::tungstenite;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ControlClient {
    http: reqwest::Client,
    controller: ControllerInfo,
}

impl ControlClient {
    pub fn new(controller: ControllerInfo) -> Result<Self> {
        // No overall timeout: the connection feed is a long-lived response
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self { http, controller })
    }

    pub fn base_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.controller.hostname, self.controller.port
        )
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        let url = format!("{}/{}", self.base_url(), path.trim_start_matches('/'));
        Url::parse(&url).context(format!("Invalid controller URL: {}", url))
    }

    /// Websocket feed URL; browsers cannot set headers there, so the secret
    /// travels as a query parameter
    pub fn websocket_url(&self) -> Result<Url> {
        let mut url = self.endpoint("connections")?;
        url.set_scheme("ws")
            .map_err(|_| anyhow::anyhow!("Cannot use ws scheme for {}", url))?;
        if !self.controller.secret.is_empty() {
            url.query_pairs_mut()
                .append_pair("token", &self.controller.secret);
        }
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.controller.secret.is_empty() {
            request
        } else {
            request.bearer_auth(&self.controller.secret)
        }
    }

    /// Open the connection feed; call `start` on it once listeners are registered
    pub async fn open_snapshot_stream(&self, transport: Transport) -> Result<SnapshotStream> {
        match transport {
            Transport::Http => self.open_http_stream().await,
            Transport::Websocket => self.open_websocket_stream().await,
        }
    }

    async fn open_http_stream(&self) -> Result<SnapshotStream> {
        let url = self.endpoint("connections")?;
        log::info!("Opening connection feed at {}", url);

        let response = self
            .authorize(self.http.get(url.clone()))
            .send()
            .await
            .context(format!("Failed to reach controller at {}", url))?
            .error_for_status()
            .context("Controller rejected the connection feed request")?;

        Ok(SnapshotStream::from_bytes(response.bytes_stream()))
    }

    #[cfg(feature = "transport-websocket")]
    async fn open_websocket_stream(&self) -> Result<SnapshotStream> {
        use futures_util::StreamExt;

        let url = self.websocket_url()?;
        log::info!(
            "Opening websocket connection feed at ws://{}:{}/connections",
            self.controller.hostname,
            self.controller.port
        );

        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .context("Failed to open websocket connection feed")?;

        let frames = socket.filter_map(|message| async move { websocket_frame(message) });

        Ok(SnapshotStream::from_frames(frames))
    }

    #[cfg(not(feature = "transport-websocket"))]
    async fn open_websocket_stream(&self) -> Result<SnapshotStream> {
        Err(anyhow::anyhow!(
            "Websocket transport not compiled in (enable the transport-websocket feature)"
        ))
    }

    /// Ask the daemon to close every active connection
    pub async fn close_all_connections(&self) -> Result<()> {
        let url = self.endpoint("connections")?;
        self.delete(url).await
    }

    pub async fn close_connection(&self, id: &str) -> Result<()> {
        let mut url = self.endpoint("connections")?;
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("Controller URL cannot have a path"))?
            .push(id);
        self.delete(url).await
    }

    async fn delete(&self, url: Url) -> Result<()> {
        log::debug!("DELETE {}", url);
        self.authorize(self.http.delete(url.clone()))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context(format!("Failed to reach controller at {}", url))?
            .error_for_status()
            .context(format!("Controller rejected DELETE {}", url.path()))?;
        Ok(())
    }
}

/// Text and binary messages carry one snapshot each; control frames are dropped
#[cfg(feature = "transport-websocket")]
fn websocket_frame(
    message: Result<tungstenite::Message, tungstenite::Error>,
) -> Option<Result<Vec<u8>, tungstenite::Error>> {
    use tungstenite::Message;

    match message {
        Ok(Message::Text(text)) => Some(Ok(text.into_bytes())),
        Ok(Message::Binary(data)) => Some(Ok(data)),
        Ok(_) => None,
        Err(e) => Some(Err(e)),
    }
}
