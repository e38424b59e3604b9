use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, IntoUrl, RequestBuilder, Response, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{debug, instrument};

use relay_core::errors::TransportError;
use relay_core::events::EventStream;
use relay_core::ids::ActionId;
use relay_core::request::{ActionResolution, ChatRequest};
use relay_core::transport::{ActionBackend, ChatTransport};
use relay_stream::event_stream;

pub const DEFAULT_CHAT_PATH: &str = "/api/chat/stream";
pub const DEFAULT_ACTIONS_PATH: &str = "/api/chat/actions";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct ClientConfig {
    pub base_url: String,
    pub chat_path: String,
    pub actions_path: String,
    pub api_token: Option<SecretString>,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            chat_path: DEFAULT_CHAT_PATH.to_owned(),
            actions_path: DEFAULT_ACTIONS_PATH.to_owned(),
            api_token: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_token(mut self, token: SecretString) -> Self {
        self.api_token = Some(token);
        self
    }
}

#[derive(Serialize)]
struct RejectBody<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
}

/// Chat transport and action backend over HTTP.
///
/// No read timeout is set on the stream: a turn lasts as long as the server
/// keeps it open, and the caller cancels it.
pub struct HttpTransport {
    client: Client,
    config: ClientConfig,
}

impl HttpTransport {
    pub fn new(config: ClientConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| TransportError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn chat_url(&self) -> String {
        self.url(&self.config.chat_path)
    }

    /// `{actions_path}/{id}/{verb}`, with the id percent-encoded as a single
    /// path segment.
    fn action_url(&self, id: &ActionId, verb: &str) -> Result<Url, TransportError> {
        let base = self.url(&self.config.actions_path);
        let mut url = Url::parse(&base)
            .map_err(|e| TransportError::InvalidRequest(format!("bad actions URL {base:?}: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| TransportError::InvalidRequest(format!("actions URL {base:?} cannot take a path")))?
            .pop_if_empty()
            .push(id.as_str())
            .push(verb);
        Ok(url)
    }

    fn post(&self, url: impl IntoUrl) -> RequestBuilder {
        let req = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json");
        match &self.config.api_token {
            Some(token) => req.bearer_auth(token.expose_secret()),
            None => req,
        }
    }

    async fn resolve<B: Serialize + ?Sized>(
        &self,
        id: &ActionId,
        verb: &str,
        body: &B,
    ) -> Result<ActionResolution, TransportError> {
        let resp = self
            .post(self.action_url(id, verb)?)
            .header(ACCEPT, "application/json")
            .json(body)
            .send()
            .await
            .map_err(network)?;
        let resp = check_status(resp).await?;
        let resolution: ActionResolution = resp
            .json()
            .await
            .map_err(|e| TransportError::Network(format!("malformed resolution body: {e}")))?;
        debug!(success = resolution.success, "action {verb} answered");
        Ok(resolution)
    }
}

fn network(e: reqwest::Error) -> TransportError {
    TransportError::Network(e.to_string())
}

async fn check_status(resp: Response) -> Result<Response, TransportError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = resp.text().await.unwrap_or_default();
    Err(match TransportError::from_status(status, body) {
        TransportError::RateLimited { .. } => TransportError::RateLimited { retry_after },
        other => other,
    })
}

#[async_trait]
impl ChatTransport for HttpTransport {
    #[instrument(skip_all, fields(url = %self.chat_url(), history = request.messages.len()))]
    async fn open_stream(&self, request: &ChatRequest) -> Result<EventStream, TransportError> {
        let resp = self
            .post(self.chat_url())
            .header(ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(network)?;
        let resp = check_status(resp).await?;
        debug!(status = resp.status().as_u16(), "chat stream opened");
        Ok(event_stream(resp.bytes_stream()))
    }
}

#[async_trait]
impl ActionBackend for HttpTransport {
    #[instrument(skip(self, id), fields(action_id = %id))]
    async fn approve(&self, id: &ActionId) -> Result<ActionResolution, TransportError> {
        self.resolve(id, "approve", &serde_json::json!({})).await
    }

    #[instrument(skip(self, id), fields(action_id = %id))]
    async fn reject(
        &self,
        id: &ActionId,
        reason: Option<&str>,
    ) -> Result<ActionResolution, TransportError> {
        self.resolve(id, "reject", &RejectBody { reason }).await
    }
}
