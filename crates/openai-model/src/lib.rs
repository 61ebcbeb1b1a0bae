//! A model provider for OpenAI-compatible chat completion APIs, such as
//! OpenRouter.

#[macro_use]
extern crate tracing;

mod config;
mod io;
mod proto;
mod response;

use std::error::Error as StdError;
use std::fmt::{self, Display};
use std::sync::Arc;

use mime::Mime;
use parley_model::{
    ErrorKind, ModelProvider, ModelProviderError, ModelRequest,
};
use reqwest::{Client, RequestBuilder, StatusCode, header};

pub use config::{
    DEFAULT_BASE_URL, DEFAULT_MODEL, OpenAIConfig, OpenAIConfigBuilder,
};
use io::{Chunks, Sse};
pub use response::OpenAIResponse;

/// Error type for [`OpenAIProvider`].
#[derive(Debug)]
pub struct Error {
    message: String,
    kind: ErrorKind,
}

impl Error {
    fn new(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    /// Returns the error message.
    #[inline]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl StdError for Error {}

impl ModelProviderError for Error {
    #[inline]
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

/// OpenAI-compatible model provider.
#[derive(Clone, Debug)]
pub struct OpenAIProvider {
    client: Client,
    config: Arc<OpenAIConfig>,
}

impl OpenAIProvider {
    /// Creates a new `OpenAIProvider` with the given configuration.
    #[inline]
    pub fn new(config: OpenAIConfig) -> Self {
        Self {
            client: Client::new(),
            config: Arc::new(config),
        }
    }

    /// Returns the configuration of this provider.
    #[inline]
    pub fn config(&self) -> &OpenAIConfig {
        &self.config
    }
}

impl ModelProvider for OpenAIProvider {
    type Error = Error;
    type Response = OpenAIResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        let openai_req = proto::create_request(req, &self.config);
        debug!(
            model = %effective_model(req, &self.config),
            messages = req.messages.len(),
            tools = req.tools.len(),
            "sending chat completion request"
        );
        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .header(header::ACCEPT, "text/event-stream")
            .json(&openai_req);
        for (name, value) in &self.config.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        open_stream(builder)
    }
}

fn effective_model<'a>(req: &'a ModelRequest, config: &'a OpenAIConfig) -> &'a str {
    if req.model.is_empty() {
        config.model()
    } else {
        &req.model
    }
}

async fn open_stream(builder: RequestBuilder) -> Result<OpenAIResponse, Error> {
    let resp = builder.send().await.map_err(|err| {
        Error::new(format!("request failed: {err}"), ErrorKind::Unavailable)
    })?;

    let status = resp.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::new("too many requests", ErrorKind::RateLimitExceeded));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        warn!(%status, "chat completion request rejected");
        return Err(Error::new(
            format!("unexpected status {status}: {body}"),
            ErrorKind::Unavailable,
        ));
    }

    let content_type = resp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let is_event_stream = content_type
        .and_then(|v| v.parse::<Mime>().ok())
        .is_some_and(|m| m.essence_str() == "text/event-stream");
    if !is_event_stream {
        return Err(Error::new(
            format!("unexpected content type: {content_type:?}"),
            ErrorKind::Protocol,
        ));
    }

    // Here we got a successful response.
    let chunks = Chunks::from_response(resp);
    let sse = Sse::new(chunks);
    Ok(OpenAIResponse::from_sse(sse))
}
