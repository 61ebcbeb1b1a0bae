//! Provider-agnostic access to the remote model.

use std::collections::HashSet;
use std::future::poll_fn;
use std::pin::{Pin, pin};
use std::sync::Arc;
use std::time::Duration;

use backoff::ExponentialBackoffBuilder;
use parley_model::{
    ErrorKind, ModelFinishReason, ModelMessage, ModelProvider,
    ModelProviderError, ModelRequest, ModelResponse, ModelResponseEvent,
    ModelTool, ToolCallRequest,
};
use tracing::Instrument;

use crate::conversation::{InvocationRequest, Turn};

type SendRequestResult = Result<FoldedResponse, Box<dyn ModelProviderError>>;
type BoxedSendRequestFuture =
    Pin<Box<dyn Future<Output = SendRequestResult> + Send>>;
type HandlerFn = Arc<dyn Fn(&ModelRequest) -> BoxedSendRequestFuture + Send + Sync>;

/// The parsed outcome of one model call.
#[derive(Clone, Debug, PartialEq)]
pub enum GatewayResponse {
    /// The model answered.
    FinalAnswer(String),
    /// The model wants these tools to be invoked, in emission order.
    ToolRequests(Vec<InvocationRequest>),
}

/// Failures of a model call.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Transport failure, non-success status or timeout.
    #[error("model unavailable: {0}")]
    Unavailable(String),
    /// The response could not be understood.
    #[error("model protocol error: {0}")]
    Protocol(String),
}

/// A wrapper around a model provider that turns a conversation snapshot
/// into a [`GatewayResponse`].
///
/// The gateway is stateless between calls, everything the model sees comes
/// from the snapshot it is given.
#[derive(Clone)]
pub struct Gateway {
    handler_fn: HandlerFn,
    system_prompt: Option<Arc<str>>,
    timeout: Duration,
}

impl Gateway {
    /// Creates a gateway for the given provider.
    pub fn new<P: ModelProvider + 'static>(
        provider: P,
        system_prompt: Option<String>,
        timeout: Duration,
    ) -> Self {
        // We have to erase the type `P`, since `Gateway` doesn't have a
        // generic parameter and we don't want it either.
        let handler_fn: HandlerFn = Arc::new(move |req: &ModelRequest| {
            let fut = provider.send_request(req);
            Box::pin(
                async move {
                    let resp_or_err = fut.await;
                    fold_response::<P>(resp_or_err).await
                }
                .instrument(trace_span!("model request")),
            )
        });
        Self {
            handler_fn,
            system_prompt: system_prompt
                .filter(|prompt| !prompt.trim().is_empty())
                .map(Arc::from),
            timeout,
        }
    }

    /// Sends the transcript and tool definitions to the model.
    ///
    /// Rate limited calls are retried with exponential backoff, all retries
    /// share one deadline of the configured timeout.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe. The response stops streaming when this
    /// operation is cancelled.
    pub async fn complete(
        &self,
        snapshot: &[Turn],
        tools: Vec<ModelTool>,
        model: &str,
        iterations_left: usize,
    ) -> Result<GatewayResponse, GatewayError> {
        let request = self.build_request(snapshot, tools, model);
        let span = debug_span!(
            "model call",
            model = %request.model,
            turns = snapshot.len(),
            iterations_left,
        );

        let folded = async {
            let backoff = ExponentialBackoffBuilder::new()
                .with_initial_interval(Duration::from_millis(500))
                .with_max_elapsed_time(Some(self.timeout))
                .build();
            let attempt = || {
                let fut = (self.handler_fn)(&request);
                async move {
                    fut.await.map_err(|err| {
                        if err.kind().is_transient() {
                            warn!("model call rate limited, retrying: {err}");
                            backoff::Error::transient(err)
                        } else {
                            backoff::Error::permanent(err)
                        }
                    })
                }
            };
            tokio::time::timeout(self.timeout, backoff::future::retry(backoff, attempt))
                .await
        }
        .instrument(span)
        .await;

        let folded = match folded {
            Ok(Ok(folded)) => folded,
            Ok(Err(err)) => {
                error!("model call failed: {err}");
                return Err(match err.kind() {
                    ErrorKind::Protocol => GatewayError::Protocol(err.to_string()),
                    ErrorKind::Unavailable | ErrorKind::RateLimitExceeded => {
                        GatewayError::Unavailable(err.to_string())
                    }
                });
            }
            Err(_) => {
                error!("model call timed out");
                return Err(GatewayError::Unavailable(format!(
                    "timed out after {:?}",
                    self.timeout
                )));
            }
        };
        folded.into_gateway_response()
    }

    fn build_request(
        &self,
        snapshot: &[Turn],
        tools: Vec<ModelTool>,
        model: &str,
    ) -> ModelRequest {
        let mut messages = Vec::with_capacity(snapshot.len() + 1);
        if let Some(prompt) = &self.system_prompt {
            messages.push(ModelMessage::System(prompt.to_string()));
        }
        messages.extend(snapshot.iter().map(Turn::to_model_message));
        ModelRequest {
            model: model.to_owned(),
            messages,
            tools,
        }
    }
}

/// A completely received response from the model.
#[derive(Debug, Default)]
struct FoldedResponse {
    transcript: String,
    tool_calls: Vec<ToolCallRequest>,
    finish_reason: Option<ModelFinishReason>,
}

impl FoldedResponse {
    fn into_gateway_response(self) -> Result<GatewayResponse, GatewayError> {
        let protocol_err = |reason: &str| Err(GatewayError::Protocol(reason.to_owned()));

        if self.tool_calls.is_empty() {
            return match self.finish_reason {
                None => protocol_err("response ended without a finish reason"),
                Some(ModelFinishReason::ToolCalls) => {
                    protocol_err("tool calls announced but none received")
                }
                Some(ModelFinishReason::Stop) if self.transcript.trim().is_empty() => {
                    protocol_err("empty answer")
                }
                Some(ModelFinishReason::Stop) => {
                    Ok(GatewayResponse::FinalAnswer(self.transcript))
                }
            };
        }

        if !self.transcript.is_empty() {
            debug!("dropping text sent along with tool calls: {}", self.transcript);
        }
        let mut ids = HashSet::with_capacity(self.tool_calls.len());
        for call in &self.tool_calls {
            if call.id.is_empty() || call.name.is_empty() {
                return protocol_err("tool call without id or name");
            }
            if !ids.insert(call.id.as_str()) {
                return protocol_err("duplicate tool call id");
            }
        }
        Ok(GatewayResponse::ToolRequests(
            self.tool_calls.into_iter().map(Into::into).collect(),
        ))
    }
}

async fn fold_response<P: ModelProvider + 'static>(
    resp_or_err: Result<P::Response, P::Error>,
) -> SendRequestResult {
    let resp = match resp_or_err {
        Ok(resp) => resp,
        Err(err) => {
            debug!("got an error: {err:?}");
            return Err(Box::new(err));
        }
    };

    trace!("start receiving events");

    let mut folded = FoldedResponse::default();
    let mut pinned_resp = pin!(resp);
    loop {
        let event_or_err =
            poll_fn(|cx| pinned_resp.as_mut().poll_next_event(cx)).await;
        let event = match event_or_err {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(err) => {
                debug!("got an error: {err:?}");
                return Err(Box::new(err));
            }
        };
        trace!("got an event: {event:?}");

        match event {
            ModelResponseEvent::MessageDelta(msg) => {
                folded.transcript.push_str(&msg);
            }
            ModelResponseEvent::ToolCall(req) => {
                folded.tool_calls.push(req);
            }
            ModelResponseEvent::Completed(reason) => {
                folded.finish_reason = Some(reason);
            }
        }
    }

    trace!("finished a request");
    Ok(folded)
}

#[cfg(test)]
mod tests {
    use parley_test_model::{PresetEvent, PresetResponse, TestModelProvider};
    use serde_json::json;

    use super::*;
    use crate::conversation::TurnPayload;
    use crate::store::ConversationStore;

    const TIMEOUT: Duration = Duration::from_secs(60);

    async fn user_snapshot(text: &str) -> Arc<[Turn]> {
        let store = ConversationStore::new();
        let mut thread = store.lock(&"test".into()).await;
        thread.append(TurnPayload::user(text));
        thread.snapshot()
    }

    fn call(id: &str, name: &str) -> PresetEvent {
        PresetEvent::ToolCall(ToolCallRequest {
            id: id.to_owned(),
            name: name.to_owned(),
            arguments: json!({ "location": "Pittsburgh" }),
            unparsed_arguments: None,
        })
    }

    #[tokio::test]
    async fn test_final_answer_and_request_shape() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::with_events([
            PresetEvent::MessageDelta("Hello".to_owned()),
            PresetEvent::MessageDelta(" there".to_owned()),
        ]));
        let gateway = Gateway::new(provider.clone(), Some("Be nice.".to_owned()), TIMEOUT);

        let tools = vec![ModelTool {
            name: "get_weather".to_owned(),
            description: "Weather".to_owned(),
            parameters: json!({}),
        }];
        let snapshot = user_snapshot("Hi").await;
        let resp = gateway.complete(&snapshot, tools.clone(), "m", 3).await.unwrap();
        assert_eq!(resp, GatewayResponse::FinalAnswer("Hello there".to_owned()));

        let requests = provider.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(
            requests[0],
            ModelRequest {
                model: "m".to_owned(),
                messages: vec![
                    ModelMessage::System("Be nice.".to_owned()),
                    ModelMessage::User("Hi".to_owned()),
                ],
                tools,
            }
        );
    }

    #[tokio::test]
    async fn test_parallel_tool_requests() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::with_events([
            PresetEvent::MessageDelta("Let me check.".to_owned()),
            call("1", "get_weather"),
            call("2", "get_time"),
        ]));
        let gateway = Gateway::new(provider, None, TIMEOUT);

        let snapshot = user_snapshot("Weather and time?").await;
        let GatewayResponse::ToolRequests(requests) =
            gateway.complete(&snapshot, vec![], "m", 1).await.unwrap()
        else {
            unreachable!("expected tool requests");
        };
        let names: Vec<_> = requests.iter().map(|r| r.tool_name.as_str()).collect();
        assert_eq!(names, ["get_weather", "get_time"]);
        assert_eq!(requests[0].id, "1");
    }

    #[tokio::test]
    async fn test_protocol_errors() {
        let cases = [
            PresetResponse::text("").with_finish_reason(ModelFinishReason::ToolCalls),
            PresetResponse::with_events([call("1", "a"), call("1", "b")]),
            PresetResponse::with_events([call("", "a")]),
            PresetResponse::text("  "),
        ];
        let snapshot = user_snapshot("Hi").await;
        for case in cases {
            let mut provider = TestModelProvider::default();
            provider.add_response(case);
            let gateway = Gateway::new(provider, None, TIMEOUT);
            let err = gateway.complete(&snapshot, vec![], "m", 1).await.unwrap_err();
            assert!(matches!(err, GatewayError::Protocol(_)), "{err:?}");
        }

        // Provider protocol failures keep their kind.
        let gateway = Gateway::new(TestModelProvider::default(), None, TIMEOUT);
        let err = gateway.complete(&snapshot, vec![], "m", 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_is_retried() {
        let mut provider = TestModelProvider::default();
        provider.add_response(
            PresetResponse::text("finally")
                .with_failures(3)
                .with_failure_kind(ErrorKind::RateLimitExceeded),
        );
        let gateway = Gateway::new(provider.clone(), None, TIMEOUT);

        let snapshot = user_snapshot("Hi").await;
        let resp = gateway.complete(&snapshot, vec![], "m", 1).await.unwrap();
        assert_eq!(resp, GatewayResponse::FinalAnswer("finally".to_owned()));
        assert_eq!(provider.requests().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_is_not_retried() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::text("never").with_failures(1));
        let gateway = Gateway::new(provider.clone(), None, TIMEOUT);

        let snapshot = user_snapshot("Hi").await;
        let err = gateway.complete(&snapshot, vec![], "m", 1).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)));
        assert_eq!(provider.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let mut provider = TestModelProvider::default();
        provider.set_delay(Duration::from_secs(120));
        provider.add_response(PresetResponse::text("too late"));
        let gateway = Gateway::new(provider, None, TIMEOUT);

        let snapshot = user_snapshot("Hi").await;
        let err = gateway.complete(&snapshot, vec![], "m", 1).await.unwrap_err();
        assert_eq!(err, GatewayError::Unavailable("timed out after 60s".to_owned()));
    }
}
