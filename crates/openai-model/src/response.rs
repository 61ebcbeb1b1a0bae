use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use parley_model::{
    ErrorKind, ModelFinishReason, ModelResponse, ModelResponseEvent,
    ToolCallRequest,
};
use pin_project_lite::pin_project;
use serde_json::Value;

use crate::Error;
use crate::io::{Sse, SseError};
use crate::proto::{self, ChatCompletionChunk, Choice, ToolCallDelta};

#[derive(Default)]
struct PartialToolCall {
    index: Option<u32>,
    id: String,
    name: String,
    arguments: String,
}

struct PartialState {
    sse: Sse,
    received_chunk: bool,
    tool_calls: Vec<PartialToolCall>,
    finish_reason: Option<String>,
    // Events ready to be returned. Tool calls are only queued once the
    // stream ends, since their arguments arrive in fragments.
    pending_events: VecDeque<ModelResponseEvent>,
    finished: bool,
}

impl PartialState {
    fn apply(&mut self, choice: Choice) {
        if let Some(content) = choice.delta.content {
            if !content.is_empty() {
                self.pending_events
                    .push_back(ModelResponseEvent::MessageDelta(content));
            }
        }
        for tool_call in choice.delta.tool_calls.into_iter().flatten() {
            self.merge_tool_call(tool_call);
        }
        if let Some(finish_reason) = choice.finish_reason {
            self.finish_reason = Some(finish_reason);
        }
    }

    fn merge_tool_call(&mut self, delta: ToolCallDelta) {
        let existing = match (delta.index, delta.id.as_deref()) {
            (Some(index), _) => {
                self.tool_calls.iter().position(|t| t.index == Some(index))
            }
            (None, Some(id)) if !id.is_empty() => {
                self.tool_calls.iter().position(|t| t.id == id)
            }
            // Fragments without index or id continue the latest call.
            (None, _) => self.tool_calls.len().checked_sub(1),
        };
        let idx = existing.unwrap_or_else(|| {
            self.tool_calls.push(PartialToolCall {
                index: delta.index,
                ..Default::default()
            });
            self.tool_calls.len() - 1
        });
        let partial = &mut self.tool_calls[idx];

        if let Some(id) = delta.id {
            if partial.id.is_empty() {
                partial.id = id;
            }
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                // Some servers repeat the name in every fragment.
                if partial.name != name {
                    partial.name.push_str(&name);
                }
            }
            if let Some(arguments) = function.arguments {
                partial.arguments.push_str(&arguments);
            }
        }
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.finished = true;
        if !self.received_chunk {
            return Err(Error::new("empty response stream", ErrorKind::Protocol));
        }

        // The order of events is important: message deltas are already
        // queued, then come the tool calls, and finally the finish reason.
        let tool_calls = std::mem::take(&mut self.tool_calls);
        let has_tool_calls = !tool_calls.is_empty();
        for tool_call in tool_calls {
            let (arguments, unparsed_arguments) =
                match proto::parse_arguments(&tool_call.arguments) {
                    Ok(arguments) => (arguments, None),
                    Err(err) => {
                        debug!(id = %tool_call.id, "unparsable tool arguments: {err}");
                        (Value::Null, Some(tool_call.arguments))
                    }
                };
            self.pending_events
                .push_back(ModelResponseEvent::ToolCall(ToolCallRequest {
                    id: tool_call.id,
                    name: tool_call.name,
                    arguments,
                    unparsed_arguments,
                }));
        }

        let finish_reason = match self.finish_reason.as_deref() {
            Some("tool_calls") => ModelFinishReason::ToolCalls,
            Some("stop") => ModelFinishReason::Stop,
            Some(reason @ ("length" | "content_filter")) => {
                warn!(reason, "response did not complete");
                let message = if reason == "length" {
                    "response was cut off at the token limit"
                } else {
                    "response was stopped by the content filter"
                };
                return Err(Error::new(message, ErrorKind::Protocol));
            }
            Some(reason) => {
                debug!(reason, "unknown finish reason");
                if has_tool_calls {
                    ModelFinishReason::ToolCalls
                } else {
                    ModelFinishReason::Stop
                }
            }
            None if has_tool_calls => ModelFinishReason::ToolCalls,
            None => ModelFinishReason::Stop,
        };
        self.pending_events
            .push_back(ModelResponseEvent::Completed(finish_reason));
        Ok(())
    }
}

type PinnedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type NextEvent = Result<(Option<ModelResponseEvent>, PartialState), Error>;

pin_project! {
    pub struct OpenAIResponse {
        next_event_fut: Option<PinnedFuture<NextEvent>>,
    }
}

impl OpenAIResponse {
    #[inline]
    pub fn from_sse(sse: Sse) -> Self {
        let partial_state = PartialState {
            sse,
            received_chunk: false,
            tool_calls: Default::default(),
            finish_reason: None,
            pending_events: Default::default(),
            finished: false,
        };
        Self {
            next_event_fut: Some(Box::pin(next_event(partial_state))),
        }
    }
}

impl ModelResponse for OpenAIResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.project();
        let Some(next_event_fut) = this.next_event_fut else {
            return Poll::Ready(Ok(None));
        };
        let (event, partial_state) =
            match ready!(next_event_fut.as_mut().poll(cx)) {
                Ok((Some(event), partial_state)) => (event, partial_state),
                Ok((None, _)) => {
                    *this.next_event_fut = None;
                    return Poll::Ready(Ok(None));
                }
                Err(err) => {
                    *this.next_event_fut = None;
                    return Poll::Ready(Err(err));
                }
            };

        // The stream may still have more data to pull, create a new future for
        // the next event.
        *this.next_event_fut = Some(Box::pin(next_event(partial_state)));

        Poll::Ready(Ok(Some(event)))
    }
}

async fn next_event(mut partial_state: PartialState) -> NextEvent {
    loop {
        if let Some(event) = partial_state.pending_events.pop_front() {
            return Ok((Some(event), partial_state));
        }
        if partial_state.finished {
            return Ok((None, partial_state));
        }

        let sse_event = match partial_state.sse.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => {
                // Some servers close the stream without `[DONE]`.
                partial_state.finish()?;
                continue;
            }
            Err(SseError::ChunksError(err)) => {
                return Err(Error::new(
                    format!("stream interrupted: {:?}", err.0),
                    ErrorKind::Unavailable,
                ));
            }
            Err(SseError::InvalidPayload) => {
                return Err(Error::new(
                    "invalid event stream payload",
                    ErrorKind::Protocol,
                ));
            }
        };
        trace!("got sse event: {sse_event}");
        if sse_event == "[DONE]" {
            partial_state.finish()?;
            continue;
        }

        let chunk = serde_json::from_str::<ChatCompletionChunk>(&sse_event)
            .map_err(|err| {
                Error::new(format!("malformed chunk: {err}"), ErrorKind::Protocol)
            })?;
        if let Some(error) = chunk.error {
            let message = error
                .message
                .unwrap_or_else(|| "upstream error".to_owned());
            return Err(Error::new(message, ErrorKind::Unavailable));
        }
        partial_state.received_chunk = true;

        // Usage-only chunks carry no choices.
        for choice in chunk.choices {
            partial_state.apply(choice);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::pin::pin;

    use bytes::Bytes;
    use serde_json::json;

    use super::*;
    use crate::io::Chunks;

    async fn collect_events(
        payload: &'static [u8],
    ) -> Result<Vec<ModelResponseEvent>, Error> {
        let chunks =
            Chunks::from_vec_deque(vec![Bytes::from_static(payload)].into());
        let mut resp = pin!(OpenAIResponse::from_sse(Sse::new(chunks)));
        let mut events = vec![];
        while let Some(event) =
            poll_fn(|cx| resp.as_mut().poll_next_event(cx)).await?
        {
            events.push(event);
        }
        Ok(events)
    }

    #[tokio::test]
    async fn test_parallel_tool_calls() {
        let events =
            collect_events(include_bytes!("../fixtures/tool_calls_response.txt"))
                .await
                .unwrap();
        assert_eq!(
            events,
            vec![
                ModelResponseEvent::MessageDelta("Let me check.".to_owned()),
                ModelResponseEvent::ToolCall(ToolCallRequest {
                    id: "call_1".to_owned(),
                    name: "get_weather".to_owned(),
                    arguments: json!({ "location": "Pittsburgh" }),
                    unparsed_arguments: None,
                }),
                ModelResponseEvent::ToolCall(ToolCallRequest {
                    id: "call_2".to_owned(),
                    name: "get_weather".to_owned(),
                    arguments: json!({ "location": "Boston" }),
                    unparsed_arguments: None,
                }),
                ModelResponseEvent::Completed(ModelFinishReason::ToolCalls),
            ]
        );
    }

    #[tokio::test]
    async fn test_text_without_done() {
        let events = collect_events(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Sunny, \"}}]}\n\n\
              data: {\"choices\":[{\"delta\":{\"content\":\"72\xC2\xB0F\"},\"finish_reason\":\"stop\"}]}\n\n",
        )
        .await
        .unwrap();
        assert_eq!(
            events,
            vec![
                ModelResponseEvent::MessageDelta("Sunny, ".to_owned()),
                ModelResponseEvent::MessageDelta("72°F".to_owned()),
                ModelResponseEvent::Completed(ModelFinishReason::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn test_error_chunk() {
        let err = collect_events(
            b"data: {\"error\":{\"message\":\"provider overloaded\"}}\n\n",
        )
        .await
        .unwrap_err();
        assert_eq!(err.message(), "provider overloaded");
        assert_eq!(err.kind, ErrorKind::Unavailable);
    }

    #[tokio::test]
    async fn test_malformed_and_empty() {
        let err = collect_events(b"data: {not json}\n\n").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);

        let err = collect_events(b"data: [DONE]\n\n").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_truncated_response() {
        let err = collect_events(
            b"data: {\"choices\":[{\"delta\":{\"content\":\"The forecast for\"},\"finish_reason\":\"length\"}]}\n\n\
              data: [DONE]\n\n",
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
        assert_eq!(err.message(), "response was cut off at the token limit");

        let err = collect_events(
            b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"content_filter\"}]}\n\n",
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_unparsable_arguments_are_kept_verbatim() {
        let events = collect_events(
            b"data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"get_weather\",\"arguments\":\"{\\\"location\\\":\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
        )
        .await
        .unwrap();
        assert_eq!(
            events,
            vec![
                ModelResponseEvent::ToolCall(ToolCallRequest {
                    id: "call_1".to_owned(),
                    name: "get_weather".to_owned(),
                    arguments: Value::Null,
                    unparsed_arguments: Some("{\"location\":".to_owned()),
                }),
                ModelResponseEvent::Completed(ModelFinishReason::ToolCalls),
            ]
        );
    }
}
