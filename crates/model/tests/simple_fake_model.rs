use std::collections::VecDeque;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::future::ready;
use std::pin::Pin;
use std::task::{self, Poll, ready};
use std::time::Duration;

use parley_model::{
    ErrorKind, ModelFinishReason, ModelMessage, ModelProvider,
    ModelProviderError, ModelRequest, ModelResponse, ModelResponseEvent,
    ToolCallRequest,
};
use serde_json::json;
use tokio::time::{Sleep, sleep};

#[derive(Debug)]
struct FakeModelProviderError(ErrorKind);

impl Display for FakeModelProviderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Error for FakeModelProviderError {}

impl ModelProviderError for FakeModelProviderError {
    fn kind(&self) -> ErrorKind {
        self.0
    }
}

/// Echoes the last user message word by word, or asks for the `echo` tool
/// when the message starts with `!`.
#[derive(Debug)]
struct FakeModelResponse {
    fake_events: VecDeque<ModelResponseEvent>,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl FakeModelResponse {
    fn new(input: &str) -> Self {
        let mut fake_events = VecDeque::new();
        if let Some(command) = input.strip_prefix('!') {
            fake_events.push_back(ModelResponseEvent::ToolCall(
                ToolCallRequest {
                    id: "call_0".to_owned(),
                    name: "echo".to_owned(),
                    arguments: json!({ "text": command }),
                    unparsed_arguments: None,
                },
            ));
            fake_events.push_back(ModelResponseEvent::Completed(
                ModelFinishReason::ToolCalls,
            ));
        } else {
            let words: Vec<_> = format!("You said {input}")
                .split(' ')
                .map(ToString::to_string)
                .collect();
            let last = words.len().saturating_sub(1);
            for (idx, mut word) in words.into_iter().enumerate() {
                if idx != last {
                    word.push(' ');
                }
                fake_events.push_back(ModelResponseEvent::MessageDelta(word));
            }
            fake_events
                .push_back(ModelResponseEvent::Completed(ModelFinishReason::Stop));
        }
        Self {
            fake_events,
            sleep: None,
        }
    }
}

impl ModelResponse for FakeModelResponse {
    type Error = FakeModelProviderError;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.get_mut();
        let sleep = this
            .sleep
            .get_or_insert_with(|| Box::pin(sleep(Duration::from_millis(1))));
        ready!(sleep.as_mut().poll(cx));
        this.sleep = None;
        Poll::Ready(Ok(this.fake_events.pop_front()))
    }
}

struct FakeModelProvider;

impl ModelProvider for FakeModelProvider {
    type Error = FakeModelProviderError;
    type Response = FakeModelResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        let last_user = req.messages.iter().rev().find_map(|msg| match msg {
            ModelMessage::User(text) => Some(text.as_str()),
            _ => None,
        });
        let result = match last_user {
            Some(text) => Ok(FakeModelResponse::new(text)),
            None => Err(FakeModelProviderError(ErrorKind::Protocol)),
        };
        ready(result)
    }
}

mod tests {
    use std::future::poll_fn;

    use super::*;

    async fn drain(mut resp: FakeModelResponse) -> Vec<ModelResponseEvent> {
        let mut events = vec![];
        loop {
            let event = poll_fn(|cx| Pin::new(&mut resp).poll_next_event(cx))
                .await
                .unwrap();
            match event {
                Some(event) => events.push(event),
                None => break,
            }
        }
        events
    }

    fn request(messages: Vec<ModelMessage>) -> ModelRequest {
        ModelRequest {
            model: "fake".to_owned(),
            messages,
            tools: vec![],
        }
    }

    #[tokio::test]
    async fn test_completion() {
        let provider = FakeModelProvider;
        let req = request(vec![ModelMessage::User("Good morning".to_owned())]);
        let resp = provider.send_request(&req).await.unwrap();

        let mut resp_message = String::new();
        let mut finish_reason = None;
        for event in drain(resp).await {
            match event {
                ModelResponseEvent::MessageDelta(delta) => {
                    resp_message.push_str(&delta);
                }
                ModelResponseEvent::Completed(reason) => {
                    finish_reason = Some(reason);
                }
                _ => unreachable!("unexpected event: {event:?}"),
            }
        }

        assert_eq!(resp_message, "You said Good morning");
        assert_eq!(finish_reason, Some(ModelFinishReason::Stop));
    }

    #[tokio::test]
    async fn test_tool_call() {
        let provider = FakeModelProvider;
        let req = request(vec![
            ModelMessage::System("Be brief.".to_owned()),
            ModelMessage::User("!ping".to_owned()),
        ]);
        let resp = provider.send_request(&req).await.unwrap();
        let events = drain(resp).await;

        assert_eq!(events.len(), 2);
        let ModelResponseEvent::ToolCall(call) = &events[0] else {
            unreachable!("unexpected event: {:?}", events[0]);
        };
        assert_eq!(call.name, "echo");
        assert_eq!(call.arguments, json!({ "text": "ping" }));
        assert_eq!(
            events[1],
            ModelResponseEvent::Completed(ModelFinishReason::ToolCalls)
        );
    }

    #[tokio::test]
    async fn test_error() {
        let provider = FakeModelProvider;
        let result = provider.send_request(&request(vec![])).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(!err.kind().is_transient());
    }
}
