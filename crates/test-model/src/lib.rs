//! A local fake model for testing purpose.

mod preset;

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};
use std::future::ready;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use parley_model::{
    ErrorKind, ModelFinishReason, ModelProvider, ModelProviderError,
    ModelRequest, ModelResponse, ModelResponseEvent,
};
use tokio::time::{Sleep, sleep};

pub use preset::*;

#[derive(Debug)]
pub struct Error {
    message: &'static str,
    kind: ErrorKind,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
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

type Responder = Arc<dyn Fn(&ModelRequest) -> PresetResponse + Send + Sync>;

#[derive(Default)]
struct Shared {
    script: Mutex<VecDeque<PresetResponse>>,
    responder: Mutex<Option<Responder>>,
    requests: Mutex<Vec<ModelRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct InFlightGuard(Arc<Shared>);

impl InFlightGuard {
    fn enter(shared: &Arc<Shared>) -> Self {
        let now = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(shared))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct TestModelResponse {
    events: VecDeque<ModelResponseEvent>,
    delay: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
    _in_flight: InFlightGuard,
}

impl ModelResponse for TestModelResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.get_mut();
        if this.events.is_empty() {
            // In case this method is called after completion.
            return Poll::Ready(Ok(None));
        }

        let delay = this.delay;
        let sleep = this.sleep.get_or_insert_with(|| Box::pin(sleep(delay)));
        ready!(sleep.as_mut().poll(cx));
        this.sleep = None;

        Poll::Ready(Ok(this.events.pop_front()))
    }
}

/// A local fake model for testing purpose.
///
/// Before sending requests, you need to setup the script, which is how the
/// model should respond to each request. Responses are consumed in order,
/// one per request. When the script runs out, the responder (if any) is
/// asked instead; otherwise an error is returned.
///
/// Clones share the same script and request log, so a test can keep a
/// clone around to inspect what the code under test has sent.
///
/// # Note
///
/// This type is not optimized for production use, there are heavy memory
/// copies involved. You should only use it for testing.
#[derive(Clone, Default)]
pub struct TestModelProvider {
    shared: Arc<Shared>,
    delay: Option<Duration>,
}

impl TestModelProvider {
    /// Appends a response to the script.
    #[inline]
    pub fn add_response(&mut self, preset: PresetResponse) {
        lock(&self.shared.script).push_back(preset);
    }

    /// Sets a fallback that computes responses once the script is empty.
    #[inline]
    pub fn set_responder(
        &mut self,
        responder: impl Fn(&ModelRequest) -> PresetResponse + Send + Sync + 'static,
    ) {
        *lock(&self.shared.responder) = Some(Arc::new(responder));
    }

    /// Sets the delay before each event of a response.
    #[inline]
    pub fn set_delay(&mut self, duration: Duration) {
        self.delay = Some(duration);
    }

    /// Returns all requests received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        lock(&self.shared.requests).clone()
    }

    /// Returns the number of responses left in the script.
    pub fn remaining_responses(&self) -> usize {
        lock(&self.shared.script).len()
    }

    /// Returns the highest number of responses that were alive at once.
    pub fn max_in_flight(&self) -> usize {
        self.shared.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_preset(&self, req: &ModelRequest) -> Result<PresetResponse, Error> {
        {
            let mut script = lock(&self.shared.script);
            if let Some(front) = script.front_mut() {
                match front.failures {
                    Some(0) => {
                        return Err(Error {
                            message: "injected failure",
                            kind: front.failure_kind,
                        });
                    }
                    Some(n) => {
                        front.failures = if n > 1 { Some(n - 1) } else { None };
                        return Err(Error {
                            message: "injected failure",
                            kind: front.failure_kind,
                        });
                    }
                    None => {}
                }
                if let Some(preset) = script.pop_front() {
                    return Ok(preset);
                }
            }
        }

        let responder = lock(&self.shared.responder).clone();
        match responder {
            Some(responder) => Ok(responder(req)),
            None => Err(Error {
                message: "no enough steps",
                kind: ErrorKind::Protocol,
            }),
        }
    }
}

fn preset_events(preset: PresetResponse) -> VecDeque<ModelResponseEvent> {
    let has_tool_call = preset
        .events
        .iter()
        .any(|event| matches!(event, PresetEvent::ToolCall(_)));
    let finish_reason = preset.finish_reason.unwrap_or(if has_tool_call {
        ModelFinishReason::ToolCalls
    } else {
        ModelFinishReason::Stop
    });

    let mut events: VecDeque<_> = preset
        .events
        .into_iter()
        .map(|event| match event {
            PresetEvent::MessageDelta(msg) => ModelResponseEvent::MessageDelta(msg),
            PresetEvent::ToolCall(req) => ModelResponseEvent::ToolCall(req),
        })
        .collect();
    events.push_back(ModelResponseEvent::Completed(finish_reason));
    events
}

impl ModelProvider for TestModelProvider {
    type Error = crate::Error;
    type Response = TestModelResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        lock(&self.shared.requests).push(req.clone());
        let result = self.next_preset(req).map(|preset| TestModelResponse {
            events: preset_events(preset),
            delay: self.delay.unwrap_or(Duration::from_millis(1)),
            sleep: None,
            _in_flight: InFlightGuard::enter(&self.shared),
        });
        ready(result)
    }
}
