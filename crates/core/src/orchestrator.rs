mod builder;
mod config;
mod error;

use std::collections::HashSet;
use std::sync::Arc;

use parley_model::ModelProvider;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub use builder::OrchestratorBuilder;
pub use config::{AgentConfig, DEFAULT_MODEL};
pub use error::TurnError;

use crate::conversation::{InvocationRequest, ThreadKey, TurnPayload};
use crate::gateway::{Gateway, GatewayResponse};
use crate::store::{ConversationStore, ThreadGuard};
use crate::tool::{Dispatcher, Registry};

pub(crate) type EventHandler =
    Arc<dyn Fn(&ThreadKey, &OrchestratorEvent) + Send + Sync>;

/// Progress of a turn, reported to the `on_event` callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OrchestratorEvent {
    /// A model call is about to be sent. Iterations count from 1.
    AwaitingModel {
        /// The number of this model call within the turn.
        iteration: usize,
    },
    /// The model requested tools, which are being dispatched.
    ToolsRequested {
        /// Requested tool names, in request order.
        names: Vec<String>,
    },
    /// All requested tools finished and their results were stored.
    ToolsDispatched {
        /// How many invocations produced an error result.
        failed: usize,
    },
    /// The turn produced a final answer.
    Finished,
    /// The turn ended with a [`TurnError`].
    Failed,
}

/// A message delivered by a chat surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    /// The message text.
    pub text: String,
    /// Identifier assigned by the chat surface. Messages with an id that
    /// was already handled in the same thread are rejected.
    pub message_id: Option<String>,
}

impl InboundMessage {
    /// Creates a message without an id.
    #[inline]
    pub fn new<S: Into<String>>(text: S) -> Self {
        Self {
            text: text.into(),
            message_id: None,
        }
    }

    /// Attaches the chat surface's message id.
    #[inline]
    pub fn with_id<S: Into<String>>(mut self, message_id: S) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// Runs the tool-augmented conversation loop.
///
/// Different threads are handled concurrently, while the turns of one
/// thread run strictly one after another: a turn holds the thread's writer
/// lock from appending the user message until its loop ends.
pub struct Orchestrator {
    gateway: Gateway,
    dispatcher: Dispatcher,
    registry: Arc<Registry>,
    store: Arc<ConversationStore>,
    config: AgentConfig,
    on_event: Option<EventHandler>,
}

impl Orchestrator {
    /// Creates a new builder with the specified model provider.
    #[inline]
    pub fn builder<P: ModelProvider + 'static>(provider: P) -> OrchestratorBuilder {
        OrchestratorBuilder::with_model_provider(provider)
    }

    /// Returns the conversation store.
    #[inline]
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Returns the tool registry.
    #[inline]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Returns the configuration.
    #[inline]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Handles a user message and returns the final answer.
    #[inline]
    pub async fn handle_turn<S: Into<String>>(
        &self,
        key: &ThreadKey,
        text: S,
    ) -> Result<String, TurnError> {
        self.handle_message(key, InboundMessage::new(text)).await
    }

    /// Same as [`Orchestrator::handle_turn`], with an optional message id
    /// for dropping redelivered messages.
    #[inline]
    pub async fn handle_message(
        &self,
        key: &ThreadKey,
        message: InboundMessage,
    ) -> Result<String, TurnError> {
        self.handle_message_with_cancel(key, message, CancellationToken::new())
            .await
    }

    /// Handles a user message until it is answered, fails, or `cancel` is
    /// triggered.
    ///
    /// Cancellation takes effect while waiting for the thread, between
    /// iterations and during a model call; a running tool batch is always
    /// completed and stored first. Turns stored before cancellation remain
    /// valid history.
    ///
    /// # Cancel safety
    ///
    /// Dropping the returned future is equivalent to cancelling it, the
    /// stored conversation never contains a tool request without its
    /// result.
    pub async fn handle_message_with_cancel(
        &self,
        key: &ThreadKey,
        message: InboundMessage,
        cancel: CancellationToken,
    ) -> Result<String, TurnError> {
        let span = debug_span!("turn", thread = %key);
        async {
            let result = self.run_loop(key, message, &cancel).await;
            match &result {
                Ok(_) => self.emit(key, OrchestratorEvent::Finished),
                Err(err) => {
                    warn!("turn failed: {err}");
                    self.emit(key, OrchestratorEvent::Failed);
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_loop(
        &self,
        key: &ThreadKey,
        message: InboundMessage,
        cancel: &CancellationToken,
    ) -> Result<String, TurnError> {
        let mut thread = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TurnError::Cancelled),
            thread = self.store.lock(key) => thread,
        };

        let InboundMessage { text, message_id } = message;
        let appended = thread.append(TurnPayload::UserMessage { text, message_id });
        if appended.is_duplicate() {
            return Err(TurnError::DuplicateMessage);
        }

        let tools = self.registry.definitions();
        let limit = self.config.max_iterations;
        for iteration in 1..=limit {
            if cancel.is_cancelled() {
                return Err(TurnError::Cancelled);
            }
            self.emit(key, OrchestratorEvent::AwaitingModel { iteration });

            let snapshot = match self.config.max_history_turns {
                Some(max) => thread.snapshot_tail(max),
                None => thread.snapshot(),
            };
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                response = self.gateway.complete(
                    &snapshot,
                    tools.clone(),
                    &self.config.model,
                    limit - iteration,
                ) => response?,
            };

            let mut requests = match response {
                GatewayResponse::FinalAnswer(text) => {
                    thread.append(TurnPayload::assistant(text.clone()));
                    debug!(iteration, "got a final answer");
                    return Ok(text);
                }
                GatewayResponse::ToolRequests(requests) => requests,
            };

            make_ids_unique(&thread, &mut requests);
            let names: Vec<_> =
                requests.iter().map(|r| r.tool_name.clone()).collect();
            debug!(iteration, tools = ?names, "model requested tools");
            self.emit(key, OrchestratorEvent::ToolsRequested { names });

            let results = self.dispatcher.dispatch_all(&requests).await;
            let failed = results.iter().filter(|r| r.is_error()).count();

            // Requests and results land in one write, so the model never
            // sees a request without its result.
            thread.append_batch(
                requests
                    .into_iter()
                    .map(TurnPayload::ToolRequest)
                    .chain(results.into_iter().map(TurnPayload::ToolResult)),
            );
            self.emit(key, OrchestratorEvent::ToolsDispatched { failed });
        }

        Err(TurnError::IterationLimitExceeded { limit })
    }

    #[inline]
    fn emit(&self, key: &ThreadKey, event: OrchestratorEvent) {
        if let Some(on_event) = &self.on_event {
            on_event(key, &event);
        }
    }
}

/// Renames invocation ids already used earlier in the thread.
///
/// Some models restart their call ids with every response, while the
/// transcript needs them unique to keep requests and results correlated.
fn make_ids_unique(thread: &ThreadGuard, requests: &mut [InvocationRequest]) {
    let suffix = thread.len();
    let mut taken: HashSet<String> =
        requests.iter().map(|request| request.id.clone()).collect();
    for request in requests.iter_mut() {
        if !thread.has_invocation(&request.id) {
            continue;
        }
        let mut id = format!("{}-{suffix}", request.id);
        while thread.has_invocation(&id) || taken.contains(&id) {
            id.push('_');
        }
        taken.insert(id.clone());
        debug!(from = %request.id, to = %id, "renaming reused invocation id");
        request.id = id;
    }
}
