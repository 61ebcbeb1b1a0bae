use std::sync::Arc;
use std::time::Duration;

use parley_model::ModelProvider;

use super::{AgentConfig, EventHandler, Orchestrator, OrchestratorEvent};
use crate::conversation::ThreadKey;
use crate::gateway::Gateway;
use crate::store::ConversationStore;
use crate::tool::{Dispatcher, Registry};

type GatewayFactory = Box<dyn FnOnce(Option<String>, Duration) -> Gateway + Send>;

/// [`Orchestrator`] builder.
pub struct OrchestratorBuilder {
    make_gateway: GatewayFactory,
    registry: Option<Arc<Registry>>,
    store: Option<Arc<ConversationStore>>,
    config: AgentConfig,
    system_prompt: Option<String>,
    on_event: Option<EventHandler>,
}

impl OrchestratorBuilder {
    /// Creates a new builder with the specified model provider.
    #[inline]
    pub fn with_model_provider<P: ModelProvider + 'static>(provider: P) -> Self {
        Self {
            make_gateway: Box::new(move |system_prompt, timeout| {
                Gateway::new(provider, system_prompt, timeout)
            }),
            registry: None,
            store: None,
            config: Default::default(),
            system_prompt: None,
            on_event: None,
        }
    }

    /// Sets the tools offered to the model. Defaults to no tools.
    #[inline]
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Shares an existing conversation store. Defaults to a new one.
    #[inline]
    pub fn store(mut self, store: Arc<ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the configuration.
    #[inline]
    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the system prompt sent before the transcript.
    #[inline]
    pub fn system_prompt<S: Into<String>>(mut self, system_prompt: S) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }

    /// Attaches a callback to be invoked on every state transition.
    #[inline]
    pub fn on_event(
        mut self,
        on_event: impl Fn(&ThreadKey, &OrchestratorEvent) + Send + Sync + 'static,
    ) -> Self {
        self.on_event = Some(Arc::new(on_event));
        self
    }

    /// Builds the orchestrator.
    pub fn build(self) -> Orchestrator {
        let Self {
            make_gateway,
            registry,
            store,
            mut config,
            system_prompt,
            on_event,
        } = self;

        if config.max_iterations == 0 {
            warn!("max_iterations must be at least 1, using 1");
            config.max_iterations = 1;
        }
        if config.max_history_turns == Some(0) {
            warn!("max_history_turns must be at least 1, using 1");
            config.max_history_turns = Some(1);
        }

        let registry = registry.unwrap_or_default();
        Orchestrator {
            gateway: make_gateway(system_prompt, config.model_timeout),
            dispatcher: Dispatcher::new(Arc::clone(&registry), config.tool_timeout),
            registry,
            store: store.unwrap_or_default(),
            config,
            on_event,
        }
    }
}
