use std::path::PathBuf;
use std::sync::Arc;

use parley_core::conversation::ThreadKey;
use parley_core::store::ConversationStore;
use parley_core::tool::{Registry, RegistryBuilder, RegistryError, Tool};
use parley_core::{
    AgentConfig, CancellationToken, InboundMessage, Orchestrator,
    OrchestratorBuilder, OrchestratorEvent,
};
use parley_model::ModelProvider;

use crate::tools::*;

/// The system prompt used unless replaced.
pub const DEFAULT_SYSTEM_PROMPT: &str = include_str!("./system_prompt.md");

/// Where memories are kept unless configured otherwise.
pub const DEFAULT_MEMORY_FILE: &str = "data/memory/memory.json";

/// A chat bot builder.
///
/// See [`ChatBot`].
pub struct ChatBotBuilder {
    orchestrator_builder: OrchestratorBuilder,
    system_prompt: Option<String>,
    system_prompt_addendum: Option<String>,
    memory_file: PathBuf,
    registry_builder: RegistryBuilder,
}

impl ChatBotBuilder {
    /// Creates a chat bot builder with a specified model provider.
    pub fn with_model_provider<M: ModelProvider + 'static>(provider: M) -> Self {
        Self {
            orchestrator_builder: Orchestrator::builder(provider),
            system_prompt: None,
            system_prompt_addendum: None,
            memory_file: PathBuf::from(DEFAULT_MEMORY_FILE),
            registry_builder: Registry::builder(),
        }
    }

    /// Replaces the default system prompt.
    #[inline]
    pub fn with_system_prompt<S: Into<String>>(mut self, prompt: S) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Appends surface-specific instructions to the system prompt.
    #[inline]
    pub fn with_system_prompt_addendum<S: Into<String>>(mut self, addendum: S) -> Self {
        self.system_prompt_addendum = Some(addendum.into());
        self
    }

    /// Sets the file backing the memory tools.
    #[inline]
    pub fn with_memory_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.memory_file = path.into();
        self
    }

    /// Sets the conversation loop configuration.
    #[inline]
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.orchestrator_builder = self.orchestrator_builder.config(config);
        self
    }

    /// Shares an existing conversation store.
    #[inline]
    pub fn with_store(mut self, store: Arc<ConversationStore>) -> Self {
        self.orchestrator_builder = self.orchestrator_builder.store(store);
        self
    }

    /// Registers an additional tool next to the built-in ones.
    #[inline]
    pub fn with_tool<T: Tool>(mut self, tool: T) -> Result<Self, RegistryError> {
        self.registry_builder = self.registry_builder.register(tool)?;
        Ok(self)
    }

    /// Attaches a callback to be invoked on every state transition of a
    /// turn.
    #[inline]
    pub fn on_event(
        mut self,
        on_event: impl Fn(&ThreadKey, &OrchestratorEvent) + Send + Sync + 'static,
    ) -> Self {
        self.orchestrator_builder = self.orchestrator_builder.on_event(on_event);
        self
    }

    /// Builds a new chat bot.
    ///
    /// Fails if an additional tool uses the name of a built-in one.
    pub fn build(self) -> Result<ChatBot, RegistryError> {
        let memory = MemoryFile::new(self.memory_file);
        let registry = self
            .registry_builder
            .register(ReadMemoryTool::new(Arc::clone(&memory)))?
            .register(WriteMemoryTool::new(Arc::clone(&memory)))?
            .register(DeleteMemoryTool::new(memory))?
            .register(CurrentTimeTool::new())?
            .build();

        let mut prompt = self
            .system_prompt
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_owned());
        if let Some(addendum) = self.system_prompt_addendum {
            prompt = format!("{}\n\n{}", prompt.trim_end(), addendum.trim());
        }

        let orchestrator = self
            .orchestrator_builder
            .registry(registry)
            .system_prompt(prompt)
            .build();
        Ok(ChatBot { orchestrator })
    }
}

/// A fully configured assistant.
///
/// The bot is basically a wrapper around [`Orchestrator`] that always
/// produces something to show: either the answer or a short apology.
pub struct ChatBot {
    orchestrator: Orchestrator,
}

impl ChatBot {
    /// Creates a chat bot builder with a specified model provider.
    #[inline]
    pub fn builder<M: ModelProvider + 'static>(provider: M) -> ChatBotBuilder {
        ChatBotBuilder::with_model_provider(provider)
    }

    /// Returns the underlying orchestrator.
    #[inline]
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Sends a message to a thread and returns the reply.
    #[inline]
    pub async fn chat(&self, key: &ThreadKey, text: &str) -> String {
        self.chat_with_cancel(key, InboundMessage::new(text), CancellationToken::new())
            .await
    }

    /// Same as [`ChatBot::chat`], but stops early when `cancel` is
    /// triggered.
    pub async fn chat_with_cancel(
        &self,
        key: &ThreadKey,
        message: InboundMessage,
        cancel: CancellationToken,
    ) -> String {
        match self
            .orchestrator
            .handle_message_with_cancel(key, message, cancel)
            .await
        {
            Ok(answer) => answer,
            Err(err) => err.user_message().to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_model::{ModelMessage, ToolCallRequest};
    use parley_test_model::{PresetResponse, TestModelProvider};
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_remembers_through_tools() {
        let dir = tempfile::tempdir().unwrap();
        let memory_file = dir.path().join("memory.json");

        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::tool_calls([ToolCallRequest {
            id: "call_0".to_owned(),
            name: "write_memory".to_owned(),
            arguments: json!({ "key": "user_timezone", "value": "EST" }),
            unparsed_arguments: None,
        }]));
        provider.add_response(PresetResponse::text("Got it, you're on EST."));

        let bot = ChatBot::builder(provider.clone())
            .with_memory_file(&memory_file)
            .with_system_prompt_addendum("Reply in one sentence.")
            .build()
            .unwrap();

        let key = ThreadKey::new("cli");
        let reply = bot.chat(&key, "Remember that I'm on EST.").await;
        assert_eq!(reply, "Got it, you're on EST.");

        let saved = std::fs::read_to_string(&memory_file).unwrap();
        assert!(saved.contains("\"user_timezone\": \"EST\""), "{saved}");

        let requests = provider.requests();
        let ModelMessage::System(prompt) = &requests[0].messages[0] else {
            unreachable!("expected a system prompt first");
        };
        assert!(prompt.starts_with("You are Parley"));
        assert!(prompt.ends_with("\n\nReply in one sentence."));

        let tools: Vec<_> = requests[0].tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            tools,
            ["read_memory", "write_memory", "delete_memory", "current_time"]
        );
    }

    #[tokio::test]
    async fn test_failure_becomes_apology() {
        // No scripted response, so the model call fails.
        let bot = ChatBot::builder(TestModelProvider::default()).build().unwrap();
        let reply = bot.chat(&ThreadKey::new("cli"), "Hello").await;
        assert_eq!(
            reply,
            "Sorry, I encountered an error processing your message. Please try again."
        );
    }

    #[test]
    fn test_builtin_name_clash() {
        let clash = parley_core::tool::FnTool::new(
            "current_time",
            "Shadows a built-in tool.",
            json!({}),
            |_| std::future::ready(Ok::<_, parley_core::tool::Error>(String::new())),
        );
        let result = ChatBot::builder(TestModelProvider::default())
            .with_tool(clash)
            .unwrap()
            .build();
        assert!(matches!(result, Err(RegistryError::DuplicateTool(name)) if name == "current_time"));
    }
}
