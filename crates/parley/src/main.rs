//! Chat with the assistant in the terminal.

#[macro_use]
extern crate tracing;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, ensure};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use parley::core::conversation::ThreadKey;
use parley::core::{AgentConfig, CancellationToken, InboundMessage, OrchestratorEvent};
use parley::{ChatBot, DEFAULT_MEMORY_FILE};
use parley_openai_model::{
    DEFAULT_BASE_URL, DEFAULT_MODEL, OpenAIConfigBuilder, OpenAIProvider,
};
use tokio::io::{self, AsyncBufReadExt, BufReader};
use tokio::select;
use tokio::signal::ctrl_c;
use tokio::sync::mpsc;

const BAR_CHAR: &str = "▎";

/// Chat with Parley in the terminal.
///
/// Every flag can also be given as an environment variable, and a `.env`
/// file in the working directory is loaded first.
#[derive(Debug, Parser)]
#[command(name = "parley", version, about)]
struct Settings {
    /// API key of the OpenAI-compatible endpoint.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Base URL of the OpenAI-compatible endpoint.
    #[arg(long, env = "OPENAI_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Model identifier.
    #[arg(long, env = "OPENAI_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    /// Maximum number of model calls for one message.
    #[arg(long, env = "PARLEY_MAX_ITERATIONS", default_value_t = 8)]
    max_iterations: usize,

    /// Deadline of one model call, in seconds.
    #[arg(long, env = "PARLEY_MODEL_TIMEOUT_SECS", default_value_t = 60)]
    model_timeout_secs: u64,

    /// Deadline of one tool invocation, in seconds.
    #[arg(long, env = "PARLEY_TOOL_TIMEOUT_SECS", default_value_t = 30)]
    tool_timeout_secs: u64,

    /// Only send this many of the latest turns to the model.
    #[arg(long, env = "PARLEY_MAX_HISTORY_TURNS")]
    max_history_turns: Option<usize>,

    /// JSON file backing the memory tools.
    #[arg(long, env = "PARLEY_MEMORY_FILE", default_value = DEFAULT_MEMORY_FILE)]
    memory_file: PathBuf,

    /// Instructions appended to the built-in system prompt.
    #[arg(long, env = "PARLEY_SYSTEM_PROMPT")]
    system_prompt: Option<String>,

    /// Sent as `X-Title`, which OpenRouter uses to attribute requests.
    #[arg(long, env = "PARLEY_APP_TITLE")]
    app_title: Option<String>,

    /// Sent as `HTTP-Referer`, which OpenRouter uses to attribute requests.
    #[arg(long, env = "PARLEY_APP_URL")]
    app_url: Option<String>,
}

impl Settings {
    fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            model: self.model.clone(),
            model_timeout: Duration::from_secs(self.model_timeout_secs),
            tool_timeout: Duration::from_secs(self.tool_timeout_secs),
            max_iterations: self.max_iterations,
            max_history_turns: self.max_history_turns,
        }
    }

    fn provider(&self) -> OpenAIProvider {
        let mut builder = OpenAIConfigBuilder::with_api_key(&self.api_key)
            .with_base_url(&self.base_url)
            .with_model(&self.model);
        if let Some(title) = &self.app_title {
            builder = builder.with_header("X-Title", title);
        }
        if let Some(url) = &self.app_url {
            builder = builder.with_header("HTTP-Referer", url);
        }
        OpenAIProvider::new(builder.build())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(err) = dotenv {
        if !err.not_found() {
            warn!("failed to load .env: {err}");
        }
    }

    let settings = Settings::parse();
    ensure!(
        !settings.api_key.trim().is_empty(),
        "OPENAI_API_KEY must not be empty"
    );
    debug!(model = %settings.model, base_url = %settings.base_url, "starting");

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut builder = ChatBot::builder(settings.provider())
        .with_config(settings.agent_config())
        .with_memory_file(&settings.memory_file)
        .on_event(move |_, event| {
            event_tx.send(event.clone()).ok();
        });
    if let Some(addendum) = &settings.system_prompt {
        builder = builder.with_system_prompt_addendum(addendum);
    }
    let bot = builder.build().context("failed to set up the chat bot")?;

    let progress_style = ProgressStyle::with_template("{spinner} {wide_msg}")
        .context("invalid progress template")?
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");

    // One conversation per process.
    let key = ThreadKey::new(format!("cli:{}", std::process::id()));
    let mut lines = BufReader::new(io::stdin()).lines();

    println!("{}", "Parley".bright_cyan().bold());
    println!("Type 'quit' or 'exit' to end the session.\n");

    loop {
        print!("{} ", "You:".bright_green().bold());
        std::io::Write::flush(&mut std::io::stdout())?;

        let line = select! {
            line = lines.next_line() => line?,
            _ = ctrl_c() => None,
        };
        let Some(line) = line else {
            println!("\nGoodbye!");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("quit") || line.eq_ignore_ascii_case("exit") {
            println!("Goodbye!");
            break;
        }

        let progress_bar = ProgressBar::new_spinner();
        progress_bar.set_style(progress_style.clone());
        progress_bar.set_message("🤔 Thinking...");
        progress_bar.enable_steady_tick(Duration::from_millis(100));

        let cancel = CancellationToken::new();
        let chat = bot.chat_with_cancel(&key, InboundMessage::new(line), cancel.clone());
        tokio::pin!(chat);

        let reply = loop {
            select! {
                reply = &mut chat => break reply,
                Some(event) = event_rx.recv() => show_event(&progress_bar, &event),
                _ = ctrl_c(), if !cancel.is_cancelled() => {
                    progress_bar.set_message("Cancelling...");
                    cancel.cancel();
                }
            }
        };
        while let Ok(event) = event_rx.try_recv() {
            show_event(&progress_bar, &event);
        }
        progress_bar.finish_and_clear();

        println!(
            "{}{} {}\n",
            BAR_CHAR.bright_cyan(),
            "Parley:".bright_cyan().bold(),
            reply.bright_white()
        );
    }

    Ok(())
}

fn show_event(progress_bar: &ProgressBar, event: &OrchestratorEvent) {
    match event {
        OrchestratorEvent::AwaitingModel { iteration } if *iteration > 1 => {
            progress_bar.set_message(format!("🤔 Thinking... (step {iteration})"));
        }
        OrchestratorEvent::ToolsRequested { names } => {
            progress_bar.println(format!(
                "{}🔧 {}",
                BAR_CHAR.bright_yellow(),
                names.join(", ").dimmed()
            ));
            progress_bar.set_message("🛠️  Running tools...");
        }
        OrchestratorEvent::ToolsDispatched { failed } if *failed > 0 => {
            progress_bar.println(format!(
                "{}⚠️  {failed} tool call(s) failed",
                BAR_CHAR.bright_yellow()
            ));
        }
        _ => {}
    }
}
