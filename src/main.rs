//! # readingpal
//!
//! Command-line front end: one-shot questions streamed to the terminal, key
//! and model management, and the JSON-lines host mode used by the browser
//! extension's native messaging bridge.

#![deny(unsafe_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::BufReader;
use tokio::sync::broadcast;
use tracing::{info, warn, Level};

use pal_core::classify::classify;
use pal_core::errors::GatewayError;
use pal_core::messages::{Conversation, Message};
use pal_core::prompt::{compose_with_selection, ActionKind};
use pal_llm::relay::{spawn_forwarder, JsonLinesChannel, MessageChannel};
use pal_llm::{HostService, StreamPipeline, StreamView, Verifier};
use pal_settings::{loader, ApiKey, CredentialResolver, SettingsResolver, SettingsStore};
use pal_store::ConversationStore;
use pal_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// How long host mode waits for in-flight terminal updates after stdin closes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Ask Claude about text you are reading.
#[derive(Parser, Debug)]
#[command(name = "readingpal", version, about = "Ask Claude about text you are reading")]
struct Cli {
    /// Settings directory (defaults to `$READINGPAL_HOME` or `~/.readingpal`).
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream an answer to stdout. Ctrl-C stops the stream.
    Ask(AskArgs),
    /// Check an API key and list the models it can use.
    Verify {
        /// Key to check instead of the configured one.
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Show or change stored settings.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Show or clear the saved conversation.
    #[command(subcommand)]
    History(HistoryCommand),
    /// Serve the JSON-lines host protocol on stdin/stdout.
    Host,
}

#[derive(Args, Debug)]
struct AskArgs {
    /// Question, or the selected text when `--action` is given.
    prompt: String,

    /// Run a selection action on the prompt text.
    #[arg(long, value_parser = parse_action)]
    action: Option<ActionKind>,

    /// Text the question is about.
    #[arg(long)]
    selection: Option<String>,

    /// Ignore and do not update the saved conversation.
    #[arg(long)]
    fresh: bool,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Show,
    SetKey { api_key: String },
    SetModel { model: String },
    ClearKey,
}

#[derive(Subcommand, Debug)]
enum HistoryCommand {
    Show,
    Clear,
}

fn parse_action(s: &str) -> Result<ActionKind, String> {
    s.parse().map_err(|e: pal_core::prompt::UnknownAction| e.to_string())
}

impl AskArgs {
    fn prompt_text(&self) -> String {
        match (self.action, self.selection.as_deref()) {
            (Some(action), _) => action.apply(&self.prompt),
            (None, Some(selection)) => compose_with_selection(selection, &self.prompt),
            (None, None) => self.prompt.clone(),
        }
    }
}

impl Cli {
    fn store(&self) -> SettingsStore {
        match &self.dir {
            Some(dir) => SettingsStore::open(dir.clone()),
            None => SettingsStore::default_location(),
        }
    }

    fn telemetry(&self) -> TelemetryConfig {
        let log_level = match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };
        let host = matches!(self.command, Command::Host);
        TelemetryConfig {
            log_level,
            format: if host { LogFormat::Json } else { LogFormat::Compact },
            ansi: !host,
            ..TelemetryConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_telemetry(&cli.telemetry()).context("failed to initialize logging")?;

    let store = cli.store();
    match cli.command {
        Command::Ask(args) => ask(store, args).await,
        Command::Verify { api_key } => verify(store, api_key).await,
        Command::Config(cmd) => config(&store, cmd),
        Command::History(cmd) => history(&store, cmd),
        Command::Host => host(store).await,
    }
}

async fn ask(store: SettingsStore, args: AskArgs) -> Result<()> {
    let prompt = args.prompt_text();
    let history = ConversationStore::in_dir(store.dir());
    let conversation = if args.fresh {
        Conversation::new()
    } else {
        history.load()?
    };

    let settings = store.load()?;
    let resolver = Arc::new(SettingsResolver::new(store));
    let pipeline = StreamPipeline::from_settings(&settings.api, resolver)?;

    // Subscribe before issuing so the first delta cannot be missed.
    let mut rx = pipeline.broadcaster().subscribe();
    let handle = match pipeline.issue(&prompt, &conversation).await {
        Ok(handle) => handle,
        Err(e) => bail!(classify(&e).user_message()),
    };

    let request_id = handle.request_id.clone();
    let mut view = StreamView::new();
    view.track(request_id.clone());

    let mut answer = String::new();
    let mut cancelled = false;
    let mut interrupted = false;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                if !pipeline.cancel(&request_id) {
                    info!(%request_id, "stream already finished");
                }
            }
            received = rx.recv() => match received {
                Ok(increment) => {
                    let Some(increment) = view.accept(increment) else { continue };
                    if increment.done {
                        cancelled = increment.is_cancelled();
                        break;
                    }
                    answer.push_str(&increment.text);
                    let mut out = std::io::stdout().lock();
                    out.write_all(increment.text.as_bytes())?;
                    out.flush()?;
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "terminal fell behind the stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    println!();

    let outcome = handle.completion.await;
    if should_save(&outcome, args.fresh, cancelled, &answer) {
        history.append([Message::user(prompt), Message::assistant(answer)])?;
    }
    if let Err(e) = outcome {
        bail!(classify(&e).user_message());
    }
    if cancelled {
        eprintln!("(stopped)");
    }
    Ok(())
}

/// A failed stream is never saved, nor a stop that produced no text.
fn should_save(
    outcome: &Result<String, GatewayError>,
    fresh: bool,
    cancelled: bool,
    answer: &str,
) -> bool {
    outcome.is_ok() && !fresh && !(cancelled && answer.is_empty())
}

async fn verify(store: SettingsStore, api_key: Option<String>) -> Result<()> {
    let settings = store.load()?;
    let key = match api_key {
        Some(key) => ApiKey::new(key),
        None => match SettingsResolver::new(store).resolve().await {
            Ok(credentials) => credentials.api_key,
            Err(e) => bail!(classify(&e).user_message()),
        },
    };

    let verifier = Verifier::from_settings(&settings.api)?;
    match verifier.verify(&key).await {
        Ok(models) => {
            for model in models {
                println!("{:<32} {}  {}", model.id, model.display_name, model.description);
            }
            Ok(())
        }
        Err(e) => bail!(classify(&e).user_message()),
    }
}

fn config(store: &SettingsStore, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show => {
            let settings = store.load()?;
            let from_env = loader::env_api_key(|name| std::env::var(name).ok()).is_some();
            let stored = store.stored_api_key()?.is_some();
            let view = serde_json::json!({
                "settingsPath": store.settings_path(),
                "hasApiKey": from_env || stored,
                "apiKeySource": if from_env { "env" } else if stored { "settings" } else { "none" },
                "model": settings.model_or_default(),
                "api": settings.api,
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        ConfigCommand::SetKey { api_key } => {
            store.save_api_key(&api_key)?;
            println!("API key saved");
        }
        ConfigCommand::SetModel { model } => {
            store.save_model(Some(&model))?;
            println!("model set to {}", store.load_file()?.model_or_default());
        }
        ConfigCommand::ClearKey => {
            store.clear_api_key()?;
            println!("API key removed");
        }
    }
    Ok(())
}

fn history(store: &SettingsStore, cmd: HistoryCommand) -> Result<()> {
    let history = ConversationStore::in_dir(store.dir());
    match cmd {
        HistoryCommand::Show => {
            let conversation = history.load()?;
            println!("{}", serde_json::to_string_pretty(&conversation)?);
        }
        HistoryCommand::Clear => {
            history.clear()?;
            println!("conversation cleared");
        }
    }
    Ok(())
}

async fn host(store: SettingsStore) -> Result<()> {
    let settings = store.load()?;
    let channel: Arc<dyn MessageChannel> = Arc::new(JsonLinesChannel::new(tokio::io::stdout()));

    let resolver = Arc::new(SettingsResolver::new(store.clone()));
    let pipeline = Arc::new(StreamPipeline::from_settings(&settings.api, resolver)?);
    let forwarder = spawn_forwarder(pipeline.broadcaster().subscribe(), Arc::clone(&channel));
    let verifier = Verifier::from_settings(&settings.api)?;
    let service = Arc::new(HostService::new(
        Arc::clone(&pipeline),
        verifier,
        store,
        Arc::clone(&channel),
    ));

    info!("host mode ready");
    service
        .serve(BufReader::new(tokio::io::stdin()))
        .await
        .context("failed to read host input")?;

    drop(pipeline);
    if tokio::time::timeout(DRAIN_TIMEOUT, forwarder).await.is_err() {
        warn!("stream forwarder did not drain in time");
    }
    Ok(())
}
