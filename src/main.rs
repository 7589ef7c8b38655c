use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use stageward::backend::ModelBackend;
use stageward::errors::BackendError;
use stageward::memory::BackendCapabilities;
use stageward::prompt::{Payload, StaticPromptSource};
use stageward::safety::{SafetyConfig, SafetyScreener};
use stageward::session::{JsonFileSessionStore, SessionStore};
use stageward::stage::StageSequence;
use stageward::workflow::Orchestrator;

#[derive(Parser)]
#[command(name = "stageward")]
#[command(version, about = "Dual-agent therapy workflow orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a stages JSON file. Defaults to the built-in protocol.
    #[arg(long, global = true)]
    pub stages_file: Option<PathBuf>,

    /// Path to a safety keywords JSON file. Defaults to the built-in lists.
    #[arg(long, global = true)]
    pub safety_config: Option<PathBuf>,

    /// Directory for session JSON files.
    #[arg(long, default_value = ".stageward/sessions", global = true)]
    pub sessions_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an interactive session against the built-in demo backends
    Chat {
        /// Resume an existing session instead of starting a new one
        #[arg(short, long)]
        session: Option<String>,
    },
    /// List the stages of the protocol
    Stages,
    /// Dump a stored session transcript
    Show { session_id: String },
}

/// Demo supervisor: advances when the user message carries an explicit
/// `[done]` marker, otherwise stays. Stands in for a real model vendor.
struct DemoSupervisorBackend;

#[async_trait]
impl ModelBackend for DemoSupervisorBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            retains_context: true,
            stage_prompt_reliable: true,
        }
    }

    async fn send(&self, payload: &Payload) -> Result<String, BackendError> {
        if payload.user_text.contains("[done]") {
            Ok(r#"{"decision": "advance", "reason": "user marked the stage done"}"#.to_string())
        } else {
            Ok(r#"{"decision": "stay", "reason": "keep working on this stage"}"#.to_string())
        }
    }
}

/// Demo responder: reflects the message back with a follow-up question.
struct DemoResponderBackend;

#[async_trait]
impl ModelBackend for DemoResponderBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            retains_context: true,
            stage_prompt_reliable: true,
        }
    }

    async fn send(&self, payload: &Payload) -> Result<String, BackendError> {
        let text = payload.user_text.replace("[done]", "");
        Ok(format!(
            "I hear you: \"{}\". What would be a small sign of progress?",
            text.trim()
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "stageward=debug" } else { "stageward=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let stages = match &cli.stages_file {
        Some(path) => StageSequence::load(path)?,
        None => StageSequence::default_protocol(),
    };

    let safety_config = match &cli.safety_config {
        Some(path) => SafetyConfig::load(path)?,
        None => SafetyConfig::default(),
    };
    let screener = SafetyScreener::new(safety_config)?;

    let store = Arc::new(JsonFileSessionStore::new(cli.sessions_dir.clone())?);

    match cli.command {
        Commands::Stages => {
            for stage in stages.all() {
                println!(
                    "{} {}",
                    console::style(format!("{:>2}.", stage.order)).dim(),
                    console::style(&stage.label).bold()
                );
                for criterion in &stage.completion_criteria {
                    println!("      - {criterion}");
                }
            }
            Ok(())
        }
        Commands::Show { session_id } => show_session(store, &session_id).await,
        Commands::Chat { session } => {
            let orchestrator = Orchestrator::new(
                stages,
                Arc::new(screener),
                store.clone(),
                Arc::new(DemoSupervisorBackend),
                Arc::new(DemoResponderBackend),
                Arc::new(StaticPromptSource),
            );
            chat(orchestrator, store, session).await
        }
    }
}

async fn show_session(store: Arc<JsonFileSessionStore>, session_id: &str) -> Result<()> {
    let session = store
        .load(session_id)
        .await?
        .with_context(|| format!("session {session_id} not found"))?;

    println!(
        "session {} at stage {}",
        console::style(&session.session_id).bold(),
        console::style(&session.stage_id).cyan()
    );
    for turn in session.turns() {
        println!(
            "{} {:?}: {}",
            console::style(format!("#{:03}", turn.seq)).dim(),
            turn.role,
            turn.text
        );
    }
    Ok(())
}

async fn chat(
    orchestrator: Orchestrator,
    store: Arc<JsonFileSessionStore>,
    session: Option<String>,
) -> Result<()> {
    let session = match session {
        Some(id) => store
            .load(&id)
            .await?
            .with_context(|| format!("session {id} not found, omit --session to start fresh"))?,
        None => orchestrator
            .start_session()
            .await
            .map_err(|e| anyhow::anyhow!(e.to_string()))?,
    };
    let session_id = session.session_id.clone();

    println!(
        "session {} at stage {} (mark a stage complete with {})",
        console::style(&session_id).bold(),
        console::style(&session.stage_id).cyan(),
        console::style("[done]").green()
    );

    let stdin = std::io::stdin();
    let mut current_stage = session.stage_id.clone();
    loop {
        print!("{} ", console::style("you>").blue().bold());
        std::io::stdout().flush()?;

        let Some(line) = stdin.lock().lines().next() else {
            break;
        };
        let line = line?;
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "quit" || text == "exit" {
            break;
        }

        let result = orchestrator.process_turn(&session_id, text).await;
        if !result.success {
            let err = result.error.expect("failed result carries an error");
            eprintln!(
                "{} [{}] {}",
                console::style("turn failed:").red().bold(),
                err.kind,
                err.message
            );
            continue;
        }

        if result.crisis {
            println!("{}", console::style(&result.reply).red());
            continue;
        }

        if result.stage != current_stage {
            println!(
                "{}",
                console::style(format!("-- moved to stage: {} --", result.stage)).yellow()
            );
            current_stage = result.stage.clone();
        }
        println!("{} {}", console::style("therapist>").green().bold(), result.reply);
    }

    println!("bye");
    Ok(())
}
