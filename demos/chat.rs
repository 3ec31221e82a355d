//! Interactive chat REPL that records every turn as a transcript.
//!
//! Usage:
//!   OPENAI_API_KEY=sk-... cargo run --example chat
//!   cargo run --example chat -- --base-url http://localhost:1234 --model qwen2.5-7b-instruct
//!   cargo run --example chat -- --backend-url http://localhost:8080 --conversation 6f1c...
//!   cargo run --example chat -- --replay events.ndjson
//!
//! Ctrl-C during a turn disconnects the client; type "exit" / "quit" to leave.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use clap::Parser;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use turn_assembler::{
    events, AgentConfig, AgentSource, BackendTranscript, ChannelLiveSink, EventStream,
    FileTranscript, KnowledgeBase, LiveEvent, OpenAiProvider, ToolHandler, ToolRegistry,
    TurnConfig, TurnError, TurnOrchestrator, TurnRequest,
};

#[derive(Parser)]
#[command(name = "chat", about = "Chat with a tool-using agent and keep the transcript")]
struct Cli {
    /// OpenAI-compatible API base URL
    #[arg(long, default_value = "https://api.openai.com")]
    base_url: String,

    #[arg(long, default_value = "gpt-4o-mini")]
    model: String,

    /// System prompt
    #[arg(long, short = 's')]
    system: Option<String>,

    #[arg(long, default_value_t = 1024)]
    max_tokens: u32,

    /// Reasoning cycles allowed per turn
    #[arg(long, default_value_t = 10)]
    max_cycles: usize,

    /// Conversation to append to
    #[arg(long, default_value = "local")]
    conversation: String,

    /// Directory for JSONL transcripts
    #[arg(long, default_value = "transcripts")]
    transcript_dir: PathBuf,

    /// Persist to a conversation backend instead of local files. Also enables
    /// the knowledge base tools.
    #[arg(long)]
    backend_url: Option<String>,

    /// Read events for each turn from an NDJSON file instead of a model
    #[arg(long)]
    replay: Option<PathBuf>,
}

struct CurrentTime;

#[async_trait]
impl ToolHandler for CurrentTime {
    async fn call(&self, _input: &Value) -> Result<String, String> {
        Ok(chrono::Utc::now().to_rfc3339())
    }
}

fn build_source(cli: &Cli, knowledge: Option<KnowledgeBase>) -> AgentSource {
    let mut provider = OpenAiProvider::new(&cli.base_url);
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        provider = provider.with_api_key(key);
    }

    let mut tools = ToolRegistry::new();
    if let Some(kb) = knowledge {
        tools = kb.register(tools);
    }
    let tools = tools.add(
        "current_time",
        json!({
            "name": "current_time",
            "description": "Current UTC time in RFC 3339 format",
            "input_schema": {"type": "object", "properties": {}}
        }),
        CurrentTime,
    );

    let mut config = AgentConfig {
        model: cli.model.clone(),
        max_tokens: cli.max_tokens,
        max_cycles: cli.max_cycles,
        system: None,
    };
    if let Some(sys) = &cli.system {
        config = config.with_system(sys);
    }
    AgentSource::new(provider, tools, config)
}

async fn replay_events(path: &PathBuf) -> io::Result<EventStream> {
    let file = tokio::fs::File::open(path).await?;
    Ok(events::from_ndjson(tokio::io::BufReader::new(file)))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = TurnConfig::from_env().unwrap_or_else(|e| {
        eprintln!("error: {e}");
        std::process::exit(1);
    });

    let (orchestrator, knowledge) = match &cli.backend_url {
        Some(url) => {
            let backend = BackendTranscript::new(url);
            let kb = KnowledgeBase::from_backend(&backend);
            (TurnOrchestrator::new(backend, config), Some(kb))
        }
        None => (
            TurnOrchestrator::new(FileTranscript::new(&cli.transcript_dir), config),
            None,
        ),
    };
    let source = build_source(&cli, knowledge);

    eprintln!("turn-assembler chat");
    eprintln!("model: {}", cli.model);
    eprintln!("conversation: {}", cli.conversation);
    eprintln!("---");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        eprint!("\x1b[1;36myou>\x1b[0m ");
        io::stderr().flush().ok();

        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => break,
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if matches!(trimmed, "exit" | "quit" | "/q") {
            break;
        }

        let events = match &cli.replay {
            Some(path) => match replay_events(path).await {
                Ok(events) => events,
                Err(e) => {
                    eprintln!("\x1b[1;31merror:\x1b[0m {}: {e}", path.display());
                    continue;
                }
            },
            None => {
                let history = match orchestrator.history(&cli.conversation).await {
                    Ok(history) => history,
                    Err(e) => {
                        eprintln!("\x1b[1;31merror:\x1b[0m loading history: {e}");
                        continue;
                    }
                };
                source.events(history, trimmed)
            }
        };

        let (live, mut rx) = ChannelLiveSink::channel(256);
        let printer = tokio::spawn(async move {
            let mut speaking = false;
            while let Some(event) = rx.recv().await {
                match event {
                    LiveEvent::Token { text } => {
                        if !speaking {
                            eprint!("\x1b[1;32magent>\x1b[0m ");
                            speaking = true;
                        }
                        print!("{text}");
                        io::stdout().flush().ok();
                    }
                    LiveEvent::ToolStarted { name, input, .. } => {
                        if speaking {
                            println!();
                            speaking = false;
                        }
                        eprintln!("\x1b[33m  [tool: {name}]\x1b[0m {input}");
                    }
                    LiveEvent::ToolFinished { name, output, .. } => {
                        let shown: String = output.chars().take(200).collect();
                        eprintln!("\x1b[33m  [result: {name}]\x1b[0m {shown}");
                    }
                }
            }
            if speaking {
                println!();
            }
        });

        let cancel = CancellationToken::new();
        let on_interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            })
        };

        let request = TurnRequest::new(&cli.conversation).with_user_message(trimmed);
        let result = orchestrator
            .run_streaming(request, events, live, cancel)
            .await;
        on_interrupt.abort();
        printer.await.ok();

        match result {
            Ok(turn) => eprintln!(
                "\x1b[2m  [{} | {} messages]\x1b[0m",
                turn.status,
                turn.messages.len()
            ),
            Err(TurnError::Persistence {
                attempts, partial, ..
            }) => eprintln!(
                "\x1b[1;31merror:\x1b[0m transcript write failed after {attempts} attempt(s); {} message(s) saved",
                partial.messages.len()
            ),
            Err(e) => eprintln!("\x1b[1;31merror:\x1b[0m {e}"),
        }
    }

    eprintln!("bye.");
}
