//! # streetrace
//!
//! CLI for the StreetRace agent DSL: compile `.sr` workflow files and run
//! them single-shot or as an interactive session.

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use streetrace::{CliConfig, EchoLlmClient, WorkloadCache};
use streetrace_runtime::testing::{InMemorySessionStore, NullToolProvider, StaticLlmClient};
use streetrace_runtime::{Event, LlmClient, Session, SessionStore, WorkflowRuntime};

#[derive(Parser)]
#[command(name = "streetrace")]
#[command(about = "Run StreetRace agent workflows", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile and execute a workflow file
    Run {
        /// Path to the .sr workflow file
        file: PathBuf,

        /// Single-shot prompt; omit for interactive mode
        #[arg(long)]
        prompt: Option<String>,

        /// Scripted model responses instead of the echo client (repeatable)
        #[arg(long = "mock-response")]
        mock_responses: Vec<String>,
    },

    /// Compile a workflow file and report diagnostics
    Check {
        /// Path to the .sr workflow file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match CliConfig::load() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{} {error:#}", "error:".red().bold());
            return ExitCode::from(2);
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Check { file } => check(&file),
        Commands::Run {
            file,
            prompt,
            mock_responses,
        } => run(&file, prompt, mock_responses).await,
    }
}

fn read_source(file: &Path) -> Result<String, ExitCode> {
    std::fs::read_to_string(file).map_err(|error| {
        eprintln!(
            "{} cannot read {}: {error}",
            "error:".red().bold(),
            file.display()
        );
        ExitCode::from(2)
    })
}

fn check(file: &Path) -> ExitCode {
    let source = match read_source(file) {
        Ok(source) => source,
        Err(code) => return code,
    };
    let cache = WorkloadCache::new();
    match cache.compile(&source) {
        Ok(workflow) => {
            println!(
                "{} {} ({} flows, {} agents, {} prompts)",
                "ok:".green().bold(),
                file.display(),
                workflow.flows.len(),
                workflow.agents.len(),
                workflow.prompts.len()
            );
            ExitCode::SUCCESS
        }
        Err(batch) => {
            eprint!("{}", batch.render(&file.display().to_string(), &source));
            ExitCode::from(2)
        }
    }
}

async fn run(file: &Path, prompt: Option<String>, mock_responses: Vec<String>) -> ExitCode {
    let source = match read_source(file) {
        Ok(source) => source,
        Err(code) => return code,
    };
    let cache = WorkloadCache::new();
    let workflow = match cache.compile(&source) {
        Ok(workflow) => workflow,
        Err(batch) => {
            eprint!("{}", batch.render(&file.display().to_string(), &source));
            return ExitCode::from(2);
        }
    };

    let llm: Arc<dyn LlmClient> = if mock_responses.is_empty() {
        Arc::new(EchoLlmClient)
    } else {
        Arc::new(StaticLlmClient::with_texts(
            mock_responses.iter().map(String::as_str).collect(),
        ))
    };
    let sessions = Arc::new(InMemorySessionStore::new());
    let runtime = WorkflowRuntime::new(workflow, llm, Arc::new(NullToolProvider), sessions.clone());

    let session_id = format!("cli-{}", std::process::id());
    if sessions
        .create("streetrace", "cli", &session_id, serde_json::Value::Null)
        .await
        .is_err()
    {
        eprintln!("{} failed to create session", "error:".red().bold());
        return ExitCode::FAILURE;
    }
    let session = Session::new("streetrace", "cli", session_id);

    match prompt {
        Some(prompt) => run_once(&runtime, session, &prompt).await,
        None => interactive(&runtime, session).await,
    }
}

/// Single-shot execution: exit 0 on `FlowResult`, 1 on `Error`.
async fn run_once(runtime: &WorkflowRuntime, session: Session, prompt: &str) -> ExitCode {
    let mut stream = runtime.run_async(session, prompt);
    let mut exit = ExitCode::FAILURE;
    while let Some(event) = stream.next().await {
        print_event(&event);
        match event {
            Event::FlowResult { .. } => exit = ExitCode::SUCCESS,
            Event::Error { fatal: true, .. } => exit = ExitCode::FAILURE,
            _ => {}
        }
    }
    runtime.close().await;
    exit
}

/// Interactive mode: each line runs through the same pipeline, sharing the
/// session. `exit`, `quit` or EOF terminate.
async fn interactive(runtime: &WorkflowRuntime, session: Session) -> ExitCode {
    let stdin = std::io::stdin();
    loop {
        print!("{} ", ">".cyan().bold());
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        let mut stream = runtime.run_async(session.clone(), line);
        while let Some(event) = stream.next().await {
            print_event(&event);
        }
    }
    runtime.close().await;
    ExitCode::SUCCESS
}

fn print_event(event: &Event) {
    match event {
        Event::AgentCall { agent, .. } => {
            eprintln!("{} {agent}", "agent:".dimmed());
        }
        Event::Log { message, .. } => {
            eprintln!("{} {message}", "log:".dimmed());
        }
        Event::Notify { message, .. } => {
            println!("{} {message}", "notify:".yellow().bold());
        }
        Event::Escalated { agent, .. } => {
            eprintln!("{} {agent}", "escalated:".yellow().bold());
        }
        Event::HistoryCompaction {
            original_tokens,
            compacted_tokens,
            ..
        } => {
            eprintln!(
                "{} {original_tokens} -> {compacted_tokens} tokens",
                "compacted:".dimmed()
            );
        }
        Event::FlowResult { result, .. } => {
            println!("{}", streetrace_runtime::value::render_text(result));
        }
        Event::Error {
            fatal: true,
            kind,
            message,
            ..
        } => {
            eprintln!("{} [{kind:?}] {message}", "error:".red().bold());
        }
        Event::Error { message, .. } => {
            eprintln!("{} {message}", "warning:".yellow());
        }
        _ => {}
    }
}
