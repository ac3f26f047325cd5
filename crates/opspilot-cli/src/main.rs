use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use opspilot_agent::engine::{AgentEngine, AskOutcome};
use opspilot_core::AppConfig;
use opspilot_gateway::{GatewayManager, GatewayServer};
use serde_json::json;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "opspilot", about = "LLM-driven operations agent", version)]
struct Cli {
    /// Workspace root (defaults to the current directory).
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Machine-readable JSON output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one conversational turn against the configured gateway.
    Ask {
        prompt: String,
        /// Operation ids likely relevant to the request, passed to the
        /// planner as hints.
        #[arg(long = "hint")]
        hints: Vec<String>,
    },
    /// Inspect and resolve pending human-approval requests.
    Validations {
        #[command(subcommand)]
        command: ValidationsCommand,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum ValidationsCommand {
    /// List pending validation requests.
    List,
    /// Approve or reject a pending request.
    Respond {
        id: Uuid,
        #[arg(long)]
        approve: bool,
        /// Replacement JSON body applied before execution.
        #[arg(long)]
        edited_body: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Write default settings and a gateway config stub.
    Init {
        /// Gateway endpoint URL to register.
        #[arg(long)]
        gateway_url: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let workspace = match cli.workspace {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    match cli.command {
        Command::Ask { prompt, hints } => {
            let engine = AgentEngine::new(&workspace)?;
            let outcome = engine.ask_with_hints(&prompt, hints)?;
            print_outcome(&outcome, cli.json);
        }
        Command::Validations { command } => match command {
            ValidationsCommand::List => {
                let engine = AgentEngine::new(&workspace)?;
                engine.sweep_validations();
                let pending = engine.pending_validations();
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&pending)?);
                } else if pending.is_empty() {
                    println!("no pending validations");
                } else {
                    for request in pending {
                        println!(
                            "{}  {}  {} {}",
                            request.id,
                            request.operation_id,
                            request.method.as_deref().unwrap_or("-"),
                            request.path.as_deref().unwrap_or("-"),
                        );
                    }
                }
            }
            ValidationsCommand::Respond {
                id,
                approve,
                edited_body,
            } => {
                let engine = AgentEngine::new(&workspace)?;
                let edited = edited_body
                    .map(|raw| {
                        serde_json::from_str(&raw)
                            .map_err(|err| anyhow!("--edited-body is not valid JSON: {err}"))
                    })
                    .transpose()?;
                let outcome = engine.respond_to_validation(id, approve, edited)?;
                print_outcome(&outcome, cli.json);
            }
        },
        Command::Config { command } => match command {
            ConfigCommand::Init { gateway_url } => {
                let cfg = AppConfig::ensure(&workspace)?;
                if let Some(url) = gateway_url {
                    let manager = GatewayManager::new(&workspace);
                    manager.add_server(GatewayServer {
                        id: "default".to_string(),
                        url,
                        enabled: true,
                        metadata: serde_json::Value::Null,
                    })?;
                }
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&cfg)?);
                } else {
                    println!(
                        "settings written to {}",
                        AppConfig::settings_path(&workspace).display()
                    );
                }
            }
        },
    }
    Ok(())
}

fn print_outcome(outcome: &AskOutcome, as_json: bool) {
    match outcome {
        AskOutcome::Answer {
            session_id,
            answer,
            steps,
        } => {
            if as_json {
                println!(
                    "{}",
                    json!({
                        "status": "answered",
                        "session_id": session_id,
                        "steps": steps,
                        "answer": answer,
                    })
                );
            } else {
                println!("{answer}");
            }
        }
        AskOutcome::AwaitingApproval {
            session_id,
            request,
        } => {
            if as_json {
                println!(
                    "{}",
                    json!({
                        "status": "awaiting_approval",
                        "session_id": session_id,
                        "request": request,
                    })
                );
            } else {
                println!(
                    "approval required for {} ({} {})",
                    request.operation_id,
                    request.method.as_deref().unwrap_or("?"),
                    request.path.as_deref().unwrap_or("?"),
                );
                if let Some(preview) = &request.resource_preview {
                    println!("target resource: {preview}");
                }
                println!(
                    "respond with: opspilot validations respond {} --approve",
                    request.id
                );
            }
        }
    }
}
