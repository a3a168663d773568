//! sessionbox - per-session sandboxes with persistent volumes.
//!
//! Usage:
//!   sessionbox serve [--port 8080]                          # Start HTTP server
//!   sessionbox run --session <id> [--language py] -- <cmd>  # One-shot command

use std::process::exit;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sessionbox::config::{Config, ConfigArgs};
use sessionbox::http_server;
use sessionbox::provisioner::Language;
use sessionbox::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "sessionbox")]
#[command(about = "Per-session sandboxes with persistent volumes")]
struct Args {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, env = "SESSIONBOX_PORT", default_value = "8080")]
        port: u16,
    },
    /// Run one command in a session's sandbox and print its output
    Run {
        /// Session identifier
        #[arg(long)]
        session: String,

        /// Language hint used when a sandbox has to be created
        #[arg(long)]
        language: Option<String>,

        /// Working directory inside the workspace
        #[arg(long)]
        workdir: Option<String>,

        /// Command and arguments to run
        #[arg(last = true, required = true)]
        cmd_args: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::from(args.config);
    let state = match AppState::from_config(config) {
        Ok(state) => state,
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(1);
        }
    };

    match args.command {
        Commands::Serve { port } => {
            if let Err(e) = http_server::run_server(port, state).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        Commands::Run {
            session,
            language,
            workdir,
            cmd_args,
        } => {
            let language = language.as_deref().map(Language::parse);
            if let Err(e) = state.manager.get_or_create(&session, language).await {
                eprintln!("Error: {}", e.public_message());
                exit(1);
            }
            let command = shell_words::join(&cmd_args);
            match state.executor.run_command(&session, &command, workdir.as_deref()).await {
                Ok(output) => {
                    print!("{}", output.stdout);
                    eprint!("{}", output.stderr);
                    exit(match output.exit_code {
                        Some(code) => code,
                        None if output.success => 0,
                        None => 1,
                    });
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            }
        }
    }
}
