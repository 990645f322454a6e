use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use sophia::ai::backend_from_config;
use sophia::client::{ChatApi, ChatController, LogNotifier, TurnOutcome};
use sophia::config::{self, ClientConfig, ServerConfig, StorageKind};
use sophia::persona::PersonaRegistry;
use sophia::retrieval::{CorpusRetriever, Retriever};
use sophia::server::{self, AppState};
use sophia::storage::{LocalRepository, MessageRepository};
use sophia::types::Role;

/// Sophia: talk to philosophers, with an optional audit of every answer
#[derive(Parser, Debug)]
#[command(name = "sophia", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the chat server
    Serve {
        /// Address to bind, overrides SOPHIA_ADDR
        #[arg(long)]
        addr: Option<SocketAddr>,

        /// `file` or `memory`, overrides SOPHIA_STORAGE
        #[arg(long)]
        storage: Option<StorageKind>,

        /// Directory for messages.json, overrides SOPHIA_DATA_DIR
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Directory of per-persona corpus files, overrides SOPHIA_CORPUS_DIR
        #[arg(long)]
        corpus_dir: Option<PathBuf>,
    },

    /// Chat with a running server from the terminal
    Chat {
        /// Server base URL, overrides SOPHIA_SERVER_URL
        #[arg(long)]
        server: Option<String>,

        /// Session id, overrides SOPHIA_SESSION
        #[arg(long)]
        session: Option<String>,

        /// Persona to talk to
        #[arg(long)]
        figure: Option<String>,

        /// Start with the audit trace on
        #[arg(long)]
        audit: bool,
    },
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    config::load_dotenv();

    match cli.command {
        Commands::Serve {
            addr,
            storage,
            data_dir,
            corpus_dir,
        } => {
            let mut config = ServerConfig::from_env().context("Failed to read configuration")?;
            if let Some(addr) = addr {
                config.addr = addr;
            }
            if let Some(storage) = storage {
                config.storage = storage;
            }
            if data_dir.is_some() {
                config.data_dir = data_dir;
            }
            if corpus_dir.is_some() {
                config.corpus_dir = corpus_dir;
            }
            run_server(config).await
        }
        Commands::Chat {
            server,
            session,
            figure,
            audit,
        } => {
            let mut config = ClientConfig::from_env();
            if let Some(server) = server {
                config.server_url = server;
            }
            if let Some(session) = session {
                config.session_id = session;
            }
            run_chat(config, figure, audit).await
        }
    }
}

async fn build_state(config: &ServerConfig) -> Result<AppState> {
    let repo: Arc<dyn MessageRepository> = match config.storage {
        StorageKind::Memory => Arc::new(LocalRepository::in_memory()),
        StorageKind::File => {
            let path = config.messages_path();
            Arc::new(
                LocalRepository::open(&path)
                    .await
                    .with_context(|| format!("Failed to open {}", path.display()))?,
            )
        }
    };

    let mut personas = match &config.personas_file {
        Some(path) => PersonaRegistry::load(path)?,
        None => PersonaRegistry::built_in(),
    };
    if let Some(id) = &config.default_figure {
        personas = personas.with_default(id)?;
    }

    let retriever: Arc<dyn Retriever> = match &config.corpus_dir {
        Some(dir) => Arc::new(CorpusRetriever::new(dir)),
        None => {
            tracing::warn!("no corpus directory configured; answers will not be grounded");
            Arc::new(CorpusRetriever::from_passages(HashMap::new()))
        }
    };

    let backend = backend_from_config(&config.providers)?;
    Ok(AppState::new(repo, personas, retriever, backend, config.history_limit))
}

async fn run_server(config: ServerConfig) -> Result<()> {
    let state = build_state(&config).await?;
    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.addr))?;
    server::serve(listener, state).await?;
    Ok(())
}

const HELP: &str = "\
/audit on|off   toggle the retrieval audit
/figure <id>    switch persona (/figures lists them)
/doc <path>     attach a text file to the next message
/new            start a new conversation
/history        list earlier conversations
/open <id>      reopen a conversation
/delete <id>    delete a message
/quit           exit";

async fn run_chat(config: ClientConfig, figure: Option<String>, audit: bool) -> Result<()> {
    let api = Arc::new(ChatApi::new(&config.server_url, &config.session_id));
    let mut controller = ChatController::new(api.clone(), LogNotifier);
    controller.set_figure(figure);
    controller.set_audit_mode(audit)?;
    controller
        .load()
        .await
        .with_context(|| format!("Failed to reach {}", config.server_url))?;

    println!("Connected to {} as session {}. Type /help for commands.", config.server_url, api.session_id());
    print_messages(&controller);

    let mut document: Option<String> = None;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, arg) = match line.split_once(' ') {
            Some((command, arg)) => (command, arg.trim()),
            None => (line, ""),
        };
        match command {
            "/quit" | "/exit" => break,
            "/help" => println!("{HELP}"),
            "/audit" => match controller.set_audit_mode(arg != "off") {
                Ok(()) => println!("audit {}", if controller.session().audit_mode() { "on" } else { "off" }),
                Err(err) => println!("{err}"),
            },
            "/figure" => {
                controller.set_figure((!arg.is_empty()).then(|| arg.to_string()));
                println!("persona: {}", if arg.is_empty() { "default" } else { arg });
            }
            "/figures" => match api.figures().await {
                Ok(figures) => figures
                    .iter()
                    .for_each(|f| println!("{:<12} {} ({})", f.id, f.name, f.title)),
                Err(err) => println!("{err}"),
            },
            "/doc" => match tokio::fs::read_to_string(arg).await {
                Ok(text) => {
                    println!("attached {} ({} chars)", arg, text.chars().count());
                    document = Some(text);
                }
                Err(err) => println!("cannot read {arg}: {err}"),
            },
            "/new" => match controller.new_conversation().await {
                Ok(id) => println!("new conversation {id}"),
                Err(err) => println!("{err}"),
            },
            "/history" => match api.chat_history().await {
                Ok(conversations) => conversations.iter().for_each(|c| {
                    println!("{}  {} ({} messages)", c.id, c.title, c.message_count)
                }),
                Err(err) => println!("{err}"),
            },
            "/open" => match controller.switch_conversation(Some(arg.to_string())).await {
                Ok(()) => print_messages(&controller),
                Err(err) => println!("{err}"),
            },
            "/delete" => match controller.delete_message(arg).await {
                Ok(()) => println!("deleted {arg}"),
                Err(err) => println!("{err}"),
            },
            _ if command.starts_with('/') => println!("unknown command; /help lists them"),
            _ => send_turn(&mut controller, line, document.take()).await,
        }
    }
    Ok(())
}

fn print_messages(controller: &ChatController<ChatApi, LogNotifier>) {
    for rendered in controller.render() {
        let speaker = match rendered.message.role {
            Role::User => "you",
            Role::Assistant => "them",
        };
        println!("[{speaker}] {}", rendered.message.content);
    }
}

/// Write a streamed piece and flush so it shows before the line ends.
fn echo(out: &mut impl std::io::Write, text: &str) -> std::io::Result<()> {
    out.write_all(text.as_bytes())?;
    out.flush()
}

/// Send one message, echoing tokens as they stream in.
async fn send_turn(controller: &mut ChatController<ChatApi, LogNotifier>, text: &str, document: Option<String>) {
    let mut view = controller.subscribe();
    let mut printed = 0;
    let outcome = {
        let send = controller.send(text, document);
        tokio::pin!(send);
        loop {
            tokio::select! {
                outcome = &mut send => break outcome,
                Ok(()) = view.changed() => {
                    let snapshot = view.borrow_and_update();
                    if let Some(streaming) = snapshot.messages.iter().find(|m| m.streaming) {
                        let content = &streaming.message.content;
                        if let Some(rest) = content.get(printed..) {
                            if let Err(err) = echo(&mut std::io::stdout(), rest) {
                                tracing::debug!(error = %err, "failed to echo streamed text");
                            }
                        }
                        printed = content.len();
                    }
                }
            }
        }
    };

    match outcome {
        Ok(TurnOutcome::Completed { .. }) => {
            let rendered = controller.render();
            let reply = rendered
                .iter()
                .rev()
                .find(|m| m.message.role == Role::Assistant)
                .map(|m| m.message.content.as_str())
                .unwrap_or_default();
            println!("{}", reply.get(printed..).unwrap_or_default());
            if let Some(report) = &controller.session().audit().report {
                println!("{report}");
            }
        }
        Ok(TurnOutcome::Failed) => println!("\nFailed to send message."),
        Err(err) => println!("{err}"),
    }
}
