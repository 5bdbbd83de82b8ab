//! remote-query: serve, query and explore a dataset over the streaming protocol.

use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use remote_query::native::QueryOperator;
use remote_query::pipeline::{execute_async, execute_stream};

use remote_query_server::config::{resolve_addr, resolve_data_path};
use remote_query_server::dsl::parse_query;
use remote_query_server::protocol::{ProtocolHandler, RemoteQueryClient, TcpConnector};
use remote_query_server::repl::render;
use remote_query_server::session::DataSession;
use remote_query_server::transport::{SocketTransport, StdioTransport};
use remote_query_server::types::{error_codes, query_error_codes, PROTOCOL_VERSION};

#[derive(Parser)]
#[command(
    name = "remote-query",
    about = "Ship queries as portable expression trees and stream the results back",
    version
)]
struct Cli {
    /// Path to the dataset file.
    #[arg(short, long, global = true)]
    data: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the dataset (default).
    Serve {
        /// Listen address (host:port). Also reads REMOTE_QUERY_ADDR.
        #[arg(long)]
        addr: Option<String>,

        /// Serve a single connection over stdin/stdout instead of TCP.
        #[arg(long)]
        stdio: bool,
    },

    /// Run one query, e.g. "FROM Order WHERE Total > 10 TAKE 5".
    Query {
        text: String,

        /// Send the query to a running server instead of running it here.
        #[arg(long)]
        remote: bool,

        /// Server address used with --remote.
        #[arg(long)]
        addr: Option<String>,

        /// Pull results one element at a time.
        #[arg(long)]
        stream: bool,
    },

    /// Validate a dataset file.
    Validate,

    /// Print protocol details as JSON.
    Info,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   remote-query completions bash > ~/.local/share/bash-completion/completions/remote-query
    ///   remote-query completions zsh > ~/.zfunc/_remote-query
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },

    /// Launch interactive REPL mode.
    Repl,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let data = cli.data.as_deref();

    match cli.command.unwrap_or(Commands::Serve {
        addr: None,
        stdio: false,
    }) {
        Commands::Serve { addr, stdio } => {
            let data_path = resolve_data_path(data);
            let session = DataSession::open_or_empty(&data_path)?;
            let handler = ProtocolHandler::new(session.executor());
            if stdio {
                StdioTransport::new(handler).run().await?;
            } else {
                let addr = resolve_addr(addr.as_deref());
                tracing::info!("remote-query server, dataset {data_path}");
                SocketTransport::new(handler).run(&addr).await?;
            }
        }

        Commands::Query {
            text,
            remote,
            addr,
            stream,
        } => {
            let session = DataSession::open(resolve_data_path(data))?;
            let expression = parse_query(&text, session.registry())?.to_expression();
            let cancel = CancellationToken::new();

            match (remote, stream) {
                (true, true) => {
                    let client = remote_client(addr.as_deref());
                    let mut items = client.stream(expression).into_stream();
                    while let Some(item) = items.next().await {
                        println!("{}", render(&item?)?);
                    }
                }
                (true, false) => {
                    let value = remote_client(addr.as_deref()).execute(expression).await?;
                    println!("{}", render(&value)?);
                }
                (false, true) => {
                    let mut items = execute_stream(session.executor(), expression, cancel).await?;
                    while let Some(item) = items.next().await {
                        println!("{}", render(&item?)?);
                    }
                }
                (false, false) => {
                    let value = execute_async(session.executor().as_ref(), expression, &cancel).await?;
                    println!("{}", render(&value)?);
                }
            }
        }

        Commands::Validate => {
            let data_path = resolve_data_path(data);
            match DataSession::open(&data_path) {
                Ok(session) => {
                    println!("Valid dataset: {data_path}");
                    println!("  Types:   {}", session.type_names().join(", "));
                    for (name, rows) in session.source_counts() {
                        println!("  Source:  {name} ({rows} rows)");
                    }
                }
                Err(e) => {
                    eprintln!("Invalid dataset: {e}");
                    std::process::exit(1);
                }
            }
        }

        Commands::Info => {
            let info = serde_json::json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "client_messages": ["stream_query", "query", "next"],
                "server_messages": ["next_response", "query_result", "error"],
                "operators": QueryOperator::ALL.iter().map(|op| op.name()).collect::<Vec<_>>(),
                "error_codes": {
                    "parse": error_codes::PARSE_ERROR,
                    "invalid_request": error_codes::INVALID_REQUEST,
                    "internal": error_codes::INTERNAL_ERROR,
                    "cancelled": query_error_codes::CANCELLED,
                    "translation": query_error_codes::TRANSLATION,
                    "type_resolution": query_error_codes::TYPE_RESOLUTION,
                    "mapping": query_error_codes::MAPPING,
                    "protocol_desync": query_error_codes::PROTOCOL_DESYNC,
                    "execution": query_error_codes::EXECUTION,
                    "empty_or_oversized_result": query_error_codes::EMPTY_OR_OVERSIZED_RESULT,
                    "already_enumerated": query_error_codes::ALREADY_ENUMERATED,
                    "out_of_order": query_error_codes::OUT_OF_ORDER,
                    "no_active_stream": query_error_codes::NO_ACTIVE_STREAM,
                    "session": query_error_codes::SESSION_ERROR,
                },
            });
            println!("{}", serde_json::to_string_pretty(&info)?);
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "remote-query", &mut std::io::stdout());
        }

        Commands::Repl => {
            remote_query_server::repl::run(data).await?;
        }
    }

    Ok(())
}

fn remote_client(addr: Option<&str>) -> RemoteQueryClient {
    RemoteQueryClient::new(Arc::new(TcpConnector::new(resolve_addr(addr))))
}
