//! Interactive REPL.
//!
//! Launch with `remote-query repl`. Lines starting with `/` are commands;
//! anything else is a query (`FROM Order WHERE Total > 10 TAKE 5`).

use std::sync::Arc;

use rustyline::completion::{Completer, Pair};
use rustyline::config::CompletionType;
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{
    Cmd, ConditionalEventHandler, Config, Editor, Event, EventContext, EventHandler, Helper,
    KeyEvent, RepeatCount,
};
use tokio_util::sync::CancellationToken;

use remote_query::dynamic::with_scope;
use remote_query::pipeline::execute_async;
use remote_query::DynamicValue;

use crate::config::resolve_data_path;
use crate::dsl::parse_query;
use crate::protocol::{RemoteQueryClient, TcpConnector};
use crate::session::DataSession;
use crate::types::ServerResult;

const COMMANDS: &[(&str, &str)] = &[
    ("/load", "Load a dataset file"),
    ("/types", "List declared types"),
    ("/sources", "List sources and row counts"),
    ("/connect", "Run queries against a server (host:port)"),
    ("/disconnect", "Run queries locally again"),
    ("/clear", "Clear the screen"),
    ("/help", "Show available commands"),
    ("/exit", "Quit the REPL"),
];

const KEYWORDS: &[&str] = &["FROM", "WHERE", "AND", "ORDER BY", "DESC", "SKIP", "TAKE"];

struct QueryHelper;

impl Completer for QueryHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let input = &line[..pos];

        if input.starts_with('/') && !input.contains(' ') {
            let matches: Vec<Pair> = COMMANDS
                .iter()
                .filter(|(cmd, _)| cmd.starts_with(input))
                .map(|(cmd, desc)| Pair {
                    display: format!("{cmd:<16} {desc}"),
                    replacement: format!("{cmd} "),
                })
                .collect();
            return Ok((0, matches));
        }

        if input.starts_with("/load ") {
            let start = "/load ".len();
            let prefix = &input[start..];
            let mut files: Vec<String> = std::fs::read_dir(".")
                .into_iter()
                .flatten()
                .flatten()
                .filter_map(|entry| {
                    let path = entry.path();
                    if path.extension().is_some_and(|e| e == "json") {
                        path.file_name().and_then(|s| s.to_str()).map(str::to_string)
                    } else {
                        None
                    }
                })
                .filter(|f| f.starts_with(prefix))
                .collect();
            files.sort();
            let matches = files
                .into_iter()
                .map(|f| Pair {
                    display: f.clone(),
                    replacement: f,
                })
                .collect();
            return Ok((start, matches));
        }

        let word_start = input.rfind(' ').map(|i| i + 1).unwrap_or(0);
        let word = &input[word_start..];
        if word.is_empty() {
            return Ok((pos, Vec::new()));
        }
        let matches = KEYWORDS
            .iter()
            .filter(|k| k.starts_with(&word.to_ascii_uppercase()))
            .map(|k| Pair {
                display: k.to_string(),
                replacement: format!("{k} "),
            })
            .collect();
        Ok((word_start, matches))
    }
}

impl Hinter for QueryHelper {
    type Hint = String;

    fn hint(&self, line: &str, pos: usize, _ctx: &rustyline::Context<'_>) -> Option<String> {
        if pos < line.len() || !line.starts_with('/') || line.contains(' ') {
            return None;
        }
        COMMANDS
            .iter()
            .find(|(cmd, _)| cmd.starts_with(line) && *cmd != line)
            .map(|(cmd, _)| cmd[line.len()..].to_string())
    }
}

impl Highlighter for QueryHelper {}
impl Validator for QueryHelper {}
impl Helper for QueryHelper {}

struct TabCompleteOrAcceptHint;

impl ConditionalEventHandler for TabCompleteOrAcceptHint {
    fn handle(
        &self,
        _evt: &Event,
        _n: RepeatCount,
        _positive: bool,
        ctx: &EventContext<'_>,
    ) -> Option<Cmd> {
        if ctx.has_hint() {
            Some(Cmd::CompleteHint)
        } else {
            Some(Cmd::Complete)
        }
    }
}

struct ReplState {
    session: DataSession,
    remote: Option<RemoteQueryClient>,
}

/// Pretty JSON in the wire encoding.
pub fn render(value: &DynamicValue) -> ServerResult<String> {
    Ok(with_scope(|| serde_json::to_string_pretty(value))?)
}

/// Run the interactive REPL over the dataset at `data`.
pub async fn run(data: Option<&str>) -> anyhow::Result<()> {
    eprintln!();
    eprintln!(
        "  \x1b[1mremote-query v{}\x1b[0m",
        env!("CARGO_PKG_VERSION")
    );
    eprintln!(
        "    Type a query, \x1b[36m/help\x1b[0m for commands, \x1b[90mTab\x1b[0m to complete."
    );
    eprintln!();

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .completion_type(CompletionType::List)
        .completion_prompt_limit(20)
        .build();

    let mut rl: Editor<QueryHelper, rustyline::history::DefaultHistory> = Editor::with_config(config)?;
    rl.set_helper(Some(QueryHelper));
    rl.bind_sequence(
        KeyEvent::from('\t'),
        EventHandler::Conditional(Box::new(TabCompleteOrAcceptHint)),
    );

    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    let hist_path = std::path::PathBuf::from(&home).join(".remote_query_history");
    if hist_path.exists() {
        let _ = rl.load_history(&hist_path);
    }

    let mut state = ReplState {
        session: DataSession::open_or_empty(resolve_data_path(data))?,
        remote: None,
    };

    loop {
        let prompt = if state.remote.is_some() {
            " \x1b[35mremote>\x1b[0m "
        } else {
            " \x1b[36mquery>\x1b[0m "
        };
        let read = tokio::task::block_in_place(|| rl.readline(prompt));
        match read {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let Some(input) = line.strip_prefix('/') else {
                    run_query(line, &state).await;
                    continue;
                };

                let mut parts = input.splitn(2, ' ');
                let cmd = parts.next().unwrap_or("");
                let args = parts.next().unwrap_or("").trim();

                match cmd {
                    "exit" | "quit" => {
                        eprintln!("  Goodbye!");
                        break;
                    }
                    "" | "help" | "h" | "?" => cmd_help(),
                    "clear" | "cls" => eprint!("\x1b[2J\x1b[H"),
                    "load" => cmd_load(args, &mut state),
                    "types" => cmd_types(&state),
                    "sources" => cmd_sources(&state),
                    "connect" => {
                        let addr = crate::config::resolve_addr((!args.is_empty()).then_some(args));
                        eprintln!("  Queries now run on {addr}");
                        state.remote = Some(RemoteQueryClient::new(Arc::new(TcpConnector::new(addr))));
                    }
                    "disconnect" => {
                        state.remote = None;
                        eprintln!("  Queries now run locally");
                    }
                    _ => eprintln!("  Unknown command '/{cmd}'. Type /help for commands."),
                }
            }
            Err(ReadlineError::Interrupted) => {
                eprintln!("  (Ctrl+C) Type /exit to quit.");
            }
            Err(ReadlineError::Eof) => {
                eprintln!("  Goodbye!");
                break;
            }
            Err(err) => {
                eprintln!("  Error: {err}");
                break;
            }
        }
    }

    let _ = rl.save_history(&hist_path);
    Ok(())
}

async fn run_query(text: &str, state: &ReplState) {
    let result = async {
        let expression = parse_query(text, state.session.registry())?.to_expression();
        let value = match &state.remote {
            Some(client) => client.execute(expression).await?,
            None => {
                let executor = state.session.executor();
                execute_async(executor.as_ref(), expression, &CancellationToken::new()).await?
            }
        };
        render(&value)
    }
    .await;

    match result {
        Ok(text) => println!("{text}"),
        Err(e) => eprintln!("  Error: {e}"),
    }
}

fn cmd_help() {
    eprintln!();
    eprintln!("  Commands:");
    eprintln!();
    for (cmd, desc) in COMMANDS {
        eprintln!("    {cmd:<18} {desc}");
    }
    eprintln!();
    eprintln!("  Queries: FROM <Type> [WHERE a > 1 AND ...] [ORDER BY a [DESC], ...] [SKIP n] [TAKE n]");
    eprintln!();
}

fn cmd_load(args: &str, state: &mut ReplState) {
    if args.is_empty() {
        eprintln!("  Usage: /load <data.json>");
        return;
    }
    match DataSession::open(args) {
        Ok(session) => {
            eprintln!(
                "  Loaded: {args} ({} types, {} sources)",
                session.type_names().len(),
                session.source_counts().len()
            );
            state.session = session;
        }
        Err(e) => eprintln!("  Failed to load: {e}"),
    }
}

fn cmd_types(state: &ReplState) {
    let registry = state.session.registry();
    eprintln!();
    for ty in registry.named_types() {
        match ty.enum_variants() {
            Some(variants) => eprintln!("    enum {} {{ {} }}", ty.name(), variants.join(", ")),
            None => {
                let fields: Vec<String> = ty
                    .fields()
                    .iter()
                    .map(|f| format!("{}: {}", f.name, f.ty))
                    .collect();
                eprintln!("    {} {{ {} }}", ty.name(), fields.join(", "));
            }
        }
    }
    eprintln!();
}

fn cmd_sources(state: &ReplState) {
    eprintln!();
    for (name, rows) in state.session.source_counts() {
        eprintln!("    {name:<24} {rows} rows");
    }
    eprintln!();
}
