//! `contextloop chat`: single-message or interactive chat.

use std::io::Write;
use std::path::Path;

use contextloop_agent::{MemoryStats, TurnOrchestrator, TurnResponse};
use contextloop_config::AppConfig;
use contextloop_core::error::Error;
use contextloop_core::message::SessionId;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

pub async fn run(
    config_path: Option<&Path>,
    session: &str,
    message: Option<String>,
    show_trace: bool,
) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let orchestrator = super::orchestrator(&config)?.build()?;
    let session = SessionId::from(session);

    if let Some(msg) = message {
        eprint!("  Thinking...");
        let response = turn(&orchestrator, &config, &session, &msg).await;
        eprint!("\r              \r");
        print_response(&response?, show_trace)?;
        return Ok(());
    }

    println!();
    println!("  contextloop interactive mode");
    println!();
    println!("  Model:     {}", config.provider.model);
    println!("  Session:   {session}");
    println!("  Memory:    {:?} (long-term: {})", config.memory.strategy, config.memory.include.join(", "));
    println!("  Budget:    {} tokens, {:?} priority", config.context.max_tokens, config.context.priority);
    println!();
    println!("  Commands: /profile, /extract, /history, /stats, /search <query>, /reset, exit");
    println!("  Ctrl+C cancels the current answer.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        match Command::parse(&line) {
            Command::Empty => continue,
            Command::Exit => break,
            Command::Profile => {
                let profile = orchestrator.profile().await?;
                println!("  (version {})", profile.version);
                println!("{}", serde_json::to_string_pretty(&profile.data)?);
            }
            Command::Extract => {
                let report = orchestrator.extract(&session, true).await?;
                super::extract::print_report(&report);
            }
            Command::History => {
                for turn in orchestrator.history(&session).await? {
                    println!("  [{}] {}: {}", turn.seq, turn.role, turn.content);
                }
            }
            Command::Stats => print_stats(&orchestrator.stats(&session).await?),
            Command::Reset => {
                let removed = orchestrator.reset(&session).await?;
                println!("  Session cleared ({removed} turn(s) removed)");
            }
            Command::Search(query) => {
                let hits = orchestrator.search_facts(&session, query, SEARCH_LIMIT).await?;
                if hits.is_empty() {
                    println!("  No matching facts");
                }
                for hit in hits {
                    println!("  {:.2}  {}", hit.score, hit.fact.text);
                }
            }
            Command::Usage(usage) => eprintln!("  usage: {usage}"),
            Command::Message(input) => {
                eprint!("  ...");
                let result = turn(&orchestrator, &config, &session, input).await;
                eprint!("\r     \r");
                match result {
                    Ok(response) => print_response(&response, show_trace)?,
                    Err(Error::Cancelled) => eprintln!("  [Cancelled]"),
                    Err(e) => eprintln!("  [Error] {e}"),
                }
            }
        }
        println!();
    }

    println!();
    println!("  Goodbye!");
    println!();
    Ok(())
}

const SEARCH_LIMIT: usize = 5;

/// A line typed at the interactive prompt.
#[derive(Debug, PartialEq)]
enum Command<'a> {
    Empty,
    Exit,
    Profile,
    Extract,
    History,
    Stats,
    Reset,
    Search(&'a str),
    Usage(&'static str),
    Message(&'a str),
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        let input = line.trim();
        match input {
            "" => Self::Empty,
            "exit" | "quit" => Self::Exit,
            "/profile" => Self::Profile,
            "/extract" => Self::Extract,
            "/history" => Self::History,
            "/stats" => Self::Stats,
            "/reset" => Self::Reset,
            _ => match input.strip_prefix("/search") {
                Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => match rest.trim() {
                    "" => Self::Usage("/search <query>"),
                    query => Self::Search(query),
                },
                _ => Self::Message(input),
            },
        }
    }
}

fn print_stats(stats: &MemoryStats) {
    println!("  Messages:   {} ({} tokens)", stats.message_count, stats.token_count);
    println!(
        "  Long-term:  {} fact(s), {} episode(s), {} pattern(s)",
        stats.semantic_facts_count, stats.episodes_count, stats.patterns_count
    );
    println!("  Profile:    {} attribute(s)", stats.profile_attributes_count);
    if let (Some(oldest), Some(newest)) = (stats.oldest_message, stats.newest_message) {
        println!("  Span:       {} .. {}", oldest.to_rfc3339(), newest.to_rfc3339());
    }
}

/// One turn, cancelled by Ctrl+C.
async fn turn(
    orchestrator: &TurnOrchestrator,
    config: &AppConfig,
    session: &SessionId,
    message: &str,
) -> Result<TurnResponse, Error> {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.cancel();
        }
    });

    let result = orchestrator
        .run_with_cancel(session, message, &config.memory, &config.rag, &config.tools, cancel)
        .await;
    watcher.abort();
    result
}

fn print_response(response: &TurnResponse, show_trace: bool) -> anyhow::Result<()> {
    println!();
    for line in response.final_answer.lines() {
        println!("  Assistant > {line}");
    }

    let context = &response.assembled_context;
    if show_trace {
        println!();
        println!(
            "  context: {}/{} tokens, sections: [{}]",
            context.total_tokens,
            context.max_tokens,
            context.titles().join(", ")
        );
        for warning in &context.warnings {
            println!("  warning: {warning}");
        }
        for source in &response.rag_sources {
            println!(
                "  source: {}#{} ({}, score {:.2})",
                source.source_id, source.chunk_index, source.namespace, source.score
            );
        }
        println!("{}", serde_json::to_string_pretty(&response.agent_trace)?);
    } else if context.truncated {
        eprintln!("  (context truncated: {} warning(s); use --trace for details)", context.warnings.len());
    }
    Ok(())
}
