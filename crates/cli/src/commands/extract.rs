//! `contextloop extract`: long-term memory extraction over a transcript file.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use contextloop_core::memory::TurnLog;
use contextloop_core::message::{ConversationTurn, Role, SessionId};
use contextloop_memory::{ExtractionReport, InMemoryTurnLog};

pub async fn run(config_path: Option<&Path>, session: &str, transcript: &Path, full: bool) -> anyhow::Result<()> {
    let config = super::load_config(config_path)?;
    let text = std::fs::read_to_string(transcript)
        .with_context(|| format!("Failed to read transcript {}", transcript.display()))?;
    let turns = parse_transcript(&text)?;

    let session = SessionId::from(session);
    let log = Arc::new(InMemoryTurnLog::new());
    for turn in turns {
        log.append(&session, turn).await?;
    }

    let orchestrator = super::orchestrator(&config)?.with_turn_log(log).build()?;
    println!("  Extracting from {} ...", transcript.display());
    let report = orchestrator.extract(&session, !full).await?;
    print_report(&report);

    let profile = orchestrator.profile().await?;
    println!();
    println!("  Profile (version {}):", profile.version);
    println!("{}", serde_json::to_string_pretty(&profile.data)?);
    Ok(())
}

/// Parse `role: content` lines. Blank lines are skipped.
pub fn parse_transcript(text: &str) -> anyhow::Result<Vec<ConversationTurn>> {
    let mut turns = Vec::new();
    for (n, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let Some((role, content)) = line.split_once(':') else {
            bail!("line {}: expected `role: content`", n + 1);
        };
        let role = match role.trim().to_ascii_lowercase().as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "system" => Role::System,
            "tool" => Role::Tool,
            other => bail!("line {}: unknown role '{other}'", n + 1),
        };
        turns.push(ConversationTurn::new(role, content.trim()));
    }
    Ok(turns)
}

pub fn print_report(report: &ExtractionReport) {
    println!();
    if !report.facts.is_empty() {
        println!("  Facts:");
        for fact in &report.facts {
            println!("    - {}", fact.text);
        }
    }
    if let Some(episode) = &report.episode {
        println!("  Episode: {}", episode.summary);
    }
    if let Some(patch) = &report.profile_patch {
        println!(
            "  Profile patch ({} field(s)) -> version {}",
            patch.len(),
            report.profile_version.unwrap_or_default()
        );
    }
    if !report.patterns.is_empty() {
        println!("  Patterns:");
        for pattern in &report.patterns {
            println!("    - {} (x{})", pattern.name, pattern.frequency);
        }
    }
    for kind in &report.skipped {
        println!("  Skipped: {kind}");
    }
    for failure in &report.failures {
        println!("  Failed: {failure}");
    }
    for note in &report.notes {
        println!("  Note: {note}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_roles_and_skips_blank_lines() {
        let turns = parse_transcript("user: hi there\n\nassistant: hello: how can I help?\n").unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[1].content, "hello: how can I help?");
    }

    #[test]
    fn rejects_unknown_role() {
        let err = parse_transcript("user: hi\nrobot: beep").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn rejects_line_without_role() {
        assert!(parse_transcript("just text").is_err());
    }
}
