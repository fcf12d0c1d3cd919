//! Terminal confirmations: every `stage_confirmation_required` event is
//! answered from stdin (or automatically with `--yes`).

use anyhow::Result;
use relay_core::events::listener;
use relay_core::{Event, EventKind, Orchestrator, ResearchContext};
use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What the operator typed at a confirmation prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Proceed,
    Rollback(String),
    Modify(String),
    Stop,
}

impl Reply {
    /// `y` / empty, `r <stage>`, `m <text>`, `q`. Anything else is `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (command, rest) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };
        match (command.to_ascii_lowercase().as_str(), rest) {
            ("" | "y" | "yes", _) => Some(Reply::Proceed),
            ("q" | "quit" | "stop", _) => Some(Reply::Stop),
            ("r" | "rollback", target) if !target.is_empty() => {
                Some(Reply::Rollback(target.to_string()))
            }
            ("m" | "modify", text) if !text.is_empty() => Some(Reply::Modify(text.to_string())),
            _ => None,
        }
    }
}

/// Answer confirmations for `orchestrator` until the returned task is aborted
pub fn spawn_confirmer(
    orchestrator: &Arc<Orchestrator<ResearchContext>>,
    auto_confirm: bool,
) -> JoinHandle<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    orchestrator.events().subscribe(
        EventKind::StageConfirmationRequired,
        listener(move |event: &Event| {
            let _ = tx.send(event.clone());
            Ok(())
        }),
    );

    let orchestrator = Arc::clone(orchestrator);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_request(&event);
            let reply = if auto_confirm {
                Reply::Proceed
            } else {
                match read_reply().await {
                    Ok(reply) => reply,
                    Err(e) => {
                        tracing::warn!(error = %e, "Could not read confirmation, stopping");
                        Reply::Stop
                    }
                }
            };

            let outcome = match reply {
                Reply::Proceed => orchestrator.confirm_stage(None, None),
                Reply::Rollback(target) => orchestrator.confirm_stage(None, Some(target)),
                Reply::Modify(text) => orchestrator.confirm_stage(Some(text), None),
                Reply::Stop => orchestrator.stop_workflow(),
            };
            if let Err(e) = outcome {
                tracing::warn!(error = %e, "Confirmation was not delivered");
            }
        }
    })
}

fn print_request(event: &Event) {
    let stage = event.str_field("stage_key").unwrap_or("?");
    println!("\n⏸  Stage `{}` finished", stage);

    let evaluation = &event.data["evaluation"];
    if let Some(score) = evaluation.get("score").and_then(|s| s.as_f64()) {
        let passed = evaluation
            .get("passed")
            .and_then(|p| p.as_bool())
            .unwrap_or(false);
        println!(
            "   Supervisor: {:.0}/100 ({})",
            score,
            if passed { "passed" } else { "not passed" }
        );
        if let Some(target) = evaluation.get("rollback_to").and_then(|t| t.as_str()) {
            println!("   Suggested rollback: {}", target);
        }
    }
}

/// Read lines until one parses
async fn read_reply() -> Result<Reply> {
    loop {
        let line = tokio::task::spawn_blocking(|| -> std::io::Result<Option<String>> {
            print!("   [y] proceed  [r <stage>] rollback  [m <text>] note  [q] stop > ");
            std::io::stdout().flush()?;
            let mut line = String::new();
            let read = std::io::stdin().lock().read_line(&mut line)?;
            Ok((read > 0).then_some(line))
        })
        .await??;

        let Some(line) = line else {
            // EOF
            return Ok(Reply::Stop);
        };
        match Reply::parse(&line) {
            Some(reply) => return Ok(reply),
            None => println!("   Unrecognized reply: {}", line.trim()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_replies() {
        assert_eq!(Reply::parse("\n"), Some(Reply::Proceed));
        assert_eq!(Reply::parse("Y"), Some(Reply::Proceed));
        assert_eq!(Reply::parse("q"), Some(Reply::Stop));
        assert_eq!(
            Reply::parse("r  literature "),
            Some(Reply::Rollback("literature".into()))
        );
        assert_eq!(
            Reply::parse("m tighten the bounds"),
            Some(Reply::Modify("tighten the bounds".into()))
        );
        assert_eq!(Reply::parse("r"), None);
        assert_eq!(Reply::parse("maybe"), None);
    }
}
