//! Terminal prompt for selection decisions.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;
use undertow_core::selection::SelectionPrompt;

/// Asks on stdin. An empty or unreadable answer counts as a refusal.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl TerminalPrompt {
    async fn ask(&self, question: &str) -> Option<String> {
        let mut stdout = tokio::io::stdout();
        if let Err(e) = async {
            stdout.write_all(question.as_bytes()).await?;
            stdout.flush().await
        }
        .await
        {
            warn!("Cannot write prompt: {e}");
            return None;
        }

        let mut line = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
            Ok(0) => None,
            Ok(_) => Some(line.trim().to_string()),
            Err(e) => {
                warn!("Cannot read answer: {e}");
                None
            }
        }
    }
}

#[async_trait]
impl SelectionPrompt for TerminalPrompt {
    async fn confirm_archive(&self, path: &str) -> bool {
        let question = format!(
            "{path} is an archive and must download completely before playback. Continue? [y/N] "
        );
        self.ask(&question)
            .await
            .is_some_and(|answer| parse_confirmation(&answer))
    }

    async fn choose(&self, title: &str, items: &[String]) -> Option<usize> {
        let mut question = format!("{title}\n");
        for (position, item) in items.iter().enumerate() {
            question.push_str(&format!("  {}) {item}\n", position + 1));
        }
        question.push_str("Choice: ");

        let answer = self.ask(&question).await?;
        parse_choice(&answer, items.len())
    }
}

fn parse_confirmation(answer: &str) -> bool {
    matches!(answer.to_ascii_lowercase().as_str(), "y" | "yes")
}

/// One-based menu choice to a position.
fn parse_choice(answer: &str, count: usize) -> Option<usize> {
    let choice: usize = answer.parse().ok()?;
    (1..=count).contains(&choice).then(|| choice - 1)
}
