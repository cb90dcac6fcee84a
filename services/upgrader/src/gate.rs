//! Admission gates consulted before each round.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Go/no-go check before a round starts.
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    /// Returns `false` to close the window without starting the round.
    async fn admit(&self, window: &str, round: u32) -> bool;
}

/// Admits every round.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAdmit;

#[async_trait]
impl AdmissionGate for AlwaysAdmit {
    async fn admit(&self, _window: &str, _round: u32) -> bool {
        true
    }
}

/// Asks the operator on stdin; `1` or `y` continues.
pub struct ConsolePrompt {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl ConsolePrompt {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

impl Default for ConsolePrompt {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether an operator answer means "continue".
pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "1" | "y" | "yes")
}

#[async_trait]
impl AdmissionGate for ConsolePrompt {
    async fn admit(&self, window: &str, round: u32) -> bool {
        let mut stdout = tokio::io::stdout();
        let prompt = format!("[{window}] start round {round}? (1/y = continue, anything else = stop): ");
        if let Err(e) = stdout.write_all(prompt.as_bytes()).await {
            warn!(error = %e, "Failed to write prompt");
        }
        let _ = stdout.flush().await;

        let answer = match self.lines.lock().await.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                warn!("Stdin closed, stopping");
                return false;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read answer, stopping");
                return false;
            }
        };

        let admitted = is_affirmative(&answer);
        info!(window, round, admitted, "Operator answered");
        admitted
    }
}
