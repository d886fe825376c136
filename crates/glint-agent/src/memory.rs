//! Per-connection conversation memory.
//!
//! Recent turns are kept verbatim; once the estimated token footprint exceeds
//! the budget, the oldest turns are folded into a rolling summary by the
//! language-model client. Summarisation runs concurrently with ingest, but a
//! snapshot taken while it is in flight waits a bounded time before falling
//! back to a pre-summary view. Appends are never lossy: a turn is only dropped
//! from verbatim storage once a summary covering it has landed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::clients::LanguageModel;
use crate::errors::Result;
use glint_core::now_unix_millis;

/// Rough token estimate: four characters per token, rounded up. The budget
/// contract only requires a consistent upper bound, not tokenizer accuracy.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() + 3) / 4
}

/// Clip `text` in place to at most `budget` estimated tokens, keeping the
/// trailing (most recent) characters.
fn clip_to_tokens(text: &mut String, budget: usize) {
    let max_chars = budget * 4;
    let char_count = text.chars().count();
    if char_count > max_chars {
        *text = text.chars().skip(char_count - max_chars).collect();
    }
}

/// One completed exchange. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub user_text: String,
    pub assistant_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_summary: Option<String>,
    pub created_at_ms: u64,
}

impl ConversationTurn {
    pub fn new(
        user_text: impl Into<String>,
        assistant_text: impl Into<String>,
        screen_summary: Option<String>,
    ) -> Self {
        Self {
            user_text: user_text.into(),
            assistant_text: assistant_text.into(),
            screen_summary,
            created_at_ms: now_unix_millis(),
        }
    }

    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.user_text)
            + estimate_tokens(&self.assistant_text)
            + self
                .screen_summary
                .as_deref()
                .map(estimate_tokens)
                .unwrap_or(0)
    }
}

/// The bounded conversation state handed to the language model for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub summary: Option<String>,
    pub turns: Vec<ConversationTurn>,
}

impl MemorySnapshot {
    pub fn estimated_tokens(&self) -> usize {
        self.summary.as_deref().map(estimate_tokens).unwrap_or(0)
            + self
                .turns
                .iter()
                .map(ConversationTurn::estimated_tokens)
                .sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_none() && self.turns.is_empty()
    }
}

struct PendingSummary {
    rx: oneshot::Receiver<Result<String>>,
    /// Number of oldest turns the in-flight summary will replace.
    covers: usize,
}

enum PendingOutcome {
    Applied(String, usize),
    Failed,
    StillRunning,
}

pub struct ConversationMemory {
    llm: Arc<dyn LanguageModel>,
    max_tokens: usize,
    summarize_wait: Duration,
    summary: Option<String>,
    turns: VecDeque<ConversationTurn>,
    pending: Option<PendingSummary>,
}

impl ConversationMemory {
    pub fn new(llm: Arc<dyn LanguageModel>, max_tokens: usize, summarize_wait: Duration) -> Self {
        Self {
            llm,
            max_tokens,
            summarize_wait,
            summary: None,
            turns: VecDeque::new(),
            pending: None,
        }
    }

    /// Record one completed exchange, kicking off summarisation if the budget
    /// is now exceeded.
    pub fn append(&mut self, turn: ConversationTurn) {
        self.turns.push_back(turn);
        self.try_apply_pending();
        self.maybe_summarize();
    }

    /// Build the bounded view for the next model call. Waits a bounded time on
    /// an in-flight summarisation; on timeout the view simply omits the oldest
    /// verbatim turns (they remain stored until the summary lands).
    pub async fn snapshot(&mut self) -> MemorySnapshot {
        self.try_apply_pending();
        let outcome = match self.pending.as_mut() {
            None => PendingOutcome::StillRunning, // nothing pending; fall through
            Some(pending) => {
                match tokio::time::timeout(self.summarize_wait, &mut pending.rx).await {
                    Ok(Ok(Ok(summary))) => PendingOutcome::Applied(summary, pending.covers),
                    Ok(Ok(Err(err))) => {
                        warn!(error = %err, "conversation summarisation failed");
                        PendingOutcome::Failed
                    }
                    Ok(Err(_)) => PendingOutcome::Failed,
                    Err(_) => {
                        debug!("summarisation still in flight, using pre-summary view");
                        PendingOutcome::StillRunning
                    }
                }
            }
        };
        match outcome {
            PendingOutcome::Applied(summary, covers) => {
                self.pending = None;
                self.apply_summary(summary, covers);
            }
            PendingOutcome::Failed => self.pending = None,
            PendingOutcome::StillRunning => {}
        }
        self.bounded_view()
    }

    pub fn clear(&mut self) {
        self.summary = None;
        self.turns.clear();
        self.pending = None;
    }

    pub fn estimated_tokens(&self) -> usize {
        self.summary.as_deref().map(estimate_tokens).unwrap_or(0)
            + self
                .turns
                .iter()
                .map(ConversationTurn::estimated_tokens)
                .sum::<usize>()
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.turns.iter()
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    fn try_apply_pending(&mut self) {
        let outcome = match self.pending.as_mut() {
            None => return,
            Some(pending) => match pending.rx.try_recv() {
                Ok(Ok(summary)) => Some((summary, pending.covers)),
                Ok(Err(err)) => {
                    warn!(error = %err, "conversation summarisation failed");
                    None
                }
                Err(oneshot::error::TryRecvError::Empty) => return,
                Err(oneshot::error::TryRecvError::Closed) => None,
            },
        };
        self.pending = None;
        if let Some((summary, covers)) = outcome {
            self.apply_summary(summary, covers);
        }
    }

    fn apply_summary(&mut self, summary: String, covers: usize) {
        for _ in 0..covers.min(self.turns.len()) {
            self.turns.pop_front();
        }
        self.summary = Some(summary);
        // The fold may not have been enough if turns kept arriving.
        self.maybe_summarize();
    }

    fn maybe_summarize(&mut self) {
        if self.pending.is_some() || self.estimated_tokens() <= self.max_tokens {
            return;
        }
        if self.turns.len() < 2 {
            // The newest turn always stays verbatim.
            return;
        }
        let mut remaining: usize = self
            .turns
            .iter()
            .map(ConversationTurn::estimated_tokens)
            .sum();
        let mut fold = 0;
        for turn in self.turns.iter() {
            if fold >= self.turns.len() - 1 || remaining <= self.max_tokens / 2 {
                break;
            }
            remaining -= turn.estimated_tokens();
            fold += 1;
        }
        if fold == 0 {
            return;
        }
        let to_fold: Vec<ConversationTurn> = self.turns.iter().take(fold).cloned().collect();
        let existing = self.summary.clone();
        let llm = Arc::clone(&self.llm);
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = llm.summarize(&to_fold, existing.as_deref()).await;
            let _ = tx.send(result);
        });
        debug!(folded = fold, "started conversation summarisation");
        self.pending = Some(PendingSummary { rx, covers: fold });
    }

    /// Snapshot of the current state, trimmed (view-only) to the budget:
    /// oldest turns leave the view first, and a lone turn that is itself over
    /// budget is clipped to its most recent words so the bound always holds.
    /// Storage is untouched; the full text remains available for the eventual
    /// summary fold.
    fn bounded_view(&self) -> MemorySnapshot {
        let mut snapshot = MemorySnapshot {
            summary: self.summary.clone(),
            turns: self.turns.iter().cloned().collect(),
        };
        while snapshot.estimated_tokens() > self.max_tokens && snapshot.turns.len() > 1 {
            snapshot.turns.remove(0);
        }
        if snapshot.estimated_tokens() <= self.max_tokens {
            return snapshot;
        }
        if let Some(summary) = snapshot.summary.as_mut() {
            clip_to_tokens(summary, self.max_tokens / 4);
        }
        let turn_budget = self.max_tokens.saturating_sub(
            snapshot.summary.as_deref().map(estimate_tokens).unwrap_or(0),
        );
        if let Some(turn) = snapshot.turns.last_mut() {
            if turn.estimated_tokens() > turn_budget {
                turn.screen_summary = None;
            }
            if turn.estimated_tokens() > turn_budget {
                let half = turn_budget / 2;
                clip_to_tokens(&mut turn.user_text, half);
                clip_to_tokens(&mut turn.assistant_text, turn_budget - half);
            }
        }
        snapshot
    }
}
