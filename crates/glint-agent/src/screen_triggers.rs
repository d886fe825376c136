//! Keyword pre-filter for screen-capture requests.
//!
//! Runs on the transcription before the language model sees it: when the user
//! is plainly asking about what they are looking at, the capture round-trip
//! starts immediately instead of waiting for the model to ask. The model-side
//! sentinel remains authoritative; this only moves the round-trip earlier.

/// Phrases that directly reference the screen.
const EXPLICIT_TRIGGERS: &[&str] = &[
    "screen",
    "display",
    "see",
    "look",
    "show",
    "what's on",
    "what is on",
    "current page",
    "this page",
    "this screen",
    "my screen",
    "the screen",
    "what am i",
    "where am i",
    "help with this",
    "help me with this",
    "what do you see",
    "can you see",
    "describe",
    "read this",
];

/// Words suggesting the user needs help with what is in front of them.
const CONTEXT_WORDS: &[&str] = &[
    "error",
    "issue",
    "problem",
    "bug",
    "broken",
    "not working",
    "help",
    "stuck",
    "confused",
    "understand",
    "explain",
    "debug",
    "fix",
];

const QUESTION_INDICATORS: &[&str] = &[
    "what", "how", "where", "why", "which", "when", "can you", "could you", "would you",
    "should i", "do i", "am i", "is this",
];

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerHit {
    pub confidence: f32,
    pub reason: &'static str,
}

/// Decide whether a transcription warrants fetching a screen capture before
/// the first model call. Mirrors the confidence ladder of the production
/// heuristic: explicit screen references score highest, then help-shaped
/// questions, then longer contextual phrases.
pub fn should_capture(text: &str) -> Option<TriggerHit> {
    let lower = text.to_lowercase();
    let word_count = lower.split_whitespace().count();

    let explicit = EXPLICIT_TRIGGERS.iter().any(|t| lower.contains(t));
    let context = CONTEXT_WORDS.iter().any(|w| lower.contains(w));
    let question = QUESTION_INDICATORS
        .iter()
        .any(|q| lower.starts_with(q) || lower.contains(&format!(" {q}")));

    let hit = if explicit {
        TriggerHit {
            confidence: 0.9,
            reason: "explicit_trigger",
        }
    } else if context && question {
        TriggerHit {
            confidence: 0.8,
            reason: "context_question",
        }
    } else if context && word_count > 3 {
        TriggerHit {
            confidence: 0.6,
            reason: "context_phrase",
        }
    } else {
        return None;
    };

    (hit.confidence >= 0.6).then_some(hit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_screen_reference_triggers() {
        let hit = should_capture("what's on my screen right now").expect("should trigger");
        assert_eq!(hit.reason, "explicit_trigger");
    }

    #[test]
    fn help_shaped_question_triggers() {
        let hit = should_capture("why is my build failing with an error").expect("should trigger");
        assert_eq!(hit.reason, "context_question");
    }

    #[test]
    fn small_talk_does_not_trigger() {
        assert!(should_capture("tell me a joke").is_none());
        assert!(should_capture("good morning").is_none());
    }

    #[test]
    fn short_context_mention_does_not_trigger() {
        // A bare context word without a question and under four words.
        assert!(should_capture("big problem").is_none());
    }
}
