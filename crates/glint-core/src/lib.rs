pub mod aggregator;
pub mod audio;
pub mod config;
pub mod events;

pub use aggregator::{AggregatorOutput, SessionAggregator, SpeechSession};
pub use config::{OrchestratorConfig, CANONICAL_SAMPLE_RATE};
pub use events::{now_unix_millis, ClientMessage, DecodeError, ErrorKind, ServerEvent, VadVerdict};
