//! # Vellum: real-time voice journaling pipeline client
//!
//! Client-side pipeline for a voice journaling application: a user speaks,
//! audio is captured and chunked while recording continues, chunks stream to
//! the backend for live transcription, the finished transcript is dispatched
//! to an LLM workflow, and the reply comes back as streaming synthesized
//! audio that starts playing before generation finishes. The whole cycle
//! survives pause/resume, network loss, backend reconnects, and cancellation
//! at any phase.
//!
//! ## Architecture
//!
//! - [`recorder`] - Chunked media recording with self-decodable chunks
//! - [`push`] - Server-sent event subscriptions with resume and stale
//!   detection
//! - [`poller`] - Long-running job polling with stale-response discard
//! - [`transcription`] - The streaming transcription orchestrator
//! - [`tts`] - Gapless streaming playback of synthesized audio
//! - [`workflow`] - LLM turn dispatch and tracking
//! - [`session`] - The four-phase voice conversation controller
//! - [`media`] - Lock-screen media-session bridge
//! - [`api`] - Backend HTTP/SSE contracts
//! - [`logging`] - Structured logging, privacy redaction, and metrics
//!
//! ## Usage
//!
//! Build a [`config::PipelineConfig`], an [`api::ApiClient`], and spawn a
//! [`session::VoiceSessionController`] with a microphone source and an audio
//! sink; drive it with user gestures and render its events.

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod media;
pub mod poller;
pub mod push;
pub mod recorder;
pub mod session;
pub mod transcription;
pub mod tts;
pub mod workflow;

#[cfg(test)]
pub mod test_utils;

pub use api::ApiClient;
pub use config::{PipelineConfig, PlatformCaps};
pub use error::{VellumError, VellumResult};
pub use session::{SessionPhase, VoiceSessionController, VoiceSessionEvent, VoiceSessionOptions};
