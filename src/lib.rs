//! Real-time ultrasonic audio watermarking over the network.
//!
//! A [`CallSession`] captures live audio (or a fixed signal file), embeds an
//! inaudible ultrasonic watermark with a neural embedding network, monitors
//! the result locally, and streams the frames to a callee. A
//! [`ServerSession`] receives the stream, plays it back, scores every frame
//! with a detection network, and reports smoothed (instantaneous, average)
//! watermark probabilities to a registered observer.
//!
//! The pipeline is thread-based: capture, embed+send, receive, detect, and
//! observer delivery each run on their own thread, connected by bounded
//! queues that drop the oldest frame under backpressure and account the
//! loss as an explicit gap.

pub mod aggregate;
pub mod config;
pub mod device;
pub mod diag;
pub mod error;
pub mod frame;
mod lock;
pub mod model;
pub mod session;
pub mod signal;
pub mod telemetry;
pub mod transport;
pub mod watermark;

pub(crate) use lock::lock_or_recover;

pub use config::PipelineConfig;
pub use error::WatermarkError;
pub use frame::AudioFrame;
pub use session::{CallSession, ServerSession, SessionState};
