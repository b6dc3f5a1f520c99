//! C4: the realtime speech-to-speech model session.

pub mod session;

pub use session::{ModelEvent, ModelSession, ModelSessionConfig};
