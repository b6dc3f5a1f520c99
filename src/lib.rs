//! supercall-core: places and supervises outbound AI-persona phone calls,
//! bridging a carrier's PSTN/media-stream web-socket and a realtime
//! speech-to-speech model web-socket.

pub mod app;
pub mod audio;
pub mod bridge;
pub mod call;
pub mod config;
pub mod constants;
pub mod errors;
pub mod front_door;
pub mod model;
pub mod telephony;
pub mod tunnel;

pub use app::{App, CallAction, CallActionResult};
pub use config::Config;
