//! C1: µ-law codec and DTMF tone synthesis.

pub mod mulaw;

pub use mulaw::{chunk_for_stream, generate_dtmf, linear_to_mulaw};
