//! # framemux: raw frame encoder front end
//!
//! Drives a frame source through the pacer into the queued encoder and
//! muxes the result into a file or a live stream.
//!
//! ## Sources
//!
//! - **Synthetic**: moving color bars, for smoke tests and demos.
//! - **Raw**: packed BGR24 frames from a file or stdin (`path = "-"`),
//!   e.g. `ffmpeg -i in.mkv -f rawvideo -pix_fmt bgr24 - | framemux`.
//!
//! ## Pacing
//!
//! - **throttle**: hold a fast source to the configured frame rate.
//! - **live**: stamp frames with their measured spacing instead.
//! - **off**: encode as fast as frames arrive.

pub mod config;
pub mod service;
pub mod source;
