//! # Audio Module
//!
//! Everything between the sound card and the wire, with no knowledge of the
//! live session itself.
//!
//! ## Key Components:
//! - **codec**: PCM16 / base64 wire format and decoded `AudioBuffer`s
//! - **buffer**: downmix, resample and re-block device input
//! - **capture**: ordered outbound chunk queue and its sender task
//! - **playback**: gapless scheduling of inbound chunks, interruption
//! - **mixer**: software output clock the scheduler schedules against
//! - **resample**: rubato rate conversion for both directions
//!
//! ## Audio Formats:
//! - **Capture**: 16kHz mono PCM16, 4096-sample blocks
//! - **Playback**: 24kHz mono PCM16

pub mod buffer;
pub mod capture;
pub mod codec;
pub mod mixer;
pub mod playback;
pub mod resample;
