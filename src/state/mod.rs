//! State machine module for the capture→playback loop
//!
//! Provides the authoritative player state machine with five states:
//! - Unknown: before initialisation, or after an invariant violation
//! - Idle: listening for audio, no playback path
//! - Play: audio present, capture routed to playback
//! - Hybernate: paused by a control command
//! - Killed: terminal, entered on a termination signal

mod command;
mod machine;

pub use command::{Command, Event, SideEffect};
pub use machine::{LoopStateMachine, PlayerState};
