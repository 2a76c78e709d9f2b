//! Rebuild-and-relaunch supervisor for native programs under development.
//!
//! The binary wires the pieces together: trigger sources ([`hotkey`],
//! [`watch`], [`signals`]) feed [`event::Trigger`]s into a channel that the
//! [`supervisor::Supervisor`] consumes on a single task.

pub mod builder;
pub mod config;
pub mod event;
pub mod hotkey;
pub mod logging;
pub mod process;
pub mod signals;
pub mod status;
pub mod supervisor;
pub mod watch;
