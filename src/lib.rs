//! # AgentWire
//!
//! A multi-room voice/text control plane for AI coding agents running inside
//! tmux sessions, local or across SSH-reachable machines.
//!
//! This library provides:
//! - An HTTP/WS portal: one WebSocket per room, push-to-talk, permission
//!   prompts, and streamed terminal output
//! - A session orchestrator that creates, forks, recreates, and kills agent
//!   sessions (with git worktree isolation for branch work)
//! - A speech broker routing synthesis/transcription through local or
//!   SSH-forwarded engines
//!
//! ## Architecture
//!
//! ```text
//!   browser ──ws──┐
//!   browser ──ws──┤   ┌─────────┐    ┌──────────────┐    ┌──────┐
//!                 ├──▶│ RoomHub │◀───│  OutputPump  │◀───│ tmux │
//!   agent hook ───┤   └─────────┘    └──────────────┘    └──┬───┘
//!                 │   ┌──────────────────┐                  │
//!                 └──▶│ SessionRegistry/ │──── HostExecutor ┤ local
//!                     │   Orchestrator   │     (ssh pool)   └ remote
//!                     └──────────────────┘
//! ```
//!
//! ## Modules
//! - `api`: the HTTP/WS surface and composition root
//! - `host`: local and SSH command execution
//! - `mux`: the tmux adapter
//! - `registry` / `orchestrator`: room table and session lifecycle
//! - `hub` / `pump`: per-room fan-out and pane tailing
//! - `permission`: the agent-hook rendezvous
//! - `speech` / `tunnel`: TTS/STT brokering and SSH port-forwards

pub mod api;
pub mod audit;
pub mod config;
pub mod error;
pub mod host;
pub mod hub;
pub mod mux;
pub mod orchestrator;
pub mod permission;
pub mod pump;
pub mod question;
pub mod registry;
pub mod speech;
pub mod tunnel;

pub use config::Config;
pub use error::{PortalError, Result};
