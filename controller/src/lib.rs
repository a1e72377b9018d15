//! # trackctl Controller Library
//!
//! This library implements a server controller for a racing game's dedicated
//! server. It connects to the server's remote-procedure interface, follows the
//! session as it moves from challenge to challenge, keeps track of who is
//! connected and with which rights, and exposes everything that happens as
//! typed events that other code can subscribe to.
//!
//! ## Core Responsibilities
//!
//! ### Session Tracking
//! The controller turns the raw callbacks of the server (challenge begins
//! and ends, status changes, rounds) into a small state machine: the current
//! challenge, race or score phase, pending restarts and warm-up.
//!
//! ### Player Management
//! Handles the full lifecycle of connecting entities:
//! - Classification into players, relay servers and forwarded players
//! - Admission checks against the banned IP list and minimum client versions
//! - Welcome and record messages on join, session duration on leave
//! - Spectator and ladder updates while connected
//!
//! ### Administration
//! Admin, operator and MasterAdmin rights are resolved from login and IP,
//! optionally gated behind a lock password. Detected cheaters are handled
//! with a configurable escalation, from forcing them into spectator mode up
//! to blacklisting and banning.
//!
//! ## Architecture Design
//!
//! ### Single Control Flow
//! All state lives in one [`engine::Core`] owned by the main loop. Event
//! handlers, chat commands and call completions receive `&mut Core` and run
//! one after another, so no locking is involved anywhere.
//!
//! ### Batched Calls
//! Calls that do not need an immediate answer are staged and sent in one
//! multicall per tick. Replies are matched to calls by their position in the
//! batch; a batch that cannot be matched stops the controller.
//!
//! ## Module Organization
//!
//! ### Engine Module (`engine`)
//! The controller core, callback routing and the connect, chat and finish
//! flows.
//!
//! ### Race Module (`race`)
//! Challenge, record and ranking types and the session state transitions.
//!
//! ### Events and Commands (`events`, `commands`)
//! The closed event vocabulary with its bus, and the chat command registry.
//!
//! ### Players and Permissions (`players`, `permissions`, `moderation`)
//! The player registry, the rights model and cheat escalation with the
//! persisted ban list.
//!
//! ### Transport (`rpc`, `dispatcher`, `network`)
//! The session capability the core relies on, the multicall dispatcher and
//! the bundled TCP implementation.
//!
//! ### Scheduling (`scheduler`)
//! Startup, the readiness wait and the 100 ms main loop. The TCP session
//! blocks on replies, so the controller runs on the multi-threaded runtime.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use controller::config::{load_banned_ips, AdminLists, Settings};
//! use controller::engine::Controller;
//! use controller::moderation::{BanList, FileListStore};
//! use controller::network::TcpSession;
//! use controller::permissions::PermissionRegistry;
//! use controller::scheduler;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load("trackctl.toml")?;
//!     let lists = AdminLists::load(&settings.controller.adminops_file)?;
//!     let ips = load_banned_ips(&settings.controller.bannedips_file)?;
//!
//!     let permissions = PermissionRegistry::new(
//!         settings.masteradmins.clone(),
//!         lists,
//!         settings.controller.lock_password.clone(),
//!     );
//!     let ban_list = BanList::new(ips, Box::new(FileListStore::new(&settings.controller.bannedips_file)));
//!     let session = TcpSession::connect(
//!         &settings.server.address(),
//!         Duration::from_secs(settings.server.timeout_secs),
//!     )
//!     .await?;
//!
//!     let mut controller = Controller::new(session, settings, permissions, ban_list);
//!     scheduler::launch(&mut controller, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod commands;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod moderation;
pub mod network;
pub mod permissions;
pub mod players;
pub mod race;
pub mod rpc;
pub mod scheduler;
pub mod testing;
pub mod utils;
