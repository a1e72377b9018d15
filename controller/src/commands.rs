//! Chat command registry
//!
//! Commands are typed handlers registered under a normalized token. A chat
//! line starting with `/` is looked up here; tokens nobody registered are
//! rejected.

use crate::error::HandlerError;
use crate::players::Player;
use log::error;
use std::collections::HashMap;

/// A command invocation by a connected player
#[derive(Debug, Clone, PartialEq)]
pub struct ChatCommand {
    pub author: Player,
    /// Normalized token
    pub name: String,
    /// Everything after the token, trimmed
    pub params: String,
}

/// Outcome of [`CommandRegistry::dispatch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    Failed,
    Unknown,
}

pub type CommandHandler<C> = Box<dyn FnMut(&mut C, &ChatCommand) -> Result<(), HandlerError>>;

struct CommandEntry<C> {
    help: String,
    admin_only: bool,
    handler: CommandHandler<C>,
}

/// Maps `+` and `-` to words so `/+` and `/-` get usable names
pub fn normalize_token(token: &str) -> String {
    token.replace('+', "plus").replace('-', "dash").to_lowercase()
}

/// Splits `/name rest of line` into the normalized token and its parameters
pub fn parse_command_line(text: &str) -> Option<(String, String)> {
    let line = text.strip_prefix('/')?;
    let mut parts = line.splitn(2, ' ');
    let token = parts.next().filter(|t| !t.is_empty())?;
    let params = parts.next().unwrap_or("").trim().to_string();
    Some((normalize_token(token), params))
}

pub struct CommandRegistry<C> {
    commands: HashMap<String, CommandEntry<C>>,
    order: Vec<String>,
}

impl<C> Default for CommandRegistry<C> {
    fn default() -> Self {
        Self {
            commands: HashMap::new(),
            order: Vec::new(),
        }
    }
}

impl<C> CommandRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler; a second registration of the same token replaces the first
    pub fn register<F>(&mut self, name: &str, help: &str, admin_only: bool, handler: F)
    where
        F: FnMut(&mut C, &ChatCommand) -> Result<(), HandlerError> + 'static,
    {
        let token = normalize_token(name);
        if !self.commands.contains_key(&token) {
            self.order.push(token.clone());
        }
        self.commands.insert(
            token,
            CommandEntry {
                help: help.to_string(),
                admin_only,
                handler: Box::new(handler),
            },
        );
    }

    pub fn contains(&self, token: &str) -> bool {
        self.commands.contains_key(token)
    }

    pub fn help(&self, token: &str) -> Option<&str> {
        self.commands.get(token).map(|entry| entry.help.as_str())
    }

    /// Commands to announce to the server, in registration order
    ///
    /// Admin-only commands are left out.
    pub fn commands(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order.iter().filter_map(|token| {
            let entry = self.commands.get(token)?;
            (!entry.admin_only).then_some((token.as_str(), entry.help.as_str()))
        })
    }

    pub fn dispatch(&mut self, context: &mut C, command: &ChatCommand) -> Dispatch {
        let Some(entry) = self.commands.get_mut(&command.name) else {
            return Dispatch::Unknown;
        };

        match (entry.handler)(context, command) {
            Ok(()) => Dispatch::Handled,
            Err(e) => {
                error!(
                    "chat command /{} by {} failed: {}",
                    command.name, command.author.login, e
                );
                Dispatch::Failed
            }
        }
    }
}
