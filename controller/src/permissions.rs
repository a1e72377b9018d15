//! Three-tier privilege model with IP-bound entries.
//!
//! Tiers are checked in the order MasterAdmin, Admin, Operator and the first
//! tier listing the login decides. An entry may pin the login to one or more
//! IP patterns; a login presented from a non-matching address is refused for
//! that tier and is not retried against the lower tiers.

use crate::config::AdminLists;
use crate::players::Player;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    MasterAdmin,
    Admin,
    Operator,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::MasterAdmin => "MasterAdmin",
            Tier::Admin => "Admin",
            Tier::Operator => "Operator",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessEntry {
    pub login: String,
    /// Comma separated IP patterns; empty allows any address.
    #[serde(default)]
    pub ip: String,
}

impl AccessEntry {
    pub fn new(login: impl Into<String>, ip: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            ip: ip.into(),
        }
    }
}

/// Checks a player address against a comma separated pattern list.
///
/// Each pattern is a literal dotted quad, `a.b.*.*` or `a.b.c.*`. An empty
/// player address matches anything.
pub fn ip_matches(player_ip: &str, patterns: &str) -> bool {
    if player_ip.is_empty() {
        return true;
    }

    patterns.split(',').map(str::trim).any(|pattern| {
        if is_dotted_quad(pattern) {
            player_ip == pattern
        } else if let Some(prefix) = pattern.strip_suffix(".*.*") {
            strip_octets(player_ip, 2) == Some(prefix)
        } else if let Some(prefix) = pattern.strip_suffix(".*") {
            strip_octets(player_ip, 1) == Some(prefix)
        } else {
            false
        }
    })
}

fn is_numeric(part: &str) -> bool {
    !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit())
}

fn is_dotted_quad(text: &str) -> bool {
    let parts: Vec<&str> = text.split('.').collect();
    parts.len() == 4 && parts.iter().all(|p| is_numeric(p))
}

/// Drops the last `count` numeric octets of an address.
fn strip_octets(ip: &str, count: usize) -> Option<&str> {
    let mut rest = ip;
    for _ in 0..count {
        let (head, tail) = rest.rsplit_once('.')?;
        if !is_numeric(tail) {
            return None;
        }
        rest = head;
    }
    Some(rest)
}

/// Admin and operator lists plus ability switches, read-only at runtime.
#[derive(Debug, Clone, Default)]
pub struct PermissionRegistry {
    masteradmins: Vec<AccessEntry>,
    admins: Vec<AccessEntry>,
    operators: Vec<AccessEntry>,
    admin_abilities: HashMap<String, bool>,
    operator_abilities: HashMap<String, bool>,
    lock_password: String,
}

impl PermissionRegistry {
    pub fn new(
        masteradmins: Vec<AccessEntry>,
        lists: AdminLists,
        lock_password: impl Into<String>,
    ) -> Self {
        Self {
            masteradmins,
            admins: lists.admins,
            operators: lists.operators,
            admin_abilities: lists.admin_abilities,
            operator_abilities: lists.operator_abilities,
            lock_password: lock_password.into(),
        }
    }

    fn entries(&self, tier: Tier) -> &[AccessEntry] {
        match tier {
            Tier::MasterAdmin => &self.masteradmins,
            Tier::Admin => &self.admins,
            Tier::Operator => &self.operators,
        }
    }

    /// Resolves the tier of a login presented from `ip`.
    pub fn tier_of(&self, login: &str, ip: &str) -> Option<Tier> {
        if login.is_empty() {
            return None;
        }

        for tier in [Tier::MasterAdmin, Tier::Admin, Tier::Operator] {
            if let Some(entry) = self.entries(tier).iter().find(|e| e.login == login) {
                if !entry.ip.is_empty() && !ip_matches(ip, &entry.ip) {
                    warn!("Attempt to use {} login '{}' from IP {} !", tier, login, ip);
                    return None;
                }
                return Some(tier);
            }
        }
        None
    }

    /// Whether the login appears in any tier, ignoring IP restrictions.
    pub fn is_listed(&self, login: &str) -> bool {
        [Tier::MasterAdmin, Tier::Admin, Tier::Operator]
            .into_iter()
            .any(|tier| self.entries(tier).iter().any(|e| e.login == login))
    }

    pub fn is_locked(&self) -> bool {
        !self.lock_password.is_empty()
    }

    pub fn unlocks(&self, password: &str) -> bool {
        self.is_locked() && self.lock_password == password
    }

    /// Whether a tier may use an ability. Unknown abilities are denied.
    pub fn tier_allows(&self, tier: Tier, ability: &str) -> bool {
        let ability = ability.to_uppercase();
        match tier {
            Tier::MasterAdmin => true,
            Tier::Admin => self.admin_abilities.get(&ability).copied().unwrap_or(false),
            Tier::Operator => self
                .operator_abilities
                .get(&ability)
                .copied()
                .unwrap_or(false),
        }
    }

    pub fn allow_ability(&self, player: &Player, ability: &str) -> bool {
        if self.is_locked() && !player.unlocked {
            return false;
        }
        match self.tier_of(&player.login, &player.ip) {
            Some(tier) => self.tier_allows(tier, ability),
            None => false,
        }
    }
}
