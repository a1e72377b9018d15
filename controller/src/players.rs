//! Player bookkeeping for the connected server
//!
//! This module tracks who is on the server, including:
//! - Player connection lifecycle (connect, info changes, disconnect)
//! - Relay servers that connect like players but are not players
//! - Merging the basic and detailed player info queries into one record
//!
//! The registry only classifies and stores. Admission checks (banned IPs,
//! client versions) and the chat notices around them belong to the caller.

use crate::config::ClientVersion;
use crate::utils::format_duration;
use log::info;
use shared::RpcValue;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Flags digit marking a relay server connecting to us.
const RELAY_PEER_UNIT: i64 = 100_000;
/// Flags digit marking a player forwarded from our relay master.
const FORWARDED_UNIT: i64 = 10_000;

fn flag_digit(flags: i64, unit: i64) -> bool {
    (flags / unit) % 10 != 0
}

/// A genuine player on the server
#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    /// Server-assigned player id
    pub pid: i64,
    /// Unique account name
    pub login: String,
    pub nickname: String,
    /// Address without port, empty until known
    pub ip: String,
    pub zone: String,
    pub team_id: i64,
    pub client_version: String,
    pub is_spectator: bool,
    /// Spectator state before the last info change
    pub previous_spectator: bool,
    pub is_official: bool,
    pub ladder_rank: i64,
    pub connected_at: Instant,
    pub wins: u32,
    /// Set once the lock password was given
    pub unlocked: bool,
}

impl Player {
    pub fn new(login: impl Into<String>) -> Self {
        Self {
            pid: 0,
            login: login.into(),
            nickname: String::new(),
            ip: String::new(),
            zone: String::new(),
            team_id: -1,
            client_version: String::new(),
            is_spectator: false,
            previous_spectator: false,
            is_official: false,
            ladder_rank: 0,
            connected_at: Instant::now(),
            wins: 0,
            unlocked: false,
        }
    }

    /// Builds a player from the basic info, completed by the detailed info.
    ///
    /// Only the detailed query reports the address, zone and client version.
    pub fn from_info(basic: &RpcValue, detailed: Option<&RpcValue>) -> Self {
        let mut player = Player::new(basic.str_field("Login"));
        player.pid = basic.int_field("PlayerId");
        player.nickname = basic.str_field("NickName");
        player.team_id = basic.get("TeamId").and_then(RpcValue::as_int).unwrap_or(-1);
        player.is_spectator = basic.int_field("SpectatorStatus") % 10 != 0
            || basic.bool_field("IsSpectator");

        let ladder_rank = basic.int_field("LadderRanking");
        player.is_official = ladder_rank > 0;
        player.ladder_rank = ladder_rank.max(0);

        if let Some(detailed) = detailed {
            if player.login.is_empty() {
                player.login = detailed.str_field("Login");
            }
            if player.nickname.is_empty() {
                player.nickname = detailed.str_field("NickName");
            }
            player.ip = strip_port(&detailed.str_field("IPAddress"));
            player.zone = detailed
                .str_field("Path")
                .strip_prefix("World|")
                .map(str::to_string)
                .unwrap_or_else(|| detailed.str_field("Path"));
            player.client_version = ClientVersion::from_reported(&detailed.str_field("ClientVersion"));
        }

        player
    }

    /// How long the player has been connected
    pub fn time_online(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

fn strip_port(address: &str) -> String {
    match address.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host.to_string(),
        _ => address.to_string(),
    }
}

/// A relay server connected to this (primary) server
#[derive(Debug, Clone, PartialEq)]
pub struct RelayPeer {
    pub login: String,
    pub nickname: String,
}

/// Fields of a player info change notification
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlayerInfo {
    pub login: String,
    pub nickname: String,
    pub pid: i64,
    pub team_id: i64,
    pub spectator_status: i64,
    pub ladder_ranking: i64,
    pub flags: i64,
}

impl PlayerInfo {
    pub fn from_rpc(value: &RpcValue) -> Self {
        Self {
            login: value.str_field("Login"),
            nickname: value.str_field("NickName"),
            pid: value.int_field("PlayerId"),
            team_id: value.int_field("TeamId"),
            spectator_status: value.int_field("SpectatorStatus"),
            ladder_ranking: value.int_field("LadderRanking"),
            flags: value.int_field("Flags"),
        }
    }

    pub fn is_forwarded(&self) -> bool {
        flag_digit(self.flags, FORWARDED_UNIT)
    }
}

/// What a connect notification turned out to be
#[derive(Debug, Clone)]
pub enum Arrival {
    /// A player to admit with [`PlayerRegistry::admit`]
    Player(Player),
    /// A relay server, already recorded
    Relay(RelayPeer),
    /// A player forwarded by our relay master, not ours to track
    Forwarded,
    /// The server could not resolve a login; the connection must be dropped
    Unresolved { login: String },
}

/// What a disconnect notification removed
#[derive(Debug, Clone)]
pub enum Departure {
    Player(Player),
    Relay(RelayPeer),
}

/// Where this controller instance sits in a relay setup
#[derive(Debug, Clone, Copy)]
pub struct RelayContext<'a> {
    /// This server relays another server
    pub is_relay: bool,
    /// Our own server login, which may show up in its own player list
    pub server_login: &'a str,
}

/// Tracks every player and relay peer on the server, keyed by login
#[derive(Debug, Default)]
pub struct PlayerRegistry {
    players: HashMap<String, Player>,
    relays: HashMap<String, RelayPeer>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classifies a connecting entity from its info queries
    ///
    /// Relay peers are recorded immediately. Genuine players are returned
    /// for the caller to vet and then [`admit`](Self::admit).
    pub fn on_connect(
        &mut self,
        requested_login: &str,
        basic: &RpcValue,
        detailed: Option<&RpcValue>,
        context: RelayContext<'_>,
    ) -> Arrival {
        let flags = basic.int_field("Flags");
        let login = basic.str_field("Login");

        if flag_digit(flags, RELAY_PEER_UNIT) {
            let peer = RelayPeer {
                login: login.clone(),
                nickname: basic.str_field("NickName"),
            };
            if !context.is_relay && login != context.server_login {
                info!("<<< relay server {} ({}) connected", peer.login, peer.nickname);
                self.relays.insert(login, peer.clone());
            }
            return Arrival::Relay(peer);
        }

        if context.is_relay && flag_digit(flags, FORWARDED_UNIT) {
            return Arrival::Forwarded;
        }

        if login.is_empty() {
            return Arrival::Unresolved {
                login: requested_login.to_string(),
            };
        }

        Arrival::Player(Player::from_info(basic, detailed))
    }

    /// Inserts a vetted player, replacing any stale entry for the login
    pub fn admit(&mut self, player: Player) -> &Player {
        info!(
            "<< player {} joined the game [{} : {} : {} : {} : {}]",
            player.pid, player.login, player.nickname, player.zone, player.ladder_rank, player.ip
        );
        let login = player.login.clone();
        self.players.insert(login.clone(), player);
        &self.players[&login]
    }

    /// Removes a player or relay peer
    ///
    /// Returns None when the login was not known.
    pub fn on_disconnect(&mut self, login: &str) -> Option<Departure> {
        if let Some(peer) = self.relays.remove(login) {
            info!(">>> relay server {} ({}) disconnected", peer.login, peer.nickname);
            return Some(Departure::Relay(peer));
        }

        let player = self.players.remove(login)?;
        info!(
            ">> player {} left the game [{} : {} : {}]",
            player.pid,
            player.login,
            player.nickname,
            format_duration(player.time_online())
        );
        Some(Departure::Player(player))
    }

    /// Applies spectator and ladder changes to a known player
    ///
    /// On a relay instance, updates for players forwarded by the master are
    /// skipped.
    pub fn on_info_changed(&mut self, info: &PlayerInfo, is_relay: bool) -> Option<&Player> {
        if is_relay && info.is_forwarded() {
            return None;
        }

        let player = self.players.get_mut(&info.login)?;
        if info.ladder_ranking > 0 {
            player.ladder_rank = info.ladder_ranking;
            player.is_official = true;
        } else {
            player.is_official = false;
        }
        player.previous_spectator = player.is_spectator;
        player.is_spectator = info.spectator_status % 10 != 0;

        Some(player)
    }

    /// Marks a player as having given the lock password
    pub fn unlock(&mut self, login: &str) -> bool {
        match self.players.get_mut(login) {
            Some(player) => {
                player.unlocked = true;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, login: &str) -> Option<&Player> {
        self.players.get(login)
    }

    pub fn get_mut(&mut self, login: &str) -> Option<&mut Player> {
        self.players.get_mut(login)
    }

    pub fn is_relay_peer(&self, login: &str) -> bool {
        self.relays.contains_key(login)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    /// Returns the number of players, relay peers excluded
    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }
}
