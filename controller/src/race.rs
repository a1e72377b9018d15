//! Race and session state machine
//!
//! Turns the raw challenge and status callbacks into lifecycle transitions:
//! begin and end of a challenge, restarts, rounds and status changes. Each
//! transition updates [`SessionState`] and emits its events through the
//! controller's bus.

use crate::config::format_message;
use crate::engine::{Completion, Controller};
use crate::error::EngineError;
use crate::events::Event;
use crate::players::PlayerInfo;
use crate::rpc::RpcSession;
use crate::utils::format_time;
use log::{debug, info};
use shared::{RpcValue, STATUS_FINISHING, STATUS_PLAYING, STATUS_SYNCHRONIZING};

/// Number of records listed in the post-race ranking
const RANKING_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Gamestate {
    /// Laps in progress
    #[default]
    Race,
    /// Scoring window between challenges
    Score,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Restart {
    #[default]
    None,
    /// The challenge restarts without a scoring window
    PendingImmediate,
    /// The challenge restarts after the scoring window
    PendingWithTimeout,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub gamestate: Gamestate,
    pub status: i32,
    pub previous_status: i32,
    pub warmup: bool,
    pub restart: Restart,
    /// Set by whoever switches the game mode; cleared on the next challenge
    pub changing_mode: bool,
    /// Challenge info was requested and has not arrived yet
    pub challenge_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GameMode {
    Rounds,
    #[default]
    TimeAttack,
    Team,
    Laps,
    Stunts,
    Cup,
}

impl GameMode {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(GameMode::Rounds),
            1 => Some(GameMode::TimeAttack),
            2 => Some(GameMode::Team),
            3 => Some(GameMode::Laps),
            4 => Some(GameMode::Stunts),
            5 => Some(GameMode::Cup),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GameMode::Rounds => "Rounds",
            GameMode::TimeAttack => "TimeAttack",
            GameMode::Team => "Team",
            GameMode::Laps => "Laps",
            GameMode::Stunts => "Stunts",
            GameMode::Cup => "Cup",
        }
    }

    /// Modes in which a lap race is played with the server's forced lap count
    pub fn forces_laps(&self) -> bool {
        matches!(self, GameMode::Rounds | GameMode::Team | GameMode::Cup)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GameInfo {
    pub mode: GameMode,
    pub forced_laps: i64,
}

impl GameInfo {
    pub fn from_rpc(value: &RpcValue) -> Self {
        Self {
            mode: GameMode::from_code(value.int_field("GameMode")).unwrap_or_default(),
            forced_laps: value.int_field("RoundsForcedLaps"),
        }
    }

    /// Stunts scores are points, everything else is a time
    pub fn format_score(&self, score: i64) -> String {
        if self.mode == GameMode::Stunts {
            score.to_string()
        } else {
            format_time(score)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub login: String,
    pub nickname: String,
    pub score: i64,
    /// Unix seconds
    pub timestamp: u64,
    pub is_new: bool,
    pub challenge_uid: String,
}

/// Records of the current challenge, best first
#[derive(Debug, Clone, Default)]
pub struct RecordList {
    records: Vec<Record>,
}

impl RecordList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn get(&self, rank: usize) -> Option<&Record> {
        self.records.get(rank)
    }

    pub fn first(&self) -> Option<&Record> {
        self.records.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Challenge {
    pub uid: String,
    pub name: String,
    pub filename: String,
    pub environment: String,
    pub lap_race: bool,
    /// Non-zero when the server forces the lap count
    pub forced_laps: i64,
    pub best_record: Option<Record>,
}

impl Challenge {
    pub fn from_rpc(value: &RpcValue) -> Self {
        Self {
            uid: value.str_field("UId"),
            name: value.str_field("Name"),
            filename: value.str_field("FileName"),
            environment: value.str_field("Environnement"),
            lap_race: value.bool_field("LapRace"),
            forced_laps: 0,
            best_record: None,
        }
    }
}

/// One line of the final ranking reported at the end of a challenge
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ranking {
    pub login: String,
    pub nickname: String,
    pub rank: i64,
    pub best_time: i64,
    pub score: i64,
}

impl Ranking {
    pub fn from_rpc(value: &RpcValue) -> Self {
        Self {
            login: value.str_field("Login"),
            nickname: value.str_field("NickName"),
            rank: value.int_field("Rank"),
            best_time: value.int_field("BestTime"),
            score: value.int_field("Score"),
        }
    }
}

/// Payload of the end-of-challenge callback
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RaceResult {
    pub rankings: Vec<Ranking>,
    pub challenge: Option<Challenge>,
    pub was_warmup: bool,
    pub continues: bool,
    /// The server is about to restart the same challenge
    pub restart: bool,
}

impl RaceResult {
    pub fn from_params(params: &[RpcValue]) -> Self {
        let flag = |index: usize| params.get(index).and_then(RpcValue::as_bool).unwrap_or(false);
        Self {
            rankings: params
                .first()
                .and_then(RpcValue::as_array)
                .map(|items| items.iter().map(Ranking::from_rpc).collect())
                .unwrap_or_default(),
            challenge: params
                .get(1)
                .filter(|value| !value.is_nil())
                .map(Challenge::from_rpc),
            was_warmup: flag(2),
            continues: flag(3),
            restart: flag(4),
        }
    }

    pub fn someone_scored(&self) -> bool {
        self.rankings.iter().any(|r| r.best_time > 0 || r.score > 0)
    }
}

impl<S: RpcSession> Controller<S> {
    /// Begin-race signal
    ///
    /// Without a challenge payload the current challenge is requested and the
    /// transition continues once the reply arrives.
    pub fn begin_race(&mut self, params: &[RpcValue]) -> Result<(), EngineError> {
        match params.first().filter(|value| !value.is_nil()) {
            Some(challenge) => {
                self.core.state.warmup = params.get(1).and_then(RpcValue::as_bool).unwrap_or(false);
                self.new_challenge(challenge)
            }
            None => {
                self.core.state.challenge_requested = true;
                self.core.stage_with(
                    "GetCurrentChallengeInfo",
                    Vec::new(),
                    None,
                    Some(Completion::NewChallenge),
                );
                Ok(())
            }
        }
    }

    pub fn new_challenge(&mut self, info: &RpcValue) -> Result<(), EngineError> {
        self.core.state.challenge_requested = false;
        self.core.state.gamestate = Gamestate::Race;
        if self.core.state.restart == Restart::None {
            info!("Begin Challenge");
        }

        if let Some(game_info) = self.core.try_query("GetCurrentGameInfo", vec![1.into()])? {
            self.core.game_info = GameInfo::from_rpc(&game_info);
        }
        self.core.state.changing_mode = false;

        match self.core.state.restart {
            Restart::PendingImmediate => {
                self.core.state.restart = Restart::None;
                self.emit(Event::RestartChallenge2(Challenge::from_rpc(info)));
                return Ok(());
            }
            Restart::PendingWithTimeout => self.core.state.restart = Restart::None,
            Restart::None => {}
        }

        self.core.refresh_server_options()?;
        self.core.records.clear();

        let mut challenge = Challenge::from_rpc(info);
        if challenge.lap_race && self.core.game_info.mode.forces_laps() {
            challenge.forced_laps = self.core.game_info.forced_laps;
        }

        self.emit(Event::NewChallenge(challenge.clone()));

        let previous = self.core.challenge.as_ref().map_or("", |c| c.name.as_str());
        info!("track changed [{}] >> [{}]", previous, challenge.name);

        if !self.core.server.is_relay {
            self.announce_record(&challenge)?;
        }

        challenge.best_record = self.core.records.first().cloned();
        self.core.challenge = Some(challenge.clone());
        self.emit(Event::NewChallenge2(challenge));
        Ok(())
    }

    fn announce_record(&mut self, challenge: &Challenge) -> Result<(), EngineError> {
        let messages = &self.core.settings.messages;
        let message = match self.core.records.first().filter(|r| r.score > 0) {
            Some(record) => {
                let score = self.core.game_info.format_score(record.score);
                info!(
                    "current record on {} is {} and held by {}",
                    challenge.name, score, record.nickname
                );
                format_message(&messages.record_current, &[&challenge.name, &score, &record.nickname])
            }
            None => {
                info!("currently no record on {}", challenge.name);
                format_message(&messages.record_none, &[&challenge.name])
            }
        };

        if self.core.settings.controller.show_recs_before & 1 == 1 {
            self.core.send_chat(&message)?;
        }
        Ok(())
    }

    /// End-race signal
    pub fn end_race(&mut self, params: &[RpcValue]) -> Result<(), EngineError> {
        let result = RaceResult::from_params(params);

        if result.restart {
            if self.core.state.changing_mode || !result.someone_scored() {
                self.core.state.restart = Restart::PendingImmediate;
                info!("Restart Challenge (instant)");
                self.emit(Event::RestartChallenge(result));
                return Ok(());
            }
            self.core.state.restart = Restart::PendingWithTimeout;
            info!("Restart Challenge (with ChatTime)");
        }

        self.core.state.gamestate = Gamestate::Score;
        if self.core.state.restart == Restart::None {
            info!("End Challenge");
        }

        if self.core.settings.controller.show_recs_after & 1 == 1 {
            self.announce_ranking()?;
        }

        if !self.core.server.is_relay {
            self.end_race_ranking(&result.rankings)?;
        }

        self.emit(Event::EndRace1(result.clone()));
        self.emit(Event::EndRace(result));
        Ok(())
    }

    fn announce_ranking(&mut self) -> Result<(), EngineError> {
        let messages = &self.core.settings.messages;
        let name = self.core.challenge.as_ref().map_or("", |c| c.name.as_str());

        let lines: Vec<String> = self
            .core
            .records
            .iter()
            .take(RANKING_SIZE)
            .enumerate()
            .filter(|(_, record)| record.score > 0)
            .map(|(i, record)| {
                let score = self.core.game_info.format_score(record.score);
                format_message(
                    &messages.ranking_record,
                    &[&(i + 1).to_string(), &record.nickname, &score],
                )
            })
            .collect();

        let message = if self.core.records.is_empty() {
            format_message(&messages.ranking_none, &[name])
        } else if lines.is_empty() {
            format_message(&messages.ranking, &[name])
        } else {
            format!("{}\n{}", format_message(&messages.ranking, &[name]), lines.join(", "))
        };

        self.core.send_chat(&message)
    }

    /// Credits the winner of the challenge and announces the win
    fn end_race_ranking(&mut self, rankings: &[Ranking]) -> Result<(), EngineError> {
        let Some(first) = rankings.first() else {
            return Ok(());
        };
        let result = if self.core.game_info.mode == GameMode::Stunts {
            first.score
        } else {
            first.best_time
        };
        if first.rank != 1 || rankings.len() < 2 || result <= 0 {
            return Ok(());
        }

        let Some(player) = self.core.players.get_mut(&first.login) else {
            return Ok(());
        };
        player.wins += 1;
        let winner = player.clone();
        info!("{} won for the {}. time!", winner.login, winner.wins);

        let wins = winner.wins.to_string();
        let multiple = self.core.settings.controller.global_win_multiple.max(1);
        if winner.wins % multiple == 0 {
            let message = format_message(
                &self.core.settings.messages.win_multi,
                &[&winner.nickname, &wins],
            );
            self.core.send_chat(&message)?;
        } else {
            let message = format_message(&self.core.settings.messages.win_new, &[&wins]);
            self.core.send_chat_to(&winner.login, &message)?;
        }

        self.emit(Event::PlayerWins(winner));
        Ok(())
    }

    pub fn begin_round(&mut self) {
        debug!("Begin Round");
        self.emit(Event::BeginRound);
    }

    pub fn end_round(&mut self) {
        debug!("End Round");
        self.emit(Event::EndRound);
    }

    /// Status-changed signal
    pub fn status_changed(&mut self, code: i32) -> Result<(), EngineError> {
        let previous = self.core.state.status;
        self.core.state.previous_status = previous;
        self.core.state.status = code;

        let pausing = code == STATUS_SYNCHRONIZING || code == STATUS_FINISHING;
        if pausing {
            if let Some(warmup) = self.core.try_query("GetWarmUp", Vec::new())? {
                self.core.state.warmup = warmup.as_bool().unwrap_or(false);
            }
        }

        // the end of a round is not always reported on its own
        if previous == STATUS_PLAYING && pausing {
            self.end_round();
        }

        if code == STATUS_PLAYING {
            self.running_play()?;
        }

        self.emit(Event::StatusChangeTo { code, previous });
        Ok(())
    }

    /// Enter-play hook
    fn running_play(&mut self) -> Result<(), EngineError> {
        if self.core.challenge.is_none() && !self.core.state.challenge_requested {
            info!("Server started playing, fetching the current challenge");
            return self.begin_race(&[]);
        }
        Ok(())
    }

    /// Player-info-changed signal
    pub fn player_info_changed(&mut self, fields: &RpcValue) {
        let info = PlayerInfo::from_rpc(fields);
        let is_relay = self.core.server.is_relay;
        if let Some(player) = self.core.players.on_info_changed(&info, is_relay).cloned() {
            self.emit(Event::PlayerInfoChanged(player));
        }
    }
}
