//! Integration tests for the controller
//!
//! These tests drive a whole controller through its callbacks and check the
//! calls it makes and the events it emits, plus the TCP transport against a
//! loopback server.

use controller::config::AdminLists;
use controller::engine::Controller;
use controller::events::{Event, EventKind};
use controller::moderation::{Anomaly, BanList, CheatReport, CheaterAction};
use controller::network::TcpSession;
use controller::permissions::PermissionRegistry;
use controller::players::Player;
use controller::race::Restart;
use controller::rpc::{Callback, RpcSession};
use controller::testing::{self, MemoryListStore, ScriptedSession};
use shared::{read_frame, write_frame, write_greeting, Message, RpcValue};
use std::cell::RefCell;
use std::net::TcpListener;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

fn controller(session: ScriptedSession) -> Controller<ScriptedSession> {
    testing::controller_with(session, testing::settings(), &MemoryListStore::default())
}

/// Records the kinds of every event published for `kinds`, in order
fn trace(controller: &mut Controller<ScriptedSession>, kinds: &[EventKind]) -> Rc<RefCell<Vec<EventKind>>> {
    let seen = Rc::new(RefCell::new(Vec::new()));
    for kind in kinds {
        let seen = Rc::clone(&seen);
        controller.subscribe(*kind, move |_, event| {
            seen.borrow_mut().push(event.kind());
            Ok(())
        });
    }
    seen
}

fn callback(method: &str, params: Vec<RpcValue>) -> Callback {
    Callback::new(method, params)
}

fn challenge(uid: &str) -> RpcValue {
    RpcValue::object([
        ("UId", RpcValue::from(uid)),
        ("Name", RpcValue::from(format!("Track {}", uid))),
        ("Environnement", RpcValue::from("Stadium")),
        ("LapRace", RpcValue::from(false)),
    ])
}

fn ranking(login: &str, rank: i64, best_time: i64) -> RpcValue {
    RpcValue::object([
        ("Login", RpcValue::from(login)),
        ("NickName", RpcValue::from(login)),
        ("Rank", RpcValue::from(rank)),
        ("BestTime", RpcValue::from(best_time)),
        ("Score", RpcValue::from(0)),
    ])
}

fn end_challenge(rankings: Vec<RpcValue>, uid: &str, restart: bool) -> Callback {
    callback(
        "TrackMania.EndChallenge",
        vec![
            RpcValue::Array(rankings),
            challenge(uid),
            false.into(),
            false.into(),
            restart.into(),
        ],
    )
}

/// RACE LIFECYCLE TESTS
mod race_tests {
    use super::*;

    /// A begin-race signal without payload fetches the challenge and finishes the transition
    #[test]
    fn begin_race_without_payload_fetches_challenge() {
        let mut session = ScriptedSession::new();
        session.batch_reply("GetCurrentChallengeInfo", challenge("ABC123"));
        let mut controller = controller(session);
        let seen = trace(
            &mut controller,
            &[EventKind::NewChallenge, EventKind::NewChallenge2],
        );

        controller
            .core
            .session
            .push_callback("TrackMania.BeginChallenge", vec![RpcValue::Nil, false.into(), false.into()]);
        controller.tick(1_000).unwrap();

        let current = controller.core.challenge.as_ref().unwrap();
        assert_eq!(current.uid, "ABC123");
        assert_eq!(current.environment, "Stadium");
        assert!(controller.core.records.is_empty());
        assert!(!controller.core.state.challenge_requested);
        assert_eq!(*seen.borrow(), vec![EventKind::NewChallenge, EventKind::NewChallenge2]);
    }

    /// A failed challenge request leaves the controller without a challenge
    #[test]
    fn faulted_challenge_request_is_skipped() {
        let mut session = ScriptedSession::new();
        session.batch_fault("GetCurrentChallengeInfo", shared::Fault::new(-1000, "No challenge."));
        let mut controller = controller(session);

        controller.begin_race(&[]).unwrap();
        controller.tick(1_000).unwrap();

        assert!(controller.core.challenge.is_none());
    }

    /// Only the playing-to-paused transition synthesizes an end of round
    #[test]
    fn status_changes_infer_end_round() {
        let mut controller = controller(ScriptedSession::new());
        let seen = trace(&mut controller, &[EventKind::EndRound]);

        controller.handle_callback(&callback("TrackMania.StatusChanged", vec![3.into(), "Synchronization".into()])).unwrap();
        controller.handle_callback(&callback("TrackMania.StatusChanged", vec![4.into(), "Play".into()])).unwrap();
        assert!(seen.borrow().is_empty());

        controller.handle_callback(&callback("TrackMania.StatusChanged", vec![3.into(), "Synchronization".into()])).unwrap();
        assert_eq!(seen.borrow().len(), 1);
        assert_eq!(controller.core.state.previous_status, 4);
    }

    /// Every status change is published under its own code
    #[test]
    fn status_change_event_carries_code() {
        let mut controller = controller(ScriptedSession::new());
        let seen = trace(&mut controller, &[EventKind::StatusChangeTo(5)]);

        controller.status_changed(4).unwrap();
        controller.status_changed(5).unwrap();

        assert_eq!(*seen.borrow(), vec![EventKind::StatusChangeTo(5)]);
    }

    /// Restart without any score is instant and skips the new-challenge processing
    #[test]
    fn instant_restart_skips_new_challenge() {
        let mut controller = controller(ScriptedSession::new());
        let seen = trace(
            &mut controller,
            &[
                EventKind::RestartChallenge,
                EventKind::RestartChallenge2,
                EventKind::EndRace,
                EventKind::NewChallenge,
            ],
        );

        controller
            .handle_callback(&end_challenge(vec![ranking("alice", 1, 0)], "ABC123", true))
            .unwrap();
        assert_eq!(controller.core.state.restart, Restart::PendingImmediate);

        controller
            .handle_callback(&callback("TrackMania.BeginChallenge", vec![challenge("ABC123"), false.into(), false.into()]))
            .unwrap();

        assert_eq!(controller.core.state.restart, Restart::None);
        assert_eq!(
            *seen.borrow(),
            vec![EventKind::RestartChallenge, EventKind::RestartChallenge2]
        );
    }

    /// Restart after someone scored ends the race normally and begins a fresh challenge
    #[test]
    fn restart_with_scores_runs_full_transition() {
        let mut controller = controller(ScriptedSession::new());
        let seen = trace(
            &mut controller,
            &[EventKind::RestartChallenge, EventKind::EndRace, EventKind::NewChallenge],
        );

        controller
            .handle_callback(&end_challenge(vec![ranking("alice", 1, 41_230)], "ABC123", true))
            .unwrap();
        assert_eq!(controller.core.state.restart, Restart::PendingWithTimeout);

        controller
            .handle_callback(&callback("TrackMania.BeginChallenge", vec![challenge("ABC123"), false.into(), false.into()]))
            .unwrap();

        assert_eq!(controller.core.state.restart, Restart::None);
        assert_eq!(*seen.borrow(), vec![EventKind::EndRace, EventKind::NewChallenge]);
    }

    /// With a win multiple of 3, every third win is broadcast and the rest are private
    #[test]
    fn win_announcements_follow_multiple() {
        let mut settings = testing::settings();
        settings.controller.global_win_multiple = 3;
        let mut controller =
            testing::controller_with(ScriptedSession::new(), settings, &MemoryListStore::default());
        controller.core.players.admit(Player::new("alice"));
        let wins = trace(&mut controller, &[EventKind::PlayerWins]);

        for _ in 0..9 {
            controller
                .handle_callback(&end_challenge(
                    vec![ranking("alice", 1, 41_230), ranking("bob", 2, 42_000)],
                    "ABC123",
                    false,
                ))
                .unwrap();
        }

        let session = &controller.core.session;
        assert_eq!(session.queried("ChatSendServerMessage").len(), 3);
        assert_eq!(session.queried("ChatSendServerMessageToLogin").len(), 6);
        assert_eq!(controller.core.players.get("alice").unwrap().wins, 9);
        assert_eq!(wins.borrow().len(), 9);
    }

    /// A lone finisher is not credited with a win
    #[test]
    fn single_ranking_is_not_a_win() {
        let mut controller = controller(ScriptedSession::new());
        controller.core.players.admit(Player::new("alice"));

        controller
            .handle_callback(&end_challenge(vec![ranking("alice", 1, 41_230)], "ABC123", false))
            .unwrap();

        assert_eq!(controller.core.players.get("alice").unwrap().wins, 0);
    }
}

/// PLAYER AND PERMISSION TESTS
mod player_tests {
    use super::*;

    fn listed(login: &str, flags: i64) -> RpcValue {
        RpcValue::object([
            ("Login", RpcValue::from(login)),
            ("NickName", RpcValue::from(login)),
            ("PlayerId", RpcValue::from(1)),
            ("Flags", RpcValue::from(flags)),
        ])
    }

    /// Sync identifies the server and connects everyone already on it, except relays
    #[test]
    fn sync_admits_listed_players_and_skips_relays() {
        let mut session = ScriptedSession::new();
        session.reply("GetSystemInfo", RpcValue::object([("ServerLogin", RpcValue::from("myserver"))]));
        session.reply("IsRelayServer", RpcValue::from(0));
        session.reply(
            "GetPlayerList",
            RpcValue::Array(vec![listed("alice", 0), listed("relay1", 100_000)]),
        );
        session.reply_once("GetPlayerInfo", listed("alice", 0));
        session.reply_once("GetPlayerInfo", listed("relay1", 100_000));
        let mut controller = controller(session);
        let seen = trace(&mut controller, &[EventKind::Sync, EventKind::PlayerConnect]);

        controller.sync().unwrap();

        assert_eq!(controller.core.server.login, "myserver");
        assert!(!controller.core.server.is_relay);
        assert_eq!(controller.core.players.len(), 1);
        assert!(controller.core.players.is_relay_peer("relay1"));
        assert_eq!(*seen.borrow(), vec![EventKind::Sync, EventKind::PlayerConnect]);
    }

    /// A relay instance learns its master and ignores its chat
    #[test]
    fn relay_instance_ignores_master_chat() {
        let mut session = ScriptedSession::new();
        session.reply("IsRelayServer", RpcValue::from(1));
        session.reply(
            "GetMainServerPlayerInfo",
            RpcValue::object([("Login", RpcValue::from("master")), ("NickName", RpcValue::from("Master"))]),
        );
        session.reply("GetPlayerList", RpcValue::Array(Vec::new()));
        let mut controller = controller(session);
        controller.register_command("hello", "Says hello", false, |core, _| {
            core.server.name = "greeted".to_string();
            Ok(())
        });
        controller.sync().unwrap();
        controller.core.players.admit(Player::new("master"));

        controller
            .handle_callback(&callback("TrackMania.PlayerChat", vec![2.into(), "master".into(), "/hello".into(), true.into()]))
            .unwrap();

        assert_eq!(controller.core.server.relay_master.as_ref().unwrap().login, "master");
        assert_ne!(controller.core.server.name, "greeted");
    }

    /// Abilities follow the tier lists, the IP patterns and the lock
    #[test]
    fn abilities_follow_tiers_and_lock() {
        let mut settings = testing::settings();
        settings.controller.lock_password = "sesame".to_string();
        let lists = AdminLists::from_toml_str(
            r#"
            [[admins]]
            login = "alice"
            ip = "10.0.*.*"

            [[operators]]
            login = "alice"

            [admin_abilities]
            kick = true
            "#,
        )
        .unwrap();
        let permissions = PermissionRegistry::new(settings.masteradmins.clone(), lists, "sesame");
        let ban_list = BanList::new(Vec::new(), Box::new(MemoryListStore::default()));
        let mut controller = Controller::new(ScriptedSession::new(), settings, permissions, ban_list);

        let mut alice = Player::new("alice");
        alice.ip = "10.0.0.5".to_string();
        controller.core.players.admit(alice);
        let mut mallory = Player::new("alice2");
        mallory.ip = "10.1.0.5".to_string();
        controller.core.players.admit(mallory);

        assert!(!controller.core.allow_ability("alice", "Kick"));
        assert!(controller.core.unlock("alice", "sesame"));
        assert!(controller.core.allow_ability("alice", "Kick"));
        assert!(!controller.core.allow_ability("alice", "ban"));
        assert!(!controller.core.allow_ability("alice2", "Kick"));
        assert!(!controller.core.allow_ability("nobody", "Kick"));
    }

    /// A finish is published with the challenge it was driven on
    #[test]
    fn finish_builds_record_for_current_challenge() {
        let mut session = ScriptedSession::new();
        session.batch_reply("GetCurrentChallengeInfo", challenge("ABC123"));
        let mut controller = controller(session);
        let mut alice = Player::new("alice");
        alice.nickname = "Alice".to_string();
        controller.core.players.admit(alice);

        let records = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&records);
        controller.subscribe(EventKind::PlayerFinish, move |_, event| {
            if let Event::PlayerFinish(record) = event {
                sink.borrow_mut().push(record.clone());
            }
            Ok(())
        });

        controller.core.session.push_callback("TrackMania.StatusChanged", vec![4.into(), "Play".into()]);
        controller.tick(1_000).unwrap();
        controller.core.session.push_callback(
            "TrackMania.PlayerFinish",
            vec![7.into(), "alice".into(), 41_230.into()],
        );
        controller.tick(1_000).unwrap();

        let records = records.borrow();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].nickname, "Alice");
        assert_eq!(records[0].score, 41_230);
        assert_eq!(records[0].challenge_uid, "ABC123");
        assert!(!records[0].is_new);
    }
}

/// MODERATION TESTS
mod moderation_tests {
    use super::*;

    /// Ban policy: one broadcast, one ban list entry, one persist, one staged ban
    #[test]
    fn ban_policy_scenario() {
        let store = MemoryListStore::default();
        let mut settings = testing::settings();
        settings.controller.cheater_action = CheaterAction::Ban;
        let mut controller = testing::controller_with(ScriptedSession::new(), settings, &store);
        let mut alice = Player::new("alice");
        alice.ip = "1.2.3.4".to_string();
        controller.core.players.admit(alice);

        controller
            .core
            .process_cheater(&CheatReport {
                login: "alice".to_string(),
                checkpoints: vec![10_000, 20_000],
                anomaly: Anomaly::Checkpoint { time: 1, index: 2 },
            })
            .unwrap();
        controller.tick(1_000).unwrap();

        let session = &controller.core.session;
        assert_eq!(session.queried("ChatSendServerMessage").len(), 1);
        assert_eq!(controller.core.ban_list.ips(), ["1.2.3.4"]);
        assert_eq!(store.saves(), vec![vec!["1.2.3.4".to_string()]]);
        assert_eq!(session.flushed_methods(), vec!["Ban"]);
    }

    /// A connecting player whose IP was banned earlier is banned again on sight
    #[test]
    fn banned_ip_rejected_on_connect() {
        let mut session = ScriptedSession::new();
        session.reply(
            "GetPlayerInfo",
            RpcValue::object([("Login", RpcValue::from("eve")), ("Flags", RpcValue::from(0))]),
        );
        session.reply(
            "GetDetailedPlayerInfo",
            RpcValue::object([("Login", RpcValue::from("eve")), ("IPAddress", RpcValue::from("6.6.6.6:2350"))]),
        );
        let mut controller = controller(session);
        controller.core.ban_list.add("6.6.6.6");

        controller.core.session.push_callback("TrackMania.PlayerConnect", vec!["eve".into(), false.into()]);
        controller.tick(1_000).unwrap();

        assert!(controller.core.players.is_empty());
        assert_eq!(controller.core.session.flushed_methods(), vec!["Ban"]);
    }
}

/// MAIN LOOP TESTS
mod loop_tests {
    use super::*;

    /// Ticks with nothing staged never reach the transport
    #[test]
    fn empty_flush_is_idempotent() {
        let mut controller = controller(ScriptedSession::new());

        controller.tick(1_000).unwrap();
        controller.tick(1_000).unwrap();

        assert_eq!(controller.core.session.flush_count(), 0);
        assert!(controller.core.session.query_methods().is_empty());
    }

    /// Calls staged during a tick go out together in one batch
    #[test]
    fn staged_calls_share_one_batch() {
        let mut controller = controller(ScriptedSession::new());
        controller.core.stage("Kick", vec!["bob".into()]);
        controller.core.stage_with("GetStatus", Vec::new(), Some("status".to_string()), None);

        controller.tick(1_000).unwrap();

        assert_eq!(controller.core.session.flush_count(), 1);
        assert_eq!(controller.core.session.batches()[0].len(), 2);
        assert_eq!(controller.core.response("status"), Some(&RpcValue::Bool(true)));
    }

    /// Callbacks are handled in arrival order within a tick
    #[test]
    fn callbacks_dispatched_in_arrival_order() {
        let mut controller = controller(ScriptedSession::new());
        let seen = trace(
            &mut controller,
            &[EventKind::BeginRound, EventKind::EndRound, EventKind::Echo],
        );

        controller.core.session.push_callback("TrackMania.Echo", vec![]);
        controller.core.session.push_callback("TrackMania.BeginRound", vec![]);
        controller.core.session.push_callback("TrackMania.EndRound", vec![]);
        controller.tick(1_000).unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![EventKind::Echo, EventKind::BeginRound, EventKind::EndRound]
        );
    }

    /// The scheduler runs until asked to stop
    #[tokio::test]
    async fn scheduler_runs_until_shutdown() {
        let mut controller = controller(ScriptedSession::new());
        let seen = trace(&mut controller, &[EventKind::EverySecond, EventKind::Shutdown]);

        controller::scheduler::run(&mut controller, tokio::time::sleep(Duration::from_millis(1_100)))
            .await
            .unwrap();

        let seen = seen.borrow();
        let seconds = seen.iter().filter(|kind| **kind == EventKind::EverySecond).count();
        assert!((1..=3).contains(&seconds));
        assert_eq!(seen.last(), Some(&EventKind::Shutdown));
    }
}

/// TRANSPORT TESTS
mod transport_tests {
    use super::*;

    /// Serves one connection: every call gets `true`, and a multicall gets one
    /// `true` per call. An echo callback precedes the reply to `GetStatus`.
    fn loopback_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();

        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            write_greeting(&mut stream).unwrap();

            while let Ok((handle, message)) = read_frame(&mut stream) {
                let Message::Call { method, params } = message else {
                    continue;
                };
                let reply = match method.as_str() {
                    "system.multicall" => {
                        let count = params[0].as_array().map_or(0, |calls| calls.len());
                        RpcValue::Array(vec![RpcValue::Array(vec![true.into()]); count])
                    }
                    "GetStatus" => {
                        let echo = Message::Callback {
                            method: "TrackMania.Echo".to_string(),
                            params: vec!["ping".into()],
                        };
                        write_frame(&mut stream, 0, &echo).unwrap();
                        RpcValue::object([("Code", RpcValue::from(4))])
                    }
                    _ => RpcValue::Bool(true),
                };
                write_frame(&mut stream, handle, &Message::Reply(Ok(reply))).unwrap();
            }
        });
        address
    }

    /// Callbacks read while waiting for a reply reach the handlers on the next tick
    #[tokio::test(flavor = "multi_thread")]
    async fn controller_over_tcp() {
        let address = loopback_server();
        let session = TcpSession::connect(&address, Duration::from_secs(2)).await.unwrap();
        let permissions = PermissionRegistry::new(Vec::new(), AdminLists::default(), "");
        let ban_list = BanList::new(Vec::new(), Box::new(MemoryListStore::default()));
        let mut controller = Controller::new(session, testing::settings(), permissions, ban_list);

        let echoes = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&echoes);
        controller.subscribe(EventKind::Echo, move |_, event| {
            if let Event::Echo(params) = event {
                sink.borrow_mut().push(params.clone());
            }
            Ok(())
        });

        let status = controller.core.query("GetStatus", Vec::new()).unwrap();
        assert_eq!(status.int_field("Code"), 4);

        controller.core.stage("ChatSendServerMessage", vec!["hello".into()]);
        controller.core.stage_with("GetStatus", Vec::new(), Some("status".to_string()), None);
        controller.tick(1_000).unwrap();

        assert_eq!(*echoes.borrow(), vec![vec![RpcValue::from("ping")]]);
        assert_eq!(controller.core.response("status"), Some(&RpcValue::Bool(true)));
        assert!(controller.core.session.last_error().is_none());
    }
}
