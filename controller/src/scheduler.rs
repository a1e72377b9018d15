//! Main loop scheduling
//!
//! The controller runs one tick every [`TICK_PERIOD`]: callbacks, the batch
//! flush, the main-loop event and, once per wall-clock second, the
//! every-second event. Startup runs once before the loop and waits for the
//! server to be ready.

use crate::engine::{Controller, Core};
use crate::error::EngineError;
use crate::events::Event;
use crate::rpc::RpcSession;
use crate::utils::unix_secs;
use log::{error, info, warn};
use shared::{STATUS_NO_CHALLENGE, STATUS_PLAYING};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Target duration of one tick
pub const TICK_PERIOD: Duration = Duration::from_millis(100);
/// Interval between status polls while waiting for the server
pub const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Remembers the last wall-clock second an every-second event went out for
#[derive(Debug, Default)]
pub struct SecondTracker {
    last: Option<u64>,
}

impl SecondTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once per distinct second value
    pub fn advance(&mut self, now_secs: u64) -> bool {
        if self.last == Some(now_secs) {
            return false;
        }
        self.last = Some(now_secs);
        true
    }
}

/// Execution-time ceiling renewed every tick
#[derive(Debug)]
pub struct Watchdog {
    ceiling: Duration,
    renewed_at: Instant,
}

impl Watchdog {
    pub fn new(ceiling: Duration) -> Self {
        Self {
            ceiling,
            renewed_at: Instant::now(),
        }
    }

    /// Starts a new budget and returns by how much the previous one was overrun
    pub fn renew(&mut self) -> Option<Duration> {
        let elapsed = self.renewed_at.elapsed();
        self.renewed_at = Instant::now();
        elapsed.checked_sub(self.ceiling).filter(|over| !over.is_zero())
    }
}

/// Sleep left in the tick after `elapsed` of work, never negative
pub fn remaining_budget(elapsed: Duration) -> Duration {
    TICK_PERIOD.saturating_sub(elapsed)
}

/// Polls the server status until it is playing
///
/// Each change of the status name is logged. Exceeding `timeout` is fatal.
pub async fn wait_until_ready<S: RpcSession>(
    core: &mut Core<S>,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<(), EngineError> {
    let started = Instant::now();
    let mut last_name: Option<String> = None;

    loop {
        let status = core.query("GetStatus", Vec::new())?;
        if status.int_field("Code") as i32 == STATUS_PLAYING {
            return Ok(());
        }

        let name = status.str_field("Name");
        if last_name.is_none() {
            info!("Waiting for dedicated server to reach status 'Running - Play'...");
        }
        if last_name.as_deref() != Some(name.as_str()) {
            info!("Status: {}", name);
            last_name = Some(name);
        }

        if started.elapsed() >= timeout {
            return Err(EngineError::ReadinessTimeout(timeout));
        }
        sleep(poll_interval).await;
    }
}

/// Everything that runs once before the main loop
pub async fn startup<S: RpcSession>(controller: &mut Controller<S>) -> Result<(), EngineError> {
    let server = controller.core.settings.server.clone();

    info!("Try to authenticate with login '{}'", server.login);
    if server.password == "SuperAdmin" {
        warn!("Insecure password 'SuperAdmin', change it on the server and in the settings");
    }
    controller.core.query(
        "Authenticate",
        vec![server.login.as_str().into(), server.password.as_str().into()],
    )?;
    controller.core.query("EnableCallbacks", vec![true.into()])?;

    wait_until_ready(
        &mut controller.core,
        READY_POLL_INTERVAL,
        Duration::from_secs(server.timeout_secs),
    )
    .await?;
    info!("Connection established successfully!");

    if controller.core.permissions.is_locked() {
        info!("Locked admin commands & features with a password");
    }

    let version = controller.core.query("GetVersion", Vec::new())?;
    controller.core.server.game = version.str_field("Name");
    controller.core.server.version = version.str_field("Version");
    controller.core.server.build = version.str_field("Build");

    controller.emit(Event::Startup);
    controller.sync()?;

    // TmForever has no chat command registration
    if controller.core.server.game != "TmForever" {
        controller.register_chat_commands()?;
    }

    controller.send_header()?;

    if controller.core.state.status == STATUS_NO_CHALLENGE {
        info!("Waiting for the server to start a challenge");
    } else {
        controller.begin_race(&[])?;
    }
    Ok(())
}

/// Runs ticks until `shutdown` resolves or a fatal error occurs
///
/// The shutdown hook runs in both cases before returning.
pub async fn run<S, F>(controller: &mut Controller<S>, shutdown: F) -> Result<(), EngineError>
where
    S: RpcSession,
    F: Future<Output = ()>,
{
    let ceiling = Duration::from_secs(controller.core.settings.controller.script_timeout_secs);
    let mut watchdog = Watchdog::new(ceiling);
    tokio::pin!(shutdown);

    let outcome = loop {
        let started = Instant::now();

        if let Err(e) = controller.tick(unix_secs()) {
            if e.is_fatal() {
                error!("{}", e);
                break Err(e);
            }
            warn!("{}", e);
        }

        let elapsed = started.elapsed();
        if let Some(over) = watchdog.renew() {
            warn!("Main loop exceeded its {:?} ceiling by {:?}", ceiling, over);
        }

        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested");
                break Ok(());
            }
            _ = sleep(remaining_budget(elapsed)) => {}
        }
    };

    controller.shutdown();
    outcome
}

/// Startup followed by the main loop
///
/// A failed startup runs the shutdown hook before the error is returned,
/// just like a fatal error inside the loop.
pub async fn launch<S, F>(controller: &mut Controller<S>, shutdown: F) -> Result<(), EngineError>
where
    S: RpcSession,
    F: Future<Output = ()>,
{
    if let Err(e) = startup(controller).await {
        error!("Startup failed: {}", e);
        controller.shutdown();
        return Err(e);
    }
    run(controller, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::testing::{self, MemoryListStore, ScriptedSession};
    use shared::RpcValue;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn status(code: i64, name: &str) -> RpcValue {
        RpcValue::object([("Code", RpcValue::from(code)), ("Name", RpcValue::from(name))])
    }

    fn controller(session: ScriptedSession) -> Controller<ScriptedSession> {
        testing::controller_with(session, testing::settings(), &MemoryListStore::default())
    }

    fn count(controller: &mut Controller<ScriptedSession>, kind: EventKind) -> Rc<RefCell<usize>> {
        let counter = Rc::new(RefCell::new(0));
        let sink = Rc::clone(&counter);
        controller.subscribe(kind, move |_, _| {
            *sink.borrow_mut() += 1;
            Ok(())
        });
        counter
    }

    #[test]
    fn test_second_tracker() {
        let mut seconds = SecondTracker::new();
        assert!(seconds.advance(10));
        assert!(!seconds.advance(10));
        assert!(seconds.advance(11));
        assert!(seconds.advance(15));
        assert!(!seconds.advance(15));
    }

    #[test]
    fn test_remaining_budget_clamps() {
        assert_eq!(remaining_budget(Duration::from_millis(30)), Duration::from_millis(70));
        assert_eq!(remaining_budget(Duration::from_millis(250)), Duration::ZERO);
    }

    #[test]
    fn test_watchdog_reports_overrun() {
        tokio_test::block_on(async {
            let mut strict = Watchdog::new(Duration::ZERO);
            sleep(Duration::from_millis(2)).await;
            assert!(strict.renew().is_some());

            let mut relaxed = Watchdog::new(Duration::from_secs(60));
            assert!(relaxed.renew().is_none());
        });
    }

    #[test]
    fn test_wait_until_ready_polls_until_playing() {
        let mut session = ScriptedSession::new();
        session.reply_once("GetStatus", status(3, "Running - Synchronization"));
        session.reply_once("GetStatus", status(3, "Running - Synchronization"));
        session.reply("GetStatus", status(4, "Running - Play"));
        let mut controller = controller(session);

        tokio_test::block_on(wait_until_ready(
            &mut controller.core,
            Duration::from_millis(1),
            Duration::from_secs(5),
        ))
        .unwrap();

        assert_eq!(controller.core.session.queried("GetStatus").len(), 3);
    }

    #[test]
    fn test_wait_until_ready_times_out() {
        let mut session = ScriptedSession::new();
        session.reply("GetStatus", status(2, "Launching"));
        let mut controller = controller(session);

        let result = tokio_test::block_on(wait_until_ready(
            &mut controller.core,
            Duration::from_millis(1),
            Duration::from_millis(5),
        ));

        assert!(matches!(result, Err(EngineError::ReadinessTimeout(_))));
    }

    #[test]
    fn test_startup_sequence() {
        let mut session = ScriptedSession::new();
        session.reply("GetStatus", status(4, "Running - Play"));
        session.reply(
            "GetVersion",
            RpcValue::object([
                ("Name", RpcValue::from("TmForever")),
                ("Version", RpcValue::from("2.11.26")),
                ("Build", RpcValue::from("2011-02-21")),
            ]),
        );
        session.reply(
            "GetSystemInfo",
            RpcValue::object([("ServerLogin", RpcValue::from("myserver"))]),
        );
        session.reply("IsRelayServer", RpcValue::from(false));
        session.reply("GetPlayerList", RpcValue::Array(Vec::new()));
        let mut controller = controller(session);
        let started = count(&mut controller, EventKind::Startup);
        let synced = count(&mut controller, EventKind::Sync);

        tokio_test::block_on(startup(&mut controller)).unwrap();

        let session = &controller.core.session;
        assert_eq!(
            &session.query_methods()[..3],
            ["Authenticate", "EnableCallbacks", "GetStatus"]
        );
        assert!(session.queried("AddChatCommand").is_empty());
        assert_eq!(controller.core.server.login, "myserver");
        assert_eq!(controller.core.server.build, "2011-02-21");
        assert_eq!(*started.borrow(), 1);
        assert_eq!(*synced.borrow(), 1);
        // playing server: the current challenge is requested right away
        assert!(controller.core.state.challenge_requested);
        assert_eq!(session.staged_methods(), vec!["GetCurrentChallengeInfo"]);
    }

    #[test]
    fn test_run_stops_on_request_and_runs_hook() {
        let mut controller = controller(ScriptedSession::new());
        let ticks = count(&mut controller, EventKind::MainLoop);
        let shutdowns = count(&mut controller, EventKind::Shutdown);

        let result = tokio_test::block_on(async {
            run(&mut controller, sleep(Duration::from_millis(250))).await
        });

        assert!(result.is_ok());
        assert!(*ticks.borrow() >= 2);
        assert_eq!(*shutdowns.borrow(), 1);
    }

    #[test]
    fn test_run_stops_on_batch_failure() {
        let mut controller = controller(ScriptedSession::new());
        let shutdowns = count(&mut controller, EventKind::Shutdown);
        controller.core.stage("Kick", vec!["bob".into()]);
        controller.core.session.fail_next_flush();

        let result = tokio_test::block_on(run(&mut controller, std::future::pending()));

        assert!(matches!(result, Err(EngineError::Protocol(_))));
        assert_eq!(*shutdowns.borrow(), 1);
        assert_eq!(controller.core.dispatcher.pending_len(), 0);
    }

    #[test]
    fn test_failed_startup_runs_shutdown_hook() {
        let mut settings = testing::settings();
        settings.server.timeout_secs = 0;
        let mut session = ScriptedSession::new();
        session.reply("GetStatus", status(2, "Launching"));
        let mut controller = testing::controller_with(session, settings, &MemoryListStore::default());
        let ticks = count(&mut controller, EventKind::MainLoop);
        let shutdowns = count(&mut controller, EventKind::Shutdown);

        let result = tokio_test::block_on(launch(&mut controller, std::future::pending()));

        assert!(matches!(result, Err(EngineError::ReadinessTimeout(_))));
        assert_eq!(*shutdowns.borrow(), 1);
        assert_eq!(*ticks.borrow(), 0);
    }
}
