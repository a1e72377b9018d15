use clap::Parser;
use controller::config::{load_banned_ips, AdminLists, Settings};
use controller::engine::Controller;
use controller::error::EngineError;
use controller::moderation::{BanList, FileListStore};
use controller::network::TcpSession;
use controller::permissions::PermissionRegistry;
use controller::scheduler;
use log::{error, info};
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Settings file
    #[clap(short, long, default_value = "trackctl.toml")]
    config: String,
    /// Log at debug level unless RUST_LOG says otherwise
    #[clap(short, long)]
    debug: bool,
}

/// Main-method of the application.
/// Loads the settings and lists, connects to the server and runs the controller until Ctrl+C.
#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(&args).await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(args: &Args) -> Result<(), EngineError> {
    info!("Load settings [{}]", args.config);
    let settings = Settings::load(&args.config).map_err(EngineError::Configuration)?;

    let adminops = settings.controller.adminops_file.clone();
    info!("Load admin/ops lists [{}]", adminops.display());
    let lists = AdminLists::load(&adminops).map_err(EngineError::Configuration)?;

    let bannedips = settings.controller.bannedips_file.clone();
    info!("Load banned IPs list [{}]", bannedips.display());
    let ips = load_banned_ips(&bannedips).map_err(EngineError::Configuration)?;

    let permissions = PermissionRegistry::new(
        settings.masteradmins.clone(),
        lists,
        settings.controller.lock_password.clone(),
    );
    let ban_list = BanList::new(ips, Box::new(FileListStore::new(bannedips)));

    let session = TcpSession::connect(
        &settings.server.address(),
        Duration::from_secs(settings.server.timeout_secs),
    )
    .await?;

    let mut controller = Controller::new(session, settings, permissions, ban_list);
    scheduler::launch(&mut controller, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down gracefully...");
    })
    .await
}
