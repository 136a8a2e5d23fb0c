//! Export entry point: compile the intent database into per-server BIND
//! trees, check them, and optionally push them to the fleet.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use bindforge::config::Config;
use bindforge::export::pusher::PushTransport;
use bindforge::export::{run_export, CancelToken};
use bindforge::store::Store;

#[derive(Parser)]
#[command(
    name = "bindforge-export",
    about = "Export all BIND trees from the intent database",
    version
)]
struct Args {
    /// Path to the bindforge configuration file
    #[arg(short, long, env = "BINDFORGE_CONFIG")]
    config: PathBuf,

    /// User name recorded in the audit log for this export
    #[arg(short, long, default_value = "exporter")]
    user: String,

    /// Build and check the trees but do not push them to the servers
    #[arg(long)]
    no_push: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let store = match Store::connect(&config.database.connection_url()).await {
        Ok(store) => store,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("interrupt received, cancelling export");
                cancel.cancel();
            }
        });
    }

    let transport = PushTransport::default();
    match run_export(&config, &store, &args.user, !args.no_push, &transport, &cancel).await {
        Ok(outcome) => {
            log::info!(
                "export at audit id {} complete: archive {}",
                outcome.bundle.audit_id,
                outcome.bundle.archive_path.display()
            );
            let failed_pushes: Vec<&str> = outcome
                .push_reports
                .iter()
                .filter(|r| !r.succeeded())
                .map(|r| r.server.as_str())
                .collect();
            if !failed_pushes.is_empty() {
                log::error!("push failed on: {}", failed_pushes.join(", "));
                return ExitCode::FAILURE;
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
