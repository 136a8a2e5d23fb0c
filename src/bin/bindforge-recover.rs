//! Recovery entry point: restore the intent database to the state just
//! after a target audit id, from the newest snapshot at or before it
//! plus a replay of the audited operations that followed.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use bindforge::config::Config;
use bindforge::recovery::recover_to;
use bindforge::store::api::CoreApi;
use bindforge::store::Store;

#[derive(Parser)]
#[command(
    name = "bindforge-recover",
    about = "Restore the intent database to a prior audit id",
    version
)]
struct Args {
    /// Path to the bindforge configuration file
    #[arg(short, long, env = "BINDFORGE_CONFIG")]
    config: PathBuf,

    /// Target audit id to recover to
    #[arg(short = 'i', long)]
    audit_id: i64,

    /// User name recorded for replayed operations
    #[arg(short, long, default_value = "recovery")]
    user: String,
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

    let api = CoreApi::new(store, args.user.as_str());
    match recover_to(&api, &config.exporter.backup_dir, args.audit_id).await {
        Ok(summary) => {
            log::info!(
                "recovered to audit id {} from snapshot {}: {} replayed, {} skipped as failed, {} skipped as forbidden",
                summary.target_id,
                summary.snapshot_id,
                summary.replayed,
                summary.skipped_failed,
                summary.skipped_forbidden
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
