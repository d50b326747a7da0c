mod cli;
mod directory_manager;
mod error;
mod hash_cache;
mod logger;
mod progress;
mod scanner;
mod scheduler;
mod session;
mod uploader;
mod webdav_client;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use cli::{Cli, HELP_TEXT, VERSION_TEXT};
use hash_cache::default_cache_path;
use uploader::Uploader;
use webdav_client::HttpWebDavClient;

/// Default per-`put_file` timeout (spec.md §5 "Timeouts").
const PUT_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    // "When run with no arguments, prints help and exits 0" (spec.md §6.1).
    if std::env::args().count() <= 1 {
        println!("{HELP_TEXT}");
        return ExitCode::SUCCESS;
    }

    let cli = Cli::parse();

    if cli.help {
        println!("{HELP_TEXT}");
        return ExitCode::SUCCESS;
    }
    if cli.version {
        println!("{VERSION_TEXT}");
        return ExitCode::SUCCESS;
    }

    let session = match cli.into_session() {
        Ok(session) => session,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let client = match HttpWebDavClient::new(&session.webdav_url, PUT_TIMEOUT) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let cache_path = default_cache_path();

    match Uploader::run(session, client, cache_path).await {
        Ok(summary) => {
            println!("{}", summary.message());
            if summary.failed > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
