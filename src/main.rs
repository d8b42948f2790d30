use std::io;

mod cli;
use cli::{parse_cli_mode, run_free_slots_mode, run_sync_mode, CliMode};

#[tokio::main]
async fn main() -> Result<(), io::Error> {
    setup_logging();

    let cli_mode = match parse_cli_mode() {
        Ok(mode) => mode,
        Err(err) => {
            eprintln!("Error: {}", err);
            println!("Usage: calsync [--sync] [--full-refresh] [--free-slots [YYYY/MM/DD]]");
            return Ok(());
        }
    };

    match cli_mode {
        CliMode::Sync { full_refresh } => run_sync_mode(full_refresh).await,
        CliMode::FreeSlots(date) => run_free_slots_mode(date).await,
    }
}

fn setup_logging() {
    let log_dir = dirs::config_dir()
        .map(|d| d.join("calsync"))
        .unwrap_or_else(|| std::path::PathBuf::from("."));

    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, "calsync.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false)
        .init();

    std::mem::forget(_guard);

    tracing::info!("calsync started");
}
