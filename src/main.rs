use std::sync::Arc;

use tokio::io::BufReader;
use tracing::info;

use carewindow::config::Config;
use carewindow::console::Console;
use carewindow::engine::Scheduler;
use carewindow::store::Ledger;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries replies; logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();
    carewindow::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let ledger = Arc::new(Ledger::open(config.wal_path())?);
    info!("carewindow ready");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  compact_threshold: {}", config.compact_threshold);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let compactor = tokio::spawn(carewindow::compactor::run_compactor(
        ledger.clone(),
        config.compact_threshold,
    ));
    let console = Console::new(Scheduler::new(ledger.clone()));
    let stdout = tokio::io::stdout();

    let session = async {
        match &config.input {
            Some(path) => {
                info!("  input: {}", path.display());
                match tokio::fs::File::open(path).await {
                    Ok(file) => console.serve(BufReader::new(file), stdout).await,
                    Err(e) => Err(e),
                }
            }
            None => console.serve(BufReader::new(tokio::io::stdin()), stdout).await,
        }
    };

    tokio::select! {
        result = session => {
            let count = result?;
            info!("input finished after {count} commands");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    compactor.abort();
    if ledger.wal_appends_since_compact().await >= config.compact_threshold {
        ledger.compact().await?;
    }
    info!("carewindow stopped");
    Ok(())
}
