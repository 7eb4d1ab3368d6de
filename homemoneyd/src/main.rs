use homemoneyd::daemon::{DaemonConfig, DaemonRuntime, format_report, format_status};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    SyncOnce,
    Status,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--sync-once" => mode = CliMode::SyncOnce,
            "--status" => mode = CliMode::Status,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: homemoneyd [--sync-once | --status]");
        println!("  --sync-once   Run one full sync and print the report");
        println!("  --status      Print pending changes and the last sync time");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::SyncOnce => {
            let report = daemon.sync_once().await?;
            println!("{}", format_report(&report));
            Ok(())
        }
        CliMode::Status => {
            let summary = daemon.status_summary().await?;
            println!("{}", format_status(&summary));
            Ok(())
        }
        CliMode::Run | CliMode::Help => daemon.run().await,
    }
}
