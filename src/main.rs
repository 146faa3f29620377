use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use leaseworker::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::parse_cli();
    init_tracing(&cli.log_filter());
    cli::run_with_cli(cli).await
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|e| {
        eprintln!("Invalid log filter '{}': {}, falling back to info", filter, e);
        EnvFilter::new("info")
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}
