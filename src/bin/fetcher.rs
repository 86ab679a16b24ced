#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> fetcher::Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    fetcher::cli::run().await
}
