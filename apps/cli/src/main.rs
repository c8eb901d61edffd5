//! wikiactivity CLI: page activity across a network of wikis.
//!
//! Pulls recent-changes feeds and sitemaps from every configured site,
//! reconciles them into one activity record per page, and reports on it.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
