//! quizwire: a multi-client trivia quiz server
//!
//! Clients connect over TCP, pick a unique nickname, browse the quiz
//! catalog, and play quizzes while a live score-ordered ranking is kept
//! per quiz.
//!
//! Features:
//! - Length-prefixed binary protocol with typed messages
//! - Single-threaded readiness-driven event loop (mio)
//! - Per-quiz leaderboards with stable score ordering
//! - Quiz catalog loaded from plain-text files at startup
//! - Configuration via CLI arguments or TOML file

mod catalog;
mod config;
mod dispatch;
mod protocol;
mod ranking;
mod server;
mod session;

use catalog::Catalog;
use config::Config;
use server::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let catalog = Catalog::load(&config.quizzes)?;

    info!(
        listen = %config.listen,
        quizzes = catalog.len(),
        max_connections = config.max_connections,
        "Starting quizwire server"
    );

    let mut server = Server::bind(&config, catalog)?;
    server.run()?;
    Ok(())
}
