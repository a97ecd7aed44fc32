//! Backend for an anonymous workplace survey board.
//!
//! Visitors submit structured surveys about stores and browse them, admins
//! curate. This crate keeps two things honest:
//!
//! - every store's [`models::StoreStats`] block follows its approved surveys
//!   through creates, edits, moderation and reassignment
//! - a browser can mark a survey helpful at most once, identified by a signed
//!   cookie instead of an account
//!
//!
//!
//! # Flow
//!
//! ## Survey mutations
//! - Request body is decoded and validated in [`utils`]
//! - [`commands::SurveyCommands`] writes the survey
//! - [`stats::recalculate`] refreshes the affected store(s)
//! - A failed refresh is a warning in the response, never a failed write
//!
//! ## Helpful votes
//! - [`voter::VoterProtocol`] resolves the `mc_helpful_voter` cookie or issues a new one
//! - [`helpful::toggle`] inserts or deletes the vote row
//! - The cached counter moves by exactly one, only when the row changed
//!
//!
//!
//! # Notes
//!
//! ## No in-process locks
//! Requests run on their own tasks. Every race (double votes, two first
//! submissions for the same store, concurrent recalculations) is settled by a
//! redis primitive: `HSETNX`, `HDEL`, `HINCRBY`, `SMOVE`. See [`database`].
//!
//! ## Stats are a projection
//! A store's stats can always be thrown away and recomputed. The
//! `recalculate-stats` binary in the `process` crate does that for every store.
//!
//!
//!
//! # Setup
//!
//! Required secrets, read from `/run/secrets/<NAME>` or the environment:
//! - `HELPFUL_VOTER_SECRET`
//! - `ADMIN_TOKEN`
//!
//! Local run without redis.
//! ```sh
//! STORAGE=memory HELPFUL_VOTER_SECRET=dev ADMIN_TOKEN=dev RUST_LOG=info cargo run --bin survey-server
//! ```
//!
//! View current docs.
//! ```sh
//! cargo doc --open
//! ```
use anyhow::{Context, Result};
use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

pub mod auth;
pub mod commands;
pub mod config;
pub mod database;
pub mod error;
pub mod helpful;
pub mod listing;
pub mod memory;
pub mod models;
pub mod notify;
pub mod repository;
pub mod routes;
pub mod state;
pub mod stats;
pub mod taxonomy;
pub mod utils;
pub mod voter;

use config::Config;
use state::AppState;

pub async fn start_server() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Loading config...");
    let config = Config::load()?;

    info!("Initializing state...");
    let state = AppState::new(config).await?;

    info!("Starting server...");
    let app = routes::router(state.clone());

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutting down...");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
