//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `tail`   | `Tail`           |
//! | `config` | `Config`         |

pub mod config;
pub mod serve;
pub mod tail;

pub use config::cmd_config;
pub use serve::{ServeOptions, cmd_serve};
pub use tail::cmd_tail;

/// Resolves on Ctrl+C, or SIGTERM on unix.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown requested");
}
