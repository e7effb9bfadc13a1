//! Waiting for the signal that ends the process.

use tokio::signal;
use tracing::info;

/// Resolves once SIGINT or SIGTERM (Ctrl+C on Windows) arrives.
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => info!("📡 Received SIGINT"),
            _ = sigterm.recv() => info!("📡 Received SIGTERM"),
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("📡 Received Ctrl+C");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_pending_until_a_signal_arrives() {
        let waited =
            tokio::time::timeout(Duration::from_millis(20), wait_for_shutdown_signal()).await;
        assert!(waited.is_err());
    }
}
