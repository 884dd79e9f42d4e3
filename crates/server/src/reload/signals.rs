//! Signal handling for configuration reload and shutdown.
//!
//! Bridges OS signals into the runtime as [`SignalType`] values:
//! SIGHUP reloads the domain list, SIGTERM and SIGINT shut down.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Signal type for cross-task communication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    /// Reload configuration (SIGHUP)
    Reload,
    /// Graceful shutdown (SIGTERM/SIGINT)
    Shutdown,
}

/// Channel between OS signal listeners and the control loop
pub struct SignalManager {
    tx: mpsc::UnboundedSender<SignalType>,
    rx: mpsc::UnboundedReceiver<SignalType>,
}

impl SignalManager {
    pub fn new() -> Self {
        debug!("Creating signal manager");
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Sender for signal producers
    pub fn sender(&self) -> mpsc::UnboundedSender<SignalType> {
        trace!("Cloning signal sender");
        self.tx.clone()
    }

    /// Register OS handlers and forward what they see
    ///
    /// Must be called from within the runtime.
    pub fn listen_os_signals(&self) -> std::io::Result<()> {
        let mut hangup = signal(SignalKind::hangup())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let mut interrupt = signal(SignalKind::interrupt())?;
        let tx = self.sender();

        tokio::spawn(async move {
            loop {
                let signal = tokio::select! {
                    Some(()) = hangup.recv() => SignalType::Reload,
                    Some(()) = terminate.recv() => SignalType::Shutdown,
                    Some(()) = interrupt.recv() => SignalType::Shutdown,
                    else => break,
                };
                if tx.send(signal).is_err() {
                    break;
                }
            }
            warn!("OS signal listener stopped");
        });

        debug!("Registered handlers for SIGHUP, SIGTERM and SIGINT");
        Ok(())
    }

    /// Wait for the next signal
    ///
    /// Never returns `None` while the manager is alive, since it holds a sender.
    pub async fn recv(&mut self) -> Option<SignalType> {
        let signal = self.rx.recv().await;
        if let Some(ref s) = signal {
            debug!(signal = ?s, "Received signal");
        }
        signal
    }

    /// Receive a signal without waiting
    pub fn try_recv(&mut self) -> Option<SignalType> {
        let signal = self.rx.try_recv().ok();
        if let Some(ref s) = signal {
            debug!(signal = ?s, "Received signal (non-blocking)");
        }
        signal
    }
}

impl Default for SignalManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signals_delivered_in_order() {
        let mut manager = SignalManager::new();
        let sender = manager.sender();

        sender.send(SignalType::Reload).unwrap();
        sender.send(SignalType::Shutdown).unwrap();

        assert_eq!(manager.recv().await, Some(SignalType::Reload));
        assert_eq!(manager.recv().await, Some(SignalType::Shutdown));
        assert_eq!(manager.try_recv(), None);
    }

    #[tokio::test]
    async fn test_os_listener_registers() {
        let manager = SignalManager::new();

        assert!(manager.listen_os_signals().is_ok());
    }
}
