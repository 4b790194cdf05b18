use std::sync::{Arc, LazyLock};

use postern_common::{DirectoryEntry, Signal, StaticDirectory, internal, tracing};
use postern_delivery::{DeliveryConfig, Dispatcher, DispatcherConfig, Mailer};
use postern_store::StoreConfig;
use serde::Deserialize;
use tokio::sync::broadcast;

/// Top level configuration, as read from `postern.config.ron`
///
/// ```ron
/// Postern (
///     delivery: (
///         immediate_send: false,
///         default_transport: Log,
///     ),
///     store: (type: "File", path: "/var/spool/postern"),
///     dispatcher: (process_interval_secs: 10),
///     recipients: [
///         (id: "alice", email: "alice@example.com", name: "Alice"),
///     ],
/// )
/// ```
#[derive(Debug, Default, Deserialize)]
pub struct Postern {
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(alias = "recipient", default)]
    pub recipients: Vec<DirectoryEntry>,
}

pub static SHUTDOWN_BROADCAST: LazyLock<broadcast::Sender<Signal>> = LazyLock::new(|| {
    let (sender, _receiver) = broadcast::channel(64);
    sender
});

async fn shutdown() -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            internal!("CTRL+C entered -- Enter it again to force shutdown");
        }
        _ = terminate.recv() => {
            internal!("Terminate Signal received, shutting down");
        }
    };

    let mut receiver = SHUTDOWN_BROADCAST.subscribe();

    SHUTDOWN_BROADCAST
        .send(Signal::Shutdown)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()))?;

    loop {
        tokio::select! {
            sig = receiver.recv() => {
                match sig {
                    Ok(s) => tracing::debug!("Received {s:?}"),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(e) => tracing::debug!("Received: {e:?}"),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    Ok(())
}

impl Postern {
    /// Parse a RON configuration document
    ///
    /// # Errors
    /// If the document is not a valid configuration
    pub fn from_ron(document: &str) -> anyhow::Result<Self> {
        Ok(ron::from_str(document)?)
    }

    /// The recipient directory described by the configuration
    #[must_use]
    pub fn directory(&self) -> StaticDirectory {
        self.recipients.iter().cloned().collect()
    }

    /// Open the configured store and build a mailer on top of it
    ///
    /// # Errors
    /// If the store cannot be initialised
    pub fn mailer(&self) -> anyhow::Result<Arc<Mailer>> {
        let store = self.store.clone().into_store()?;

        internal!(
            level = DEBUG,
            recipients = self.recipients.len(),
            transport = ?self.delivery.default_transport,
            "Mailer configured"
        );

        let mailer = Mailer::new(self.delivery.clone(), Arc::new(self.directory()), store);
        Ok(Arc::new(mailer))
    }

    /// Run the dispatcher until a shutdown signal arrives
    ///
    /// # Errors
    ///
    /// This function will return an error if the store cannot be initialised,
    /// or the signal handlers cannot be installed.
    pub async fn run(self) -> anyhow::Result<()> {
        let mailer = self.mailer()?;
        let dispatcher = Dispatcher::new(mailer, self.dispatcher.clone());

        internal!("Controller running");

        let ret = tokio::select! {
            () = dispatcher.serve(SHUTDOWN_BROADCAST.subscribe()) => {
                Ok(())
            }
            r = shutdown() => {
                r
            }
        };

        internal!("Shutting down...");

        ret
    }
}
