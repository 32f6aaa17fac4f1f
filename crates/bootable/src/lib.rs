//! Lifecycle interface for long-lived backend services, plus an ordered boot
//! sequence that unwinds in reverse.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

/// Error type returned by lifecycle operations.
pub type BootableError = Box<dyn std::error::Error + Send + Sync>;

/// Trait for bootable services.
#[async_trait]
pub trait Bootable
where
    Self: Send + Sync + 'static,
{
    /// Get the name of the bootable service.
    fn name(&self) -> &str;

    /// Start the bootable service.
    async fn start(&self) -> Result<(), BootableError>;

    /// Shutdown the bootable service. Calling this on a service that is not
    /// running must succeed without doing anything.
    async fn shutdown(&self) -> Result<(), BootableError>;

    /// Wait for the bootable service to exit.
    async fn wait(&self);
}

/// Services started in order and shut down in reverse.
#[derive(Default)]
pub struct BootSequence {
    started: Vec<Arc<dyn Bootable>>,
}

impl std::fmt::Debug for BootSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.started.iter().map(|service| service.name()))
            .finish()
    }
}

impl BootSequence {
    /// Creates an empty sequence.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of services currently started.
    #[must_use]
    pub fn len(&self) -> usize {
        self.started.len()
    }

    /// Whether no service is currently started.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
    }

    /// Starts `service` and records it. A service that fails to start is not
    /// recorded; the caller decides whether to unwind the rest.
    ///
    /// # Errors
    ///
    /// Returns the service's start error.
    pub async fn start(&mut self, service: Arc<dyn Bootable>) -> Result<(), BootableError> {
        info!("starting {}", service.name());
        service.start().await?;
        info!("{} started", service.name());
        self.started.push(service);
        Ok(())
    }

    /// Shuts every started service down, most recently started first.
    ///
    /// Every service is given the chance to shut down; the first error, if
    /// any, is returned after all of them have been attempted.
    ///
    /// # Errors
    ///
    /// Returns the first shutdown error encountered.
    pub async fn unwind(&mut self) -> Result<(), BootableError> {
        let mut first_error = None;

        while let Some(service) = self.started.pop() {
            info!("shutting down {}", service.name());
            if let Err(e) = service.shutdown().await {
                error!("failed to shut down {}: {}", service.name(), e);
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    struct Recorder {
        name: String,
        fail_start: bool,
        fail_shutdown: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                fail_start: false,
                fail_shutdown: false,
                log: log.clone(),
            }
        }
    }

    #[async_trait]
    impl Bootable for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self) -> Result<(), BootableError> {
            if self.fail_start {
                return Err(format!("{} refused to start", self.name).into());
            }
            self.log.lock().unwrap().push(format!("start {}", self.name));
            Ok(())
        }

        async fn shutdown(&self) -> Result<(), BootableError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("shutdown {}", self.name));
            if self.fail_shutdown {
                return Err(format!("{} refused to stop", self.name).into());
            }
            Ok(())
        }

        async fn wait(&self) {}
    }

    #[tokio::test]
    async fn test_unwinds_in_reverse_order() {
        let _ = tracing_subscriber::fmt::try_init();

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut sequence = BootSequence::new();

        sequence
            .start(Arc::new(Recorder::new("store", &log)))
            .await
            .unwrap();
        sequence
            .start(Arc::new(Recorder::new("listener", &log)))
            .await
            .unwrap();

        let mut failing = Recorder::new("bus", &log);
        failing.fail_start = true;
        assert!(sequence.start(Arc::new(failing)).await.is_err());
        assert_eq!(sequence.len(), 2);

        sequence.unwind().await.unwrap();
        assert!(sequence.is_empty());

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "start store",
                "start listener",
                "shutdown listener",
                "shutdown store"
            ]
        );
    }

    #[tokio::test]
    async fn test_unwind_continues_after_error() {
        let _ = tracing_subscriber::fmt::try_init();

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut sequence = BootSequence::new();

        sequence
            .start(Arc::new(Recorder::new("store", &log)))
            .await
            .unwrap();
        let mut stubborn = Recorder::new("listener", &log);
        stubborn.fail_shutdown = true;
        sequence.start(Arc::new(stubborn)).await.unwrap();

        assert!(sequence.unwind().await.is_err());
        assert_eq!(
            log.lock().unwrap().last().map(String::as_str),
            Some("shutdown store")
        );
    }
}
