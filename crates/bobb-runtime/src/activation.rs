//! Activation watcher
//!
//! Consumes activation signals from the mailbox directory: once at startup
//! for signals left behind while nothing was watching, then for every new
//! signal file as it appears.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bobb_core::{ActivationSignal, DirMailbox, Mailbox, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Brings an agent online for a consumed activation signal
#[async_trait]
pub trait ActivationHandler: Send + Sync {
    async fn on_activation(&self, signal: ActivationSignal) -> Result<()>;
}

pub struct ActivationWatcher {
    mailbox: Arc<DirMailbox>,
    handler: Arc<dyn ActivationHandler>,
    settle: Duration,
    shutdown: CancellationToken,
}

impl ActivationWatcher {
    pub fn new(mailbox: Arc<DirMailbox>, handler: Arc<dyn ActivationHandler>) -> Self {
        Self {
            mailbox,
            handler,
            settle: Duration::from_millis(100),
            shutdown: CancellationToken::new(),
        }
    }

    /// Delay between a change notification and reading the signal file
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Start watching, then sweep signals that were already pending.
    ///
    /// The watch is installed before the sweep so a signal written in between
    /// is seen by at least one of them; the mailbox's take-once semantics
    /// keep it from being handled twice.
    pub async fn start(&self) -> Result<JoinHandle<()>> {
        tokio::fs::create_dir_all(self.mailbox.dir()).await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if tx.send(event).is_err() {
                        debug!("Activation watcher channel closed");
                    }
                }
                Err(e) => error!("Activation watch error: {:?}", e),
            })
            .map_err(std::io::Error::other)?;
        watcher
            .watch(self.mailbox.dir(), RecursiveMode::NonRecursive)
            .map_err(std::io::Error::other)?;

        info!("Activation watcher started: {}", self.mailbox.dir().display());

        for signal in self.mailbox.take_all().await? {
            self.dispatch(signal);
        }

        let mailbox = self.mailbox.clone();
        let handler = self.handler.clone();
        let settle = self.settle;
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            // keep the OS watch alive for the task's lifetime
            let _watcher = watcher;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Activation watcher stopped");
                        break;
                    }
                    Some(event) = rx.recv() => {
                        if matches!(event.kind, EventKind::Remove(_) | EventKind::Access(_)) {
                            continue;
                        }
                        for path in event.paths {
                            let Some(agent_id) = DirMailbox::agent_id_for(&path) else {
                                continue;
                            };
                            tokio::time::sleep(settle).await;
                            match mailbox.take(&agent_id).await {
                                Ok(Some(signal)) => spawn_handler(handler.clone(), signal),
                                Ok(None) => {}
                                Err(e) => error!("Failed to read activation for {}: {}", agent_id, e),
                            }
                        }
                    }
                }
            }
        });

        Ok(handle)
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    fn dispatch(&self, signal: ActivationSignal) {
        spawn_handler(self.handler.clone(), signal);
    }
}

fn spawn_handler(handler: Arc<dyn ActivationHandler>, signal: ActivationSignal) {
    tokio::spawn(async move {
        let agent_id = signal.agent_id.clone();
        info!("Processing activation for {} ({})", signal.name, agent_id);
        match handler.on_activation(signal).await {
            Ok(()) => info!("Activation processed: {}", agent_id),
            Err(e) => error!("Activation of {} failed: {}", agent_id, e),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ActivationHandler for Recorder {
        async fn on_activation(&self, signal: ActivationSignal) -> Result<()> {
            self.seen.lock().unwrap().push(signal.agent_id);
            Ok(())
        }
    }

    fn signal(id: &str) -> ActivationSignal {
        ActivationSignal {
            agent_id: id.to_string(),
            name: id.to_string(),
            token: "a.b.c".to_string(),
            port: 4097,
            timestamp: Utc::now(),
        }
    }

    async fn wait_for(recorder: &Recorder, count: usize) -> Vec<String> {
        for _ in 0..100 {
            {
                let seen = recorder.seen.lock().unwrap();
                if seen.len() >= count {
                    return seen.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        recorder.seen.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn test_sweeps_pending_then_watches() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = Arc::new(DirMailbox::new(dir.path().join(".activations")));
        mailbox.put(&signal("early")).await.unwrap();

        let recorder = Arc::new(Recorder::default());
        let watcher = ActivationWatcher::new(mailbox.clone(), recorder.clone())
            .with_settle(Duration::from_millis(10));
        let handle = watcher.start().await.unwrap();

        assert_eq!(wait_for(&recorder, 1).await, vec!["early".to_string()]);

        mailbox.put(&signal("late")).await.unwrap();
        let seen = wait_for(&recorder, 2).await;
        assert_eq!(seen, vec!["early".to_string(), "late".to_string()]);

        // file is consumed, and a grace period yields no duplicate delivery
        assert!(mailbox.pending().await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);

        watcher.stop();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_handler_does_not_stop_watcher() {
        struct Failing {
            calls: Mutex<u32>,
        }

        #[async_trait]
        impl ActivationHandler for Failing {
            async fn on_activation(&self, _signal: ActivationSignal) -> Result<()> {
                *self.calls.lock().unwrap() += 1;
                Err(bobb_core::BobbError::Backend("boom".into()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mailbox = Arc::new(DirMailbox::new(dir.path()));
        let failing = Arc::new(Failing {
            calls: Mutex::new(0),
        });
        let watcher = ActivationWatcher::new(mailbox.clone(), failing.clone())
            .with_settle(Duration::from_millis(10));
        let handle = watcher.start().await.unwrap();

        mailbox.put(&signal("one")).await.unwrap();
        mailbox.put(&signal("two")).await.unwrap();

        for _ in 0..100 {
            if *failing.calls.lock().unwrap() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(*failing.calls.lock().unwrap(), 2);

        watcher.stop();
        handle.await.unwrap();
    }
}
