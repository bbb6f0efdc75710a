//! Activation mailbox: durable hand-off between the registry and the runtime
//!
//! One signal per agent id; a newer put overwrites an unconsumed one.
//! `take` removes the signal before handing it out, so each signal is
//! delivered at most once even when a directory sweep and a change
//! notification race for the same file.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Request to bring an agent online
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct ActivationSignal {
    pub agent_id: String,
    pub name: String,
    pub token: String,
    pub port: u16,
    pub timestamp: DateTime<Utc>,
}

impl std::fmt::Debug for ActivationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivationSignal")
            .field("agent_id", &self.agent_id)
            .field("name", &self.name)
            .field("token", &"***")
            .field("port", &self.port)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

#[async_trait]
pub trait Mailbox: Send + Sync {
    async fn put(&self, signal: &ActivationSignal) -> Result<()>;

    /// Claim and remove the signal for `agent_id`, if any
    async fn take(&self, agent_id: &str) -> Result<Option<ActivationSignal>>;

    /// Ids with a pending signal
    async fn pending(&self) -> Result<Vec<String>>;

    /// Read every pending signal without consuming it
    async fn peek_existing(&self) -> Result<Vec<ActivationSignal>>;

    /// Claim every pending signal
    async fn take_all(&self) -> Result<Vec<ActivationSignal>> {
        let mut out = Vec::new();
        for id in self.pending().await? {
            if let Some(signal) = self.take(&id).await? {
                out.push(signal);
            }
        }
        Ok(out)
    }
}

/// One `<agent_id>.json` file per pending signal
pub struct DirMailbox {
    dir: PathBuf,
}

impl DirMailbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn signal_path(&self, agent_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", agent_id))
    }

    /// Agent id for a path inside the mailbox, if it names a signal file
    pub fn agent_id_for(path: &Path) -> Option<String> {
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return None;
        }
        path.file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

#[async_trait]
impl Mailbox for DirMailbox {
    async fn put(&self, signal: &ActivationSignal) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let target = self.signal_path(&signal.agent_id);
        let tmp = self.dir.join(format!(
            "{}.json.{}.tmp",
            signal.agent_id,
            uuid::Uuid::new_v4()
        ));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(signal)?).await?;
        tokio::fs::rename(&tmp, &target).await?;
        debug!("Activation signal written for {}", signal.agent_id);
        Ok(())
    }

    async fn take(&self, agent_id: &str) -> Result<Option<ActivationSignal>> {
        let path = self.signal_path(agent_id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Whoever removes the file owns the signal
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        match serde_json::from_slice(&raw) {
            Ok(signal) => Ok(Some(signal)),
            Err(e) => {
                warn!("Discarding malformed activation signal for {}: {}", agent_id, e);
                Ok(None)
            }
        }
    }

    async fn peek_existing(&self) -> Result<Vec<ActivationSignal>> {
        let mut out = Vec::new();
        for id in self.pending().await? {
            match tokio::fs::read(self.signal_path(&id)).await {
                Ok(raw) => match serde_json::from_slice(&raw) {
                    Ok(signal) => out.push(signal),
                    Err(e) => warn!("Skipping malformed activation signal for {}: {}", id, e),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    async fn pending(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = Self::agent_id_for(&entry.path()) {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn signal(id: &str, port: u16) -> ActivationSignal {
        ActivationSignal {
            agent_id: id.to_string(),
            name: id.to_uppercase(),
            token: "a.b.c".to_string(),
            port,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_put_then_take_once() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = DirMailbox::new(dir.path().join(".activations"));

        mailbox.put(&signal("chef", 4097)).await.unwrap();
        let taken = mailbox.take("chef").await.unwrap().unwrap();
        assert_eq!(taken.port, 4097);
        assert!(mailbox.take("chef").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_newer_put_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = DirMailbox::new(dir.path());

        mailbox.put(&signal("chef", 1)).await.unwrap();
        mailbox.put(&signal("chef", 2)).await.unwrap();
        assert_eq!(mailbox.pending().await.unwrap(), vec!["chef".to_string()]);
        assert_eq!(mailbox.take("chef").await.unwrap().unwrap().port, 2);
    }

    #[tokio::test]
    async fn test_take_all_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = DirMailbox::new(dir.path());

        mailbox.put(&signal("a", 1)).await.unwrap();
        mailbox.put(&signal("b", 2)).await.unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hi").unwrap();
        std::fs::write(dir.path().join("c.json.123.tmp"), "{}").unwrap();

        let all = mailbox.take_all().await.unwrap();
        let ids: Vec<_> = all.iter().map(|s| s.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(mailbox.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = DirMailbox::new(dir.path());
        mailbox.put(&signal("chef", 4097)).await.unwrap();

        assert_eq!(mailbox.peek_existing().await.unwrap().len(), 1);
        assert_eq!(mailbox.peek_existing().await.unwrap().len(), 1);
        assert!(mailbox.take("chef").await.unwrap().is_some());
        assert!(mailbox.peek_existing().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = DirMailbox::new(dir.path().join("nope"));
        assert!(mailbox.take_all().await.unwrap().is_empty());
        assert!(mailbox.take("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_takes_deliver_once() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = Arc::new(DirMailbox::new(dir.path()));
        mailbox.put(&signal("race", 7)).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mb = mailbox.clone();
            handles.push(tokio::spawn(async move { mb.take("race").await.unwrap() }));
        }
        let mut delivered = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
    }

    #[tokio::test]
    async fn test_malformed_signal_is_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let mailbox = DirMailbox::new(dir.path());
        std::fs::write(dir.path().join("bad.json"), "not json").unwrap();
        assert!(mailbox.take("bad").await.unwrap().is_none());
        assert!(!dir.path().join("bad.json").exists());
    }

    #[test]
    fn test_agent_id_for() {
        assert_eq!(
            DirMailbox::agent_id_for(Path::new("/x/chef.json")),
            Some("chef".to_string())
        );
        assert_eq!(DirMailbox::agent_id_for(Path::new("/x/chef.json.abc.tmp")), None);
        assert_eq!(DirMailbox::agent_id_for(Path::new("/x/chef.txt")), None);
    }
}
