//! Backend process supervision
//!
//! Each agent gets one reasoning-backend child process on its own port. A
//! server is tracked from spawn until it is stopped, so a second start for
//! the same id is a no-op even while the first is still coming up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bobb_core::{BobbError, Result};
use reqwest::StatusCode;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How backend servers are launched and probed
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub command: String,
    /// Arguments passed to `command`; `{port}` is replaced with the agent's port
    pub args: Vec<String>,
    pub health_path: String,
    pub health_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: "opencode".to_string(),
            args: vec!["serve".into(), "--port".into(), "{port}".into()],
            health_path: "/api/session".to_string(),
            health_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Healthy,
}

/// Snapshot of one tracked server
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub id: String,
    pub port: u16,
    pub cwd: PathBuf,
    pub state: ProcessState,
}

struct BackendProcess {
    port: u16,
    cwd: PathBuf,
    child: Child,
    state: ProcessState,
    generation: u64,
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    client: reqwest::Client,
    processes: Arc<Mutex<HashMap<String, BackendProcess>>>,
    generation: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self {
            config,
            client,
            processes: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        })
    }

    /// Spawn the backend for `id` and wait until it answers the health probe.
    /// On timeout the child is killed and untracked.
    pub async fn start_server(&self, id: &str, port: u16, cwd: &Path) -> Result<()> {
        if let Some(existing) = self.processes.lock().await.get(id) {
            info!(
                "Backend for {} already running on port {}",
                id, existing.port
            );
            return Ok(());
        }

        tokio::fs::create_dir_all(cwd).await?;

        let args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|a| a.replace("{port}", &port.to_string()))
            .collect();

        info!("Starting backend for {} on port {}", id, port);
        let mut child = Command::new(&self.config.command)
            .args(&args)
            .current_dir(cwd)
            .env("AGENT_ID", id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BobbError::Backend(format!(
                    "failed to spawn '{}' for {}: {}",
                    self.config.command, id, e
                ))
            })?;

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut processes = self.processes.lock().await;
            if processes.contains_key(id) {
                // lost a race with a concurrent start; our child is dropped and killed
                info!("Backend for {} was started concurrently", id);
                return Ok(());
            }
            if let Some(stdout) = child.stdout.take() {
                forward_output(id.to_string(), "stdout", stdout);
            }
            if let Some(stderr) = child.stderr.take() {
                forward_output(id.to_string(), "stderr", stderr);
            }
            processes.insert(
                id.to_string(),
                BackendProcess {
                    port,
                    cwd: cwd.to_path_buf(),
                    child,
                    state: ProcessState::Starting,
                    generation,
                },
            );
        }

        match self.wait_for_health(id, port, generation).await {
            Ok(()) => {
                if let Some(process) = self.processes.lock().await.get_mut(id) {
                    if process.generation == generation {
                        process.state = ProcessState::Healthy;
                    }
                }
                info!("Backend for {} is ready on port {}", id, port);
                Ok(())
            }
            Err(e) => {
                self.stop_generation(id, generation).await;
                Err(e)
            }
        }
    }

    async fn wait_for_health(&self, id: &str, port: u16, generation: u64) -> Result<()> {
        let deadline = Instant::now() + self.config.health_timeout;

        loop {
            if self.probe(port).await {
                return Ok(());
            }

            {
                let mut processes = self.processes.lock().await;
                match processes.get_mut(id).filter(|p| p.generation == generation) {
                    Some(process) => {
                        if let Ok(Some(status)) = process.child.try_wait() {
                            return Err(BobbError::Backend(format!(
                                "backend for {} exited during startup ({})",
                                id, status
                            )));
                        }
                    }
                    None => {
                        return Err(BobbError::Backend(format!(
                            "backend for {} was stopped during startup",
                            id
                        )));
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(BobbError::ProcessStartTimeout {
                    id: id.to_string(),
                    port,
                    timeout: self.config.health_timeout,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Stop `id` only if it is still the process spawned as `generation`
    async fn stop_generation(&self, id: &str, generation: u64) {
        let process = {
            let mut processes = self.processes.lock().await;
            match processes.get(id) {
                Some(p) if p.generation == generation => processes.remove(id),
                _ => None,
            }
        };
        if let Some(mut process) = process {
            info!("Stopping backend for {} (port {})", id, process.port);
            kill(id, &mut process.child).await;
        }
    }

    /// One health probe. A 401 still proves the server is listening.
    pub async fn probe(&self, port: u16) -> bool {
        let url = format!("http://127.0.0.1:{}{}", port, self.config.health_path);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success() || resp.status() == StatusCode::UNAUTHORIZED,
            Err(_) => false,
        }
    }

    /// Kill and untrack the backend for `id`. Returns false if nothing was tracked.
    pub async fn stop_server(&self, id: &str) -> bool {
        let process = self.processes.lock().await.remove(id);
        match process {
            Some(mut process) => {
                info!("Stopping backend for {} (port {})", id, process.port);
                kill(id, &mut process.child).await;
                true
            }
            None => false,
        }
    }

    pub async fn stop_all(&self) {
        let drained: Vec<(String, BackendProcess)> =
            self.processes.lock().await.drain().collect();
        info!("Stopping {} backend server(s)", drained.len());
        for (id, mut process) in drained {
            kill(&id, &mut process.child).await;
        }
    }

    pub async fn is_running(&self, id: &str) -> bool {
        self.processes.lock().await.contains_key(id)
    }

    pub async fn state(&self, id: &str) -> Option<ProcessState> {
        self.processes.lock().await.get(id).map(|p| p.state)
    }

    pub async fn running_servers(&self) -> Vec<ServerInfo> {
        let processes = self.processes.lock().await;
        let mut servers: Vec<ServerInfo> = processes
            .iter()
            .map(|(id, p)| ServerInfo {
                id: id.clone(),
                port: p.port,
                cwd: p.cwd.clone(),
                state: p.state,
            })
            .collect();
        servers.sort_by(|a, b| a.id.cmp(&b.id));
        servers
    }
}

async fn kill(id: &str, child: &mut Child) {
    match tokio::time::timeout(Duration::from_secs(5), child.kill()).await {
        Ok(Ok(())) => debug!("Backend for {} exited", id),
        Ok(Err(e)) => warn!("Failed to kill backend for {}: {}", id, e),
        Err(_) => warn!("Backend for {} did not exit within 5s", id),
    }
}

fn forward_output<R>(id: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(agent = %id, stream, "{}", line);
        }
    });
}
