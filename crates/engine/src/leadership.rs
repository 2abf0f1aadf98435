//! Leadership detection and edge-triggered leadership tracking.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::queue::stopped;

/// Raw status reported by a leadership detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadershipStatus {
    Leader,
    NotLeader,
    Unknown,
}

/// One report from a leadership detector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipEvent {
    pub status: LeadershipStatus,
    pub error: Option<String>,
}

impl LeadershipEvent {
    pub fn leader() -> Self {
        Self {
            status: LeadershipStatus::Leader,
            error: None,
        }
    }

    pub fn not_leader() -> Self {
        Self {
            status: LeadershipStatus::NotLeader,
            error: None,
        }
    }

    pub fn unknown(error: impl Into<String>) -> Self {
        Self {
            status: LeadershipStatus::Unknown,
            error: Some(error.into()),
        }
    }
}

/// Source of raw leadership events.
#[async_trait]
pub trait Leadership: Send + Sync {
    /// Begin reporting. The stream ends when the detector stops.
    ///
    /// # Errors
    ///
    /// Returns an error when the detector cannot be started.
    async fn start(&self) -> Result<mpsc::Receiver<LeadershipEvent>>;

    /// Stop reporting.
    async fn stop(&self);
}

/// Turns raw leadership events into leadership edges.
///
/// Starts out not leader. An `Unknown` report carrying an error downgrades
/// a leader to not leader; an `Unknown` report without an error changes
/// nothing.
#[derive(Debug, Default)]
pub struct LeadershipMonitor {
    leader: bool,
}

impl LeadershipMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// Apply one event. Returns the new leadership value only if it changed.
    pub fn observe(&mut self, event: &LeadershipEvent) -> Option<bool> {
        let next = match event.status {
            LeadershipStatus::Leader => true,
            LeadershipStatus::NotLeader => false,
            LeadershipStatus::Unknown => {
                if let Some(error) = &event.error {
                    warn!(error = %error, leader = self.leader, "Leadership unknown");
                    false
                } else {
                    self.leader
                }
            }
        };

        if next == self.leader {
            return None;
        }
        self.leader = next;
        Some(next)
    }

    /// Forward edges from `events` to `edges` until either side closes or
    /// `stop` fires.
    pub fn spawn(
        mut self,
        mut events: mpsc::Receiver<LeadershipEvent>,
        edges: mpsc::Sender<bool>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = stopped(&mut stop) => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        debug!(status = ?event.status, "Leadership event");
                        if let Some(edge) = self.observe(&event) {
                            info!(leader = edge, "Leadership changed");
                            if edges.send(edge).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            debug!("Leadership monitor stopped");
        })
    }
}

/// Detector driven by explicit calls.
#[derive(Debug)]
pub struct ManualLeadership {
    status: watch::Sender<LeadershipEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for ManualLeadership {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualLeadership {
    pub fn new() -> Self {
        let (status, _) = watch::channel(LeadershipEvent {
            status: LeadershipStatus::Unknown,
            error: None,
        });
        Self {
            status,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Report a status.
    pub fn set(&self, status: LeadershipStatus) {
        self.status.send_replace(LeadershipEvent {
            status,
            error: None,
        });
    }

    /// Report a detector failure.
    pub fn fail(&self, reason: impl Into<String>) {
        self.status.send_replace(LeadershipEvent::unknown(reason));
    }
}

#[async_trait]
impl Leadership for ManualLeadership {
    async fn start(&self) -> Result<mpsc::Receiver<LeadershipEvent>> {
        let (tx, rx) = mpsc::channel(16);
        let mut status = self.status.subscribe();
        let task = tokio::spawn(async move {
            loop {
                let event = status.borrow_and_update().clone();
                if tx.send(event).await.is_err() {
                    break;
                }
                if status.changed().await.is_err() {
                    break;
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(task);
        Ok(rx)
    }

    async fn stop(&self) {
        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for task in tasks {
            task.abort();
        }
    }
}

/// Detector that polls a file naming the current leader.
///
/// This process is leader while the trimmed file contents equal `name`.
/// A file that cannot be read reports `Unknown` with the read error.
#[derive(Debug)]
pub struct FileLeadership {
    path: PathBuf,
    name: String,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FileLeadership {
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            interval,
            task: Mutex::new(None),
        }
    }

    async fn poll(path: &std::path::Path, name: &str) -> LeadershipEvent {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) if contents.trim() == name => LeadershipEvent::leader(),
            Ok(_) => LeadershipEvent::not_leader(),
            Err(e) => LeadershipEvent::unknown(format!("{}: {e}", path.display())),
        }
    }
}

#[async_trait]
impl Leadership for FileLeadership {
    async fn start(&self) -> Result<mpsc::Receiver<LeadershipEvent>> {
        let (tx, rx) = mpsc::channel(16);
        let path = self.path.clone();
        let name = self.name.clone();
        let mut ticker = tokio::time::interval(self.interval);

        let task = tokio::spawn(async move {
            loop {
                ticker.tick().await;
                let event = Self::poll(&path, &name).await;
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });

        let previous = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(rx)
    }

    async fn stop(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}
