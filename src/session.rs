//! Target processes, monitoring sessions and the snapshots taken in them.

use serde::Serialize;
use uuid::Uuid;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::DumpEnvelope;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetProcess {
    pub pid: u32,
    pub host: String,
    pub main_class: String,
    pub jvm_args: String,
    /// Attached over the network rather than in the local machine.
    pub remote: bool,
}

impl TargetProcess {
    pub fn local(pid: u32, main_class: impl Into<String>) -> Self {
        Self {
            pid,
            host: "localhost".to_string(),
            main_class: main_class.into(),
            jvm_args: String::new(),
            remote: false,
        }
    }

    /// `pid@host`; also the session key and snapshot directory name.
    pub fn process_id(&self) -> String {
        format!("{}@{}", self.pid, self.host)
    }

    pub fn envelope(&self) -> DumpEnvelope {
        DumpEnvelope::capture(
            self.process_id(),
            self.main_class.clone(),
            self.jvm_args.clone(),
        )
    }
}

/// Immutable record of one persisted dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: Uuid,
    pub path: PathBuf,
    pub session: String,
    pub envelope: DumpEnvelope,
    pub captured_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub key: String,
    pub terminated: bool,
    pub snapshots: Vec<Snapshot>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, target: &TargetProcess) {
        let key = target.process_id();
        self.lock().entry(key.clone()).or_insert_with(|| Session {
            key,
            terminated: false,
            snapshots: Vec::new(),
        });
    }

    /// Tears the session down together with its snapshot list.
    pub fn detach(&self, key: &str) -> Option<Session> {
        self.lock().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn session(&self, key: &str) -> Option<Session> {
        self.lock().get(key).cloned()
    }

    /// Registers `snapshot` under its session. A session that was already
    /// torn down comes back as a terminated placeholder; returns `true` when
    /// that happened.
    pub fn add_snapshot(&self, snapshot: Snapshot) -> bool {
        let mut sessions = self.lock();
        let mut placeholder = false;
        let session = sessions.entry(snapshot.session.clone()).or_insert_with(|| {
            placeholder = true;
            Session {
                key: snapshot.session.clone(),
                terminated: true,
                snapshots: Vec::new(),
            }
        });
        if placeholder {
            tracing::info!(session = %session.key, "created terminated session for snapshot");
        }
        session.snapshots.push(snapshot);
        placeholder
    }

    pub fn snapshots(&self, key: &str) -> Vec<Snapshot> {
        self.lock()
            .get(key)
            .map(|s| s.snapshots.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
