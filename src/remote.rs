//! Monitor-side view of the agent's remote management surface.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{ProfilerError, ProfilerRemoteContract, ProfilerResult};

/// Calls the facade places on a profiler agent. An error means the call
/// itself could not be placed; the agent never reports failures in-band.
pub trait RemoteProfiler: Send + Sync {
    fn set_running(&self, running: bool) -> ProfilerResult<()>;
    fn is_running(&self) -> ProfilerResult<bool>;
    fn clear(&self) -> ProfilerResult<()>;
    fn dump(&self) -> ProfilerResult<String>;
    fn dump_to_file(&self) -> ProfilerResult<()>;
    fn dump_dir(&self) -> ProfilerResult<PathBuf>;
    fn set_dump_dir(&self, dir: &Path) -> ProfilerResult<()>;
    /// `None` when the agent reports no version at all.
    fn version(&self) -> ProfilerResult<Option<String>>;
    fn set_filter(&self, key: &str, value: &str) -> ProfilerResult<()>;
    fn profiled_packages(&self) -> ProfilerResult<Vec<String>>;
    fn ignored_packages(&self) -> ProfilerResult<Vec<String>>;
    fn profiled_classloaders(&self) -> ProfilerResult<Vec<String>>;
}

/// In-process link to an agent contract.
///
/// Dropping the connection makes every call fail with `RemoteUnreachable`,
/// the same way a lost management connection does.
pub struct LocalAgentLink {
    contract: Arc<ProfilerRemoteContract>,
    connected: AtomicBool,
}

impl LocalAgentLink {
    pub fn new(contract: Arc<ProfilerRemoteContract>) -> Self {
        Self {
            contract,
            connected: AtomicBool::new(true),
        }
    }

    pub fn contract(&self) -> &Arc<ProfilerRemoteContract> {
        &self.contract
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn call<T>(&self, f: impl FnOnce(&ProfilerRemoteContract) -> T) -> ProfilerResult<T> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ProfilerError::RemoteUnreachable(
                "agent connection closed".to_string(),
            ));
        }
        Ok(f(&self.contract))
    }
}

impl RemoteProfiler for LocalAgentLink {
    fn set_running(&self, running: bool) -> ProfilerResult<()> {
        self.call(|c| c.set_running(running))
    }

    fn is_running(&self) -> ProfilerResult<bool> {
        self.call(ProfilerRemoteContract::is_running)
    }

    fn clear(&self) -> ProfilerResult<()> {
        self.call(ProfilerRemoteContract::clear)
    }

    fn dump(&self) -> ProfilerResult<String> {
        self.call(ProfilerRemoteContract::dump)
    }

    fn dump_to_file(&self) -> ProfilerResult<()> {
        self.call(ProfilerRemoteContract::dump_to_file)
    }

    fn dump_dir(&self) -> ProfilerResult<PathBuf> {
        self.call(ProfilerRemoteContract::get_dump_dir)
    }

    fn set_dump_dir(&self, dir: &Path) -> ProfilerResult<()> {
        self.call(|c| c.set_dump_dir(dir.to_path_buf()))
    }

    fn version(&self) -> ProfilerResult<Option<String>> {
        self.call(|c| Some(c.get_version()).filter(|v| !v.is_empty()))
    }

    fn set_filter(&self, key: &str, value: &str) -> ProfilerResult<()> {
        self.call(|c| c.set_filter(key, value))
    }

    fn profiled_packages(&self) -> ProfilerResult<Vec<String>> {
        self.call(ProfilerRemoteContract::get_profiled_packages)
    }

    fn ignored_packages(&self) -> ProfilerResult<Vec<String>> {
        self.call(ProfilerRemoteContract::get_ignored_packages)
    }

    fn profiled_classloaders(&self) -> ProfilerResult<Vec<String>> {
        self.call(ProfilerRemoteContract::get_profiled_classloaders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::fake::{Passthrough, RecordingPort};
    use crate::{AgentConfig, AgentConfigHandle, PROFILED_PACKAGES_PROP_KEY, ProfileCollector};

    fn link() -> LocalAgentLink {
        let contract = ProfilerRemoteContract::new(
            Arc::new(RecordingPort::with_classes(&["com.acme.Foo"])),
            Arc::new(Passthrough),
            Arc::new(ProfileCollector::new()),
            AgentConfigHandle::new(AgentConfig::default()),
        );
        LocalAgentLink::new(Arc::new(contract))
    }

    #[test]
    fn connected_link_forwards_to_contract() {
        let link = link();
        link.set_filter(PROFILED_PACKAGES_PROP_KEY, "com.acme.*")
            .expect("set filter");
        link.set_running(true).expect("resume");
        assert!(link.is_running().expect("running"));
        assert_eq!(link.profiled_packages().expect("packages"), vec!["com.acme.*"]);
        assert!(link.version().expect("version").is_some());
    }

    #[test]
    fn empty_agent_version_is_reported_as_absent() {
        let contract = ProfilerRemoteContract::new(
            Arc::new(RecordingPort::default()),
            Arc::new(Passthrough),
            Arc::new(ProfileCollector::new()),
            AgentConfigHandle::default(),
        )
        .with_version("");
        let link = LocalAgentLink::new(Arc::new(contract));
        assert_eq!(link.version().expect("version"), None);
    }

    #[test]
    fn disconnected_link_is_unreachable() {
        let link = link();
        link.set_connected(false);
        let err = link.is_running().expect_err("unreachable");
        assert!(matches!(err, ProfilerError::RemoteUnreachable(_)));
        assert!(err.is_transient());
        assert!(link.dump().is_err());
    }
}
