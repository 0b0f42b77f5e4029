//! Monitor-side entry point for CPU profiling of one target process.
//!
//! The profiler state is derived from the agent on every query and never
//! stored. Mutating operations are serialized per facade; state queries do
//! not wait for them.

use time::OffsetDateTime;

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use crate::{
    AgentLoadDetector, CallTreeModel, CancelToken, DEFAULT_SAMPLING_PERIOD_MS, DumpParser,
    EventHub, FileStore, PROFILED_PACKAGES_KEY, PROFILED_PACKAGES_PROP_KEY, PROFILER_TYPE_KEY,
    ProfilerError, ProfilerEvent, ProfilerMode, ProfilerResult, ProfilerState, ProgressMonitor,
    RemoteProfiler, SAMPLING_PERIOD_KEY, SamplingProfiler, SessionRegistry, SettingsStore,
    Snapshot, SnapshotWriter, TargetProcess, dump_to_string, join_package_list, parse_package_list,
    snapshot_path,
};

const MAX_SNAPSHOT_NAME_ATTEMPTS: u32 = 1000;

/// Version the facade expects the agent to be a prefix of.
pub const MONITOR_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Collaborators a facade drives.
pub struct FacadeDeps {
    pub remote: Arc<dyn RemoteProfiler>,
    pub sampler: Arc<dyn SamplingProfiler>,
    pub detector: Arc<dyn AgentLoadDetector>,
    pub store: Arc<dyn FileStore>,
    pub sessions: Arc<SessionRegistry>,
}

#[derive(Debug, Clone)]
struct FacadeSettings {
    mode: ProfilerMode,
    sampling_period_ms: u32,
    /// Packages held locally; the agent owns the BCI set.
    profiled_packages: BTreeSet<String>,
}

impl FacadeSettings {
    fn load(store: &dyn SettingsStore) -> Self {
        let mode = match store.get(PROFILER_TYPE_KEY) {
            Some(raw) => raw.parse().unwrap_or_else(|err| {
                tracing::warn!("ignoring setting {PROFILER_TYPE_KEY}: {err}");
                ProfilerMode::default()
            }),
            None => ProfilerMode::default(),
        };
        let sampling_period_ms = match store.get(SAMPLING_PERIOD_KEY) {
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(ms) if ms > 0 => ms,
                _ => {
                    tracing::warn!("ignoring setting {SAMPLING_PERIOD_KEY}={raw:?}");
                    DEFAULT_SAMPLING_PERIOD_MS
                }
            },
            None => DEFAULT_SAMPLING_PERIOD_MS,
        };
        let profiled_packages = match store.get(PROFILED_PACKAGES_KEY) {
            Some(raw) => parse_package_list(&raw).unwrap_or_else(|err| {
                tracing::warn!("ignoring setting {PROFILED_PACKAGES_KEY}: {err}");
                BTreeSet::new()
            }),
            None => BTreeSet::new(),
        };
        Self {
            mode,
            sampling_period_ms,
            profiled_packages,
        }
    }
}

pub struct ProfilerFacade {
    target: TargetProcess,
    deps: FacadeDeps,
    snapshot_dir: PathBuf,
    own_version: String,
    settings: Mutex<FacadeSettings>,
    agent_version: OnceLock<String>,
    model: Mutex<CallTreeModel>,
    op: Mutex<()>,
    events: EventHub,
}

impl ProfilerFacade {
    /// Reads the initial mode, sampling period and package filters from
    /// `settings`; later changes to the store are not observed.
    pub fn new(
        target: TargetProcess,
        deps: FacadeDeps,
        snapshot_dir: impl Into<PathBuf>,
        settings: &dyn SettingsStore,
    ) -> Self {
        deps.sessions.attach(&target);
        Self {
            target,
            deps,
            snapshot_dir: snapshot_dir.into(),
            own_version: MONITOR_VERSION.to_string(),
            settings: Mutex::new(FacadeSettings::load(settings)),
            agent_version: OnceLock::new(),
            model: Mutex::new(CallTreeModel::new()),
            op: Mutex::new(()),
            events: EventHub::default(),
        }
    }

    pub fn with_monitor_version(mut self, version: impl Into<String>) -> Self {
        self.own_version = version.into();
        self
    }

    pub fn target(&self) -> &TargetProcess {
        &self.target
    }

    pub fn snapshot_dir(&self) -> &Path {
        &self.snapshot_dir
    }

    pub fn subscribe(&self) -> Receiver<ProfilerEvent> {
        self.events.subscribe()
    }

    /// Immutable copy of the current call tree.
    pub fn model(&self) -> CallTreeModel {
        self.lock_model().clone()
    }

    pub fn get_state(&self) -> ProfilerState {
        self.get_state_for(self.get_profiler_type())
    }

    pub fn get_state_for(&self, mode: ProfilerMode) -> ProfilerState {
        self.try_state_for(mode).unwrap_or_else(|err| {
            tracing::debug!(mode = mode.as_str(), "cpu profiler state query failed: {err}");
            ProfilerState::Unknown
        })
    }

    pub fn resume(&self) -> ProfilerResult<()> {
        let _op = self.lock_op();
        match self.get_profiler_type() {
            ProfilerMode::Bci => {
                self.validate_agent()?;
                self.deps.remote.set_running(true)?;
            }
            ProfilerMode::Sampling => self.deps.sampler.resume()?,
        }
        tracing::info!(process = %self.target.process_id(), "cpu profiler resumed");
        Ok(())
    }

    pub fn suspend(&self) -> ProfilerResult<()> {
        let _op = self.lock_op();
        match self.get_profiler_type() {
            ProfilerMode::Bci => {
                self.validate_agent()?;
                self.deps.remote.set_running(false)?;
            }
            ProfilerMode::Sampling => self.deps.sampler.suspend()?,
        }
        tracing::info!(process = %self.target.process_id(), "cpu profiler suspended");
        Ok(())
    }

    /// Clears the collector for the current mode. The local model is emptied
    /// and `ModelChanged` emitted even when the agent check or the collector
    /// call fails.
    pub fn clear(&self) -> ProfilerResult<()> {
        let _op = self.lock_op();
        let cleared = match self.get_profiler_type() {
            ProfilerMode::Bci => self
                .validate_agent()
                .and_then(|()| self.deps.remote.clear()),
            ProfilerMode::Sampling => self.deps.sampler.clear(),
        };
        self.lock_model().remove_all();
        self.events.emit(ProfilerEvent::ModelChanged);
        cleared
    }

    /// Persists the current model as a snapshot of this target's session.
    pub fn dump(&self) -> ProfilerResult<Snapshot> {
        let _op = self.lock_op();
        let envelope = self.target.envelope();
        let text = {
            let model = self.lock_model();
            dump_to_string(&model, Some(&envelope))?
        };

        let session = self.target.process_id();
        let (path, captured_at_ms) = self.write_snapshot(&session, text.as_bytes())?;

        let snapshot = Snapshot {
            id: uuid::Uuid::new_v4(),
            path,
            session,
            envelope,
            captured_at_ms,
        };
        self.deps.sessions.add_snapshot(snapshot.clone());
        tracing::info!(path = %snapshot.path.display(), "cpu snapshot written");
        self.events
            .emit(ProfilerEvent::SnapshotTaken(snapshot.clone()));
        Ok(snapshot)
    }

    /// Pulls the agent's dump into the local model. Returns `false` without
    /// touching anything unless BCI mode is active and the agent is running.
    pub fn refresh_bci_profile_cache(
        &self,
        cancel: &CancelToken,
        progress: &mut dyn ProgressMonitor,
    ) -> ProfilerResult<bool> {
        let _op = self.lock_op();
        if self.get_profiler_type() != ProfilerMode::Bci
            || self.get_state_for(ProfilerMode::Bci) != ProfilerState::Running
        {
            return Ok(false);
        }
        let text = self.deps.remote.dump()?;
        let parsed = DumpParser::new(cancel, progress)
            .parse(&text)
            .map_err(|err| {
                if !matches!(err.error, ProfilerError::Cancelled) {
                    tracing::error!("cannot parse cpu dump from agent: {err}");
                }
                ProfilerError::from(err)
            })?;
        self.lock_model().merge(&parsed);
        self.events.emit(ProfilerEvent::ModelChanged);
        Ok(true)
    }

    /// In BCI mode this is a silent no-op unless the agent is ready or
    /// running.
    pub fn set_profiled_packages(&self, packages: &BTreeSet<String>) -> ProfilerResult<()> {
        let _op = self.lock_op();
        let joined = join_package_list(packages);
        let packages = parse_package_list(&joined)?;
        match self.get_profiler_type() {
            ProfilerMode::Bci => {
                if !self.get_state_for(ProfilerMode::Bci).is_operational() {
                    tracing::debug!("agent not ready, profiled packages left unchanged");
                    return Ok(());
                }
                self.deps
                    .remote
                    .set_filter(PROFILED_PACKAGES_PROP_KEY, &joined)?;
            }
            ProfilerMode::Sampling => self.lock_settings().profiled_packages = packages,
        }
        self.events.emit(ProfilerEvent::ConfigChanged);
        Ok(())
    }

    /// In BCI mode the agent's list, with empty entries dropped; the local
    /// set when the agent is not ready.
    pub fn get_profiled_packages(&self) -> ProfilerResult<BTreeSet<String>> {
        if self.get_profiler_type() == ProfilerMode::Bci
            && self.get_state_for(ProfilerMode::Bci).is_operational()
        {
            let remote = self.deps.remote.profiled_packages()?;
            return Ok(remote.into_iter().filter(|p| !p.is_empty()).collect());
        }
        Ok(self.lock_settings().profiled_packages.clone())
    }

    /// Switching modes first suspends a running profiler in the old mode.
    /// The mode stays unchanged when the old profiler's state cannot be read
    /// or it refuses to stop.
    pub fn set_profiler_type(&self, mode: ProfilerMode) -> ProfilerResult<()> {
        let _op = self.lock_op();
        let current = self.get_profiler_type();
        if current == mode {
            return Ok(());
        }
        match self.try_state_for(current)? {
            ProfilerState::Running => {
                let suspended = match current {
                    ProfilerMode::Bci => self.deps.remote.set_running(false),
                    ProfilerMode::Sampling => self.deps.sampler.suspend(),
                };
                if let Err(err) = suspended {
                    tracing::warn!(mode = current.as_str(), "cannot suspend before mode switch: {err}");
                    return Err(err);
                }
            }
            ProfilerState::Unknown => {
                return Err(ProfilerError::RemoteUnreachable(format!(
                    "{} profiler state is unknown",
                    current.as_str()
                )));
            }
            _ => {}
        }
        self.lock_settings().mode = mode;
        tracing::info!(mode = mode.as_str(), "cpu profiler mode changed");
        self.events.emit(ProfilerEvent::ConfigChanged);
        Ok(())
    }

    pub fn get_profiler_type(&self) -> ProfilerMode {
        self.lock_settings().mode
    }

    pub fn set_sampling_period(&self, period_ms: u32) -> ProfilerResult<()> {
        if period_ms == 0 {
            return Err(ProfilerError::InvalidArgument(
                "sampling period must be a positive number of milliseconds".to_string(),
            ));
        }
        let _op = self.lock_op();
        self.lock_settings().sampling_period_ms = period_ms;
        if let Err(err) = self.deps.sampler.set_sampling_period(period_ms) {
            tracing::warn!("sampling period not pushed to collector: {err}");
        }
        self.events.emit(ProfilerEvent::ConfigChanged);
        Ok(())
    }

    pub fn get_sampling_period(&self) -> u32 {
        self.lock_settings().sampling_period_ms
    }

    /// Best-effort teardown: stops a running BCI profiler.
    pub fn dispose(&self) {
        let _op = self.lock_op();
        if self.get_profiler_type() == ProfilerMode::Bci
            && self.get_state_for(ProfilerMode::Bci) == ProfilerState::Running
        {
            if let Err(err) = self.deps.remote.set_running(false) {
                tracing::error!("cannot suspend cpu profiler on dispose: {err}");
            }
        }
    }

    fn try_state_for(&self, mode: ProfilerMode) -> ProfilerResult<ProfilerState> {
        if mode == ProfilerMode::Sampling {
            return self.deps.sampler.state();
        }
        if !self.agent_present() {
            return Ok(ProfilerState::AgentNotLoaded);
        }
        match self.agent_version()? {
            Some(found) if self.version_compatible(&found) => {}
            _ => return Ok(ProfilerState::InvalidVersion),
        }
        Ok(if self.deps.remote.is_running()? {
            ProfilerState::Running
        } else {
            ProfilerState::Ready
        })
    }

    fn agent_present(&self) -> bool {
        self.target.remote || self.deps.detector.is_agent_loaded()
    }

    /// Checks the agent before a BCI call. A missing local agent also drops
    /// the facade back to sampling mode.
    fn validate_agent(&self) -> ProfilerResult<()> {
        if !self.agent_present() {
            self.lock_settings().mode = ProfilerMode::Sampling;
            tracing::warn!(
                process = %self.target.process_id(),
                "profiler agent not loaded, falling back to sampling mode"
            );
            return Err(ProfilerError::AgentNotLoaded);
        }
        match self.agent_version()? {
            Some(found) if self.version_compatible(&found) => Ok(()),
            found => Err(ProfilerError::InvalidAgentVersion {
                expected: self.own_version.clone(),
                found: found.unwrap_or_default(),
            }),
        }
    }

    fn agent_version(&self) -> ProfilerResult<Option<String>> {
        if let Some(version) = self.agent_version.get() {
            return Ok(Some(version.clone()));
        }
        let version = self.deps.remote.version()?.filter(|v| !v.is_empty());
        if let Some(v) = &version {
            let _ = self.agent_version.set(v.clone());
        }
        Ok(version)
    }

    fn version_compatible(&self, agent: &str) -> bool {
        self.own_version.starts_with(agent)
    }

    /// Writes a new snapshot file named after the capture time. A name taken
    /// by an earlier snapshot moves the capture time forward by one
    /// millisecond.
    fn write_snapshot(&self, session: &str, bytes: &[u8]) -> ProfilerResult<(PathBuf, i64)> {
        let mut captured_at_ms = epoch_millis();
        let mut attempts = 0;
        let (path, writer) = loop {
            let path = snapshot_path(&self.snapshot_dir, session, captured_at_ms);
            match self.deps.store.create(&path) {
                Ok(writer) => break (path, writer),
                Err(err)
                    if err.kind() == io::ErrorKind::AlreadyExists
                        && attempts < MAX_SNAPSHOT_NAME_ATTEMPTS =>
                {
                    attempts += 1;
                    captured_at_ms += 1;
                }
                Err(source) => return Err(ProfilerError::IoFailure { path, source }),
            }
        };

        match fill(writer, bytes) {
            Ok(writer) => {
                if let Err(err) = writer.close() {
                    tracing::warn!(path = %path.display(), "cannot close snapshot file: {err}");
                }
                Ok((path, captured_at_ms))
            }
            Err(source) => {
                if let Err(err) = self.deps.store.delete(&path) {
                    tracing::warn!(path = %path.display(), "cannot remove partial snapshot: {err}");
                }
                Err(ProfilerError::IoFailure { path, source })
            }
        }
    }

    fn lock_op(&self) -> MutexGuard<'_, ()> {
        self.op.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_model(&self) -> MutexGuard<'_, CallTreeModel> {
        self.model.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_settings(&self) -> MutexGuard<'_, FacadeSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn fill(
    mut writer: Box<dyn SnapshotWriter>,
    bytes: &[u8],
) -> io::Result<Box<dyn SnapshotWriter>> {
    writer.write_all(bytes)?;
    writer.flush()?;
    Ok(writer)
}

fn epoch_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
