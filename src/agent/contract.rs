//! Remotely invokable profiler surface of the agent.
//!
//! Nothing here may fail across the remote boundary: each operation runs
//! its body as a `ProfilerResult`, logs a failure and answers with a safe
//! default instead.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    AgentConfigHandle, ClassTransformer, InstrumentationController, InstrumentationPort,
    ProfileCollector, ProfilerResult, parse_package_list,
};

/// The only filter key `set_filter` understands.
pub const PROFILED_PACKAGES_PROP_KEY: &str = "jvmmonitor.profiled.packages";

/// Build version reported to monitors for compatibility checks.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct ProfilerRemoteContract {
    controller: InstrumentationController,
    collector: Arc<ProfileCollector>,
    config: AgentConfigHandle,
    version: String,
    /// Serializes config changes together with the controller update they
    /// drive.
    update: Mutex<()>,
}

impl ProfilerRemoteContract {
    /// Starts profiling right away when the config says it was enabled.
    pub fn new(
        port: Arc<dyn InstrumentationPort>,
        rewriter: Arc<dyn ClassTransformer>,
        collector: Arc<ProfileCollector>,
        config: AgentConfigHandle,
    ) -> Self {
        let contract = Self {
            controller: InstrumentationController::new(port, rewriter),
            collector,
            config,
            version: AGENT_VERSION.to_string(),
            update: Mutex::new(()),
        };
        if contract.config.read().profiler_enabled {
            contract.set_running(true);
        }
        contract
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn collector(&self) -> &Arc<ProfileCollector> {
        &self.collector
    }

    pub fn controller(&self) -> &InstrumentationController {
        &self.controller
    }

    pub fn set_running(&self, running: bool) {
        let op = if running { "resume" } else { "suspend" };
        swallow(op, self.try_set_running(running), ());
    }

    pub fn is_running(&self) -> bool {
        self.config.read().profiler_enabled
    }

    pub fn clear(&self) {
        self.collector.clear();
    }

    pub fn dump(&self) -> String {
        swallow("dump", self.collector.dump(), String::new())
    }

    pub fn dump_to_file(&self) {
        let dir = self.config.read().dump_dir.clone();
        swallow("dump to file", self.collector.dump_to_file(&dir).map(drop), ());
    }

    pub fn get_dump_dir(&self) -> PathBuf {
        self.config.read().dump_dir.clone()
    }

    pub fn set_dump_dir(&self, dir: PathBuf) {
        self.config.write().dump_dir = dir;
    }

    pub fn get_version(&self) -> String {
        self.version.clone()
    }

    pub fn set_filter(&self, key: &str, value: &str) {
        if key != PROFILED_PACKAGES_PROP_KEY {
            tracing::warn!(key, "ignoring unknown profiler filter key");
            return;
        }
        swallow("set filter", self.try_set_profiled_packages(value), ());
    }

    pub fn get_profiled_packages(&self) -> Vec<String> {
        self.config.read().profiled_packages.iter().cloned().collect()
    }

    pub fn get_ignored_packages(&self) -> Vec<String> {
        self.config.read().ignored_packages.iter().cloned().collect()
    }

    pub fn get_profiled_classloaders(&self) -> Vec<String> {
        self.config.read().profiled_classloaders.iter().cloned().collect()
    }

    fn try_set_running(&self, running: bool) -> ProfilerResult<()> {
        let _update = self.lock_update();
        if running {
            let filters = self.config.read().filters();
            let report = self.controller.enable(&filters)?;
            if !report.rejected.is_empty() {
                tracing::warn!(
                    rejected = report.rejected.len(),
                    "some classes could not be retransformed"
                );
            }
            self.config.write().profiler_enabled = true;
        } else {
            self.controller.disable()?;
            self.config.write().profiler_enabled = false;
        }
        Ok(())
    }

    /// The config keeps the old packages when the controller refuses the
    /// new filters.
    fn try_set_profiled_packages(&self, value: &str) -> ProfilerResult<()> {
        let packages = parse_package_list(value)?;
        let _update = self.lock_update();
        let mut filters = self.config.read().filters();
        filters.profiled = packages.clone();
        self.controller.set_filter(&filters)?;
        self.config.write().profiled_packages = packages;
        Ok(())
    }

    fn lock_update(&self) -> MutexGuard<'_, ()> {
        self.update.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn swallow<T>(op: &str, result: ProfilerResult<T>, fallback: T) -> T {
    match result {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(op, "cpu profiler operation failed: {err}");
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AgentConfig;
    use crate::agent::fake::{Passthrough, RecordingPort};
    use crate::{MethodId, parse_dump};
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn contract_with(port: Arc<RecordingPort>, config: AgentConfig) -> ProfilerRemoteContract {
        ProfilerRemoteContract::new(
            port,
            Arc::new(Passthrough),
            Arc::new(ProfileCollector::new()),
            AgentConfigHandle::new(config),
        )
    }

    fn acme_config() -> AgentConfig {
        AgentConfig {
            profiled_packages: ["com.acme.*".to_string()].into(),
            ..AgentConfig::default()
        }
    }

    #[test]
    fn set_running_toggles_transformer_and_flag() {
        let port = Arc::new(RecordingPort::with_classes(&["com.acme.Foo"]));
        let contract = contract_with(port.clone(), acme_config());
        assert!(!contract.is_running());

        contract.set_running(true);
        assert!(contract.is_running());
        assert!(*port.installed.lock().expect("lock"));
        assert_eq!(port.take_retransformed(), vec!["com.acme.Foo"]);

        contract.set_running(false);
        assert!(!contract.is_running());
        assert!(!*port.installed.lock().expect("lock"));
    }

    #[test]
    fn enabled_config_starts_running_on_attach() {
        let port = Arc::new(RecordingPort::with_classes(&["com.acme.Foo"]));
        let config = AgentConfig {
            profiler_enabled: true,
            ..acme_config()
        };
        let contract = contract_with(port.clone(), config);
        assert!(contract.is_running());
        assert!(contract.controller().is_active());
    }

    #[test]
    fn set_filter_ignores_unknown_keys_and_bad_syntax() {
        let port = Arc::new(RecordingPort::with_classes(&["com.acme.Foo"]));
        let contract = contract_with(port, acme_config());

        contract.set_filter("jvmmonitor.ignored.packages", "org.*");
        assert_eq!(contract.get_profiled_packages(), vec!["com.acme.*"]);

        contract.set_filter(PROFILED_PACKAGES_PROP_KEY, "com.*.bad");
        assert_eq!(contract.get_profiled_packages(), vec!["com.acme.*"]);

        contract.set_filter(PROFILED_PACKAGES_PROP_KEY, "org.demo, com.acme.*");
        assert_eq!(contract.get_profiled_packages(), vec!["com.acme.*", "org.demo"]);
    }

    #[test]
    fn set_filter_while_running_retransforms_immediately() {
        let port = Arc::new(RecordingPort::with_classes(&["com.acme.Foo", "org.demo.Bar"]));
        let contract = contract_with(port.clone(), acme_config());
        contract.set_running(true);
        port.take_retransformed();

        contract.set_filter(PROFILED_PACKAGES_PROP_KEY, "org.demo");
        assert_eq!(port.take_retransformed(), vec!["com.acme.Foo", "org.demo.Bar"]);
    }

    #[test]
    fn dump_and_clear_go_through_the_collector() {
        let port = Arc::new(RecordingPort::default());
        let contract = contract_with(port, acme_config());
        let collector = contract.collector().clone();
        collector.method_enter("main", &MethodId::new("com.acme.App", "run", "()V"), 0);
        collector.method_exit("main", 40);

        let parsed = parse_dump(&contract.dump()).expect("parse");
        assert_eq!(parsed.total_invocations(), 1);

        contract.clear();
        let parsed = parse_dump(&contract.dump()).expect("parse");
        assert!(parsed.is_empty());
    }

    #[test]
    fn dump_to_file_failure_is_swallowed() {
        let port = Arc::new(RecordingPort::default());
        let contract = contract_with(port, acme_config());
        contract.dump_to_file();

        let dir = std::env::temp_dir().join(format!("jprof-contract-{}", Uuid::new_v4()));
        contract.set_dump_dir(dir.clone());
        assert_eq!(contract.get_dump_dir(), dir);
        contract.dump_to_file();
        let written = std::fs::read_dir(&dir).expect("dump dir").count();
        assert_eq!(written, 1);
    }

    #[test]
    fn version_and_filter_getters_report_config() {
        let port = Arc::new(RecordingPort::default());
        let config = AgentConfig {
            ignored_packages: ["com.acme.gen".to_string()].into(),
            profiled_classloaders: ["app".to_string()].into(),
            ..acme_config()
        };
        let contract = contract_with(port, config).with_version("0.1");
        assert_eq!(contract.get_version(), "0.1");
        assert_eq!(contract.get_ignored_packages(), vec!["com.acme.gen"]);
        assert_eq!(contract.get_profiled_classloaders(), vec!["app"]);
    }

    #[test]
    fn concurrent_filter_changes_leave_config_and_controller_in_step() {
        let port = Arc::new(RecordingPort::with_classes(&["com.acme.Foo", "org.demo.Bar"]));
        let contract = contract_with(port, acme_config());
        contract.set_running(true);

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let contract = &contract;
                scope.spawn(move || {
                    for round in 0..25 {
                        let value = format!("pkg{worker}.r{round}, com.acme.*");
                        contract.set_filter(PROFILED_PACKAGES_PROP_KEY, &value);
                        if round % 5 == 0 {
                            contract.set_running(true);
                        }
                    }
                });
            }
        });

        let reported: BTreeSet<String> = contract.get_profiled_packages().into_iter().collect();
        let controller = contract.controller();
        assert_eq!(controller.filters().profiled, reported);
        assert_eq!(controller.state().previous_profiled_packages, reported);
        assert!(controller.is_active());
    }

    #[test]
    fn filter_set_while_stopped_applies_on_next_start() {
        let port = Arc::new(RecordingPort::with_classes(&["com.acme.Foo", "org.demo.Bar"]));
        let contract = contract_with(port.clone(), acme_config());

        contract.set_filter(PROFILED_PACKAGES_PROP_KEY, "org.demo");
        assert!(port.take_retransformed().is_empty());

        contract.set_running(true);
        assert_eq!(port.take_retransformed(), vec!["org.demo.Bar"]);
        let expected: BTreeSet<String> = ["org.demo".to_string()].into();
        assert_eq!(contract.controller().filters().profiled, expected);
        assert_eq!(contract.controller().state().previous_profiled_packages, expected);
    }
}
