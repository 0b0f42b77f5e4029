//! Installs and removes the profiling transformer and re-instruments loaded
//! classes when the package filters change.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::{
    ClassTransformer, FilteringTransformer, InstrumentationPort, LoadedClass, PackageFilterSet,
    ProfilerError, ProfilerResult, matches,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentationPhase {
    NotInstalled,
    /// Transformer registered, retransform batch not yet completed.
    InstalledIdle,
    InstalledActive,
}

#[derive(Debug, Clone)]
pub struct InstrumentationState {
    pub transformer_installed: bool,
    pub needs_retransform: bool,
    /// Profiled set in effect at the last completed retransform batch.
    pub previous_profiled_packages: BTreeSet<String>,
}

impl Default for InstrumentationState {
    fn default() -> Self {
        Self {
            transformer_installed: false,
            needs_retransform: true,
            previous_profiled_packages: BTreeSet::new(),
        }
    }
}

impl InstrumentationState {
    pub fn phase(&self) -> InstrumentationPhase {
        match (self.transformer_installed, self.needs_retransform) {
            (false, _) => InstrumentationPhase::NotInstalled,
            (true, true) => InstrumentationPhase::InstalledIdle,
            (true, false) => InstrumentationPhase::InstalledActive,
        }
    }
}

/// Outcome of one retransform batch.
#[derive(Debug, Default)]
pub struct RetransformReport {
    pub retransformed: Vec<String>,
    /// Per-class failures; never abort the batch.
    pub rejected: Vec<ProfilerError>,
}

impl RetransformReport {
    pub fn is_noop(&self) -> bool {
        self.retransformed.is_empty() && self.rejected.is_empty()
    }
}

pub struct InstrumentationController {
    port: Arc<dyn InstrumentationPort>,
    transformer: Arc<FilteringTransformer>,
    filters: Arc<RwLock<PackageFilterSet>>,
    state: Mutex<InstrumentationState>,
}

impl InstrumentationController {
    pub fn new(port: Arc<dyn InstrumentationPort>, rewriter: Arc<dyn ClassTransformer>) -> Self {
        let filters = Arc::new(RwLock::new(PackageFilterSet::default()));
        Self {
            port,
            transformer: Arc::new(FilteringTransformer::new(filters.clone(), rewriter)),
            filters,
            state: Mutex::new(InstrumentationState::default()),
        }
    }

    pub fn state(&self) -> InstrumentationState {
        self.lock_state().clone()
    }

    pub fn phase(&self) -> InstrumentationPhase {
        self.lock_state().phase()
    }

    pub fn is_active(&self) -> bool {
        self.phase() == InstrumentationPhase::InstalledActive
    }

    /// Filters the installed transformer currently applies.
    pub fn filters(&self) -> PackageFilterSet {
        self.filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Installs the transformer if needed and retransforms every loaded class
    /// covered by the new or the previous profiled packages.
    ///
    /// Calling this again while active with an unchanged profiled set does
    /// not touch the host.
    pub fn enable(&self, filters: &PackageFilterSet) -> ProfilerResult<RetransformReport> {
        let mut state = self.lock_state();
        if state.phase() == InstrumentationPhase::InstalledActive
            && state.previous_profiled_packages == filters.profiled
        {
            self.publish_filters(filters);
            return Ok(RetransformReport::default());
        }
        self.enable_locked(&mut state, filters)
    }

    pub fn disable(&self) -> ProfilerResult<()> {
        let mut state = self.lock_state();
        if !state.transformer_installed {
            return Ok(());
        }
        self.port.remove_transformer()?;
        state.transformer_installed = false;
        state.needs_retransform = true;
        tracing::info!("profiling transformer removed");
        Ok(())
    }

    /// Applies new filters. While active, a changed profiled set is
    /// retransformed immediately; otherwise the change waits for `enable`.
    pub fn set_filter(&self, filters: &PackageFilterSet) -> ProfilerResult<Option<RetransformReport>> {
        let mut state = self.lock_state();
        if state.transformer_installed && state.previous_profiled_packages != filters.profiled {
            return self.enable_locked(&mut state, filters).map(Some);
        }
        self.publish_filters(filters);
        state.needs_retransform = true;
        Ok(None)
    }

    fn enable_locked(
        &self,
        state: &mut InstrumentationState,
        filters: &PackageFilterSet,
    ) -> ProfilerResult<RetransformReport> {
        if !state.transformer_installed {
            let transformer: Arc<dyn ClassTransformer> = self.transformer.clone();
            self.port.add_transformer(transformer)?;
            state.transformer_installed = true;
            tracing::info!("profiling transformer installed");
        }
        self.publish_filters(filters);

        let loaded = self.port.loaded_classes();
        let mut report = RetransformReport::default();
        for class in retransform_candidates(filters, &state.previous_profiled_packages, &loaded) {
            match self.port.retransform(class) {
                Ok(()) => {
                    tracing::info!(class = %class.name, "retransformed class");
                    report.retransformed.push(class.name.clone());
                }
                Err(err) => {
                    tracing::error!(class = %class.name, "cannot retransform class: {err}");
                    report.rejected.push(match err {
                        rejected @ ProfilerError::RetransformRejected { .. } => rejected,
                        other => ProfilerError::RetransformRejected {
                            class: class.name.clone(),
                            reason: other.to_string(),
                        },
                    });
                }
            }
        }

        state.previous_profiled_packages = filters.profiled.clone();
        state.needs_retransform = false;
        Ok(report)
    }

    fn publish_filters(&self, filters: &PackageFilterSet) {
        *self.filters.write().unwrap_or_else(PoisonError::into_inner) = filters.clone();
    }

    fn lock_state(&self) -> MutexGuard<'_, InstrumentationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Loaded classes that must be re-visited: not array types, in the union of
/// the current and previous profiled packages, and not ignored.
pub fn retransform_candidates<'a>(
    filters: &PackageFilterSet,
    previous_profiled: &BTreeSet<String>,
    loaded: &'a [LoadedClass],
) -> Vec<&'a LoadedClass> {
    let targets: BTreeSet<&String> = filters.profiled.iter().chain(previous_profiled).collect();
    loaded
        .iter()
        .filter(|class| !class.is_array())
        .filter(|class| matches(&class.name, targets.iter().copied()))
        .filter(|class| !matches(&class.name, &filters.ignored))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::fake::{Passthrough, RecordingPort};

    fn controller(port: Arc<RecordingPort>) -> InstrumentationController {
        InstrumentationController::new(port, Arc::new(Passthrough))
    }

    #[test]
    fn candidates_skip_arrays_and_foreign_packages() {
        let loaded = vec![
            LoadedClass::new("com.acme.Foo"),
            LoadedClass::new("org.other.Bar"),
            LoadedClass::new("[Lcom.acme.Foo;"),
        ];
        let filters = PackageFilterSet::profiling(["com.acme.*"]);
        let names: Vec<&str> = retransform_candidates(&filters, &BTreeSet::new(), &loaded)
            .into_iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["com.acme.Foo"]);
    }

    #[test]
    fn candidates_union_previous_packages_and_drop_ignored() {
        let loaded = vec![
            LoadedClass::new("com.acme.Foo"),
            LoadedClass::new("com.acme.gen.Stub"),
            LoadedClass::new("org.old.Legacy"),
        ];
        let mut filters = PackageFilterSet::profiling(["com.acme.*"]);
        filters.ignored.insert("com.acme.gen".to_string());
        let previous: BTreeSet<String> = ["org.old".to_string()].into();
        let names: Vec<&str> = retransform_candidates(&filters, &previous, &loaded)
            .into_iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["com.acme.Foo", "org.old.Legacy"]);
    }

    #[test]
    fn second_enable_with_same_filters_is_a_noop() {
        let port = Arc::new(RecordingPort::with_classes(&["com.acme.Foo", "com.acme.Bar"]));
        let ctl = controller(port.clone());
        let filters = PackageFilterSet::profiling(["com.acme.*"]);

        let first = ctl.enable(&filters).expect("enable");
        assert_eq!(first.retransformed.len(), 2);
        assert_eq!(port.take_retransformed().len(), 2);
        assert_eq!(ctl.phase(), InstrumentationPhase::InstalledActive);

        let second = ctl.enable(&filters).expect("enable again");
        assert!(second.is_noop());
        assert!(port.take_retransformed().is_empty());
        assert_eq!(*port.adds.lock().expect("lock"), 1);
    }

    #[test]
    fn rejected_class_does_not_abort_batch() {
        let mut port = RecordingPort::with_classes(&["com.acme.A", "com.acme.Locked", "com.acme.B"]);
        port.unmodifiable.insert("com.acme.Locked".to_string());
        let port = Arc::new(port);
        let ctl = controller(port.clone());

        let report = ctl
            .enable(&PackageFilterSet::profiling(["com.acme.*"]))
            .expect("enable");
        assert_eq!(report.retransformed, vec!["com.acme.A", "com.acme.B"]);
        assert_eq!(report.rejected.len(), 1);
        assert!(matches!(
            &report.rejected[0],
            ProfilerError::RetransformRejected { class, .. } if class == "com.acme.Locked"
        ));
        assert!(!ctl.state().needs_retransform);
    }

    #[test]
    fn filter_change_while_active_retransforms_old_and_new_packages() {
        let port = Arc::new(RecordingPort::with_classes(&["com.acme.Foo", "org.demo.Bar"]));
        let ctl = controller(port.clone());
        ctl.enable(&PackageFilterSet::profiling(["com.acme.*"]))
            .expect("enable");
        port.take_retransformed();

        let report = ctl
            .set_filter(&PackageFilterSet::profiling(["org.demo"]))
            .expect("set filter")
            .expect("retransformed immediately");
        assert_eq!(report.retransformed, vec!["com.acme.Foo", "org.demo.Bar"]);
        let state = ctl.state();
        let expected: BTreeSet<String> = ["org.demo".to_string()].into();
        assert_eq!(state.previous_profiled_packages, expected);
    }

    #[test]
    fn filter_change_while_disabled_waits_for_enable() {
        let port = Arc::new(RecordingPort::with_classes(&["com.acme.Foo"]));
        let ctl = controller(port.clone());
        ctl.enable(&PackageFilterSet::profiling(["com.acme.*"]))
            .expect("enable");
        ctl.disable().expect("disable");
        assert!(!*port.installed.lock().expect("lock"));
        port.take_retransformed();

        let report = ctl
            .set_filter(&PackageFilterSet::profiling(["org.demo"]))
            .expect("set filter");
        assert!(report.is_none());
        assert!(port.take_retransformed().is_empty());
        let state = ctl.state();
        assert!(state.needs_retransform);
        let expected: BTreeSet<String> = ["com.acme.*".to_string()].into();
        assert_eq!(state.previous_profiled_packages, expected);

        let report = ctl
            .enable(&PackageFilterSet::profiling(["org.demo"]))
            .expect("enable");
        assert_eq!(report.retransformed, vec!["com.acme.Foo"]);
        assert_eq!(*port.adds.lock().expect("lock"), 2);
    }

    #[test]
    fn refused_install_leaves_filters_and_state_untouched() {
        let port = Arc::new(RecordingPort {
            refuse_install: true,
            ..RecordingPort::with_classes(&["com.acme.Foo"])
        });
        let ctl = controller(port.clone());

        let err = ctl
            .enable(&PackageFilterSet::profiling(["com.acme.*"]))
            .expect_err("install refused");
        assert!(matches!(err, ProfilerError::InvalidArgument(_)));
        assert_eq!(ctl.filters(), PackageFilterSet::default());
        assert_eq!(ctl.phase(), InstrumentationPhase::NotInstalled);
        assert!(ctl.state().previous_profiled_packages.is_empty());
        assert!(port.take_retransformed().is_empty());
    }
}
