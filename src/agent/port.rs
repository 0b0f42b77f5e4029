//! Capability interface over the host's instrumentation facility.

use std::sync::{Arc, PoisonError, RwLock};

use crate::{ARRAY_TYPE_MARKER, PackageFilterSet, ProfilerResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedClass {
    /// Binary class name as reported by the host (`com.acme.Foo`, `[I`).
    pub name: String,
    /// Name of the defining class loader; `None` for the bootstrap loader.
    pub class_loader: Option<String>,
}

impl LoadedClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class_loader: None,
        }
    }

    pub fn with_loader(mut self, loader: impl Into<String>) -> Self {
        self.class_loader = Some(loader.into());
        self
    }

    pub fn is_array(&self) -> bool {
        self.name.starts_with(ARRAY_TYPE_MARKER)
    }
}

/// Rewrites class bytes. Returning `None` leaves the class untouched.
pub trait ClassTransformer: Send + Sync {
    fn transform(&self, class: &LoadedClass, bytes: &[u8]) -> Option<Vec<u8>>;
}

pub trait InstrumentationPort: Send + Sync {
    fn loaded_classes(&self) -> Vec<LoadedClass>;
    fn add_transformer(&self, transformer: Arc<dyn ClassTransformer>) -> ProfilerResult<()>;
    fn remove_transformer(&self) -> ProfilerResult<()>;
    fn retransform(&self, class: &LoadedClass) -> ProfilerResult<()>;
}

/// Gates a host-supplied rewriter with the current package filters and
/// class-loader scope, so classes loaded later are treated like the ones
/// picked for retransformation.
pub struct FilteringTransformer {
    filters: Arc<RwLock<PackageFilterSet>>,
    rewriter: Arc<dyn ClassTransformer>,
}

impl FilteringTransformer {
    pub fn new(filters: Arc<RwLock<PackageFilterSet>>, rewriter: Arc<dyn ClassTransformer>) -> Self {
        Self { filters, rewriter }
    }

    pub fn should_instrument(&self, class: &LoadedClass) -> bool {
        if class.is_array() {
            return false;
        }
        let filters = self.filters.read().unwrap_or_else(PoisonError::into_inner);
        if !filters.includes(&class.name) {
            return false;
        }
        filters.profiled_classloaders.is_empty()
            || class
                .class_loader
                .as_ref()
                .is_some_and(|loader| filters.profiled_classloaders.contains(loader))
    }
}

impl ClassTransformer for FilteringTransformer {
    fn transform(&self, class: &LoadedClass, bytes: &[u8]) -> Option<Vec<u8>> {
        if !self.should_instrument(class) {
            return None;
        }
        tracing::debug!(class = %class.name, "instrumenting class");
        self.rewriter.transform(class, bytes)
    }
}


#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::ProfilerError;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    /// In-memory host that records every instrumentation request.
    #[derive(Default)]
    pub(crate) struct RecordingPort {
        pub(crate) classes: Vec<LoadedClass>,
        pub(crate) unmodifiable: BTreeSet<String>,
        /// Makes `add_transformer` fail.
        pub(crate) refuse_install: bool,
        pub(crate) installed: Mutex<bool>,
        pub(crate) adds: Mutex<usize>,
        pub(crate) retransformed: Mutex<Vec<String>>,
    }

    impl RecordingPort {
        pub(crate) fn with_classes(names: &[&str]) -> Self {
            Self {
                classes: names.iter().map(|n| LoadedClass::new(*n)).collect(),
                ..Self::default()
            }
        }

        pub(crate) fn take_retransformed(&self) -> Vec<String> {
            std::mem::take(&mut *self.retransformed.lock().expect("lock"))
        }
    }

    impl InstrumentationPort for RecordingPort {
        fn loaded_classes(&self) -> Vec<LoadedClass> {
            self.classes.clone()
        }

        fn add_transformer(&self, _transformer: Arc<dyn ClassTransformer>) -> ProfilerResult<()> {
            if self.refuse_install {
                return Err(ProfilerError::InvalidArgument(
                    "host refused the transformer".to_string(),
                ));
            }
            *self.installed.lock().expect("lock") = true;
            *self.adds.lock().expect("lock") += 1;
            Ok(())
        }

        fn remove_transformer(&self) -> ProfilerResult<()> {
            *self.installed.lock().expect("lock") = false;
            Ok(())
        }

        fn retransform(&self, class: &LoadedClass) -> ProfilerResult<()> {
            if self.unmodifiable.contains(&class.name) {
                return Err(ProfilerError::RetransformRejected {
                    class: class.name.clone(),
                    reason: "unmodifiable class".to_string(),
                });
            }
            self.retransformed
                .lock()
                .expect("lock")
                .push(class.name.clone());
            Ok(())
        }
    }

    /// Rewriter that leaves every class as-is.
    pub(crate) struct Passthrough;

    impl ClassTransformer for Passthrough {
        fn transform(&self, _class: &LoadedClass, bytes: &[u8]) -> Option<Vec<u8>> {
            Some(bytes.to_vec())
        }
    }
}
