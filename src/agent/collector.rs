//! In-process profiling data collected by instrumented methods.

use time::OffsetDateTime;

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::{CallTreeModel, MethodId, NodeId, ProfilerError, ProfilerResult, dump_to_string};

#[derive(Debug, Clone, Copy)]
struct OpenFrame {
    node: NodeId,
    entered_at_ns: u64,
}

#[derive(Debug, Default)]
struct CollectorState {
    model: CallTreeModel,
    stacks: HashMap<String, Vec<OpenFrame>>,
}

/// Per-thread call trees built from method enter/exit events.
#[derive(Debug, Default)]
pub struct ProfileCollector {
    state: Mutex<CollectorState>,
}

impl ProfileCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method_enter(&self, thread: &str, method: &MethodId, now_ns: u64) {
        let mut state = self.lock();
        let state = &mut *state;
        let thread_idx = state.model.ensure_thread(thread);
        let stack = state.stacks.entry(thread.to_string()).or_default();
        let parent = stack.last().map(|f| f.node);
        let node = state.model.add_frame(thread_idx, parent, method, 1, 0);
        stack.push(OpenFrame {
            node,
            entered_at_ns: now_ns,
        });
    }

    pub fn method_exit(&self, thread: &str, now_ns: u64) {
        let mut state = self.lock();
        let state = &mut *state;
        let Some(frame) = state.stacks.get_mut(thread).and_then(Vec::pop) else {
            // Frames opened before the last clear.
            tracing::debug!(thread, "method exit without a matching enter");
            return;
        };
        let elapsed = now_ns.saturating_sub(frame.entered_at_ns);
        state.model.add_frame_value(frame.node, elapsed);
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.model.remove_all();
        state.stacks.clear();
    }

    pub fn total_invocations(&self) -> u64 {
        self.lock().model.total_invocations()
    }

    /// Copy of the collected tree with self and max values filled in.
    pub fn snapshot(&self) -> CallTreeModel {
        let mut model = self.lock().model.clone();
        model.recompute_self_values();
        model.refresh_max_values();
        model
    }

    pub fn dump(&self) -> ProfilerResult<String> {
        dump_to_string(&self.snapshot(), None)
    }

    /// Writes the current dump to `dir/cpu-<epoch_ms>.jsonl`.
    pub fn dump_to_file(&self, dir: &Path) -> ProfilerResult<PathBuf> {
        if dir.as_os_str().is_empty() {
            return Err(ProfilerError::Config("dump directory is not set".to_string()));
        }
        std::fs::create_dir_all(dir).map_err(|source| ProfilerError::IoFailure {
            path: dir.to_path_buf(),
            source,
        })?;
        let text = self.dump()?;
        let mut millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let (path, mut file) = loop {
            let path = dir.join(format!("cpu-{millis}.jsonl"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => break (path, file),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => millis += 1,
                Err(source) => return Err(ProfilerError::IoFailure { path, source }),
            }
        };
        file.write_all(text.as_bytes())
            .map_err(|source| ProfilerError::IoFailure {
                path: path.clone(),
                source,
            })?;
        tracing::info!(path = %path.display(), "cpu profile dumped");
        Ok(path)
    }

    fn lock(&self) -> MutexGuard<'_, CollectorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_dump;
    use uuid::Uuid;

    fn m(class: &str, method: &str) -> MethodId {
        MethodId::new(class, method, "()V")
    }

    fn record_workload(collector: &ProfileCollector) {
        collector.method_enter("main", &m("com.acme.App", "run"), 0);
        for i in 0..3u64 {
            let base = 10 + i * 20;
            collector.method_enter("main", &m("com.acme.Db", "load"), base);
            collector.method_enter("main", &m("com.acme.Io", "read"), base + 2);
            collector.method_exit("main", base + 12);
            collector.method_exit("main", base + 15);
        }
        collector.method_exit("main", 100);
        collector.method_enter("worker", &m("com.acme.Job", "exec"), 5);
        collector.method_exit("worker", 25);
    }

    #[test]
    fn enter_exit_builds_call_tree() {
        let collector = ProfileCollector::new();
        record_workload(&collector);
        let model = collector.snapshot();
        assert_eq!(model.threads().len(), 2);
        assert_eq!(collector.total_invocations(), 8);

        let run = model.threads()[0].roots()[0];
        assert_eq!(model.node(run).cumulative_value, 100);
        let load = model.node(run).children()[0];
        assert_eq!(model.node(load).invocation_count, 3);
        assert_eq!(model.node(load).cumulative_value, 45);
        assert_eq!(model.node(load).self_value, 15);
        assert_eq!(model.node(run).self_value, 55);
    }

    #[test]
    fn dump_round_trips_total_invocations() {
        let collector = ProfileCollector::new();
        record_workload(&collector);
        let before = collector.total_invocations();
        let parsed = parse_dump(&collector.dump().expect("dump")).expect("parse");
        assert_eq!(parsed.total_invocations(), before);
        assert_eq!(parsed.grand_total(), collector.snapshot().grand_total());
    }

    #[test]
    fn clear_drops_data_and_open_frames() {
        let collector = ProfileCollector::new();
        collector.method_enter("main", &m("A", "a"), 0);
        collector.clear();
        collector.method_exit("main", 10);
        assert_eq!(collector.total_invocations(), 0);
        assert!(collector.snapshot().is_empty());
    }

    #[test]
    fn dump_to_file_writes_parsable_dump() {
        let collector = ProfileCollector::new();
        record_workload(&collector);
        let dir = std::env::temp_dir().join(format!("jprof-agent-dump-{}", Uuid::new_v4()));
        let path = collector.dump_to_file(&dir).expect("dump to file");
        let text = std::fs::read_to_string(&path).expect("read dump");
        assert_eq!(parse_dump(&text).expect("parse").total_invocations(), 8);
    }

    #[test]
    fn repeated_dumps_to_file_get_distinct_names() {
        let collector = ProfileCollector::new();
        record_workload(&collector);
        let dir = std::env::temp_dir().join(format!("jprof-agent-dump-{}", Uuid::new_v4()));
        let first = collector.dump_to_file(&dir).expect("first dump");
        collector.clear();
        let second = collector.dump_to_file(&dir).expect("second dump");
        assert_ne!(first, second);
        let text = std::fs::read_to_string(&first).expect("read first dump");
        assert_eq!(parse_dump(&text).expect("parse").total_invocations(), 8);
    }
}
