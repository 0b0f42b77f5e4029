//! Streaming parser from dump text into a [`CallTreeModel`].

use thiserror::Error;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{
    CallTreeModel, DUMP_FORMAT, DUMP_VERSION, DumpRecord, MethodId, NodeId, ProfilerError,
};

/// Cooperative cancellation flag shared between a caller and a long parse.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

pub trait ProgressMonitor {
    fn begin(&mut self, _total_bytes: usize) {}
    fn worked(&mut self, _consumed_bytes: usize) {}
    fn done(&mut self) {}
}

#[derive(Debug, Default)]
pub struct NoProgress;

impl ProgressMonitor for NoProgress {}

/// A failed parse, with the tree built from every complete record before the
/// failure. `partial` is `None` when the parse was cancelled.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct DumpParseError {
    pub error: ProfilerError,
    pub partial: Option<CallTreeModel>,
}

impl From<DumpParseError> for ProfilerError {
    fn from(value: DumpParseError) -> Self {
        value.error
    }
}

pub struct DumpParser<'a> {
    cancel: &'a CancelToken,
    progress: &'a mut dyn ProgressMonitor,
}

struct Cursor {
    offset: usize,
    line: usize,
}

impl<'a> DumpParser<'a> {
    pub fn new(cancel: &'a CancelToken, progress: &'a mut dyn ProgressMonitor) -> Self {
        Self { cancel, progress }
    }

    pub fn parse(&mut self, text: &str) -> Result<CallTreeModel, DumpParseError> {
        let mut model = CallTreeModel::new();
        self.progress.begin(text.len());
        let result = self.parse_into(text, &mut model);
        self.progress.done();
        model.recompute_self_values();
        model.refresh_max_values();
        match result {
            Ok(()) => Ok(model),
            Err(ProfilerError::Cancelled) => {
                tracing::debug!("cpu dump parse cancelled");
                Err(DumpParseError {
                    error: ProfilerError::Cancelled,
                    partial: None,
                })
            }
            Err(error) => {
                tracing::warn!("cpu dump parse stopped: {error}");
                Err(DumpParseError {
                    error,
                    partial: Some(model),
                })
            }
        }
    }

    fn parse_into(&mut self, text: &str, model: &mut CallTreeModel) -> Result<(), ProfilerError> {
        let mut cursor = Cursor { offset: 0, line: 0 };
        let mut seen_header = false;
        let mut finished = false;
        let mut thread: Option<usize> = None;
        let mut stack: Vec<NodeId> = Vec::new();
        let mut threads_seen = 0usize;
        let mut frames_seen = 0usize;

        for raw in text.split_inclusive('\n') {
            cursor.line += 1;
            let start = cursor.offset;
            cursor.offset += raw.len();
            let body = raw.trim();
            if body.is_empty() {
                continue;
            }
            if finished {
                return Err(malformed(start, cursor.line, "data after end record"));
            }
            let record: DumpRecord = serde_json::from_str(body).map_err(|e| {
                let reason = if e.is_eof() {
                    format!("truncated record: {e}")
                } else {
                    format!("invalid record: {e}")
                };
                malformed(start, cursor.line, reason)
            })?;

            if !seen_header && !matches!(record, DumpRecord::Header { .. }) {
                return Err(malformed(start, cursor.line, "dump does not start with a header"));
            }

            match record {
                DumpRecord::Header {
                    format,
                    version,
                    envelope,
                } => {
                    if seen_header {
                        return Err(malformed(start, cursor.line, "duplicate header"));
                    }
                    if format != DUMP_FORMAT || version != DUMP_VERSION {
                        return Err(malformed(
                            start,
                            cursor.line,
                            format!("unsupported dump {format} v{version}"),
                        ));
                    }
                    model.envelope = envelope;
                    seen_header = true;
                }
                DumpRecord::Thread { name } => {
                    if self.cancel.is_cancelled() {
                        return Err(ProfilerError::Cancelled);
                    }
                    self.progress.worked(start);
                    thread = Some(model.ensure_thread(&name));
                    stack.clear();
                    threads_seen += 1;
                }
                DumpRecord::Frame {
                    depth,
                    class_name,
                    method_name,
                    signature,
                    count,
                    time,
                } => {
                    let Some(thread) = thread else {
                        return Err(malformed(start, cursor.line, "frame outside of a thread"));
                    };
                    if depth > stack.len() {
                        return Err(malformed(
                            start,
                            cursor.line,
                            format!("frame depth {depth} skips a level (parent depth {})", stack.len()),
                        ));
                    }
                    stack.truncate(depth);
                    let method = MethodId::new(class_name, method_name, signature);
                    let id = model.add_frame(thread, stack.last().copied(), &method, count, time);
                    stack.push(id);
                    frames_seen += 1;
                }
                DumpRecord::End { threads, frames } => {
                    if threads != threads_seen || frames != frames_seen {
                        return Err(malformed(
                            start,
                            cursor.line,
                            format!(
                                "end record expects {threads} threads/{frames} frames, read {threads_seen}/{frames_seen}"
                            ),
                        ));
                    }
                    finished = true;
                }
            }
        }

        if self.cancel.is_cancelled() {
            return Err(ProfilerError::Cancelled);
        }
        self.progress.worked(text.len());
        if !finished {
            return Err(malformed(
                cursor.offset,
                cursor.line,
                "dump ended before the end record",
            ));
        }
        Ok(())
    }
}

/// Parses without cancellation or progress reporting.
pub fn parse_dump(text: &str) -> Result<CallTreeModel, DumpParseError> {
    let cancel = CancelToken::new();
    let mut progress = NoProgress;
    DumpParser::new(&cancel, &mut progress).parse(text)
}

fn malformed(offset: usize, line: usize, reason: impl Into<String>) -> ProfilerError {
    ProfilerError::MalformedDump {
        offset,
        line,
        reason: reason.into(),
    }
}
