//! Offline CPU profile commands (`jprof hotspots ...`).

use clap::Subcommand;
use serde::Serialize;

use std::path::{Path, PathBuf};

use crate::{
    CallEdge, CallTreeModel, Config, MethodId, NodeId, ProfilerError, ProfilerResult,
    list_snapshot_files, matches, package_of, parse_dump, parse_package_list,
};

const DUMP_HELP: &str = "CPU dump or snapshot file (*.cpu, *.jsonl).";
const METHOD_HELP: &str = "Method as class.method, optionally with a signature: com.acme.Foo.run(I)V";

#[derive(Debug, Subcommand)]
pub enum ProfileCommand {
    /// Rank methods by self time.
    Hotspots {
        #[arg(value_name = "DUMP", help = DUMP_HELP)]
        dump: PathBuf,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Print the call tree with per-thread percentages.
    Tree {
        #[arg(value_name = "DUMP", help = DUMP_HELP)]
        dump: PathBuf,
        /// Deepest frame depth to print (0 = roots only).
        #[arg(long)]
        depth: Option<usize>,
    },
    /// Show who calls a method.
    Callers {
        #[arg(value_name = "DUMP", help = DUMP_HELP)]
        dump: PathBuf,
        #[arg(value_name = "METHOD", help = METHOD_HELP)]
        method: String,
    },
    /// Show what a method calls.
    Callees {
        #[arg(value_name = "DUMP", help = DUMP_HELP)]
        dump: PathBuf,
        #[arg(value_name = "METHOD", help = METHOD_HELP)]
        method: String,
    },
    /// Check whether a class falls under a comma-separated package filter.
    Match {
        #[arg(value_name = "CLASS")]
        class: String,
        #[arg(value_name = "PATTERNS")]
        patterns: String,
    },
    /// List snapshot files under the configured base directory.
    Snapshots {
        #[arg(long)]
        session: Option<String>,
    },
    /// Summarize a dump: envelope, threads, totals and max values.
    Info {
        #[arg(value_name = "DUMP", help = DUMP_HELP)]
        dump: PathBuf,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TreeRow {
    thread: String,
    depth: usize,
    method: String,
    invocations: u64,
    self_value: u64,
    cumulative_value: u64,
    percent: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct EdgeRow {
    method: String,
    invocations: u64,
    cumulative_value: u64,
}

impl From<CallEdge> for EdgeRow {
    fn from(edge: CallEdge) -> Self {
        Self {
            method: edge.method.to_string(),
            invocations: edge.invocation_count,
            cumulative_value: edge.cumulative_value,
        }
    }
}

/// A parsed dump plus the reason it is incomplete, if it is.
struct LoadedDump {
    model: CallTreeModel,
    warning: Option<String>,
}

pub fn profile_command(config: &Config, command: &ProfileCommand) -> ProfilerResult<serde_json::Value> {
    match command {
        ProfileCommand::Hotspots { dump, limit } => {
            let loaded = load_dump(dump)?;
            let rows = loaded
                .model
                .hot_spots()
                .into_iter()
                .take(*limit)
                .map(|h| {
                    serde_json::json!({
                        "method": h.method.to_string(),
                        "invocations": h.invocation_count,
                        "selfValue": h.self_value,
                        "selfPercent": round2(h.self_percentage),
                    })
                })
                .collect::<Vec<_>>();
            Ok(with_warnings(
                serde_json::json!({
                    "schemaVersion": "jprof.hotspots.v1",
                    "dump": dump.display().to_string(),
                    "limit": limit,
                    "hotspots": rows,
                }),
                &loaded,
            ))
        }
        ProfileCommand::Tree { dump, depth } => {
            let loaded = load_dump(dump)?;
            let rows = tree_rows(&loaded.model, *depth);
            Ok(with_warnings(
                serde_json::json!({
                    "schemaVersion": "jprof.tree.v1",
                    "dump": dump.display().to_string(),
                    "frames": serde_json::to_value(rows)?,
                }),
                &loaded,
            ))
        }
        ProfileCommand::Callers { dump, method } => {
            edge_report(dump, method, "jprof.callers.v1", "callers", CallTreeModel::callers_of)
        }
        ProfileCommand::Callees { dump, method } => {
            edge_report(dump, method, "jprof.callees.v1", "callees", CallTreeModel::callees_of)
        }
        ProfileCommand::Match { class, patterns } => {
            let patterns = parse_package_list(patterns)?;
            let matched = matches(class, &patterns);
            Ok(serde_json::json!({
                "schemaVersion": "jprof.match.v1",
                "class": class,
                "package": package_of(class),
                "patterns": patterns,
                "matched": matched,
            }))
        }
        ProfileCommand::Snapshots { session } => {
            let dir = config.snapshots_dir();
            let files = list_snapshot_files(&dir, session.as_deref())?;
            Ok(serde_json::json!({
                "schemaVersion": "jprof.snapshots.v1",
                "dir": dir.display().to_string(),
                "snapshots": serde_json::to_value(files)?,
            }))
        }
        ProfileCommand::Info { dump } => {
            let loaded = load_dump(dump)?;
            let model = &loaded.model;
            let threads = model
                .threads()
                .iter()
                .enumerate()
                .map(|(idx, t)| {
                    serde_json::json!({
                        "name": t.name,
                        "roots": t.roots().len(),
                        "total": model.thread_total(idx),
                    })
                })
                .collect::<Vec<_>>();
            Ok(with_warnings(
                serde_json::json!({
                    "schemaVersion": "jprof.info.v1",
                    "dump": dump.display().to_string(),
                    "envelope": serde_json::to_value(&model.envelope)?,
                    "threads": threads,
                    "nodes": model.node_count(),
                    "totalInvocations": model.total_invocations(),
                    "grandTotal": model.grand_total(),
                    "max": serde_json::to_value(model.max_values())?,
                }),
                &loaded,
            ))
        }
    }
}

/// Reads and parses `path`. A malformed dump still yields the frames read
/// before the damage, with the parse error kept as a warning.
fn load_dump(path: &Path) -> ProfilerResult<LoadedDump> {
    let text = std::fs::read_to_string(path).map_err(|source| ProfilerError::IoFailure {
        path: path.to_path_buf(),
        source,
    })?;
    match parse_dump(&text) {
        Ok(model) => Ok(LoadedDump {
            model,
            warning: None,
        }),
        Err(err) => match err.partial {
            Some(model) => Ok(LoadedDump {
                model,
                warning: Some(err.error.to_string()),
            }),
            None => Err(err.error),
        },
    }
}

fn with_warnings(mut value: serde_json::Value, loaded: &LoadedDump) -> serde_json::Value {
    if let (Some(warning), Some(map)) = (&loaded.warning, value.as_object_mut()) {
        map.insert("warnings".to_string(), serde_json::json!([warning]));
    }
    value
}

fn edge_report(
    dump: &Path,
    method: &str,
    schema: &str,
    field: &str,
    edges: fn(&CallTreeModel, &MethodId) -> Vec<CallEdge>,
) -> ProfilerResult<serde_json::Value> {
    let query = MethodId::parse_qualified(method).ok_or_else(|| {
        ProfilerError::InvalidArgument(format!("expected class.method, got {method:?}"))
    })?;
    let loaded = load_dump(dump)?;
    let found = loaded.model.find_methods(&query);
    if found.is_empty() {
        return Err(ProfilerError::InvalidArgument(format!(
            "method {method:?} does not appear in {}",
            dump.display()
        )));
    }
    let mut rows = Vec::with_capacity(found.len());
    for m in found {
        let edge_rows: Vec<EdgeRow> = edges(&loaded.model, &m)
            .into_iter()
            .map(EdgeRow::from)
            .collect();
        rows.push(serde_json::json!({
            "method": m.to_string(),
            field: serde_json::to_value(edge_rows)?,
        }));
    }
    Ok(with_warnings(
        serde_json::json!({
            "schemaVersion": schema,
            "dump": dump.display().to_string(),
            "query": method,
            "matches": rows,
        }),
        &loaded,
    ))
}

fn tree_rows(model: &CallTreeModel, max_depth: Option<usize>) -> Vec<TreeRow> {
    let mut rows = Vec::new();
    for thread in model.threads() {
        let mut stack: Vec<(NodeId, usize)> =
            thread.roots().iter().rev().map(|r| (*r, 0)).collect();
        while let Some((id, depth)) = stack.pop() {
            let node = model.node(id);
            rows.push(TreeRow {
                thread: thread.name.clone(),
                depth,
                method: node.method.to_string(),
                invocations: node.invocation_count,
                self_value: node.self_value,
                cumulative_value: node.cumulative_value,
                percent: round2(model.percentage(id)),
            });
            if max_depth.is_some_and(|max| depth >= max) {
                continue;
            }
            stack.extend(node.children().iter().rev().map(|c| (*c, depth + 1)));
        }
    }
    rows
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
