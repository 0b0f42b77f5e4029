//! CPU dump text format.
//!
//! A dump is JSON Lines: one record per line, tagged by `kind`.
//!
//! ```text
//! {"kind":"header","format":"jprof-cpu-dump","version":1,"envelope":{...}}
//! {"kind":"thread","name":"main"}
//! {"kind":"frame","depth":0,"class":"com.acme.App","method":"run","signature":"()V","count":1,"time":100}
//! {"kind":"frame","depth":1,"class":"com.acme.Db","method":"load","signature":"()V","count":4,"time":60}
//! {"kind":"end","threads":1,"frames":2}
//! ```
//!
//! Frames are written in pre-order; `depth` 0 starts a new root and a frame's
//! depth is never more than one below the previous frame. `time` is the
//! cumulative value of the frame. The `end` trailer lets readers tell a
//! complete dump from a truncated one.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use std::io::Write;

use crate::{CallTreeModel, MethodId, NodeId, ProfilerResult};

pub const DUMP_FORMAT: &str = "jprof-cpu-dump";
pub const DUMP_VERSION: u32 = 1;

/// Process metadata captured alongside a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpEnvelope {
    /// `pid@host`.
    pub process: String,
    pub main_class: String,
    pub jvm_args: String,
    /// RFC 3339 capture time.
    pub captured_at: String,
}

impl DumpEnvelope {
    pub fn capture(process: String, main_class: String, jvm_args: String) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            process,
            main_class,
            jvm_args,
            captured_at: now
                .format(&Rfc3339)
                .unwrap_or_else(|_| now.unix_timestamp().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DumpRecord {
    Header {
        format: String,
        version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        envelope: Option<DumpEnvelope>,
    },
    Thread {
        name: String,
    },
    Frame {
        depth: usize,
        #[serde(rename = "class")]
        class_name: String,
        #[serde(rename = "method")]
        method_name: String,
        #[serde(default)]
        signature: String,
        count: u64,
        time: u64,
    },
    End {
        threads: usize,
        frames: usize,
    },
}

impl DumpRecord {
    pub fn header(envelope: Option<DumpEnvelope>) -> Self {
        Self::Header {
            format: DUMP_FORMAT.to_string(),
            version: DUMP_VERSION,
            envelope,
        }
    }

    fn frame(depth: usize, method: &MethodId, count: u64, time: u64) -> Self {
        Self::Frame {
            depth,
            class_name: method.class_name.clone(),
            method_name: method.method_name.clone(),
            signature: method.signature.clone(),
            count,
            time,
        }
    }
}

/// Writes `model` in dump format. The envelope argument wins over the one
/// stored on the model.
pub fn write_dump<W: Write>(
    model: &CallTreeModel,
    envelope: Option<&DumpEnvelope>,
    out: &mut W,
) -> ProfilerResult<()> {
    let envelope = envelope.or(model.envelope.as_ref()).cloned();
    write_record(out, &DumpRecord::header(envelope))?;
    let mut frames = 0usize;
    for thread in model.threads() {
        write_record(
            out,
            &DumpRecord::Thread {
                name: thread.name.clone(),
            },
        )?;
        let mut stack: Vec<(NodeId, usize)> =
            thread.roots().iter().rev().map(|r| (*r, 0)).collect();
        while let Some((id, depth)) = stack.pop() {
            let node = model.node(id);
            write_record(
                out,
                &DumpRecord::frame(
                    depth,
                    &node.method,
                    node.invocation_count,
                    node.cumulative_value,
                ),
            )?;
            frames += 1;
            stack.extend(node.children().iter().rev().map(|c| (*c, depth + 1)));
        }
    }
    write_record(
        out,
        &DumpRecord::End {
            threads: model.threads().len(),
            frames,
        },
    )?;
    Ok(())
}

pub fn dump_to_string(
    model: &CallTreeModel,
    envelope: Option<&DumpEnvelope>,
) -> ProfilerResult<String> {
    let mut buf = Vec::with_capacity(model.node_count().saturating_mul(96));
    write_dump(model, envelope, &mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn write_record<W: Write>(out: &mut W, record: &DumpRecord) -> ProfilerResult<()> {
    serde_json::to_writer(&mut *out, record)?;
    out.write_all(b"\n")?;
    Ok(())
}
