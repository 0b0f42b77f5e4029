//! Terminal output for the `jprof` binary: styled reports or one JSON
//! document per line.

use anyhow::Result;
use serde_json::Value;

pub struct CliLogger {
    json: bool,
    no_color: bool,
}

impl CliLogger {
    pub fn new(json: bool, no_color: bool) -> Self {
        Self { json, no_color }
    }

    /// Prints a command report. Parse warnings embedded in the report go to
    /// stderr in pretty mode.
    pub fn print_report(&self, report: &Value) -> Result<()> {
        if self.json {
            println!("{}", serde_json::to_string(report)?);
            return Ok(());
        }

        let mut out = String::new();
        let title = report
            .get("schemaVersion")
            .and_then(Value::as_str)
            .map(report_title)
            .unwrap_or_else(|| "jprof".to_string());
        out.push_str(&format!("{}\n", self.style(&title, "36;1")));

        let Some(map) = report.as_object() else {
            out.push_str(&render_value(report, 0));
            println!("{}", out.trim_end());
            return Ok(());
        };
        for (key, value) in map {
            match key.as_str() {
                "schemaVersion" | "warnings" => {}
                "frames" => out.push_str(&self.render_tree(value)),
                "hotspots" => out.push_str(&self.render_hotspots(value)),
                _ => match value {
                    Value::Object(_) | Value::Array(_) => out.push_str(&format!(
                        "{}\n{}\n",
                        self.style(key, "90"),
                        render_value(value, 2)
                    )),
                    _ => out.push_str(&format!(
                        "{} {}\n",
                        self.style(key, "90"),
                        render_value(value, 0)
                    )),
                },
            }
        }
        println!("{}", out.trim_end());

        if let Some(warnings) = map.get("warnings").and_then(Value::as_array) {
            for w in warnings.iter().filter_map(Value::as_str) {
                self.print_warning(w);
            }
        }
        Ok(())
    }

    pub fn print_error(&self, code: &str, msg: &str) {
        if self.json {
            let out = serde_json::json!({
                "status": "error",
                "code": code,
                "message": msg,
            });
            println!("{out}");
            return;
        }
        eprintln!("{} {msg}", self.style("error", "31;1"));
    }

    pub fn print_warning(&self, msg: &str) {
        if self.json {
            let out = serde_json::json!({
                "status": "warning",
                "code": "warning",
                "message": msg,
            });
            eprintln!("{out}");
            return;
        }
        eprintln!("{} {msg}", self.style("warn", "33;1"));
    }

    fn render_tree(&self, frames: &Value) -> String {
        let mut out = String::new();
        let mut thread = None;
        for row in frames.as_array().into_iter().flatten() {
            let name = row["thread"].as_str().unwrap_or_default();
            if thread != Some(name) {
                out.push_str(&format!("{} {name}\n", self.style("thread", "37;1")));
                thread = Some(name);
            }
            let depth = row["depth"].as_u64().unwrap_or(0) as usize;
            out.push_str(&format!(
                "{}{:>6.2}% {} {}\n",
                "  ".repeat(depth + 1),
                row["percent"].as_f64().unwrap_or(0.0),
                row["method"].as_str().unwrap_or_default(),
                self.style(
                    &format!(
                        "calls={} self={} total={}",
                        row["invocations"], row["selfValue"], row["cumulativeValue"]
                    ),
                    "90"
                ),
            ));
        }
        out
    }

    fn render_hotspots(&self, rows: &Value) -> String {
        let mut out = String::new();
        for (rank, row) in rows.as_array().into_iter().flatten().enumerate() {
            out.push_str(&format!(
                "{:>3}. {:>6.2}% {} {}\n",
                rank + 1,
                row["selfPercent"].as_f64().unwrap_or(0.0),
                row["method"].as_str().unwrap_or_default(),
                self.style(
                    &format!("calls={} self={}", row["invocations"], row["selfValue"]),
                    "90"
                ),
            ));
        }
        out
    }

    fn style(&self, text: &str, ansi: &str) -> String {
        if self.no_color {
            return text.to_string();
        }
        format!("\x1b[{ansi}m{text}\x1b[0m")
    }
}

/// `jprof.hotspots.v1` -> `jprof hotspots`.
fn report_title(schema: &str) -> String {
    let mut parts = schema.split('.');
    match (parts.next(), parts.next()) {
        (Some(tool), Some(kind)) => format!("{tool} {kind}"),
        _ => schema.to_string(),
    }
}

fn render_value(value: &Value, indent: usize) -> String {
    let pad = " ".repeat(indent);
    match value {
        Value::Null => format!("{pad}-"),
        Value::Bool(v) => format!("{pad}{v}"),
        Value::Number(v) => format!("{pad}{v}"),
        Value::String(v) => format!("{pad}{v}"),
        Value::Array(items) if items.is_empty() => format!("{pad}(none)"),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Object(map) => format!("{pad}- {}", inline_object(map)),
                other => format!("{pad}- {}", render_value(other, 0)),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| match v {
                Value::Object(_) | Value::Array(_) => {
                    format!("{pad}{k}:\n{}", render_value(v, indent + 2))
                }
                _ => format!("{pad}{k}: {}", render_value(v, 0)),
            })
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

fn inline_object(map: &serde_json::Map<String, Value>) -> String {
    map.iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{k}={s}"),
            other => format!("{k}={other}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_comes_from_schema_version() {
        assert_eq!(report_title("jprof.hotspots.v1"), "jprof hotspots");
        assert_eq!(report_title("plain"), "plain");
    }

    #[test]
    fn arrays_of_objects_render_inline() {
        let value = serde_json::json!([{"session": "1@a", "capturedAtMs": 5}]);
        assert_eq!(render_value(&value, 0), "- capturedAtMs=5 session=1@a");
        assert_eq!(render_value(&serde_json::json!([]), 2), "  (none)");
    }
}
