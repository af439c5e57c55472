//! `toolwright events`: Validate and summarize a JSONL event log.

use std::collections::{BTreeMap, HashSet};
use std::io::BufRead;
use std::path::Path;

use toolwright_core::event::{Event, EventKind, RunStatus};

/// What a pass over an event log found.
#[derive(Debug, Default)]
pub struct LogSummary {
    pub events: Vec<Event>,
    pub by_type: BTreeMap<&'static str, usize>,
    /// `(line number, error)` for every line that failed to parse or validate.
    pub invalid: Vec<(usize, String)>,
    pub runs: Vec<RunStatus>,
    /// Calls with no recorded result, e.g. from an interrupted run.
    pub unanswered_calls: Vec<String>,
}

pub fn summarize(reader: impl BufRead) -> std::io::Result<LogSummary> {
    let mut summary = LogSummary::default();
    let mut open_calls: Vec<String> = Vec::new();
    let mut answered: HashSet<String> = HashSet::new();

    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event = match Event::from_json_line(&line) {
            Ok(event) => event,
            Err(e) => {
                summary.invalid.push((i + 1, e.to_string()));
                continue;
            }
        };

        *summary.by_type.entry(event.event_type().as_str()).or_default() += 1;
        match &event.kind {
            EventKind::ToolCall { tool_call_id, .. } => open_calls.push(tool_call_id.clone()),
            EventKind::ToolResult { tool_call_id, .. } => {
                answered.insert(tool_call_id.clone());
            }
            EventKind::AgentRunEnd { status, .. } => summary.runs.push(*status),
            _ => {}
        }
        summary.events.push(event);
    }

    summary.unanswered_calls = open_calls
        .into_iter()
        .filter(|id| !answered.contains(id))
        .collect();
    Ok(summary)
}

pub async fn run(path: &Path, list: bool) -> Result<(), Box<dyn std::error::Error>> {
    let file = std::fs::File::open(path)
        .map_err(|e| format!("Failed to open {}: {e}", path.display()))?;
    let summary = summarize(std::io::BufReader::new(file))?;

    if list {
        for event in &summary.events {
            println!("{}  {:<36}  {}", event.timestamp.to_rfc3339(), event.event_type().as_str(), event.id);
        }
        println!();
    }

    println!("Events:  {}", summary.events.len());
    for (event_type, count) in &summary.by_type {
        println!("   {event_type:<36} {count}");
    }

    if !summary.runs.is_empty() {
        let statuses: Vec<String> = summary.runs.iter().map(|s| format!("{s:?}")).collect();
        println!("Runs:    {} ({})", summary.runs.len(), statuses.join(", "));
    }
    if !summary.unanswered_calls.is_empty() {
        println!(
            "warning: {} tool call(s) without a result: {}",
            summary.unanswered_calls.len(),
            summary.unanswered_calls.join(", ")
        );
    }

    if summary.invalid.is_empty() {
        return Ok(());
    }
    for (line, err) in &summary.invalid {
        println!("   line {line}: {err}");
    }
    Err(format!("{} invalid line(s)", summary.invalid.len()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line(kind: EventKind) -> String {
        Event::new(kind).to_json_line().unwrap()
    }

    #[test]
    fn summarizes_a_run() {
        let log = [
            line(EventKind::UserMessage { content: "hi".into() }),
            line(EventKind::ToolCall {
                tool_call_id: "c1".into(),
                name: "click".into(),
                arguments: json!({}),
            }),
            line(EventKind::ToolCall {
                tool_call_id: "c2".into(),
                name: "type".into(),
                arguments: json!({}),
            }),
            line(EventKind::ToolResult {
                tool_call_id: "c1".into(),
                name: "click".into(),
                content: json!("ok"),
                error: None,
                elapsed_ms: 3,
            }),
            String::new(),
            line(EventKind::AgentRunEnd {
                session_id: "s".into(),
                status: RunStatus::Aborted,
                iterations: 1,
                elapsed_ms: 10,
                final_content: None,
            }),
        ]
        .join("\n");

        let summary = summarize(log.as_bytes()).unwrap();
        assert_eq!(summary.events.len(), 5);
        assert!(summary.invalid.is_empty());
        assert_eq!(summary.by_type["tool_call"], 2);
        assert_eq!(summary.runs, vec![RunStatus::Aborted]);
        assert_eq!(summary.unanswered_calls, vec!["c2".to_string()]);
    }

    #[test]
    fn reports_invalid_lines_with_numbers() {
        let log = format!(
            "{}\nnot json\n{}\n",
            line(EventKind::UserMessage { content: "hi".into() }),
            r#"{"id":"x","timestamp":"2024-01-01T00:00:00Z","type":"tool_call","name":"click","arguments":{}}"#
        );
        let summary = summarize(log.as_bytes()).unwrap();
        assert_eq!(summary.events.len(), 1);
        let lines: Vec<usize> = summary.invalid.iter().map(|(n, _)| *n).collect();
        assert_eq!(lines, vec![2, 3]);
    }
}
