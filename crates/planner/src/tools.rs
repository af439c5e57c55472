//! Tools the planner contributes to the agent's registry.
//!
//! Handlers only acknowledge. The planner reads the calls back from the
//! event stream and folds them into its Plan State.

use std::sync::Arc;

use serde_json::{Value, json};
use toolwright_core::event::PlanStep;
use toolwright_core::tool::{FunctionTool, Tool};

pub const CREATE_PLAN: &str = "create_plan";
pub const UPDATE_PLAN: &str = "update_plan";
pub const SEQUENTIAL_THINKING: &str = "sequential_thinking";

pub fn create_plan_tool() -> Arc<dyn Tool> {
    Arc::new(FunctionTool::new(
        CREATE_PLAN,
        "Record the ordered list of steps you will take to complete the task.",
        json!({
            "type": "object",
            "properties": {
                "steps": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Concrete, ordered steps"
                }
            },
            "required": ["steps"]
        }),
        |args: Value| async move {
            let count = args["steps"].as_array().map_or(0, Vec::len);
            Ok(json!({ "status": "plan recorded", "steps": count }))
        },
    ))
}

pub fn update_plan_tool() -> Arc<dyn Tool> {
    Arc::new(FunctionTool::new(
        UPDATE_PLAN,
        "Replace the plan with its current state, marking finished steps as done.",
        json!({
            "type": "object",
            "properties": {
                "steps": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "content": { "type": "string" },
                            "done": { "type": "boolean" }
                        },
                        "required": ["content", "done"]
                    }
                }
            },
            "required": ["steps"]
        }),
        |_args: Value| async move { Ok(json!({ "status": "plan updated" })) },
    ))
}

pub fn sequential_thinking_tool() -> Arc<dyn Tool> {
    Arc::new(FunctionTool::new(
        SEQUENTIAL_THINKING,
        "Think through the problem one step at a time. Call repeatedly until no further thought is needed.",
        json!({
            "type": "object",
            "properties": {
                "thought": { "type": "string" },
                "thought_number": { "type": "integer", "minimum": 1 },
                "total_thoughts": { "type": "integer", "minimum": 1 },
                "next_thought_needed": { "type": "boolean" }
            },
            "required": ["thought", "next_thought_needed"]
        }),
        |args: Value| async move {
            Ok(json!({
                "thought_number": args["thought_number"].as_u64().unwrap_or(1),
                "next_thought_needed": args["next_thought_needed"].as_bool().unwrap_or(false)
            }))
        },
    ))
}

/// The `steps` argument as a list. Text-marker engines deliver it as a
/// string: either a JSON array or one step per line.
fn steps_array(args: &Value) -> Option<Vec<Value>> {
    match args.get("steps")? {
        Value::Array(items) => Some(items.clone()),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Array(items)) => Some(items),
            _ => Some(
                raw.lines()
                    .map(|line| line.trim().trim_start_matches(['-', '*']).trim())
                    .filter(|line| !line.is_empty())
                    .map(|line| Value::String(line.to_string()))
                    .collect(),
            ),
        },
        _ => None,
    }
}

/// Steps from `create_plan` arguments. Accepts plain strings or step objects.
pub fn steps_from_create(args: &Value) -> Option<Vec<PlanStep>> {
    let items = steps_array(args)?;
    let steps: Vec<PlanStep> = items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) if !s.trim().is_empty() => Some(PlanStep {
                content: s.trim().to_string(),
                done: false,
            }),
            Value::Object(_) => serde_json::from_value::<PlanStep>(item.clone()).ok(),
            _ => None,
        })
        .collect();
    (!steps.is_empty()).then_some(steps)
}

/// Steps from `update_plan` arguments.
pub fn steps_from_update(args: &Value) -> Option<Vec<PlanStep>> {
    let items = steps_array(args)?;
    let steps: Vec<PlanStep> = items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(PlanStep {
                content: s.clone(),
                done: false,
            }),
            other => serde_json::from_value::<PlanStep>(other.clone()).ok(),
        })
        .collect();
    (!steps.is_empty()).then_some(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_accepts_strings_and_objects() {
        let steps = steps_from_create(&json!({
            "steps": ["search docs", {"content": "summarize", "done": false}, "  "]
        }))
        .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].content, "search docs");
        assert!(steps_from_create(&json!({"steps": []})).is_none());
        assert!(steps_from_create(&json!({"plan": "x"})).is_none());
    }

    #[test]
    fn string_steps_are_split() {
        let steps = steps_from_create(&json!({"steps": "- open page\n- read title\n"})).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].content, "read title");

        let steps = steps_from_create(&json!({"steps": "[\"a\", \"b\"]"})).unwrap();
        assert_eq!(steps[0].content, "a");
    }

    #[test]
    fn update_reads_done_flags() {
        let steps = steps_from_update(&json!({
            "steps": [{"content": "a", "done": true}, {"content": "b"}]
        }))
        .unwrap();
        assert!(steps[0].done);
        assert!(!steps[1].done);
    }

    #[tokio::test]
    async fn tools_acknowledge() {
        let tool = create_plan_tool();
        let out = tool.execute(json!({"steps": ["a", "b"]})).await.unwrap();
        assert_eq!(out["steps"], 2);

        let tool = sequential_thinking_tool();
        let out = tool
            .execute(json!({"thought": "hmm", "next_thought_needed": true, "thought_number": 2}))
            .await
            .unwrap();
        assert_eq!(out["thought_number"], 2);
        assert_eq!(out["next_thought_needed"], true);
        assert_eq!(update_plan_tool().name(), UPDATE_PLAN);
    }
}
