//! Variable substitution into job payloads.
//!
//! Placeholders are literal `{{.scope.name}}` strings:
//! - `{{.workflow.name}}`, `{{.workflow.project}}`
//! - `{{.workflow.task.id}}`, `{{.workflow.task.creator}}`
//! - `{{.workflow.params.<name>}}`
//! - `{{.stage.name}}`
//! - `{{.job.<job task name>.<output>}}` -- outputs of earlier jobs
//!
//! Unknown placeholders are left as-is. Rendering walks the JSON form of a
//! payload and substitutes inside string values only, so a value containing
//! quotes or braces can never change the payload's shape.

use std::collections::BTreeMap;

use conveyor_types::definition::{StageDefinition, WorkflowDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Placeholder -> replacement.
pub type Variables = BTreeMap<String, String>;

/// Placeholder under which a job's output is published.
pub fn output_placeholder(job_task_name: &str, output: &str) -> String {
    format!("{{{{.job.{job_task_name}.{output}}}}}")
}

/// Workflow-scoped variables for a task.
pub fn workflow_variables(def: &WorkflowDefinition, task_id: i64, creator: &str) -> Variables {
    let mut vars = Variables::new();
    vars.insert("{{.workflow.name}}".to_string(), def.name.clone());
    vars.insert("{{.workflow.project}}".to_string(), def.project.clone());
    vars.insert("{{.workflow.task.id}}".to_string(), task_id.to_string());
    vars.insert("{{.workflow.task.creator}}".to_string(), creator.to_string());
    for param in &def.params {
        vars.insert(
            format!("{{{{.workflow.params.{}}}}}", param.name),
            param.value.clone(),
        );
    }
    vars
}

/// Workflow variables extended with the stage scope.
pub fn stage_variables(workflow: &Variables, stage: &StageDefinition) -> Variables {
    let mut vars = workflow.clone();
    vars.insert("{{.stage.name}}".to_string(), stage.name.clone());
    vars
}

/// Replace every known placeholder in `text`.
pub fn render_text(text: &str, vars: &Variables) -> String {
    if !text.contains("{{") {
        return text.to_string();
    }
    vars.iter()
        .fold(text.to_string(), |acc, (placeholder, value)| {
            acc.replace(placeholder.as_str(), value)
        })
}

/// Render every string inside a serializable payload.
pub fn render<T>(payload: &T, vars: &Variables) -> Result<T, serde_json::Error>
where
    T: Serialize + DeserializeOwned,
{
    let mut value = serde_json::to_value(payload)?;
    render_value(&mut value, vars);
    serde_json::from_value(value)
}

fn render_value(value: &mut Value, vars: &Variables) {
    match value {
        Value::String(text) => *text = render_text(text, vars),
        Value::Array(items) => items.iter_mut().for_each(|item| render_value(item, vars)),
        Value::Object(map) => map.values_mut().for_each(|item| render_value(item, vars)),
        _ => {}
    }
}
