//! Merge of sibling task outputs for aggregate tasks

use weft_core::{ErrorInfo, Payload, TaskState, TaskStatus};

/// Shallow-merge the outputs of `deps` in the given order; later keys win.
///
/// Every dependency must exist and have succeeded, otherwise the merge
/// fails with `MissingDependencyOutput` naming the first offender.
pub fn merge_outputs<'a, I>(deps: I) -> Result<Payload, ErrorInfo>
where
    I: IntoIterator<Item = (&'a str, Option<&'a TaskState>)>,
{
    let mut merged = Payload::new();
    for (task_id, state) in deps {
        let state = match state {
            Some(state) if state.status == TaskStatus::Success => state,
            Some(state) => {
                return Err(ErrorInfo::missing_dependency(format!(
                    "task {} finished as {} and has no output to aggregate",
                    task_id, state.status
                ))
                .with_details(serde_json::json!({ "task_id": task_id, "status": state.status })));
            }
            None => {
                return Err(ErrorInfo::missing_dependency(format!(
                    "task {} has not run in this execution",
                    task_id
                ))
                .with_details(serde_json::json!({ "task_id": task_id })));
            }
        };
        if let Some(output) = &state.output {
            for (key, value) in output {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    Ok(merged)
}
