//! Next-step resolution from a finished task

use weft_core::{ErrorCode, ErrorInfo, TaskState, TaskStatus};

use crate::definition::{TaskConfig, TaskKind};

/// What the dispatch loop does after a task settles
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Next(String),
    Complete,
    Fail(ErrorInfo),
    Cancel,
}

/// Pick the next step for a terminal task state.
///
/// `final` only applies on success. A router's chosen route replaces
/// `on_success`; a wait task's `on_timeout` takes precedence over
/// `on_error` when its deadline passed.
pub fn resolve(task: &TaskConfig, state: &TaskState) -> Transition {
    match state.status {
        TaskStatus::Success => {
            if let TaskKind::Router(_) = task.kind {
                let routed = state
                    .output
                    .as_ref()
                    .and_then(|o| o.get("next"))
                    .and_then(|v| v.as_str());
                return match routed {
                    Some(next) => Transition::Next(next.to_string()),
                    None => Transition::Fail(ErrorInfo::execution(format!(
                        "router {} produced no route",
                        task.id
                    ))),
                };
            }
            if task.is_final {
                return Transition::Complete;
            }
            match task.success_next() {
                Some(next) => Transition::Next(next.to_string()),
                None => Transition::Complete,
            }
        }
        TaskStatus::Failed | TaskStatus::TimedOut => {
            let error = state
                .error
                .clone()
                .unwrap_or_else(|| ErrorInfo::execution(format!("task {} failed", task.id)));

            if let TaskKind::Wait(ref wait) = task.kind {
                if error.code == ErrorCode::TimeoutExceeded {
                    if let Some(ref next) = wait.on_timeout {
                        return Transition::Next(next.clone());
                    }
                }
            }
            match task.error_next() {
                Some(next) => Transition::Next(next.to_string()),
                None => Transition::Fail(error),
            }
        }
        TaskStatus::Canceled => Transition::Cancel,
        TaskStatus::Pending | TaskStatus::Running => Transition::Fail(ErrorInfo::infrastructure(format!(
            "task {} was resolved before it settled ({})",
            task.id, state.status
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::WaitTask;
    use serde_json::json;
    use weft_core::{ComponentType, ExecutionType};

    fn state(status: TaskStatus, output: Option<serde_json::Value>, error: Option<ErrorInfo>) -> TaskState {
        let mut s = TaskState::new("wf", "exec", "t", ExecutionType::Basic, ComponentType::Agent);
        s.mark_running().unwrap();
        match status {
            TaskStatus::Success => s
                .succeed(output.and_then(|o| o.as_object().cloned()).unwrap_or_default())
                .unwrap(),
            TaskStatus::Failed => s.fail(error.unwrap()).unwrap(),
            TaskStatus::TimedOut => s.time_out(error.unwrap()).unwrap(),
            TaskStatus::Canceled => s.cancel().unwrap(),
            _ => {}
        }
        s
    }

    #[test]
    fn test_success_paths() {
        let task = TaskConfig::agent("t", "a", "run").on_success("next");
        assert_eq!(
            resolve(&task, &state(TaskStatus::Success, None, None)),
            Transition::Next("next".into())
        );

        let final_task = TaskConfig::agent("t", "a", "run").on_success("next").with_final();
        assert_eq!(
            resolve(&final_task, &state(TaskStatus::Success, None, None)),
            Transition::Complete
        );

        let terminal = TaskConfig::agent("t", "a", "run");
        assert_eq!(resolve(&terminal, &state(TaskStatus::Success, None, None)), Transition::Complete);
    }

    #[test]
    fn test_final_ignored_on_error() {
        let task = TaskConfig::agent("t", "a", "run").with_final().on_error("recover");
        let failed = state(TaskStatus::Failed, None, Some(ErrorInfo::execution("boom")));
        assert_eq!(resolve(&task, &failed), Transition::Next("recover".into()));

        let no_handler = TaskConfig::agent("t", "a", "run").with_final();
        assert_eq!(
            resolve(&no_handler, &failed),
            Transition::Fail(ErrorInfo::execution("boom"))
        );
    }

    #[test]
    fn test_router_uses_chosen_route() {
        let task: TaskConfig = serde_json::from_value(json!({
            "id": "t", "type": "router", "condition": "{{ .x }}",
            "routes": { "a": "left", "default": "right" }
        }))
        .unwrap();
        let done = state(TaskStatus::Success, Some(json!({"route": "a", "next": "left"})), None);
        assert_eq!(resolve(&task, &done), Transition::Next("left".into()));
    }

    #[test]
    fn test_wait_timeout_prefers_on_timeout() {
        let task = TaskConfig::new(
            "t",
            TaskKind::Wait(WaitTask {
                wait_for: "approved".into(),
                condition: None,
                on_timeout: Some("escalate".into()),
            }),
        )
        .on_error("fallback");

        let timed_out = state(TaskStatus::Failed, None, Some(ErrorInfo::timeout("deadline")));
        assert_eq!(resolve(&task, &timed_out), Transition::Next("escalate".into()));

        let other = state(TaskStatus::Failed, None, Some(ErrorInfo::execution("bad")));
        assert_eq!(resolve(&task, &other), Transition::Next("fallback".into()));
    }

    #[test]
    fn test_canceled_task_cancels() {
        let task = TaskConfig::agent("t", "a", "run").on_error("recover");
        let canceled = state(TaskStatus::Canceled, None, None);
        assert_eq!(resolve(&task, &canceled), Transition::Cancel);
    }
}
