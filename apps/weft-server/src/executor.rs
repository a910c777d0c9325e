//! Executor adapter that forwards basic tasks to a remote agent/tool service

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use weft_core::{ExecutorConfig, Payload};
use weft_workflow::{ComponentRef, ExecutionRequest, Executor, ExecutorError};

/// Wire body posted for every task invocation
#[derive(Debug, Serialize)]
struct InvokeBody<'a> {
    workflow_id: &'a str,
    workflow_exec_id: &'a str,
    task_id: &'a str,
    task_exec_id: &'a str,
    component: &'static str,
    target: &'a str,
    action: Option<&'a str>,
    input: &'a Payload,
}

pub struct HttpExecutor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpExecutor {
    pub fn new(config: &ExecutorConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }

    async fn invoke(&self, request: &ExecutionRequest) -> Result<Payload, ExecutorError> {
        let component = match request.target {
            ComponentRef::Agent(_) => "agent",
            ComponentRef::Tool(_) => "tool",
        };
        let body = InvokeBody {
            workflow_id: &request.workflow_id,
            workflow_exec_id: &request.workflow_exec_id,
            task_id: &request.task_id,
            task_exec_id: &request.task_exec_id,
            component,
            target: request.target.id(),
            action: request.action.as_deref(),
            input: &request.input,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExecutorError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ExecutorError::Failed(format!(
                "{} {} returned {}: {}",
                component,
                request.target.id(),
                status,
                text
            )));
        }

        match response.json::<Value>().await {
            Ok(Value::Object(output)) => Ok(output),
            Ok(other) => Err(ExecutorError::Failed(format!(
                "expected a JSON object from {}, got {}",
                request.target.id(),
                other
            ))),
            Err(e) => Err(ExecutorError::Failed(format!(
                "invalid response from {}: {}",
                request.target.id(),
                e
            ))),
        }
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
        token: CancellationToken,
    ) -> Result<Payload, ExecutorError> {
        debug!(
            task_exec_id = %request.task_exec_id,
            target = %request.target.id(),
            endpoint = %self.endpoint,
            "Invoking remote executor"
        );

        // Dropping the request future aborts the HTTP call
        tokio::select! {
            result = self.invoke(&request) => {
                if let Err(ref e) = result {
                    warn!(task_exec_id = %request.task_exec_id, error = %e, "Remote execution failed");
                }
                result
            }
            _ = token.cancelled() => Err(ExecutorError::Canceled),
        }
    }
}
