//! Task handler registry.
//!
//! Handlers are opaque executors keyed by `task_type`. An unknown type is a
//! domain failure recorded on the row, never a panic. The built-in handlers
//! simulate their work with representative latencies.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::info;

use conveyor_core::TaskMessage;

/// Outcome of executing a task handler.
#[derive(Debug, Clone)]
pub enum HandlerResult {
    /// The work finished; carries the result reference recorded on the row.
    Success { result_file: String },
    /// The work failed; carries the user-facing error message.
    Failure { message: String },
}

type TaskHandler = Box<dyn Fn(TaskMessage) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Maps `task_type` to its executor.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, TaskHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The production handler set.
    pub fn builtin() -> Self {
        let mut registry = Self::new();

        registry.register("send_email", |msg| async move {
            info!(user_id = msg.user_id, "sending email");
            tokio::time::sleep(Duration::from_millis(500)).await;
            info!(user_id = msg.user_id, "email sent");
            HandlerResult::Success {
                result_file: "result.txt".to_string(),
            }
        });

        registry.register("generate_report", |msg| async move {
            info!(user_id = msg.user_id, "generating report");
            tokio::time::sleep(Duration::from_secs(5)).await;
            info!(user_id = msg.user_id, "report generated");
            HandlerResult::Success {
                result_file: "result.txt".to_string(),
            }
        });

        registry.register("resize_image", |msg| async move {
            info!(user_id = msg.user_id, "resizing image");
            tokio::time::sleep(Duration::from_secs(2)).await;
            info!(user_id = msg.user_id, "image resized");
            HandlerResult::Success {
                result_file: "result.txt".to_string(),
            }
        });

        registry.register("cleanup_temp", |msg| async move {
            info!(user_id = msg.user_id, "cleaning temp files");
            tokio::time::sleep(Duration::from_secs(1)).await;
            info!(user_id = msg.user_id, "temp cleanup done");
            HandlerResult::Success {
                result_file: "result.txt".to_string(),
            }
        });

        registry
    }

    pub fn register<F, Fut>(&mut self, task_type: impl Into<String>, handler: F)
    where
        F: Fn(TaskMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers
            .insert(task_type.into(), Box::new(move |msg| Box::pin(handler(msg))));
    }

    /// Execute the handler for a message's task type.
    pub async fn execute(&self, message: &TaskMessage) -> HandlerResult {
        match self.handlers.get(&message.task_type) {
            Some(handler) => handler(message.clone()).await,
            None => HandlerResult::Failure {
                message: format!("unknown task type: {}", message.task_type),
            },
        }
    }
}
