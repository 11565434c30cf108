//! Task registry

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use super::{Task, TaskContext, TaskError, TaskResult};

/// Object-safe task handler over JSON values
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn call(&self, ctx: Arc<TaskContext>, input: Value)
        -> Result<TaskResult<Value>, TaskError>;
}

struct TypedHandler<T: Task> {
    task: T,
}

#[async_trait]
impl<T: Task> TaskHandler for TypedHandler<T> {
    async fn call(
        &self,
        ctx: Arc<TaskContext>,
        input: Value,
    ) -> Result<TaskResult<Value>, TaskError> {
        let input: T::Input = serde_json::from_value(input)?;
        match self.task.execute(&ctx, input).await? {
            TaskResult::Complete(output) => Ok(TaskResult::Complete(
                serde_json::to_value(output).map_err(|e| TaskError::message(e.to_string()))?,
            )),
            TaskResult::Async => Ok(TaskResult::Async),
        }
    }
}

type HandlerFn = dyn Fn(Arc<TaskContext>, Value) -> BoxFuture<'static, Result<TaskResult<Value>, TaskError>>
    + Send
    + Sync;

struct FnHandler {
    body: Box<HandlerFn>,
}

#[async_trait]
impl TaskHandler for FnHandler {
    async fn call(
        &self,
        ctx: Arc<TaskContext>,
        input: Value,
    ) -> Result<TaskResult<Value>, TaskError> {
        (self.body)(ctx, input).await
    }
}

/// Task handlers by name
#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Task>(&mut self, task: T) {
        self.handlers
            .insert(T::NAME.to_string(), Arc::new(TypedHandler { task }));
    }

    /// Register a closure
    ///
    /// ```ignore
    /// registry.register_fn("add", |_ctx, input| async move {
    ///     let sum = input["a"].as_i64().unwrap_or(0) + input["b"].as_i64().unwrap_or(0);
    ///     Ok(TaskResult::Complete(json!(sum)))
    /// });
    /// ```
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, body: F)
    where
        F: Fn(Arc<TaskContext>, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskResult<Value>, TaskError>> + Send + 'static,
    {
        let body: Box<HandlerFn> = Box::new(move |ctx, input| Box::pin(body(ctx, input)));
        self.handlers
            .insert(name.into(), Arc::new(FnHandler { body }));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered task names, sorted
    pub fn task_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.task_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;
    use crate::clients::TaskWorkerRequest;
    use crate::clock::SystemClock;
    use crate::persistence::InMemoryTaskStore;

    #[derive(Deserialize)]
    struct AddInput {
        a: i64,
        b: i64,
    }

    #[derive(Serialize)]
    struct AddOutput {
        sum: i64,
    }

    struct AddTask;

    #[async_trait]
    impl Task for AddTask {
        const NAME: &'static str = "add";
        type Input = AddInput;
        type Output = AddOutput;

        async fn execute(
            &self,
            _ctx: &TaskContext,
            input: Self::Input,
        ) -> Result<TaskResult<Self::Output>, TaskError> {
            Ok(TaskResult::Complete(AddOutput {
                sum: input.a + input.b,
            }))
        }
    }

    fn context() -> Arc<TaskContext> {
        let request = TaskWorkerRequest {
            execution_id: "math/1".into(),
            workflow_name: "math".into(),
            task_name: "add".into(),
            seq: 0,
            retry: 0,
            input: Value::Null,
            heartbeat: None,
            scheduled_time: Utc::now(),
        };
        Arc::new(TaskContext::new(
            &request,
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(SystemClock),
        ))
    }

    #[tokio::test]
    async fn test_typed_task() {
        let mut registry = TaskRegistry::new();
        registry.register(AddTask);

        let handler = registry.get("add").unwrap();
        let result = handler.call(context(), json!({"a": 2, "b": 3})).await;
        assert_eq!(result, Ok(TaskResult::Complete(json!({"sum": 5}))));
    }

    #[tokio::test]
    async fn test_typed_task_rejects_bad_input() {
        let mut registry = TaskRegistry::new();
        registry.register(AddTask);

        let err = registry
            .get("add")
            .unwrap()
            .call(context(), json!({"a": "two"}))
            .await
            .unwrap_err();
        assert_eq!(err.error, "InvalidInput");
    }

    #[tokio::test]
    async fn test_closure_task() {
        let mut registry = TaskRegistry::new();
        registry.register_fn("echo", |_ctx, input| async move {
            Ok::<_, TaskError>(TaskResult::Complete(input))
        });
        registry.register(AddTask);

        assert_eq!(registry.task_names(), vec!["add", "echo"]);
        assert!(registry.get("missing").is_none());

        let result = registry.get("echo").unwrap().call(context(), json!(1)).await;
        assert_eq!(result, Ok(TaskResult::Complete(json!(1))));
    }
}
