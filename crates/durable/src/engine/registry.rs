//! Workflow registry for type-erased workflow programs
//!
//! The registry maps workflow names to programs that take and return JSON,
//! so the orchestrator can run any execution knowing only its id.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::LocalBoxFuture;
use serde_json::Value;

use super::WorkflowContext;
use crate::workflow::{error_names, Workflow, WorkflowError};

/// Type-erased workflow program
///
/// Implemented for every registered [`Workflow`] and for closures passed to
/// [`WorkflowRegistry::register_fn`]. The returned future is driven by the
/// interpreter on the calling thread, so it does not need to be `Send`.
pub trait WorkflowProgram: Send + Sync {
    /// Registered workflow name
    fn name(&self) -> &str;

    /// Start the program body with JSON input
    fn start(
        &self,
        ctx: WorkflowContext,
        input: Value,
    ) -> LocalBoxFuture<'static, Result<Value, WorkflowError>>;
}

/// Adapter from a typed [`Workflow`]
struct TypedProgram<W: Workflow> {
    _workflow: PhantomData<fn() -> W>,
}

impl<W: Workflow> WorkflowProgram for TypedProgram<W> {
    fn name(&self) -> &str {
        W::NAME
    }

    fn start(
        &self,
        ctx: WorkflowContext,
        input: Value,
    ) -> LocalBoxFuture<'static, Result<Value, WorkflowError>> {
        match serde_json::from_value::<W::Input>(input) {
            Ok(input) => Box::pin(async move {
                let output = W::run(ctx, input).await?;
                Ok(serde_json::to_value(output)?)
            }),
            Err(err) => {
                let error = WorkflowError::new(error_names::INVALID_INPUT, err.to_string());
                Box::pin(async move { Err(error) })
            }
        }
    }
}

type ProgramFn =
    dyn Fn(WorkflowContext, Value) -> LocalBoxFuture<'static, Result<Value, WorkflowError>>
        + Send
        + Sync;

/// Adapter from a closure
struct FnProgram {
    name: String,
    body: Box<ProgramFn>,
}

impl WorkflowProgram for FnProgram {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(
        &self,
        ctx: WorkflowContext,
        input: Value,
    ) -> LocalBoxFuture<'static, Result<Value, WorkflowError>> {
        (self.body)(ctx, input)
    }
}

/// Registry of workflow programs
#[derive(Default, Clone)]
pub struct WorkflowRegistry {
    programs: HashMap<String, Arc<dyn WorkflowProgram>>,
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed workflow
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = WorkflowRegistry::new();
    /// registry.register::<OrderWorkflow>();
    /// ```
    pub fn register<W: Workflow>(&mut self) {
        self.programs.insert(
            W::NAME.to_string(),
            Arc::new(TypedProgram::<W> {
                _workflow: PhantomData,
            }),
        );
    }

    /// Register a closure over JSON values
    ///
    /// ```ignore
    /// registry.register_fn("double", |ctx, input| async move {
    ///     let n = ctx.task("compute", input).await?;
    ///     Ok(json!(n.as_i64().unwrap_or_default() * 2))
    /// });
    /// ```
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, body: F)
    where
        F: Fn(WorkflowContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, WorkflowError>> + 'static,
    {
        let name = name.into();
        let body: Box<ProgramFn> = Box::new(move |ctx, input| Box::pin(body(ctx, input)));
        self.programs
            .insert(name.clone(), Arc::new(FnProgram { name, body }));
    }

    /// Check if a workflow is registered
    pub fn contains(&self, name: &str) -> bool {
        self.programs.contains_key(name)
    }

    /// Look up a program by workflow name
    pub fn get(&self, name: &str) -> Result<Arc<dyn WorkflowProgram>, RegistryError> {
        self.programs
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownWorkflow(name.to_string()))
    }

    /// Get the number of registered workflows
    pub fn len(&self) -> usize {
        self.programs.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    /// Registered workflow names, sorted
    pub fn workflow_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.programs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflows", &self.workflow_names())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Workflow not registered
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),
}
