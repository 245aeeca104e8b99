//! Command and message dispatch
//!
//! Handlers are registered by name at startup into a plain map. A handler
//! comes in one of three shapes: sync, async, or dual (both entry points,
//! so the execution mode can be chosen per request).
//!
//! Names are `.` separated segments. The `std.` namespace is reserved for
//! the built-in commands registered by `ServiceDispatcher::new`.

use crate::container::{self, ExecutionMode};
use crate::context::SyncContext;
use crate::error::{HubError, HubResult, TaskExecuteError, TaskResult};
use crate::filter::Filter;
use crate::protocol::SyncTask;
use crate::types::JsonValue;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

pub const STD_PREFIX: &str = "std.";

/// Value returned by a command handler. `Err` becomes a task `Error`.
pub type HandlerResult = Result<Option<JsonValue>, String>;

type SyncHandler = Arc<dyn Fn(&Param, &SyncContext) -> HandlerResult + Send + Sync>;
type AsyncHandler = Arc<dyn for<'a> Fn(Param, &'a SyncContext) -> BoxFuture<'a, HandlerResult> + Send + Sync>;

fn sync_handler<F>(handler: F) -> SyncHandler
where
    F: Fn(&Param, &SyncContext) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(handler)
}

fn async_handler<F>(handler: F) -> AsyncHandler
where
    F: for<'a> Fn(Param, &'a SyncContext) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
{
    Arc::new(handler)
}

/// Parameter of a command or message
#[derive(Debug, Clone, Default)]
pub struct Param {
    value: Option<JsonValue>,
}

impl Param {
    pub fn new(value: Option<JsonValue>) -> Self {
        Param { value }
    }

    pub fn value(&self) -> Option<&JsonValue> {
        self.value.as_ref()
    }

    pub fn is_null(&self) -> bool {
        self.value.as_ref().map_or(true, JsonValue::is_null)
    }

    /// Deserialize the parameter. A missing parameter reads as `null`.
    pub fn get<T: DeserializeOwned>(&self) -> Result<T, String> {
        let result = match &self.value {
            Some(value) => serde_json::from_slice(value.as_bytes()),
            None => serde_json::from_value(serde_json::Value::Null),
        };
        result.map_err(|e| format!("invalid param: {}", e))
    }
}

/// Serialize a handler result
pub fn to_result<T: Serialize>(value: &T) -> HandlerResult {
    serde_json::to_value(value)
        .map(|v| Some(JsonValue::from_value(&v)))
        .map_err(|e| e.to_string())
}

/// Whether a handler answers commands or messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Command,
    Message,
}

enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
    Dual(SyncHandler, AsyncHandler),
}

impl Handler {
    fn supports_sync(&self) -> bool {
        !matches!(self, Handler::Async(_))
    }
}

/// Check a handler name: non-empty `.` separated segments
pub fn validate_name(name: &str) -> HubResult<()> {
    if name.is_empty() || name.split('.').any(str::is_empty) {
        return Err(HubError::InvalidHandlerName(name.to_string()));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(HubError::InvalidHandlerName(name.to_string()));
    }
    Ok(())
}

pub struct ServiceDispatcher {
    handlers: HashMap<(HandlerKind, String), Handler>,
}

impl ServiceDispatcher {
    /// Dispatcher with the `std.` built-in commands
    pub fn new() -> Self {
        let mut dispatcher = ServiceDispatcher {
            handlers: HashMap::new(),
        };
        dispatcher.register_std_commands();
        dispatcher
    }

    fn insert(&mut self, kind: HandlerKind, name: &str, handler: Handler, builtin: bool) -> HubResult<()> {
        validate_name(name)?;
        if !builtin && name.starts_with(STD_PREFIX) {
            return Err(HubError::ReservedHandlerName(name.to_string()));
        }
        let key = (kind, name.to_string());
        if self.handlers.contains_key(&key) {
            return Err(HubError::DuplicateHandler(name.to_string()));
        }
        self.handlers.insert(key, handler);
        Ok(())
    }

    // ==================== Registration ====================

    pub fn register_command<F>(&mut self, name: &str, handler: F) -> HubResult<()>
    where
        F: Fn(&Param, &SyncContext) -> HandlerResult + Send + Sync + 'static,
    {
        self.insert(HandlerKind::Command, name, Handler::Sync(sync_handler(handler)), false)
    }

    pub fn register_async_command<F>(&mut self, name: &str, handler: F) -> HubResult<()>
    where
        F: for<'a> Fn(Param, &'a SyncContext) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
    {
        self.insert(HandlerKind::Command, name, Handler::Async(async_handler(handler)), false)
    }

    pub fn register_dual_command<S, A>(&mut self, name: &str, sync: S, asynchronous: A) -> HubResult<()>
    where
        S: Fn(&Param, &SyncContext) -> HandlerResult + Send + Sync + 'static,
        A: for<'a> Fn(Param, &'a SyncContext) -> BoxFuture<'a, HandlerResult> + Send + Sync + 'static,
    {
        let handler = Handler::Dual(sync_handler(sync), async_handler(asynchronous));
        self.insert(HandlerKind::Command, name, handler, false)
    }

    pub fn register_message<F>(&mut self, name: &str, handler: F) -> HubResult<()>
    where
        F: Fn(&Param, &SyncContext) -> Result<(), String> + Send + Sync + 'static,
    {
        let handler = sync_handler(move |param, ctx| handler(param, ctx).map(|()| None));
        self.insert(HandlerKind::Message, name, Handler::Sync(handler), false)
    }

    pub fn register_async_message<F>(&mut self, name: &str, handler: F) -> HubResult<()>
    where
        F: for<'a> Fn(Param, &'a SyncContext) -> BoxFuture<'a, Result<(), String>> + Send + Sync + 'static,
    {
        let handler = async_handler(move |param, ctx| {
            let fut = handler(param, ctx);
            Box::pin(async move { fut.await.map(|()| None) })
        });
        self.insert(HandlerKind::Message, name, Handler::Async(handler), false)
    }

    fn register_std_commands(&mut self) {
        let builtins: Vec<(&str, Handler)> = vec![
            ("std.Echo", Handler::Sync(sync_handler(|param, _| Ok(param.value().cloned())))),
            (
                "std.Containers",
                Handler::Sync(sync_handler(|_, ctx| to_result(&ctx.database().container_names()))),
            ),
            (
                "std.Host",
                Handler::Sync(sync_handler(|_, ctx| {
                    to_result(&json!({
                        "hubName": ctx.hub_name(),
                        "version": env!("CARGO_PKG_VERSION"),
                    }))
                })),
            ),
            ("std.Stats", Handler::Async(async_handler(|_, ctx| Box::pin(container_stats(ctx))))),
        ];
        for (name, handler) in builtins {
            // built-in names are valid and unique
            let _ = self.insert(HandlerKind::Command, name, handler, true);
        }
    }

    // ==================== Dispatch ====================

    pub fn has_handler(&self, kind: HandlerKind, name: &str) -> bool {
        self.handlers.contains_key(&(kind, name.to_string()))
    }

    /// Names of registered handlers of `kind`, sorted
    pub fn handler_names(&self, kind: HandlerKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// True if `name` can run without suspending. Unknown names qualify
    /// since their result needs no I/O.
    pub fn supports_sync(&self, kind: HandlerKind, name: &str) -> bool {
        self.handlers
            .get(&(kind, name.to_string()))
            .map_or(true, Handler::supports_sync)
    }

    /// Run the task authorizer of the request
    pub fn authorize(&self, task: &SyncTask, ctx: &SyncContext) -> TaskResult<()> {
        ctx.auth()
            .authorizer()
            .authorize_task(task, ctx)
            .map_err(|reason| TaskExecuteError::permission_denied(reason, ctx.user_id().map(str::to_string)))
    }

    /// Invoke the handler registered for `name`. Messages without a handler
    /// succeed, commands without one fail with `NotImplemented`.
    pub async fn dispatch(
        &self,
        kind: HandlerKind,
        name: &str,
        param: Option<JsonValue>,
        ctx: &SyncContext,
        mode: ExecutionMode,
    ) -> TaskResult<Option<JsonValue>> {
        let handler = match self.handlers.get(&(kind, name.to_string())) {
            Some(handler) => handler,
            None if kind == HandlerKind::Message => return Ok(None),
            None => {
                return Err(TaskExecuteError::not_implemented(format!(
                    "no command handler for '{}'",
                    name
                )))
            }
        };
        let param = Param::new(param);
        let result = match (handler, mode) {
            (Handler::Sync(sync), _) | (Handler::Dual(sync, _), ExecutionMode::Sync) => sync(&param, ctx),
            (Handler::Async(asynchronous), ExecutionMode::Async) | (Handler::Dual(_, asynchronous), ExecutionMode::Async) => {
                asynchronous(param, ctx).await
            }
            (Handler::Async(_), ExecutionMode::Sync) => {
                return Err(TaskExecuteError::not_implemented(format!(
                    "'{}' has no synchronous handler",
                    name
                )))
            }
        };
        result.map_err(TaskExecuteError::error)
    }
}

impl Default for ServiceDispatcher {
    fn default() -> Self {
        ServiceDispatcher::new()
    }
}

/// `std.Stats`: entity count per container
async fn container_stats(ctx: &SyncContext) -> HandlerResult {
    let database = ctx.database();
    let mut containers = Vec::new();
    for name in database.container_names() {
        let container = database.container(&name).map_err(|e| e.message)?;
        let count = container::count(container.as_ref(), &Filter::all(), ctx, ExecutionMode::Async)
            .await
            .map_err(|e| e.message)?;
        containers.push(json!({"name": name, "count": count}));
    }
    to_result(&json!({ "containers": containers }))
}
