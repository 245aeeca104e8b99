//! Request execution engine
//!
//! Runs the tasks of a request strictly in order against one
//! `SyncContext` and assembles exactly one result per task. The same engine
//! function serves both execution modes:
//!
//! - sync: every container and handler call uses its sync form, so the
//!   engine future completes on its first poll
//! - async: every call is awaited before the next task starts
//!
//! Task failures never escape the loop. A `TaskExecuteError` fills the
//! task's slot and a panic is caught, logged and reported as `Error`.

use crate::container::{self, EntityContainer, ExecutionMode};
use crate::context::SyncContext;
use crate::database::Database;
use crate::dispatcher::HandlerKind;
use crate::error::{EntityError, EntityErrorType, TaskExecuteError, TaskResult};
use crate::events::{ChangeEvent, EventDispatcher};
use crate::filter::Filter;
use crate::hub::Hub;
use crate::merge;
use crate::protocol::*;
use crate::queue::panic_message;
use crate::references;
use crate::transaction::TransactionState;
use crate::types::{EntityState, JsonEntity, JsonKey};
use futures_util::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

impl Hub {
    /// True if every task of `request` can run without suspending
    pub fn is_sync_request(&self, database: &Database, request: &SyncRequest) -> bool {
        request.tasks.iter().all(|task| task_supports_sync(database, task))
    }

    /// Execute without suspending. Callers check `is_sync_request` first.
    pub fn execute_sync(&self, request: &SyncRequest) -> SyncResponse {
        match self.execute_tasks(request, ExecutionMode::Sync).now_or_never() {
            Some(response) => response,
            None => {
                tracing::error!(database = %request.database, "synchronous execution suspended");
                let error = TaskExecuteError::error("synchronous execution suspended");
                error_response(request, &error)
            }
        }
    }

    pub async fn execute_async(&self, request: &SyncRequest) -> SyncResponse {
        self.execute_tasks(request, ExecutionMode::Async).await
    }

    /// Pick the sync path when possible, bypassing any request queue
    pub async fn execute_direct(&self, request: &SyncRequest) -> SyncResponse {
        let sync = match self.database(&request.database) {
            Some(database) => self.is_sync_request(&database, request),
            None => true,
        };
        if sync {
            self.execute_sync(request)
        } else {
            self.execute_async(request).await
        }
    }

    async fn execute_tasks(&self, request: &SyncRequest, mode: ExecutionMode) -> SyncResponse {
        let database = match self.database(&request.database) {
            Some(database) => database,
            None => {
                let error = TaskExecuteError::invalid_task(format!("database not found: {}", request.database));
                return error_response(request, &error);
            }
        };
        let started = Instant::now();
        let auth = self.authenticator().authenticate(request);
        let mut ctx = SyncContext::new(
            Arc::clone(&database),
            Arc::clone(self.pools()),
            auth,
            request.client_id.clone(),
            self.name_arc(),
            self.events().cloned(),
        );
        tracing::debug!(
            database = %request.database,
            user = ?ctx.user_id(),
            tasks = request.tasks.len(),
            ?mode,
            "request started"
        );

        let mut results: Vec<SyncTaskResult> = Vec::with_capacity(request.tasks.len());
        for (index, task) in request.tasks.iter().enumerate() {
            let outcome = match task {
                SyncTask::TransactionCommit | SyncTask::TransactionRollback => {
                    let commit = matches!(task, SyncTask::TransactionCommit);
                    AssertUnwindSafe(async {
                        database.service().dispatcher().authorize(task, &ctx)?;
                        end_transaction(commit, &mut ctx, &mut results, mode).await
                    })
                    .catch_unwind()
                    .await
                }
                _ => {
                    AssertUnwindSafe(execute_task(task, index, &database, &mut ctx, mode))
                        .catch_unwind()
                        .await
                }
            };
            let result = match outcome {
                Ok(Ok(result)) => result,
                Ok(Err(error)) => SyncTaskResult::Error(error),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(
                        database = %request.database,
                        user = ?ctx.user_id(),
                        task = index,
                        kind = task.name(),
                        error = %message,
                        "task panicked"
                    );
                    SyncTaskResult::Error(TaskExecuteError::error(format!("internal error: {}", message)))
                }
            };
            results.push(result);
        }

        if ctx.transaction_state() == TransactionState::Active {
            let outcome = AssertUnwindSafe(auto_rollback(&mut ctx, &mut results, mode))
                .catch_unwind()
                .await;
            if let Err(panic) = outcome {
                tracing::error!(
                    database = %request.database,
                    error = %panic_message(panic.as_ref()),
                    "rollback at request end panicked"
                );
            }
        }
        ctx.release_connection();

        tracing::debug!(
            database = %request.database,
            user = ?ctx.user_id(),
            tasks = results.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "request finished"
        );
        SyncResponse {
            database: request.database.clone(),
            client_id: request.client_id.clone(),
            tasks: results,
        }
    }
}

fn error_response(request: &SyncRequest, error: &TaskExecuteError) -> SyncResponse {
    SyncResponse {
        database: request.database.clone(),
        client_id: request.client_id.clone(),
        tasks: request
            .tasks
            .iter()
            .map(|_| SyncTaskResult::Error(error.clone()))
            .collect(),
    }
}

// ==================== Mode selection ====================

fn container_supports_sync(database: &Database, name: &str) -> bool {
    // a missing container yields an error result without I/O
    database.container(name).map_or(true, |c| c.capabilities().sync)
}

fn references_support_sync(database: &Database, references: &[References]) -> bool {
    references.iter().all(|r| {
        container_supports_sync(database, &r.container) && references_support_sync(database, &r.references)
    })
}

fn task_supports_sync(database: &Database, task: &SyncTask) -> bool {
    let dispatcher = database.service().dispatcher();
    match task {
        SyncTask::Command(command) => dispatcher.supports_sync(HandlerKind::Command, &command.name),
        SyncTask::Message(message) => dispatcher.supports_sync(HandlerKind::Message, &message.name),
        SyncTask::Read(read) => {
            container_supports_sync(database, &read.container) && references_support_sync(database, &read.references)
        }
        SyncTask::Query(query) => {
            container_supports_sync(database, &query.container)
                && references_support_sync(database, &query.references)
        }
        other => match other.container() {
            Some(name) => container_supports_sync(database, name),
            None => true,
        },
    }
}

// ==================== Tasks ====================

async fn execute_task(
    task: &SyncTask,
    index: usize,
    database: &Database,
    ctx: &mut SyncContext,
    mode: ExecutionMode,
) -> TaskResult<SyncTaskResult> {
    database.service().dispatcher().authorize(task, ctx)?;

    match task {
        SyncTask::Create(command) => {
            let c = database.container(&command.container)?;
            let (entities, parse_errors) = check_entities(&command.entities, database, &command.container)?;
            ctx.ensure_connection()?;
            let keys: Vec<JsonKey> = entities.iter().map(|e| e.key.clone()).collect();
            journal_keys(&c, &keys, ctx, mode).await?;
            let checked = CreateEntities {
                container: command.container.clone(),
                entities,
            };
            let mut written = container::create(c.as_ref(), &checked, ctx, mode).await?;
            written.errors.splice(0..0, parse_errors);
            notify(ctx, &command.container, ChangeKind::Create, keys, &written.errors);
            Ok(SyncTaskResult::Create(written))
        }
        SyncTask::Upsert(command) => {
            let c = database.container(&command.container)?;
            let (entities, parse_errors) = check_entities(&command.entities, database, &command.container)?;
            ctx.ensure_connection()?;
            let keys: Vec<JsonKey> = entities.iter().map(|e| e.key.clone()).collect();
            journal_keys(&c, &keys, ctx, mode).await?;
            let checked = UpsertEntities {
                container: command.container.clone(),
                entities,
            };
            let mut written = container::upsert(c.as_ref(), &checked, ctx, mode).await?;
            written.errors.splice(0..0, parse_errors);
            notify(ctx, &command.container, ChangeKind::Upsert, keys, &written.errors);
            Ok(SyncTaskResult::Upsert(written))
        }
        SyncTask::Read(command) => {
            let c = database.container(&command.container)?;
            ctx.ensure_connection()?;
            let mut entities = container::read(c.as_ref(), command, ctx, mode).await?;
            let references = references::resolve(&mut entities, &command.references, database, ctx, mode).await;
            Ok(SyncTaskResult::Read(ReadEntitiesResult { entities, references }))
        }
        SyncTask::Query(command) => {
            let c = database.container(&command.container)?;
            ctx.ensure_connection()?;
            let page = container::query(c.as_ref(), command, ctx, mode).await?;
            let mut entities = page.entities;
            let references = references::resolve(&mut entities, &command.references, database, ctx, mode).await;
            Ok(SyncTaskResult::Query(QueryEntitiesResult {
                container: command.container.clone(),
                cursor: page.cursor,
                entities,
                references,
            }))
        }
        SyncTask::Aggregate(command) => {
            let c = database.container(&command.container)?;
            ctx.ensure_connection()?;
            let value = match command.kind {
                AggregateType::Count => container::count(c.as_ref(), &command.filter, ctx, mode).await? as f64,
            };
            Ok(SyncTaskResult::Aggregate(AggregateEntitiesResult {
                container: command.container.clone(),
                kind: command.kind,
                value,
            }))
        }
        SyncTask::Delete(command) => {
            let c = database.container(&command.container)?;
            if !command.all && command.ids.is_empty() {
                return Ok(SyncTaskResult::Delete(EntityErrors::default()));
            }
            ctx.ensure_connection()?;
            let keys = if command.all {
                journal_all(&c, ctx, mode).await?
            } else {
                journal_keys(&c, &command.ids, ctx, mode).await?;
                command.ids.clone()
            };
            let deleted = container::delete(c.as_ref(), command, ctx, mode).await?;
            notify(ctx, &command.container, ChangeKind::Delete, keys, &deleted.errors);
            Ok(SyncTaskResult::Delete(deleted))
        }
        SyncTask::Merge(command) => {
            let c = database.container(&command.container)?;
            ctx.ensure_connection()?;
            let keys = unique_keys(command.patches.iter().map(|p| &p.key));
            journal_keys(&c, &keys, ctx, mode).await?;
            let merged = if c.capabilities().native_merge {
                container::merge_native(c.as_ref(), command, ctx, mode).await?
            } else {
                merge::merge_entities(c.as_ref(), command, ctx, mode).await?
            };
            notify(ctx, &command.container, ChangeKind::Merge, keys, &merged.errors);
            Ok(SyncTaskResult::Merge(merged))
        }
        SyncTask::Message(message) => {
            database
                .service()
                .dispatcher()
                .dispatch(HandlerKind::Message, &message.name, message.param.clone(), ctx, mode)
                .await?;
            Ok(SyncTaskResult::Message)
        }
        SyncTask::Command(command) => {
            let result = database
                .service()
                .dispatcher()
                .dispatch(HandlerKind::Command, &command.name, command.param.clone(), ctx, mode)
                .await?;
            Ok(SyncTaskResult::Command(SendCommandResult { result }))
        }
        SyncTask::SubscribeChanges(command) => {
            database.container(&command.container)?;
            let events = subscriber_events(ctx)?;
            events.subscribe_changes(ctx.client_id(), command)?;
            Ok(SyncTaskResult::SubscribeChanges)
        }
        SyncTask::SubscribeMessage(command) => {
            let events = subscriber_events(ctx)?;
            events.subscribe_message(ctx.client_id(), command)?;
            Ok(SyncTaskResult::SubscribeMessage)
        }
        SyncTask::CloseCursors(command) => {
            let c = database.container(&command.container)?;
            let count = c.cursors().close(command.cursors.as_deref(), ctx.user_id());
            Ok(SyncTaskResult::CloseCursors(CloseCursorsResult { count }))
        }
        SyncTask::TransactionBegin => {
            ctx.ensure_connection()?;
            ctx.begin_transaction(index)?;
            Ok(SyncTaskResult::TransactionBegin(TransactionResult {
                state: TransactionOutcome::Active,
            }))
        }
        SyncTask::TransactionCommit | SyncTask::TransactionRollback => {
            Err(TaskExecuteError::error("transaction end handled by the task loop"))
        }
    }
}

/// Separate entities whose value is not valid JSON and validate the rest
/// against the schema. Any schema violation fails the whole task.
fn check_entities(
    entities: &[JsonEntity],
    database: &Database,
    container: &str,
) -> TaskResult<(Vec<JsonEntity>, Vec<EntityError>)> {
    let mut valid = Vec::with_capacity(entities.len());
    let mut errors = Vec::new();
    for entity in entities {
        match entity.value.parse() {
            Ok(_) => valid.push(entity.clone()),
            Err(e) => errors.push(EntityError::new(
                entity.key.clone(),
                EntityErrorType::ParseError,
                format!("invalid JSON: {}", e),
            )),
        }
    }
    if let Some(schema) = database.schema() {
        let violations = schema.validate_entities(container, &valid);
        if !violations.is_empty() {
            let messages: Vec<String> = violations.iter().map(ToString::to_string).collect();
            return Err(TaskExecuteError::validation(format!(
                "validation of {} entities failed: {}",
                violations.len(),
                messages.join(", ")
            )));
        }
    }
    Ok((valid, errors))
}

fn unique_keys<'k>(keys: impl Iterator<Item = &'k JsonKey>) -> Vec<JsonKey> {
    let mut seen = HashSet::new();
    keys.filter(|key| seen.insert(*key)).cloned().collect()
}

fn subscriber_events(ctx: &SyncContext) -> TaskResult<Arc<dyn EventDispatcher>> {
    if !ctx.auth().permission().subscribe {
        return Err(TaskExecuteError::permission_denied(
            "subscribe not permitted",
            ctx.user_id().map(str::to_string),
        ));
    }
    ctx.events()
        .cloned()
        .ok_or_else(|| TaskExecuteError::not_implemented("no event dispatcher configured"))
}

/// Report keys written without entity error. Inside a transaction the
/// event waits for the commit.
fn notify(ctx: &mut SyncContext, container: &str, kind: ChangeKind, keys: Vec<JsonKey>, errors: &[EntityError]) {
    if ctx.events().is_none() {
        return;
    }
    let failed: HashSet<&JsonKey> = errors.iter().map(|e| &e.key).collect();
    let keys: Vec<JsonKey> = keys.into_iter().filter(|key| !failed.contains(key)).collect();
    let event = ChangeEvent {
        database: ctx.database().name().to_string(),
        container: container.to_string(),
        client_id: ctx.client_id().map(str::to_string),
        user_id: ctx.user_id().map(str::to_string),
        kind,
        keys,
    };
    match ctx.transaction_mut() {
        Some(transaction) => transaction.defer_event(event),
        None => {
            if let Some(events) = ctx.events() {
                events.entities_changed(event);
            }
        }
    }
}

// ==================== Transactions ====================

/// Record the stored state of `keys` before they are written
async fn journal_keys(
    c: &Arc<dyn EntityContainer>,
    keys: &[JsonKey],
    ctx: &mut SyncContext,
    mode: ExecutionMode,
) -> TaskResult<()> {
    let pending: Vec<JsonKey> = match ctx.transaction() {
        None => return Ok(()),
        Some(transaction) => keys
            .iter()
            .filter(|key| !transaction.journal().is_recorded(c.name(), key))
            .cloned()
            .collect(),
    };
    if pending.is_empty() {
        return Ok(());
    }
    let stored = container::read_keys(c.as_ref(), pending, ctx, mode).await?;
    let mut previous = Vec::with_capacity(stored.len());
    for entity in stored {
        match entity.state {
            EntityState::Value(value) => previous.push((entity.key, Some(value))),
            EntityState::Missing => previous.push((entity.key, None)),
            EntityState::Error(error) => {
                return Err(TaskExecuteError::database(format!(
                    "cannot record previous state of {}: {}",
                    entity.key, error.message
                )))
            }
        }
    }
    if let Some(transaction) = ctx.transaction_mut() {
        for (key, value) in previous {
            transaction.journal_mut().record(Arc::clone(c), key, value);
        }
    }
    Ok(())
}

/// Record every stored entity before a delete of the whole container and
/// return the stored keys. Nothing is read when neither a transaction nor
/// an event dispatcher needs them.
async fn journal_all(
    c: &Arc<dyn EntityContainer>,
    ctx: &mut SyncContext,
    mode: ExecutionMode,
) -> TaskResult<Vec<JsonKey>> {
    if ctx.transaction().is_none() && ctx.events().is_none() {
        return Ok(Vec::new());
    }
    let command = QueryEntities::new(c.name(), Filter::all());
    let page = container::query(c.as_ref(), &command, ctx, mode).await?;
    let mut keys = Vec::with_capacity(page.entities.len());
    for entity in page.entities {
        if let EntityState::Value(value) = entity.state {
            if let Some(transaction) = ctx.transaction_mut() {
                transaction.journal_mut().record(Arc::clone(c), entity.key.clone(), Some(value));
            }
            keys.push(entity.key);
        }
    }
    Ok(keys)
}

/// Handle `transactionCommit` / `transactionRollback` and rewrite the
/// result of the matching `transactionBegin`.
async fn end_transaction(
    commit: bool,
    ctx: &mut SyncContext,
    results: &mut [SyncTaskResult],
    mode: ExecutionMode,
) -> TaskResult<SyncTaskResult> {
    let transaction = ctx.take_transaction()?;
    let begin = transaction.begin_index();
    let failed = results[begin + 1..].iter().any(SyncTaskResult::is_error);

    let (state, outcome) = if commit && !failed {
        let events = transaction.commit();
        if let Some(dispatcher) = ctx.events() {
            for event in events {
                dispatcher.entities_changed(event);
            }
        }
        (TransactionOutcome::Committed, Ok(()))
    } else {
        if commit {
            tracing::warn!(
                database = %ctx.database().name(),
                user = ?ctx.user_id(),
                begin = begin,
                "task failed inside transaction, rolling back"
            );
        }
        let outcome = transaction.rollback(ctx, mode).await.map(|_| ());
        (TransactionOutcome::RolledBack, outcome)
    };

    results[begin] = SyncTaskResult::TransactionBegin(TransactionResult { state });
    outcome?;
    let result = TransactionResult { state };
    Ok(if commit {
        SyncTaskResult::TransactionCommit(result)
    } else {
        SyncTaskResult::TransactionRollback(result)
    })
}

/// Roll back a transaction left open at the end of the request
async fn auto_rollback(ctx: &mut SyncContext, results: &mut [SyncTaskResult], mode: ExecutionMode) {
    let transaction = match ctx.take_transaction() {
        Ok(transaction) => transaction,
        Err(_) => return,
    };
    let begin = transaction.begin_index();
    tracing::warn!(
        database = %ctx.database().name(),
        user = ?ctx.user_id(),
        begin = begin,
        "transaction not committed, rolling back"
    );
    if let Err(error) = transaction.rollback(ctx, mode).await {
        tracing::error!(database = %ctx.database().name(), error = %error, "rollback at request end failed");
    }
    results[begin] = SyncTaskResult::TransactionBegin(TransactionResult {
        state: TransactionOutcome::RolledBack,
    });
}
