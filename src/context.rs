//! Per request execution state
//!
//! A `SyncContext` is created for one request, exclusively owned by it and
//! dropped after the response is assembled. It holds the authentication
//! result, the lazily acquired storage connection and the pending
//! transaction.

use crate::auth::AuthState;
use crate::connection_pool::PooledConnection;
use crate::database::Database;
use crate::error::{TaskExecuteError, TaskResult};
use crate::events::EventDispatcher;
use crate::pool::SharedPools;
use crate::transaction::{Transaction, TransactionState};
use std::sync::Arc;

pub struct SyncContext {
    database: Arc<Database>,
    pools: Arc<SharedPools>,
    auth: AuthState,
    client_id: Option<String>,
    hub_name: Arc<str>,
    events: Option<Arc<dyn EventDispatcher>>,
    connection: Option<PooledConnection>,
    transaction: Option<Transaction>,
}

impl SyncContext {
    pub fn new(
        database: Arc<Database>,
        pools: Arc<SharedPools>,
        auth: AuthState,
        client_id: Option<String>,
        hub_name: Arc<str>,
        events: Option<Arc<dyn EventDispatcher>>,
    ) -> Self {
        SyncContext {
            database,
            pools,
            auth,
            client_id,
            hub_name,
            events,
            connection: None,
            transaction: None,
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn pools(&self) -> &SharedPools {
        &self.pools
    }

    pub fn auth(&self) -> &AuthState {
        &self.auth
    }

    pub fn user_id(&self) -> Option<&str> {
        self.auth.user_id()
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn hub_name(&self) -> &str {
        &self.hub_name
    }

    pub fn events(&self) -> Option<&Arc<dyn EventDispatcher>> {
        self.events.as_ref()
    }

    // ==================== Connection ====================

    /// Acquire the storage connection on first use
    pub fn ensure_connection(&mut self) -> TaskResult<()> {
        if self.connection.is_none() {
            let connection = self.database.connections().acquire()?;
            tracing::trace!(database = %self.database.name(), connection = connection.id(), "connection acquired");
            self.connection = Some(connection);
        }
        Ok(())
    }

    /// Return the connection to its pool. Safe to call repeatedly.
    pub fn release_connection(&mut self) {
        if let Some(connection) = self.connection.take() {
            tracing::trace!(database = %self.database.name(), connection = connection.id(), "connection released");
        }
    }

    // ==================== Transaction ====================

    pub fn transaction_state(&self) -> TransactionState {
        match self.transaction {
            Some(_) => TransactionState::Active,
            None => TransactionState::Idle,
        }
    }

    /// Idle → Active
    pub fn begin_transaction(&mut self, begin_index: usize) -> TaskResult<()> {
        if self.transaction.is_some() {
            return Err(TaskExecuteError::invalid_task("transaction already started"));
        }
        self.transaction = Some(Transaction::new(begin_index));
        Ok(())
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    pub fn transaction_mut(&mut self) -> Option<&mut Transaction> {
        self.transaction.as_mut()
    }

    /// Active → Idle, handing the transaction to the caller
    pub fn take_transaction(&mut self) -> TaskResult<Transaction> {
        self.transaction
            .take()
            .ok_or_else(|| TaskExecuteError::invalid_task("missing transaction begin"))
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        self.release_connection();
    }
}
