//! Connection Pool
//!
//! Manages the storage connections of one database. A request checks out at
//! most one connection, lazily on its first storage task, and the handle
//! returns it to the pool when dropped.

use crate::config::ConnectionPoolConfig;
use crate::error::{TaskExecuteError, TaskResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A logical storage connection
#[derive(Debug)]
pub struct Connection {
    id: u64,
    last_used: Instant,
    checkouts: u64,
}

impl Connection {
    fn new(id: u64) -> Self {
        Connection {
            id,
            last_used: Instant::now(),
            checkouts: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// How often this connection has been checked out
    pub fn checkouts(&self) -> u64 {
        self.checkouts
    }

    fn is_idle_too_long(&self, max_idle_time: Duration) -> bool {
        self.last_used.elapsed() > max_idle_time
    }
}

struct PoolState {
    idle: VecDeque<Connection>,
    active: usize,
    next_id: u64,
}

/// Connection pool of one database
pub struct ConnectionPool {
    database: String,
    config: ConnectionPoolConfig,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    pub fn new(database: &str, config: ConnectionPoolConfig) -> Self {
        ConnectionPool {
            database: database.to_string(),
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: 0,
                next_id: 1,
            }),
        }
    }

    /// Check out a connection without blocking
    pub fn acquire(self: &Arc<Self>) -> TaskResult<PooledConnection> {
        let closed = self.cleanup_idle_connections(self.config.max_idle_time());
        if closed > 0 {
            tracing::debug!(database = %self.database, closed, "idle connections closed");
        }
        let mut state = self.state.lock();

        let mut connection = match state.idle.pop_front() {
            Some(conn) => conn,
            None => {
                if state.active >= self.config.max_size {
                    tracing::warn!(
                        database = %self.database,
                        max_size = self.config.max_size,
                        "connection pool exhausted"
                    );
                    return Err(TaskExecuteError::database("no connection available"));
                }
                let id = state.next_id;
                state.next_id += 1;
                Connection::new(id)
            }
        };

        state.active += 1;
        connection.checkouts += 1;
        connection.last_used = Instant::now();

        Ok(PooledConnection {
            pool: Arc::clone(self),
            connection: Some(connection),
        })
    }

    fn release(&self, mut connection: Connection) {
        connection.last_used = Instant::now();
        let mut state = self.state.lock();
        state.active -= 1;
        state.idle.push_back(connection);
    }

    /// Number of connections currently checked out
    pub fn active_connections(&self) -> usize {
        self.state.lock().active
    }

    pub fn idle_connections(&self) -> usize {
        self.state.lock().idle.len()
    }

    /// Close idle connections unused for longer than `max_idle_time`
    pub fn cleanup_idle_connections(&self, max_idle_time: Duration) -> usize {
        let mut state = self.state.lock();
        let before = state.idle.len();
        state.idle.retain(|c| !c.is_idle_too_long(max_idle_time));
        before - state.idle.len()
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            total_connections: state.active + state.idle.len(),
            active_connections: state.active,
            idle_connections: state.idle.len(),
            max_size: self.config.max_size,
        }
    }
}

/// Handle to a pooled connection that returns it to the pool on drop
pub struct PooledConnection {
    pool: Arc<ConnectionPool>,
    connection: Option<Connection>,
}

impl PooledConnection {
    pub fn id(&self) -> u64 {
        self.connection.as_ref().map(Connection::id).unwrap_or(0)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_connections: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub max_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskErrorType;
    use std::thread;

    fn create_test_pool(max_size: usize) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(
            "test",
            ConnectionPoolConfig {
                max_size,
                ..ConnectionPoolConfig::default()
            },
        ))
    }

    #[test]
    fn test_get_connection() {
        let pool = create_test_pool(4);

        let handle = pool.acquire().unwrap();
        assert_eq!(handle.id(), 1);
        assert_eq!(pool.active_connections(), 1);
        assert_eq!(pool.idle_connections(), 0);
    }

    #[test]
    fn test_connection_return() {
        let pool = create_test_pool(4);

        {
            let _handle = pool.acquire().unwrap();
            assert_eq!(pool.active_connections(), 1);
        }

        // Connection should be returned and reused
        assert_eq!(pool.active_connections(), 0);
        assert_eq!(pool.idle_connections(), 1);
        let handle = pool.acquire().unwrap();
        assert_eq!(handle.id(), 1);
    }

    #[test]
    fn test_pool_max_size() {
        let pool = create_test_pool(2);

        let _conn1 = pool.acquire().unwrap();
        let _conn2 = pool.acquire().unwrap();

        let result = pool.acquire();
        let err = result.err().unwrap();
        assert_eq!(err.kind, TaskErrorType::DatabaseError);
        assert!(err.message.contains("no connection"));
    }

    #[test]
    fn test_concurrent_connections() {
        let pool = create_test_pool(8);
        let mut handles = vec![];

        for _ in 0..5 {
            let pool_clone = pool.clone();
            handles.push(thread::spawn(move || {
                let _conn = pool_clone.acquire().unwrap();
                thread::sleep(Duration::from_millis(10));
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pool.active_connections(), 0);
    }

    #[test]
    fn test_pool_stats() {
        let pool = create_test_pool(10);

        let _conn = pool.acquire().unwrap();
        let stats = pool.stats();
        assert_eq!(stats.active_connections, 1);
        assert_eq!(stats.max_size, 10);
    }

    #[test]
    fn test_cleanup_idle_connections() {
        let pool = create_test_pool(4);
        drop(pool.acquire().unwrap());

        assert_eq!(pool.cleanup_idle_connections(Duration::from_secs(60)), 0);
        thread::sleep(Duration::from_millis(5));
        assert_eq!(pool.cleanup_idle_connections(Duration::from_millis(1)), 1);
        assert_eq!(pool.idle_connections(), 0);
    }

    #[test]
    fn test_acquire_closes_stale_connections() {
        let pool = Arc::new(ConnectionPool::new(
            "test",
            ConnectionPoolConfig {
                max_size: 4,
                max_idle_secs: 0,
            },
        ));
        drop(pool.acquire().unwrap());
        thread::sleep(Duration::from_millis(5));

        let handle = pool.acquire().unwrap();
        assert_eq!(handle.id(), 2, "Stale idle connection must not be reused");
        assert_eq!(pool.stats().total_connections, 1);
    }
}
