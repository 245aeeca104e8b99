//! Query cursors
//!
//! A cursor remembers the last key enumerated by a paged query. It belongs
//! to the user that created it and is only usable by that user.

use crate::error::{TaskExecuteError, TaskResult};
use crate::types::JsonKey;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;

/// State of one open cursor
#[derive(Debug, Clone)]
pub struct Cursor {
    /// Last key returned to the client
    pub position: JsonKey,
    pub user_id: Option<String>,
    pub last_access: DateTime<Utc>,
}

impl Cursor {
    fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - self.last_access > ttl,
            Err(_) => false,
        }
    }
}

/// Cursor table of one container
pub struct CursorTable {
    cursors: DashMap<String, Cursor>,
    ttl: Duration,
}

impl CursorTable {
    pub fn new(ttl: Duration) -> Self {
        CursorTable {
            cursors: DashMap::new(),
            ttl,
        }
    }

    /// Allocate a new cursor positioned after `position`
    pub fn open(&self, position: JsonKey, user_id: Option<&str>) -> String {
        self.reclaim_expired();
        let cursor = Cursor {
            position,
            user_id: user_id.map(str::to_string),
            last_access: Utc::now(),
        };
        loop {
            let id = format!("{:016x}", rand::random::<u64>());
            if let dashmap::mapref::entry::Entry::Vacant(entry) = self.cursors.entry(id.clone()) {
                entry.insert(cursor);
                return id;
            }
        }
    }

    /// Position of an existing cursor. Cursors of other users are reported
    /// as not found.
    pub fn resume(&self, id: &str, user_id: Option<&str>) -> TaskResult<JsonKey> {
        self.reclaim_expired();
        match self.cursors.get_mut(id) {
            Some(mut cursor) if cursor.user_id.as_deref() == user_id => {
                cursor.last_access = Utc::now();
                Ok(cursor.position.clone())
            }
            _ => Err(TaskExecuteError::invalid_task("cursor not found")),
        }
    }

    pub fn update(&self, id: &str, position: JsonKey) {
        if let Some(mut cursor) = self.cursors.get_mut(id) {
            cursor.position = position;
            cursor.last_access = Utc::now();
        }
    }

    pub fn remove(&self, id: &str) {
        self.cursors.remove(id);
    }

    /// Close cursors of `user_id`: the given ids, or all of them when `ids`
    /// is `None`. Returns the number of cursors the user still holds.
    pub fn close(&self, ids: Option<&[String]>, user_id: Option<&str>) -> usize {
        match ids {
            Some(ids) => {
                for id in ids {
                    self.cursors
                        .remove_if(id, |_, cursor| cursor.user_id.as_deref() == user_id);
                }
            }
            None => self
                .cursors
                .retain(|_, cursor| cursor.user_id.as_deref() != user_id),
        }
        self.count_for(user_id)
    }

    pub fn count_for(&self, user_id: Option<&str>) -> usize {
        self.cursors
            .iter()
            .filter(|entry| entry.user_id.as_deref() == user_id)
            .count()
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    /// Drop cursors idle for longer than the configured ttl
    pub fn reclaim_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.cursors.len();
        self.cursors.retain(|_, cursor| !cursor.is_expired(now, self.ttl));
        let reclaimed = before.saturating_sub(self.cursors.len());
        if reclaimed > 0 {
            tracing::debug!(reclaimed, "reclaimed expired cursors");
        }
        reclaimed
    }
}
