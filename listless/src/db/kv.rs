/*
 * This file is part of listless
 *
 * Copyright 2023 - The listless developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Script-visible key/value buckets.
//!
//! Scripts keep arbitrary persistent state in named string→string buckets.
//! A handle is cheap to clone; all clones share one `destroyed` flag, so
//! once a bucket is destroyed every surviving handle degrades to logged
//! no-ops instead of corrupting the store. Every mutating operation commits
//! before returning.

use std::{cell::Cell, rc::Rc};

use super::Database;
use crate::errors::*;

/// A handle to one named key/value bucket.
#[derive(Clone)]
pub struct KvStore {
    db: Rc<Database>,
    bucket_name: String,
    destroyed: Rc<Cell<bool>>,
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("KvStore")
            .field("bucket_name", &self.bucket_name)
            .field("destroyed", &self.destroyed.get())
            .finish()
    }
}

impl KvStore {
    /// Open or create the named bucket. Returns `None` (with a logged
    /// cause) only when the store rejects the bucket row.
    pub fn open(db: &Rc<Database>, bucket_name: &str) -> Option<Self> {
        match db.connection.execute(
            "INSERT OR IGNORE INTO kv_bucket(name) VALUES (?);",
            [bucket_name],
        ) {
            Ok(_) => Some(Self {
                db: Rc::clone(db),
                bucket_name: bucket_name.to_string(),
                destroyed: Rc::new(Cell::new(false)),
            }),
            Err(err) => {
                log::error!(
                    "Error creating KV store {:?} (returning nothing): {}",
                    bucket_name,
                    err
                );
                None
            }
        }
    }

    /// The bucket's name.
    pub fn bucket_name(&self) -> &str {
        &self.bucket_name
    }

    fn guard(&self, operation: &str) -> bool {
        if self.destroyed.get() {
            log::error!(
                "{} operation called on destroyed bucket: {}",
                operation,
                self.bucket_name
            );
            return false;
        }
        true
    }

    /// Store a string→string mapping, replacing any prior value.
    pub fn store(&self, key: &str, value: &str) {
        if !self.guard("Store") {
            return;
        }
        if let Err(err) = self.db.connection.execute(
            "INSERT INTO kv_entry(bucket, key, value) VALUES (?, ?, ?) ON CONFLICT(bucket, key) \
             DO UPDATE SET value = excluded.value;",
            rusqlite::params![&self.bucket_name, key, value],
        ) {
            log::error!("Error storing value in KV bucket: {}", err);
        }
    }

    /// The value stored under `key`, or the empty string when absent or on
    /// any failure (which is logged).
    pub fn retrieve(&self, key: &str) -> String {
        use rusqlite::OptionalExtension;

        if !self.guard("Retrieve") {
            return String::new();
        }
        let value: Result<Option<String>> = self
            .db
            .connection
            .query_row(
                "SELECT value FROM kv_entry WHERE bucket = ? AND key = ?;",
                rusqlite::params![&self.bucket_name, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::from);
        match value {
            Ok(value) => value.unwrap_or_default(),
            Err(err) => {
                log::error!(
                    "Error retrieving key from KV bucket (returning empty string): {}",
                    err
                );
                String::new()
            }
        }
    }

    /// Delete the value under `key`. Deleting an absent key is a no-op.
    pub fn delete(&self, key: &str) {
        if !self.guard("Delete") {
            return;
        }
        if let Err(err) = self.db.connection.execute(
            "DELETE FROM kv_entry WHERE bucket = ? AND key = ?;",
            rusqlite::params![&self.bucket_name, key],
        ) {
            log::error!("Error deleting key from KV bucket: {}", err);
        }
    }

    /// All keys currently in the bucket, in key order.
    pub fn keys(&self) -> Vec<String> {
        if !self.guard("Keys") {
            return Vec::new();
        }
        let keys = (|| -> Result<Vec<String>> {
            let mut stmt = self
                .db
                .connection
                .prepare("SELECT key FROM kv_entry WHERE bucket = ? ORDER BY key;")?;
            let iter = stmt.query_map([&self.bucket_name], |row| row.get::<_, String>(0))?;
            let mut keys = Vec::new();
            for key in iter {
                keys.push(key?);
            }
            Ok(keys)
        })();
        match keys {
            Ok(keys) => keys,
            Err(err) => {
                log::error!("Error iterating over keys in bucket to return key-list: {}", err);
                Vec::new()
            }
        }
    }

    /// Remove the bucket and its entries from the store, and mark every
    /// clone of this handle destroyed so later operations fail softly.
    pub fn destroy(&self) {
        self.destroyed.set(true);
        if let Err(err) = self
            .db
            .connection
            .execute("DELETE FROM kv_bucket WHERE name = ?;", [&self.bucket_name])
        {
            log::error!("Error destroying bucket: {}", err);
        }
    }
}
