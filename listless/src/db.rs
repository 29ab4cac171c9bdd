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

//! The backing store and its logical buckets.
//!
//! One SQLite file holds the member roster, the script-visible key/value
//! buckets and the transaction table. Scripts never see this handle; they
//! get the façade types in [`crate::scripting`], whose method sets are the
//! capability whitelists.

use std::path::Path;

use log::info;
use rusqlite::Connection as DbConnection;

use crate::errors::*;

mod kv;
mod members;
mod transactions;

pub use kv::KvStore;
pub use members::RosterEdit;

/// A handle to the backing store.
pub struct Database {
    /// The `rusqlite` connection handle.
    pub(crate) connection: DbConnection,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Database").finish()
    }
}

fn log_callback(error_code: std::ffi::c_int, message: &str) {
    match error_code {
        rusqlite::ffi::SQLITE_NOTICE => log::trace!("{}", message),
        rusqlite::ffi::SQLITE_WARNING => log::warn!("{}", message),
        _ => log::error!("{error_code} {}", message),
    }
}

impl Database {
    /// The database schema.
    ///
    /// ```sql
    #[doc = include_str!("./schema.sql")]
    /// ```
    pub const SCHEMA: &'static str = include_str!("./schema.sql");

    /// Open an existing store. Fails when the file or any of the required
    /// buckets is missing.
    pub fn open_db<P: AsRef<Path>>(path: P) -> Result<Self> {
        use std::sync::Once;

        static INIT_SQLITE_LOGGING: Once = Once::new();

        let path = path.as_ref();
        if !path.exists() {
            return Err("Database doesn't exist".into());
        }
        INIT_SQLITE_LOGGING.call_once(|| {
            _ = unsafe { rusqlite::trace::config_log(Some(log_callback)) };
        });
        let conn = DbConnection::open(path)
            .chain_err(|| format!("sqlite3 library could not open {}.", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "on")?;
        // synchronise less often to the filesystem
        conn.pragma_update(None, "synchronous", "normal")?;
        conn.busy_timeout(core::time::Duration::from_millis(500))?;
        conn.busy_handler(Some(|times: i32| -> bool { times < 5 }))?;
        let db = Self { connection: conn };
        db.check_buckets()?;
        Ok(db)
    }

    /// Create the store file (mode 0600) and apply the schema if it does
    /// not exist yet, then open it.
    pub fn open_or_create_db<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            use std::os::unix::fs::PermissionsExt;

            info!("Creating database in {}", path.display());
            let file = std::fs::File::create(path)
                .chain_err(|| format!("Could not create database file {}.", path.display()))?;
            let metadata = file
                .metadata()
                .chain_err(|| format!("Could not fstat database {}.", path.display()))?;
            let mut permissions = metadata.permissions();

            permissions.set_mode(0o600); // Read/write for owner only.
            file.set_permissions(permissions)
                .chain_err(|| format!("Could not chmod 600 database {}.", path.display()))?;

            let conn = DbConnection::open(path)?;
            conn.execute_batch(Self::SCHEMA).chain_err(|| {
                format!("Could not apply schema to database {}.", path.display())
            })?;
        }
        Self::open_db(path)
    }

    /// Verify that every required bucket is present, so lookups can assume
    /// the tables exist.
    fn check_buckets(&self) -> Result<()> {
        for (table, missing) in [
            ("member", ErrorKind::MemberBucketNotFound),
            ("kv_bucket", ErrorKind::KvBucketNotFound),
            ("kv_entry", ErrorKind::KvBucketNotFound),
            ("mail_transaction", ErrorKind::TransactionBucketNotFound),
        ] {
            let found: bool = self.connection.query_row(
                "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?);",
                [table],
                |row| row.get(0),
            )?;
            if !found {
                return Err(missing.into());
            }
        }
        Ok(())
    }

    /// Execute operations inside a named SQL savepoint. The savepoint rolls
    /// back when dropped without [`Savepoint::commit`].
    pub fn savepoint(&self, name: Option<&'static str>) -> Result<Savepoint<'_>> {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static COUNTER: AtomicUsize = AtomicUsize::new(0);

        let name = name
            .map(Ok)
            .unwrap_or_else(|| Err(COUNTER.fetch_add(1, Ordering::Relaxed)));
        match name {
            Ok(ref n) => self.connection.execute_batch(&format!("SAVEPOINT {n}"))?,
            Err(ref i) => self.connection.execute_batch(&format!("SAVEPOINT _{i}"))?,
        };
        Ok(Savepoint {
            db: self,
            name,
            committed: false,
        })
    }
}

/// A savepoint handle; rolls its changes back on drop unless committed.
#[derive(Debug)]
pub struct Savepoint<'conn> {
    db: &'conn Database,
    name: std::result::Result<&'static str, usize>,
    committed: bool,
}

impl Drop for Savepoint<'_> {
    fn drop(&mut self) {
        if !self.committed {
            _ = self.rollback_();
        }
    }
}

impl Savepoint<'_> {
    /// Commit and consume the savepoint.
    pub fn commit(mut self) -> Result<()> {
        match self.name {
            Ok(ref n) => self
                .db
                .connection
                .execute_batch(&format!("RELEASE SAVEPOINT {n}"))?,
            Err(ref i) => self
                .db
                .connection
                .execute_batch(&format!("RELEASE SAVEPOINT _{i}"))?,
        };
        self.committed = true;
        Ok(())
    }

    /// A convenience method which consumes and rolls back the savepoint.
    pub fn rollback(mut self) -> Result<()> {
        let ret = self.rollback_();
        self.committed = true;
        ret
    }

    fn rollback_(&self) -> Result<()> {
        match self.name {
            Ok(ref n) => self.db.connection.execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT {n}; RELEASE SAVEPOINT {n}"
            ))?,
            Err(ref i) => self.db.connection.execute_batch(&format!(
                "ROLLBACK TO SAVEPOINT _{i}; RELEASE SAVEPOINT _{i}"
            ))?,
        };
        Ok(())
    }
}

impl std::ops::Deref for Savepoint<'_> {
    type Target = Database;

    #[inline]
    fn deref(&self) -> &Database {
        self.db
    }
}
