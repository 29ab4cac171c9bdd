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

//! Transaction storage: hash-keyed, mail-triggered commands.
//!
//! Registration stores the SHA-256 of a caller-supplied secret, never the
//! secret itself; the plaintext travels inside a later inbound message and
//! is hashed in place to find the row again. Dispatching a found
//! transaction is the script runtime's business, see
//! [`crate::scripting`].

use chrono::{Duration, Utc};
use rusqlite::OptionalExtension;
use sha2::{Digest, Sha256};

use super::Database;
use crate::{errors::*, models::MailTransaction};

/// SHA-256 the secret to get the row key. Deliberately partitioned for
/// modularity; swap the digest here if it ever has to change.
fn hash_secret(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

impl Database {
    /// Validate and store a transaction under the hash of `secret`,
    /// expiring `valid_hours` from now. Fails with `TransactionNotReady`
    /// when script name or hook is missing and `ExpiredTransaction` when
    /// the validity window is not positive.
    pub fn register_transaction(
        &self,
        secret: &str,
        script_name: &str,
        script_hook: &str,
        ref_code: &str,
        permitted: Vec<String>,
        valid_hours: i64,
        persists: bool,
    ) -> Result<()> {
        let transaction = MailTransaction {
            ref_code: ref_code.to_string(),
            script_name: script_name.to_string(),
            script_hook: script_hook.to_string(),
            permitted,
            expires: Utc::now() + Duration::hours(valid_hours),
            persists,
        };
        self.put_transaction(secret, transaction)
    }

    /// Store a prepared transaction under the hash of `secret`.
    pub fn put_transaction(&self, secret: &str, mut transaction: MailTransaction) -> Result<()> {
        transaction.prepare()?;
        let value = serde_json::to_string(&transaction)?;
        self.connection.execute(
            "INSERT INTO mail_transaction(secret_hash, value, expires) VALUES (?, ?, ?) ON \
             CONFLICT(secret_hash) DO UPDATE SET value = excluded.value, expires = \
             excluded.expires;",
            rusqlite::params![
                hash_secret(secret).as_slice(),
                &value,
                transaction.expires.timestamp_millis()
            ],
        )?;
        log::trace!(
            "put_transaction {}::{} expires {}.",
            transaction.script_name,
            transaction.script_hook,
            transaction.expires
        );
        Ok(())
    }

    /// Pure lookup by secret. Expiry is the caller's problem; a stored but
    /// stale transaction is still returned.
    pub fn get_transaction(&self, secret: &str) -> Result<MailTransaction> {
        let value: Option<String> = self
            .connection
            .query_row(
                "SELECT value FROM mail_transaction WHERE secret_hash = ?;",
                [hash_secret(secret).as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            Some(value) => Ok(serde_json::from_str(&value)?),
            None => Err(ErrorKind::TransactionNotFound.into()),
        }
    }

    /// Whether a live (stored and unexpired) transaction exists under the
    /// secret, without triggering it.
    pub fn has_transaction(&self, secret: &str) -> bool {
        match self.get_transaction(secret) {
            Ok(transaction) => !transaction.is_expired(),
            Err(_) => false,
        }
    }

    /// Remove the transaction stored under the secret, if any.
    pub fn delete_transaction(&self, secret: &str) -> Result<()> {
        self.connection.execute(
            "DELETE FROM mail_transaction WHERE secret_hash = ?;",
            [hash_secret(secret).as_slice()],
        )?;
        Ok(())
    }

    /// Sweep every expired transaction row. Returns how many were removed.
    pub fn purge_expired_transactions(&self) -> Result<usize> {
        let removed = self.connection.execute(
            "DELETE FROM mail_transaction WHERE expires < ?;",
            [Utc::now().timestamp_millis()],
        )?;
        if removed > 0 {
            log::info!("Purged {} expired transactions.", removed);
        }
        Ok(removed)
    }
}
