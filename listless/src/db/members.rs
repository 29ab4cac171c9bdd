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

//! Member store operations.

use log::trace;
use rusqlite::OptionalExtension;

use super::Database;
use crate::{addresses::normalise_email, errors::*, models::Member};

/// What a [`Database::for_each_subscriber_rw`] callback wants done with the
/// entry it was shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterEdit {
    /// Leave the entry untouched.
    Keep,
    /// Delete the entry.
    Delete,
    /// Store `member` under `key`, deleting the old entry when the key
    /// differs.
    Store {
        /// Destination key; stored canonicalised.
        key: String,
        /// The record to write.
        member: Member,
    },
}

impl Database {
    /// Construct a new subscriber record. Nothing is persisted; pass the
    /// result to [`Database::update_subscriber`] to save it.
    pub fn create_subscriber(
        &self,
        email: &str,
        name: &str,
        allowed_post: bool,
        moderator: bool,
    ) -> Member {
        Member::new(email, name, allowed_post, moderator)
    }

    /// Normalise the address and fetch its subscriber record, if any.
    pub fn get_subscriber(&self, email: &str) -> Result<Member> {
        let email = normalise_email(email);
        if email.is_empty() {
            return Err(ErrorKind::InvalidEmail.into());
        }
        let value: Option<String> = self
            .connection
            .query_row(
                "SELECT value FROM member WHERE address = ?;",
                [&email],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            Some(value) => Ok(serde_json::from_str(&value)?),
            None => Err(ErrorKind::MemberEntryNotFound.into()),
        }
    }

    /// Upsert a subscriber record under the canonicalised address.
    pub fn update_subscriber(&self, email: &str, member: &Member) -> Result<()> {
        let email = normalise_email(email);
        if email.is_empty() {
            return Err(ErrorKind::InvalidEmail.into());
        }
        let value = serde_json::to_string(member)?;
        self.connection.execute(
            "INSERT INTO member(address, value) VALUES (?, ?) ON CONFLICT(address) DO UPDATE SET \
             value = excluded.value;",
            rusqlite::params![&email, &value],
        )?;
        trace!("update_subscriber {} {:?}.", email, member);
        Ok(())
    }

    /// Delete a subscriber. Deleting an absent address is not an error.
    pub fn del_subscriber(&self, email: &str) -> Result<()> {
        let email = normalise_email(email);
        if email.is_empty() {
            return Err(ErrorKind::InvalidEmail.into());
        }
        self.connection
            .execute("DELETE FROM member WHERE address = ?;", [&email])?;
        trace!("del_subscriber {}.", email);
        Ok(())
    }

    /// Whether the address belongs to a moderator. Unknown and malformed
    /// addresses are not moderators; lookup failures reduce to `false` with
    /// a logged cause.
    pub fn is_moderator(&self, email: &str) -> bool {
        match self.get_subscriber(email) {
            Ok(member) => member.moderator,
            Err(err) => {
                log::warn!("is_moderator({:?}) treated as false: {}", email, err);
                false
            }
        }
    }

    /// Whether the address may post. Same failure policy as
    /// [`Database::is_moderator`].
    pub fn is_allowed_post(&self, email: &str) -> bool {
        match self.get_subscriber(email) {
            Ok(member) => member.allowed_post,
            Err(err) => {
                log::warn!("is_allowed_post({:?}) treated as false: {}", email, err);
                false
            }
        }
    }

    /// All subscriber records, in key order. Callers wanting only
    /// moderators filter on [`Member::moderator`] themselves.
    pub fn subscribers(&self) -> Result<Vec<Member>> {
        let mut members = Vec::new();
        self.for_each_subscriber(|member| members.push(member.clone()))?;
        Ok(members)
    }

    /// Read-only iteration over the roster. Entries arrive in the store's
    /// key order, which is stable within one statement but is not insertion
    /// order.
    pub fn for_each_subscriber<F>(&self, mut view: F) -> Result<()>
    where
        F: FnMut(&Member),
    {
        let mut stmt = self
            .connection
            .prepare("SELECT address, value FROM member ORDER BY address;")?;
        let iter = stmt.query_map([], |row| {
            let address: String = row.get(0)?;
            let value: String = row.get(1)?;
            Ok((address, value))
        })?;
        for entry in iter {
            let (address, value) = entry?;
            match serde_json::from_str::<Member>(&value) {
                Ok(member) => view(&member),
                Err(err) => log::warn!("Skipping undecodable member entry {}: {}", address, err),
            }
        }
        Ok(())
    }

    /// Read-write iteration over the roster. The callback sees each entry
    /// and returns a [`RosterEdit`]; edits are collected during iteration
    /// and applied afterwards inside a single savepoint, so the iterated
    /// bucket is never mutated under the cursor. A [`RosterEdit::Store`]
    /// with a null-equivalent key rewrites the entry in place.
    pub fn for_each_subscriber_rw<F>(&self, mut update: F) -> Result<()>
    where
        F: FnMut(&str, &Member) -> RosterEdit,
    {
        let mut edits: Vec<(String, RosterEdit)> = Vec::new();
        {
            let mut stmt = self
                .connection
                .prepare("SELECT address, value FROM member ORDER BY address;")?;
            let iter = stmt.query_map([], |row| {
                let address: String = row.get(0)?;
                let value: String = row.get(1)?;
                Ok((address, value))
            })?;
            for entry in iter {
                let (address, value) = entry?;
                let member = match serde_json::from_str::<Member>(&value) {
                    Ok(member) => member,
                    Err(err) => {
                        log::warn!("Skipping undecodable member entry {}: {}", address, err);
                        continue;
                    }
                };
                let edit = update(&address, &member);
                if edit != RosterEdit::Keep {
                    edits.push((address, edit));
                }
            }
        }
        if edits.is_empty() {
            return Ok(());
        }
        let savepoint = self.savepoint(Some(stringify!(for_each_subscriber_rw)))?;
        for (old_key, edit) in edits {
            match edit {
                RosterEdit::Keep => {}
                RosterEdit::Delete => savepoint.del_subscriber(&old_key)?,
                RosterEdit::Store { key, member } => {
                    let key = if key.is_empty() { old_key.clone() } else { key };
                    if normalise_email(&key) != old_key {
                        savepoint.del_subscriber(&old_key)?;
                    }
                    savepoint.update_subscriber(&key, &member)?;
                }
            }
        }
        savepoint.commit()
    }
}
