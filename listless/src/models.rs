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

//! Database models: [`Member`] and [`MailTransaction`].

use chrono::{DateTime, Duration, DurationRound, TimeZone, Utc};

use crate::{addresses::normalise_email, errors::*, message::Message};

/// A subscriber record, stored as JSON under its canonical address.
///
/// `join_date` is a UTC timestamp, truncated to the hour on creation so it
/// carries no sub-hour fingerprint and can never lie in the future.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Member {
    /// Canonical e-mail address; the member store's primary key.
    pub email: String,
    /// Display name, may be empty.
    pub name: String,
    /// When the subscriber joined, UTC.
    pub join_date: DateTime<Utc>,
    /// Whether the subscriber can authorise moderator commands.
    pub moderator: bool,
    /// Whether the subscriber may post to the list.
    pub allowed_post: bool,
}

impl std::fmt::Display for Member {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "{} <{}> [moderator: {}, can post: {}]",
            self.name, self.email, self.moderator, self.allowed_post
        )
    }
}

impl Member {
    /// Construct a new subscriber record. Nothing is persisted; pass the
    /// result to the member store to save it.
    pub fn new(email: &str, name: &str, allowed_post: bool, moderator: bool) -> Self {
        let now = Utc::now();
        Self {
            email: email.to_string(),
            name: name.to_string(),
            join_date: now.duration_trunc(Duration::hours(1)).unwrap_or(now),
            moderator,
            allowed_post,
        }
    }

    /// Overwrite the join date with a manually chosen UTC hour. Months are
    /// indexed from 1. Out-of-range values leave the record unchanged and
    /// log a warning.
    pub fn set_join_date_utc(&mut self, year: i32, month: u32, day: u32, hour: u32) {
        match Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).single() {
            Some(date) => self.join_date = date,
            None => log::warn!(
                "Ignoring invalid join date {:04}-{:02}-{:02} {:02}:00 for {}",
                year,
                month,
                day,
                hour,
                self.email
            ),
        }
    }
}

/// A mail-triggered command, keyed in the store by the SHA-256 of a secret
/// the registering script ships out-of-band.
///
/// The secret itself is never persisted; it travels inside a later inbound
/// message and is hashed in place to look the transaction up again.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MailTransaction {
    /// Free-form reference the registering script can use to find its own
    /// state again, typically a key/value bucket key.
    pub ref_code: String,
    /// Path of the script holding the hook to dispatch to.
    pub script_name: String,
    /// Name of the hook function inside the script. One script can serve
    /// several transactions through differently named hooks.
    pub script_hook: String,
    /// Canonical sender addresses allowed to trigger this transaction.
    /// Empty means anyone may.
    pub permitted: Vec<String>,
    /// When the transaction stops being triggerable.
    pub expires: DateTime<Utc>,
    /// Whether the transaction survives being triggered.
    pub persists: bool,
}

impl MailTransaction {
    /// Check required fields and canonicalise the permitted senders before
    /// the transaction is inserted into the store.
    pub fn prepare(&mut self) -> Result<()> {
        if self.is_expired() {
            return Err(ErrorKind::ExpiredTransaction.into());
        }
        if self.script_hook.is_empty() || self.script_name.is_empty() {
            return Err(ErrorKind::TransactionNotReady.into());
        }
        for entry in self.permitted.iter_mut() {
            *entry = normalise_email(entry);
        }
        Ok(())
    }

    /// Whether the expiry instant has passed.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires
    }

    /// Whether the address may trigger this transaction. An empty permitted
    /// set admits any sender.
    pub fn is_permitted(&self, address: &str) -> bool {
        if self.permitted.is_empty() {
            return true;
        }
        let address = normalise_email(address);
        self.permitted.iter().any(|p| *p == address)
    }

    /// Both trigger preconditions at once: the sender is admissible and the
    /// transaction has not expired.
    pub fn validate(&self, message: &Message) -> bool {
        self.is_permitted(message.sender()) && !self.is_expired()
    }
}
