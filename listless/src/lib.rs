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

// `error_chain!` can recurse deeply
#![recursion_limit = "1024"]

//! Scriptable discussion-list engine.
//!
//! `listless` rides on an ordinary IMAP/SMTP mailbox: it polls the inbox
//! and, for every message found, runs an operator-authored rhai handler
//! that decides whether the message is bounced, dropped, or re-sent to the
//! list membership. Subscribers, script state and mail-triggered commands
//! live in one SQLite file.
//!
//! The interesting pieces:
//!
//! - [`engine::Engine`] — the poll → handle → send loop.
//! - [`message::Message`] — the mutable message object with its
//!   deduplicated `To`/`Cc`/`Bcc` roster.
//! - [`db::Database`] — members, key/value buckets and transactions.
//! - [`scripting::ScriptHost`] — the Privileged and Moderator sandboxes
//!   and their capability façades.

#[macro_use]
extern crate error_chain;
#[macro_use]
pub extern crate serde;

/// Date library
pub extern crate chrono;
/// Log
pub extern crate log;
/// Mail library
pub extern crate melib;
/// Script engine
pub extern crate rhai;
/// Sql library
pub extern crate rusqlite;
/// serde_json
pub extern crate serde_json;

pub mod addresses;
pub mod client;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod message;
pub mod models;
pub mod scripting;

pub use config::Configuration;
pub use db::{Database, KvStore, RosterEdit};
pub use engine::{Delivery, Engine, LOOP_HEADER};
pub use errors::*;
pub use message::Message;
pub use models::{MailTransaction, Member};
pub use scripting::{HandlerVerdict, MessageHandle, ModeratorDb, PrivilegedDb, ScriptHost};
