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

//! The engine: poll, handle, send.
//!
//! One message at a time: fetch the oldest unseen message, parse it, drop
//! self-loops, normalise the roster, run the handler, and submit when the
//! handler says so. The inter-cycle sleeps are the loop's only backpressure:
//! `PollFrequency` after an empty poll or any error, `MessageFrequency`
//! after a successful send, none after a drop.

use std::{
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use error_chain::ChainedError;
use log::{error, info};

use crate::{
    client::ImapClient,
    config::Configuration,
    db::Database,
    errors::*,
    message::Message,
    scripting::{MessageHandle, ScriptHost},
};

/// The header every outbound message is stamped with; an inbound message
/// carrying it with our own list address is our own mail come back around.
pub const LOOP_HEADER: &str = "sent-from-listless";

/// What one delivery cycle did with the message it saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The inbox had nothing unseen.
    Empty,
    /// The message was our own outbound mail come back around.
    SelfLoop,
    /// The handler declined to send.
    Dropped,
    /// The message went out over SMTP.
    Sent,
}

/// The state and event looper that manages the account and list.
pub struct Engine {
    config: Configuration,
    db: Rc<Database>,
    host: ScriptHost,
    client: ImapClient,
    shutdown: Arc<AtomicBool>,
}

impl Engine {
    /// Build an engine from the given configuration: open (or create) the
    /// store and prepare the script host and IMAP client. The IMAP
    /// connection itself is made lazily on the first poll.
    pub fn new(config: Configuration) -> Result<Self> {
        let db = Rc::new(Database::open_or_create_db(&config.database)?);
        let host = ScriptHost::new(Rc::clone(&db), config.clone());
        let client = ImapClient::new(&config);
        Ok(Self {
            db,
            host,
            client,
            shutdown: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    /// The shared store handle.
    pub fn db(&self) -> &Rc<Database> {
        &self.db
    }

    /// A flag that interrupts [`Engine::delivery_loop`] between polls when
    /// set. Hand it to a signal handler.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run one-shot script source with `config` and `database` globals.
    pub fn exec_once(&self, source: &str) -> Result<()> {
        self.host.exec(source)
    }

    /// Poll-and-deliver until the shutdown flag is raised, then tear down
    /// the IMAP session.
    pub fn delivery_loop(&mut self) {
        let poll_pause = Duration::from_secs(self.config.poll_frequency);
        let message_pause = Duration::from_secs(self.config.message_frequency);
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let pause = match self.deliver_one() {
                Ok(Delivery::Sent) => Some(message_pause),
                Ok(Delivery::Empty) => Some(poll_pause),
                // Drops go straight back to polling.
                Ok(Delivery::SelfLoop) | Ok(Delivery::Dropped) => None,
                Err(err) => {
                    error!("Error during delivery cycle: {}", err.display_chain());
                    Some(poll_pause)
                }
            };
            if let Some(pause) = pause {
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                std::thread::sleep(pause);
            }
        }
        info!("Shutting down..");
        self.client.logout();
    }

    /// One poll cycle: fetch the oldest unseen message and push it through
    /// the pipeline. The message is flagged seen whatever the outcome, so
    /// a poison message cannot wedge the loop.
    pub fn deliver_one(&mut self) -> Result<Delivery> {
        let Some((uid, raw)) = self.client.fetch_unseen()? else {
            return Ok(Delivery::Empty);
        };
        let outcome = self.handle_bytes(&raw);
        if let Err(err) = self.client.mark_seen(uid) {
            error!("Could not flag uid {} as seen: {}", uid, err);
        }
        outcome.chain_err(|| format!("while handling message uid {}", uid))
    }

    /// The per-message pipeline, independent of IMAP bookkeeping: parse,
    /// self-loop check, roster normalisation, handler, submission.
    pub fn handle_bytes(&self, raw: &[u8]) -> Result<Delivery> {
        let message = match Message::from_bytes(raw) {
            Ok(message) => message,
            Err(err) => {
                error!(
                    "Received email but failed to parse: {}; body was {:?}",
                    err,
                    String::from_utf8_lossy(raw)
                );
                return Err(err).chain_err(|| ErrorKind::ParseFailed);
            }
        };
        // A sent-from-listless header matching our own list address means
        // this is the list's own outbound mail come back around.
        if message.get_header(LOOP_HEADER) == self.config.list_address {
            info!("Received mail with a {} header matching own. Ignoring.", LOOP_HEADER);
            return Ok(Delivery::SelfLoop);
        }
        info!("Received email addressed to {:?}", message.to());
        let handle = MessageHandle::new(message);
        handle.borrow_mut().normalise_recipients();
        info!("Loading user eventLoop script..");
        let verdict = self.host.run_event_loop(&handle)?;
        if let Some(report) = verdict.error {
            return Err(ErrorKind::Script(format!("eventLoop reported: {}", report)).into());
        }
        if !verdict.send {
            log::debug!("No error occurred, but not sending message on instruction from handler");
            return Ok(Delivery::Dropped);
        }
        let mut message = handle.borrow_mut();
        info!("Outgoing email with subject {:?}", message.subject());
        // Stamp the loop tag; some lists retain the "To: <list@address>"
        // header unchanged, so our own mail can legitimately come back.
        message.set_header(LOOP_HEADER, &self.config.list_address);
        message
            .send(self.config.smtp_conf(), &[self.config.list_address.as_str()])
            .chain_err(|| ErrorKind::SmtpSubmitFailed)?;
        info!("Sent message successfully; subject {:?}", message.subject());
        Ok(Delivery::Sent)
    }
}
