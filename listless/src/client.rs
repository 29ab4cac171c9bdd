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

//! Blocking IMAP inbox client.
//!
//! The delivery loop wants exactly one primitive: "give me the oldest
//! unseen message, if any". The session is established lazily and thrown
//! away on any error, so the next poll starts from a clean reconnect.

use std::net::TcpStream;

use native_tls::TlsStream;

use crate::{config::Configuration, errors::*};

type Session = imap::Session<TlsStream<TcpStream>>;

/// A lazily connected IMAP client for one account's `INBOX`.
pub struct ImapClient {
    host: String,
    port: u16,
    username: String,
    password: String,
    session: Option<Session>,
}

impl std::fmt::Debug for ImapClient {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("ImapClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("connected", &self.session.is_some())
            .finish()
    }
}

impl ImapClient {
    /// A client for the configured IMAP account. No connection is made
    /// until the first fetch.
    pub fn new(config: &Configuration) -> Self {
        Self {
            host: config.imap_host.clone(),
            port: config.imap_port,
            username: config.imap_username.clone(),
            password: config.imap_password.clone(),
            session: None,
        }
    }

    fn connect(&self) -> Result<Session> {
        let tls = native_tls::TlsConnector::builder()
            .build()
            .chain_err(|| "Could not build a TLS connector for IMAP.")?;
        // Port 993 is implicit TLS; everything else is expected to upgrade
        // with STARTTLS.
        let client = if self.port == 993 {
            imap::connect((self.host.as_str(), self.port), self.host.as_str(), &tls)?
        } else {
            imap::connect_starttls((self.host.as_str(), self.port), self.host.as_str(), &tls)?
        };
        let mut session = client
            .login(self.username.as_str(), self.password.as_str())
            .map_err(|err| err.0)?;
        session.select("INBOX")?;
        log::info!("Connected to IMAP inbox at {}:{}.", self.host, self.port);
        Ok(session)
    }

    fn session(&mut self) -> Result<&mut Session> {
        if self.session.is_none() {
            self.session = Some(self.connect()?);
        }
        Ok(self.session.as_mut().expect("session was just established"))
    }

    /// Fetch the lowest-UID unseen message, or `None` when the inbox holds
    /// nothing new. The session is dropped on error so the next call
    /// reconnects.
    pub fn fetch_unseen(&mut self) -> Result<Option<(u32, Vec<u8>)>> {
        let result = self.fetch_unseen_inner();
        if result.is_err() {
            self.session = None;
        }
        result
    }

    fn fetch_unseen_inner(&mut self) -> Result<Option<(u32, Vec<u8>)>> {
        let session = self.session()?;
        let mut uids: Vec<u32> = session
            .uid_search("UNSEEN")
            .chain_err(|| ErrorKind::ImapFetchFailed)?
            .into_iter()
            .collect();
        uids.sort_unstable();
        let Some(&uid) = uids.first() else {
            return Ok(None);
        };
        let fetches = session
            .uid_fetch(uid.to_string(), "(UID RFC822)")
            .chain_err(|| ErrorKind::ImapFetchFailed)?;
        for fetch in fetches.iter() {
            if let Some(body) = fetch.body() {
                return Ok(Some((fetch.uid.unwrap_or(uid), body.to_vec())));
            }
        }
        log::warn!("IMAP fetch for uid {} returned no message body.", uid);
        Ok(None)
    }

    /// Flag a message as seen so the next poll skips it.
    pub fn mark_seen(&mut self, uid: u32) -> Result<()> {
        let session = self.session()?;
        session
            .uid_store(uid.to_string(), "+FLAGS (\\Seen)")
            .chain_err(|| ErrorKind::ImapFetchFailed)?;
        Ok(())
    }

    /// Log out and drop the session, if one is open.
    pub fn logout(&mut self) {
        if let Some(mut session) = self.session.take() {
            _ = session.logout();
        }
    }
}

impl Drop for ImapClient {
    fn drop(&mut self) {
        self.logout();
    }
}
