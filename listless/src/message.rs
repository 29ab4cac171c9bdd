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

//! The mutable message object handed to handler scripts.
//!
//! A [`Message`] wraps one parsed RFC 5322 message together with an
//! augmented recipient roster: the ordered `To`/`Cc`/`Bcc` sequences plus
//! the `in_recipient_lists` set that keeps them globally disjoint. Every
//! address enters the roster through
//! [`normalise_email`](crate::addresses::normalise_email), so the sequences
//! never hold two spellings of one mailbox.

use std::collections::HashSet;

use melib::HeaderName;

use crate::{
    addresses::{normalise_email, parse_expressive, split_address_list},
    errors::*,
};

/// A parsed inbound message plus its recipient roster.
#[derive(Debug, Clone, Default)]
pub struct Message {
    from: String,
    sender: String,
    subject: String,
    to: Vec<String>,
    cc: Vec<String>,
    bcc: Vec<String>,
    in_recipient_lists: HashSet<String>,
    /// Remaining headers in arrival order. Names compare case-insensitively.
    headers: Vec<(String, String)>,
    text: String,
}

impl Message {
    /// Parse raw message bytes into a scriptable message. The roster is
    /// normalised during construction.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let env = melib::Envelope::from_bytes(raw, None)?;
        let mut headers = Vec::new();
        let mut from = String::new();
        for (name, value) in env.other_headers().iter() {
            match name.as_str().to_lowercase().as_str() {
                "from" => from = value.to_string(),
                // Recipients come from the parsed address lists below and
                // the subject from its decoded accessor.
                "to" | "cc" | "bcc" | "subject" => {}
                _ => headers.push((name.as_str().to_string(), value.to_string())),
            }
        }
        let stringify = |addresses: &[melib::Address]| -> Vec<String> {
            addresses.iter().map(|address| address.to_string()).collect()
        };
        let to = stringify(env.to());
        let cc = stringify(env.cc());
        let bcc = stringify(env.bcc());
        let mut message = Self {
            sender: parse_expressive(&from).unwrap_or_default(),
            from,
            subject: env.subject().to_string(),
            to,
            cc,
            bcc,
            in_recipient_lists: HashSet::new(),
            headers,
            text: env.body_bytes(raw).text(melib::attachment_types::Text::Plain),
        };
        message.normalise_recipients();
        Ok(message)
    }

    /// The raw `From` header value, display name and all.
    pub fn from_header(&self) -> &str {
        &self.from
    }

    /// Replace the `From` header value and re-derive [`Message::sender`].
    pub fn set_from(&mut self, from: &str) {
        self.sender = parse_expressive(from).unwrap_or_default();
        self.from = from.to_string();
    }

    /// The canonical address derived from `From`; empty when `From` was
    /// unparseable.
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// The decoded `Subject` value.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Replace the `Subject` value.
    pub fn set_subject(&mut self, subject: &str) {
        self.subject = subject.to_string();
    }

    /// The ordered `To` sequence.
    pub fn to(&self) -> &[String] {
        &self.to
    }

    /// The ordered `Cc` sequence.
    pub fn cc(&self) -> &[String] {
        &self.cc
    }

    /// The ordered `Bcc` sequence.
    pub fn bcc(&self) -> &[String] {
        &self.bcc
    }

    /// The roster set: the union of the three sequences.
    pub fn recipient_set(&self) -> &HashSet<String> {
        &self.in_recipient_lists
    }

    /// The plain-text body. Encoding-naive: this is the text body, not any
    /// HTML alternative.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Replace the plain-text body.
    pub fn set_text(&mut self, text: &str) {
        self.text = text.to_string();
    }

    /// First value of the named header, or the empty string.
    pub fn get_header(&self, key: &str) -> String {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.clone())
            .unwrap_or_default()
    }

    /// Append a header value, keeping any existing values for the key.
    pub fn add_header(&mut self, key: &str, value: &str) {
        self.headers.push((key.to_string(), value.to_string()));
    }

    /// Replace all values of the key with one value.
    pub fn set_header(&mut self, key: &str, value: &str) {
        self.del_header(key);
        self.headers.push((key.to_string(), value.to_string()));
    }

    /// Remove all values of the key. Removing an absent key is a no-op.
    pub fn del_header(&mut self, key: &str) {
        self.headers.retain(|(name, _)| !name.eq_ignore_ascii_case(key));
    }

    /// Add an address to the `To` sequence. The address is normalised
    /// first; addresses already anywhere in the roster are skipped, so the
    /// three sequences stay disjoint.
    pub fn add_to_recipient(&mut self, address: &str) {
        let address = normalise_email(address);
        if address.is_empty() {
            return;
        }
        if self.in_recipient_lists.insert(address.clone()) {
            self.to.push(address);
        }
    }

    /// Add an address to the `Cc` sequence; same rules as
    /// [`Message::add_to_recipient`].
    pub fn add_cc_recipient(&mut self, address: &str) {
        let address = normalise_email(address);
        if address.is_empty() {
            return;
        }
        if self.in_recipient_lists.insert(address.clone()) {
            self.cc.push(address);
        }
    }

    /// Add an address to the `Bcc` sequence; same rules as
    /// [`Message::add_to_recipient`].
    pub fn add_bcc_recipient(&mut self, address: &str) {
        let address = normalise_email(address);
        if address.is_empty() {
            return;
        }
        if self.in_recipient_lists.insert(address.clone()) {
            self.bcc.push(address);
        }
    }

    /// The canonical way to add a subscriber: a shortcut for
    /// [`Message::add_bcc_recipient`].
    pub fn add_recipient(&mut self, address: &str) {
        self.add_bcc_recipient(address);
    }

    /// [`Message::add_recipient`] over a whole list.
    pub fn add_recipient_list<I, S>(&mut self, addresses: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for address in addresses {
            self.add_recipient(address.as_ref());
        }
    }

    /// Remove an address from whichever sequence holds it. `To` is walked
    /// first, then `Cc`, then `Bcc`; by the disjointness invariant at most
    /// one of them contains it. Removing an unknown address is a no-op.
    pub fn remove_recipient(&mut self, address: &str) {
        let address = normalise_email(address);
        if !self.in_recipient_lists.remove(&address) {
            return;
        }
        for sequence in [&mut self.to, &mut self.cc, &mut self.bcc] {
            if let Some(pos) = sequence.iter().position(|a| *a == address) {
                sequence.remove(pos);
                return;
            }
        }
    }

    /// Empty all three sequences and the roster set.
    pub fn clear_recipients(&mut self) {
        self.to.clear();
        self.cc.clear();
        self.bcc.clear();
        self.in_recipient_lists.clear();
    }

    /// Re-derive the roster from the raw sequences: split comma-joined
    /// entries, reduce expressive forms to canonical addresses, and drop
    /// duplicates in `To`, `Cc`, `Bcc` order. Each sequence is replaced
    /// wholesale by its freshly parsed list. Unparseable entries are
    /// dropped with a logged warning.
    pub fn normalise_recipients(&mut self) {
        self.in_recipient_lists.clear();
        for (field, mut entries) in [
            ("To", std::mem::take(&mut self.to)),
            ("Cc", std::mem::take(&mut self.cc)),
            ("Bcc", std::mem::take(&mut self.bcc)),
        ] {
            let mut fresh = Vec::with_capacity(entries.len());
            for entry in entries.drain(..) {
                for segment in split_address_list(&entry) {
                    match parse_expressive(&segment) {
                        Ok(address) => {
                            if self.in_recipient_lists.insert(address.clone()) {
                                fresh.push(address);
                            } else {
                                log::trace!("Skipping already-seen recipient {}", address);
                            }
                        }
                        Err(err) => {
                            log::warn!("Dropping {} recipient entry {:?}: {}", field, segment, err);
                        }
                    }
                }
            }
            match field {
                "To" => self.to = fresh,
                "Cc" => self.cc = fresh,
                _ => self.bcc = fresh,
            }
        }
    }

    /// The merged send-to list: the roster minus the excluded addresses
    /// (compared in normalised form), in `To`, `Cc`, `Bcc` order.
    pub fn send_list(&self, exclude: &[&str]) -> Vec<String> {
        let excluded: HashSet<String> = exclude
            .iter()
            .map(|a| normalise_email(a))
            .filter(|a| !a.is_empty())
            .collect();
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .filter(|a| !excluded.contains(*a))
            .cloned()
            .collect()
    }

    /// Serialise the message for submission. `Bcc` never appears in the
    /// wire form; blind recipients only show up in the SMTP envelope.
    pub fn to_draft(&self) -> melib::Draft {
        let mut draft = melib::Draft::default();
        draft.headers.insert(
            HeaderName::try_from("From").unwrap(),
            self.from.clone(),
        );
        draft.headers.insert(
            HeaderName::try_from("Subject").unwrap(),
            self.subject.clone(),
        );
        draft
            .headers
            .insert(HeaderName::try_from("To").unwrap(), self.to.join(", "));
        if !self.cc.is_empty() {
            draft
                .headers
                .insert(HeaderName::try_from("Cc").unwrap(), self.cc.join(", "));
        }
        for (name, value) in &self.headers {
            match HeaderName::try_from(name.as_str()) {
                Ok(header) => {
                    draft.headers.insert(header, value.clone());
                }
                Err(err) => {
                    log::warn!("Skipping unserialisable header {:?}: {}", name, err);
                }
            }
        }
        draft.body = self.text.clone();
        draft
    }

    /// Submit the message over SMTP to the merged recipient list minus
    /// `exclude`. Fails with
    /// [`ErrorKind::MissingRecipients`](crate::ErrorKind::MissingRecipients)
    /// when the computed list is empty.
    pub fn send(&self, smtp_conf: melib::smtp::SmtpServerConf, exclude: &[&str]) -> Result<()> {
        use melib::{futures, smol, smtp::SmtpConnection};

        let send_list = self.send_list(exclude);
        if self.from.is_empty() || send_list.is_empty() {
            return Err(ErrorKind::MissingRecipients.into());
        }
        let recipients: Vec<melib::Address> = send_list
            .iter()
            .map(|address| melib::Address::new(None, address.clone()))
            .collect();
        let mut draft = self.to_draft();
        let raw = draft.finalise()?;
        let mut conn = smol::future::block_on(smol::spawn(SmtpConnection::new_connection(
            smtp_conf,
        )))
        .chain_err(|| ErrorKind::SmtpSubmitFailed)?;
        futures::executor::block_on(conn.mail_transaction(&raw, Some(&recipients)))
            .chain_err(|| ErrorKind::SmtpSubmitFailed)?;
        Ok(())
    }
}
