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

//! Library error chain.

// Create the Error, ErrorKind, ResultExt, and Result types
error_chain! {
    errors {
        /// Normalisation produced the empty string.
        InvalidEmail {
            description("invalid email address")
            display("Invalid email given, cannot derive a canonical address")
        }
        /// A header entry could not be reduced to a plain address.
        Unparseable(entry: String) {
            description("unparseable address entry")
            display("Entry {:?} is neither a simple (foo@bar.com) nor an expressive (Foo Bar <foo@bar.com>) address", entry)
        }
        /// The member bucket is missing from the backing store.
        MemberBucketNotFound {
            description("member bucket not found")
            display("The backing store has no member bucket; was it initialised by another program?")
        }
        /// The transaction bucket is missing from the backing store.
        TransactionBucketNotFound {
            description("transaction bucket not found")
            display("The backing store has no transaction bucket; was it initialised by another program?")
        }
        /// The key/value parent bucket is missing from the backing store.
        KvBucketNotFound {
            description("key/value bucket not found")
            display("The backing store has no key/value buckets; was it initialised by another program?")
        }
        /// Member lookup miss, distinct from a malformed address.
        MemberEntryNotFound {
            description("member entry not found")
            display("No member entry found for the provided address")
        }
        /// A transaction is missing required fields.
        TransactionNotReady {
            description("transaction missing required fields")
            display("Transaction does not have all required fields (script name and hook)")
        }
        /// A transaction's expiry is in the past.
        ExpiredTransaction {
            description("transaction expired")
            display("This transaction has expired and cannot be used")
        }
        /// No transaction stored under the hashed secret.
        TransactionNotFound {
            description("transaction not found")
            display("Provided transaction secret did not yield a transaction; nonexistent, or expired and cleared out?")
        }
        /// The triggering sender is not in the transaction's permitted set.
        SenderNotPermitted {
            description("sender not permitted")
            display("The message sender is not permitted to trigger this transaction")
        }
        /// The handler's second return value was absent or not a boolean.
        OkNotBoolean {
            description("handler 'ok' value not boolean")
            display("'ok' value returned from the eventLoop handler is not a boolean")
        }
        /// The handler's third return value was neither a string nor unit.
        ErrValNotStringOrNil {
            description("handler 'error' value not string or nil")
            display("'error' value returned from the eventLoop handler is neither a string nor nil")
        }
        /// The computed send-to list was empty.
        MissingRecipients {
            description("no recipients")
            display("Must specify at least one From address and one recipient")
        }
        /// A script failed to load or evaluate.
        Script(msg: String) {
            description("script error")
            display("Script error: {}", msg)
        }
        /// Fetching from the IMAP inbox failed.
        ImapFetchFailed {
            description("IMAP fetch failed")
            display("Could not fetch mail from the IMAP inbox")
        }
        /// Submitting to the SMTP server failed.
        SmtpSubmitFailed {
            description("SMTP submission failed")
            display("Could not submit outgoing mail over SMTP")
        }
        /// An inbound message could not be parsed.
        ParseFailed {
            description("message parse failed")
            display("Received mail but failed to parse it")
        }
    }
    foreign_links {
        Sql(rusqlite::Error);
        Io(::std::io::Error);
        Melib(melib::error::Error);
        Imap(imap::error::Error);
        SerdeJson(serde_json::Error);
    }
}

// rhai's boxed error value does not fit foreign_links, so route it into the
// Script kind by hand.
impl From<Box<rhai::EvalAltResult>> for Error {
    fn from(err: Box<rhai::EvalAltResult>) -> Self {
        ErrorKind::Script(err.to_string()).into()
    }
}
