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

//! Shared test support: a loopback SMTP server that records everything
//! submitted to it.

#![allow(dead_code)]

use std::{
    net::{IpAddr, ToSocketAddrs},
    sync::{Arc, Mutex, Once},
    thread,
};

use listless::melib;
use mailin_embedded::{
    response::{INTERNAL_ERROR, OK},
    Handler, Response, Server, SslConfig,
};

static INIT_STDERR_LOGGING: Once = Once::new();

pub fn init_stderr_logging() {
    INIT_STDERR_LOGGING.call_once(|| {
        stderrlog::new()
            .quiet(false)
            .verbosity(15)
            .show_module_names(true)
            .timestamp(stderrlog::Timestamp::Millisecond)
            .init()
            .unwrap();
    });
}

#[derive(Debug, Clone)]
pub enum Message {
    Helo,
    Mail {
        from: String,
    },
    Rcpt {
        from: String,
        to: Vec<String>,
    },
    DataStart {
        from: String,
        to: Vec<String>,
    },
    Data {
        from: String,
        to: Vec<String>,
        buf: Vec<u8>,
    },
}

/// Records one `(rcpt, envelope)` pair per accepted recipient.
#[derive(Debug, Clone)]
pub struct TestSmtpHandler {
    address: String,
    pub messages: Arc<Mutex<Vec<((IpAddr, String), Message)>>>,
    pub stored: Arc<Mutex<Vec<(String, melib::Envelope)>>>,
}

impl Handler for TestSmtpHandler {
    fn helo(&mut self, ip: IpAddr, domain: &str) -> Response {
        self.messages
            .lock()
            .unwrap()
            .push(((ip, domain.to_string()), Message::Helo));
        OK
    }

    fn mail(&mut self, ip: IpAddr, domain: &str, from: &str) -> Response {
        if let Some((_, message)) = self
            .messages
            .lock()
            .unwrap()
            .iter_mut()
            .rev()
            .find(|((i, d), _)| (i, d.as_str()) == (&ip, domain))
        {
            if let Message::Helo = &message {
                *message = Message::Mail {
                    from: from.to_string(),
                };
                return OK;
            }
        }
        INTERNAL_ERROR
    }

    fn rcpt(&mut self, to: &str) -> Response {
        if let Some((_, message)) = self.messages.lock().unwrap().last_mut() {
            if let Message::Mail { from } = message {
                *message = Message::Rcpt {
                    from: from.clone(),
                    to: vec![to.to_string()],
                };
                return OK;
            } else if let Message::Rcpt { to: tos, .. } = message {
                tos.push(to.to_string());
                return OK;
            }
        }
        INTERNAL_ERROR
    }

    fn data_start(&mut self, domain: &str, _from: &str, _is8bit: bool, _to: &[String]) -> Response {
        if let Some(((_, d), ref mut message)) = self.messages.lock().unwrap().last_mut() {
            if d != domain {
                return INTERNAL_ERROR;
            }
            if let Message::Rcpt { from, to } = message {
                *message = Message::DataStart {
                    from: from.to_string(),
                    to: to.to_vec(),
                };
                return OK;
            }
        }
        INTERNAL_ERROR
    }

    fn data(&mut self, buf: &[u8]) -> Result<(), std::io::Error> {
        if let Some((_, ref mut message)) = self.messages.lock().unwrap().last_mut() {
            if let Message::DataStart { from, to } = message {
                *message = Message::Data {
                    from: from.to_string(),
                    to: to.clone(),
                    buf: buf.to_vec(),
                };
                return Ok(());
            } else if let Message::Data { buf: stored, .. } = message {
                stored.extend(buf.iter());
                return Ok(());
            }
        }
        Ok(())
    }

    fn data_end(&mut self) -> Response {
        let last = self.messages.lock().unwrap().pop();
        if let Some(((ip, domain), Message::Data { from: _, to, buf })) = last {
            for to in to {
                match melib::Envelope::from_bytes(&buf, None) {
                    Ok(env) => {
                        self.stored.lock().unwrap().push((to.clone(), env));
                    }
                    Err(err) => {
                        panic!("envelope parse error {}", err);
                    }
                }
            }
            self.messages
                .lock()
                .unwrap()
                .push(((ip, domain), Message::Helo));
            return OK;
        }
        panic!("last self.messages item was not Message::Data: {last:?}");
    }
}

impl TestSmtpHandler {
    /// Spawn a recording SMTP server on `address` and return its handle.
    pub fn new(address: &str) -> Self {
        init_stderr_logging();
        let handler = Self {
            address: address.to_string(),
            messages: Arc::new(Mutex::new(vec![])),
            stored: Arc::new(Mutex::new(vec![])),
        };
        let handler2 = handler.clone();
        let _smtp_handle = thread::spawn(move || {
            let address = handler2.address.clone();
            let mut server = Server::new(handler2);
            let sockaddr = address.as_str().to_socket_addrs().unwrap().next().unwrap();
            eprintln!("Running smtp server at {}", sockaddr);
            server
                .with_name("example.com")
                .with_ssl(SslConfig::None)
                .unwrap()
                .with_addr(sockaddr)
                .unwrap();
            server.serve().expect("Could not run server");
        });
        handler
    }

    /// First value of the named header in a stored envelope.
    pub fn header_of(env: &melib::Envelope, name: &str) -> String {
        env.other_headers()
            .iter()
            .find(|(header, _)| header.as_str().eq_ignore_ascii_case(name))
            .map(|(_, value)| value.to_string())
            .unwrap_or_default()
    }
}
