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

//! Process configuration.
//!
//! The configuration file is a rhai script; every top-level `let` binding
//! becomes a key. Evaluating a script rather than parsing a static format
//! lets operators compute values (say, read a password from an environment
//! variable) and keeps the config surface identical to what handler scripts
//! see as their `config` global.

use std::{
    collections::HashMap,
    net::{IpAddr, ToSocketAddrs},
    path::{Path, PathBuf},
};

use crate::errors::*;

/// Static per-process configuration. Serde names match the config-file keys
/// so the same spelling works in the file, in scripts, and in logs.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Configuration {
    /// IMAP account user name.
    #[serde(rename = "IMAPUsername")]
    pub imap_username: String,
    /// IMAP account password.
    #[serde(rename = "IMAPPassword")]
    pub imap_password: String,
    /// IMAP server host name.
    #[serde(rename = "IMAPHost")]
    pub imap_host: String,
    /// IMAP server port; 993 uses implicit TLS, anything else STARTTLS.
    #[serde(rename = "IMAPPort")]
    pub imap_port: u16,
    /// SMTP account user name.
    #[serde(rename = "SMTPUsername")]
    pub smtp_username: String,
    /// SMTP account password.
    #[serde(rename = "SMTPPassword")]
    pub smtp_password: String,
    /// SMTP server host name.
    #[serde(rename = "SMTPHost")]
    pub smtp_host: String,
    /// SMTP server port; 465 uses implicit TLS, 587 STARTTLS.
    #[serde(rename = "SMTPPort")]
    pub smtp_port: u16,
    /// The single outbound IP of the SMTP host, recorded so operators can
    /// publish it in their SPF policy. Resolved from `SMTPHost` when unset.
    #[serde(rename = "SMTPIP")]
    pub smtp_ip: String,
    /// The list's own address: used as `Reply-To` by convention and as the
    /// self-loop tag value. Defaults to `SMTPUsername@SMTPHost`.
    #[serde(rename = "ListAddress")]
    pub list_address: String,
    /// Path of the backing store file.
    #[serde(rename = "Database")]
    pub database: PathBuf,
    /// Path of the delivery handler script, re-read on every message.
    #[serde(rename = "DeliverScript")]
    pub deliver_script: PathBuf,
    /// Seconds to sleep after a successful send.
    #[serde(rename = "MessageFrequency")]
    pub message_frequency: u64,
    /// Seconds to sleep after an empty poll or any error.
    #[serde(rename = "PollFrequency")]
    pub poll_frequency: u64,
    /// Free-form string constants passed through to scripts as
    /// `config.Constants`.
    #[serde(rename = "Constants")]
    pub constants: HashMap<String, String>,
}

/// Read a string binding, treating a missing or wrongly typed value as
/// absent.
fn string_or_default(scope: &rhai::Scope, name: &str, default: &str) -> String {
    scope
        .get_value::<String>(name)
        .unwrap_or_else(|| default.to_string())
}

/// Read an integer binding, falling back on wrong types and values outside
/// the port/seconds range.
fn int_or_default(scope: &rhai::Scope, name: &str, default: i64) -> i64 {
    match scope.get_value::<i64>(name) {
        Some(value) if value >= 0 => value,
        _ => default,
    }
}

impl Configuration {
    /// Evaluate the configuration script at `path` into a `Configuration`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .chain_err(|| format!("Configuration file {} not found.", path.display()))?;
        let engine = rhai::Engine::new();
        let mut scope = rhai::Scope::new();
        engine
            .run_with_scope(&mut scope, &source)
            .map_err(Error::from)
            .chain_err(|| {
                format!(
                    "Could not evaluate configuration file `{}` successfully: ",
                    path.display()
                )
            })?;
        Ok(Self::from_scope(&scope))
    }

    /// Assemble a `Configuration` from an evaluated scope, applying the
    /// documented defaults.
    pub fn from_scope(scope: &rhai::Scope) -> Self {
        let mut config = Self {
            imap_username: string_or_default(scope, "IMAPUsername", ""),
            imap_password: string_or_default(scope, "IMAPPassword", ""),
            imap_host: string_or_default(scope, "IMAPHost", ""),
            imap_port: int_or_default(scope, "IMAPPort", 143) as u16,
            smtp_username: string_or_default(scope, "SMTPUsername", ""),
            smtp_password: string_or_default(scope, "SMTPPassword", ""),
            smtp_host: string_or_default(scope, "SMTPHost", ""),
            smtp_port: int_or_default(scope, "SMTPPort", 465) as u16,
            smtp_ip: string_or_default(scope, "SMTPIP", ""),
            list_address: string_or_default(scope, "ListAddress", ""),
            database: string_or_default(scope, "Database", "").into(),
            deliver_script: string_or_default(scope, "DeliverScript", "").into(),
            message_frequency: int_or_default(scope, "MessageFrequency", 1) as u64,
            poll_frequency: int_or_default(scope, "PollFrequency", 60) as u64,
            constants: HashMap::new(),
        };
        if config.list_address.is_empty() {
            config.list_address = format!("{}@{}", config.smtp_username, config.smtp_host);
            log::info!(
                "Setting 'ListAddress' configuration option to {} as this field is required and \
                 must be reasonably unique. Set manually if incorrect.",
                config.list_address
            );
        }
        if let Some(constants) = scope.get_value::<rhai::Map>("Constants") {
            for (key, value) in constants {
                config.constants.insert(key.to_string(), value.to_string());
            }
        }
        config
    }

    /// `host:port` of the SMTP server.
    pub fn smtp_addr(&self) -> String {
        format!("{}:{}", self.smtp_host, self.smtp_port)
    }

    /// The submission server description used for every outbound message.
    /// PLAIN/LOGIN auth is offered when credentials are configured;
    /// transport security follows the port convention.
    pub fn smtp_conf(&self) -> melib::smtp::SmtpServerConf {
        use melib::smtp::*;

        SmtpServerConf {
            hostname: self.smtp_host.clone(),
            port: self.smtp_port,
            envelope_from: self.list_address.clone(),
            auth: if self.smtp_username.is_empty() {
                SmtpAuth::None
            } else {
                SmtpAuth::Auto {
                    username: self.smtp_username.clone(),
                    password: Password::Raw(self.smtp_password.clone()),
                    auth_type: Default::default(),
                    require_auth: true,
                }
            },
            security: match self.smtp_port {
                465 => SmtpSecurity::Tls {
                    danger_accept_invalid_certs: false,
                },
                587 => SmtpSecurity::StartTLS {
                    danger_accept_invalid_certs: false,
                },
                _ => SmtpSecurity::None,
            },
            extensions: Default::default(),
        }
    }

    /// Resolve and record the outbound SMTP IP when the operator has not
    /// pinned one. More than one distinct address is ambiguous and fatal:
    /// the operator must set `SMTPIP` so their SPF record stays honest.
    pub fn resolve_smtp_ip(&mut self) -> Result<()> {
        if !self.smtp_ip.is_empty() {
            return Ok(());
        }
        let mut ips: Vec<IpAddr> = self
            .smtp_addr()
            .to_socket_addrs()
            .chain_err(|| format!("Could not resolve SMTP host {}.", self.smtp_host))?
            .map(|addr| addr.ip())
            .collect();
        ips.sort();
        ips.dedup();
        match ips.as_slice() {
            [] => Err(format!("SMTP host {} resolved to no addresses.", self.smtp_host).into()),
            [single] => {
                self.smtp_ip = single.to_string();
                log::info!(
                    "Outbound SMTP IP is {}; publish it in the list domain's SPF record.",
                    self.smtp_ip
                );
                Ok(())
            }
            many => Err(format!(
                "SMTP host {} resolves to {} addresses ({:?}); set SMTPIP explicitly.",
                self.smtp_host,
                many.len(),
                many
            )
            .into()),
        }
    }

    /// Check the fields every mode needs, and with `loop_mode` also the
    /// fields the delivery loop needs. Failures here are fatal at startup.
    pub fn validate(&self, loop_mode: bool) -> Result<()> {
        if self.database.as_os_str().is_empty() {
            return Err("Configuration is missing the required 'Database' path.".into());
        }
        if !loop_mode {
            return Ok(());
        }
        for (key, value) in [
            ("IMAPUsername", &self.imap_username),
            ("IMAPPassword", &self.imap_password),
            ("IMAPHost", &self.imap_host),
            ("SMTPUsername", &self.smtp_username),
            ("SMTPPassword", &self.smtp_password),
            ("SMTPHost", &self.smtp_host),
        ] {
            if value.is_empty() {
                return Err(format!("Configuration is missing required field '{}'.", key).into());
            }
        }
        if self.deliver_script.as_os_str().is_empty() {
            return Err("Configuration is missing the required 'DeliverScript' path.".into());
        }
        Ok(())
    }
}
