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

pub use std::path::PathBuf;

pub use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "listless",
    about = "scripted discussion-list driver over IMAP/SMTP",
    long_about = "A simple, rhai-scripted discussion/mailing list driver over IMAP/SMTP.",
    before_long_help = "GNU Affero version 3 or later <https://www.gnu.org/licenses/>",
    author,
    version
)]
pub struct Opt {
    /// Print logs.
    #[arg(short, long)]
    pub debug: bool,
    #[command(subcommand)]
    pub cmd: Command,
    /// Silence all output.
    #[arg(short, long)]
    pub quiet: bool,
    /// Verbose mode (-v, -vv, -vvv, etc).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
    /// Debug log timestamp (sec, ms, ns, none).
    #[arg(short, long)]
    pub ts: Option<stderrlog::Timestamp>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the mailing list delivery loop forever.
    Loop {
        /// Location of the configuration file.
        configfile: PathBuf,
    },
    /// Execute a script once in the context of a configuration file, with
    /// `config` and `database` globals. Useful for list setup and batch
    /// roster edits.
    Exec {
        /// Location of the configuration file.
        configfile: PathBuf,
        /// Location of the script to execute.
        scriptfile: PathBuf,
    },
    /// Subscriber management.
    Sub {
        #[command(subcommand)]
        cmd: SubCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum SubCommand {
    /// Print all subscribers as CSV (email,name,moderator,allowedPost).
    List {
        /// Location of the configuration file.
        configfile: PathBuf,
    },
    /// Create or update a subscriber.
    Update {
        /// Location of the configuration file.
        configfile: PathBuf,
        /// Subscriber e-mail address.
        #[arg(long)]
        email: String,
        /// Subscriber display name.
        #[arg(long)]
        name: Option<String>,
        /// Make the subscriber a moderator.
        #[arg(long)]
        moderator: bool,
        /// Allow the subscriber to post.
        #[arg(long = "can-post")]
        can_post: bool,
    },
    /// Delete a subscriber. Removing an unknown address is not an error.
    Remove {
        /// Location of the configuration file.
        configfile: PathBuf,
        /// Subscriber e-mail address.
        #[arg(long)]
        email: String,
    },
}
