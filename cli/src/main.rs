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

extern crate listless;
extern crate log;
extern crate stderrlog;

use error_chain::ChainedError;
use listless::{errors::*, Configuration, Database, Engine, Member};
use log::info;

mod args;
use args::*;

/// Quote a CSV field when it needs it.
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn run_app(opt: Opt) -> Result<()> {
    if opt.debug {
        println!("DEBUG: {:?}", &opt);
    }
    use Command::*;
    match opt.cmd {
        Loop { configfile } => {
            info!("Starting listless in loop mode. Hello!");
            let mut config = Configuration::from_file(&configfile)?;
            config.validate(true)?;
            config.resolve_smtp_ip()?;
            info!("Loading engine..");
            let mut engine = Engine::new(config)?;
            info!("Starting event loop.");
            engine.delivery_loop();
            info!("Exited delivery loop successfully, shutting down.");
        }
        Exec { configfile, scriptfile } => {
            info!("Starting listless in exec mode. Hello!");
            let config = Configuration::from_file(&configfile)?;
            config.validate(false)?;
            let engine = Engine::new(config)?;
            let source = std::fs::read_to_string(&scriptfile)
                .chain_err(|| format!("Could not read script {}.", scriptfile.display()))?;
            engine.exec_once(&source)?;
        }
        Sub { cmd } => {
            use SubCommand::*;
            match cmd {
                List { configfile } => {
                    let config = Configuration::from_file(&configfile)?;
                    config.validate(false)?;
                    let db = Database::open_or_create_db(&config.database)?;
                    println!("email,name,moderator,allowedPost");
                    db.for_each_subscriber(|member| {
                        println!(
                            "{},{},{},{}",
                            csv_field(&member.email),
                            csv_field(&member.name),
                            member.moderator,
                            member.allowed_post
                        );
                    })?;
                }
                Update {
                    configfile,
                    email,
                    name,
                    moderator,
                    can_post,
                } => {
                    let config = Configuration::from_file(&configfile)?;
                    config.validate(false)?;
                    let db = Database::open_or_create_db(&config.database)?;
                    let member = match db.get_subscriber(&email) {
                        Ok(mut existing) => {
                            if let Some(name) = name {
                                existing.name = name;
                            }
                            existing.moderator = moderator;
                            existing.allowed_post = can_post;
                            existing
                        }
                        Err(Error(ErrorKind::MemberEntryNotFound, _)) => {
                            Member::new(&email, name.as_deref().unwrap_or(""), can_post, moderator)
                        }
                        Err(err) => return Err(err),
                    };
                    db.update_subscriber(&email, &member)?;
                    println!("Updated subscriber {}", member.email);
                }
                Remove { configfile, email } => {
                    let config = Configuration::from_file(&configfile)?;
                    config.validate(false)?;
                    let db = Database::open_or_create_db(&config.database)?;
                    db.del_subscriber(&email)?;
                    println!("Removed subscriber {}", email);
                }
            }
        }
    }
    Ok(())
}

fn main() -> std::result::Result<(), i32> {
    let opt = Opt::parse();
    stderrlog::new()
        .module(module_path!())
        .module("listless")
        .quiet(opt.quiet)
        .verbosity(opt.verbose as usize)
        .timestamp(opt.ts.unwrap_or(stderrlog::Timestamp::Off))
        .init()
        .unwrap();
    if let Err(err) = run_app(opt) {
        println!("{}", err.display_chain());
        std::process::exit(-1);
    }
    Ok(())
}
