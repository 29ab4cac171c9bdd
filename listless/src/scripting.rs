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

//! The embedded rhai runtime and its two sandbox profiles.
//!
//! The *Privileged* sandbox runs the operator's delivery handler with the
//! full standard library and the broad database façade. The *Moderator*
//! sandbox runs mail-triggered transaction hooks with a reduced package set
//! and the narrow façade. Neither sandbox is a security boundary against a
//! malicious operator; both are boundaries against careless scripts.
//!
//! Capability whitelists are structural: each façade type registers exactly
//! its permitted methods on the engine and nothing else, so an
//! off-whitelist call fails inside the script and there is no reflective
//! path back to the raw store handle.

use std::{cell::RefCell, rc::Rc};

use rhai::{packages::Package, Dynamic, EvalAltResult};

use crate::{config::Configuration, db::Database, errors::*, message::Message, models::Member};

pub use crate::db::KvStore;

/// The handler contract's function name.
const EVENT_LOOP_FN: &str = "eventLoop";

/// The aggregate result of one `eventLoop` invocation: whether to submit
/// the (mutated) message, and the handler's own error report if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerVerdict {
    /// Second return value: submit the message?
    pub send: bool,
    /// Third return value: a handler-reported error, or `None`.
    pub error: Option<String>,
}

/// Shared-mutable handle to the [`Message`] under processing. Clones share
/// one underlying message, which is how script mutations become visible to
/// the engine after the call returns.
#[derive(Debug, Clone)]
pub struct MessageHandle(Rc<RefCell<Message>>);

impl MessageHandle {
    /// Wrap a message for one handler invocation.
    pub fn new(message: Message) -> Self {
        Self(Rc::new(RefCell::new(message)))
    }

    /// Immutable access to the wrapped message.
    pub fn borrow(&self) -> std::cell::Ref<'_, Message> {
        self.0.borrow()
    }

    /// Mutable access to the wrapped message.
    pub fn borrow_mut(&self) -> std::cell::RefMut<'_, Message> {
        self.0.borrow_mut()
    }
}

/// The broad database façade handed to the delivery handler.
#[derive(Clone)]
pub struct PrivilegedDb(pub(crate) Rc<Database>);

/// The narrow database façade handed to transaction hooks.
#[derive(Clone)]
pub struct ModeratorDb(pub(crate) Rc<Database>);

fn script_err(err: impl std::fmt::Display) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        err.to_string().into(),
        rhai::Position::NONE,
    ))
}

/// Owner of the interpreter configuration: builds sandboxes, runs the
/// delivery handler, one-shot scripts, and transaction hooks.
pub struct ScriptHost {
    db: Rc<Database>,
    config: Configuration,
}

impl ScriptHost {
    /// A host over the shared store and the process configuration.
    pub fn new(db: Rc<Database>, config: Configuration) -> Self {
        Self { db, config }
    }

    /// Load the delivery script from disk and run its `eventLoop` function
    /// against the message, validating the three-value return shape.
    ///
    /// The script file is re-read on every call, so operators can edit the
    /// handler without restarting the loop. Each invocation gets a fresh
    /// engine and scope; nothing leaks between messages.
    pub fn run_event_loop(&self, message: &MessageHandle) -> Result<HandlerVerdict> {
        let script_path = self.config.deliver_script.clone();
        let source = std::fs::read_to_string(&script_path)
            .chain_err(|| format!("Could not read deliver script {}.", script_path.display()))?;
        let engine = self.privileged_engine();
        let ast = engine
            .compile(&source)
            .map_err(|err| ErrorKind::Script(err.to_string()))?;
        let config = rhai::serde::to_dynamic(&self.config).map_err(Error::from)?;
        let database = PrivilegedDb(Rc::clone(&self.db));
        let mut scope = rhai::Scope::new();
        let result: Dynamic = engine
            .call_fn(
                &mut scope,
                &ast,
                EVENT_LOOP_FN,
                (config, database, message.clone()),
            )
            .map_err(Error::from)?;
        Self::verdict_from(result)
    }

    /// Validate the handler's return values. Only positions 2 and 3 are
    /// inspected; the returned message is position 1 by convention but the
    /// engine reads mutations through the shared handle instead.
    fn verdict_from(result: Dynamic) -> Result<HandlerVerdict> {
        let Some(parts) = result.try_cast::<rhai::Array>() else {
            return Err(ErrorKind::OkNotBoolean.into());
        };
        let errval = parts.get(2).cloned().unwrap_or(Dynamic::UNIT);
        let error = if errval.is_unit() {
            None
        } else {
            match errval.into_string() {
                Ok(message) => Some(message),
                Err(_) => return Err(ErrorKind::ErrValNotStringOrNil.into()),
            }
        };
        let send = parts
            .get(1)
            .cloned()
            .and_then(|okv| okv.try_cast::<bool>())
            .ok_or(ErrorKind::OkNotBoolean)?;
        Ok(HandlerVerdict { send, error })
    }

    /// Run a one-shot script with `config` and `database` globals in
    /// scope. `database` is the Privileged façade.
    pub fn exec(&self, source: &str) -> Result<()> {
        let engine = self.privileged_engine();
        let mut scope = rhai::Scope::new();
        scope.push_dynamic(
            "config",
            rhai::serde::to_dynamic(&self.config).map_err(Error::from)?,
        );
        scope.push("database", PrivilegedDb(Rc::clone(&self.db)));
        engine
            .run_with_scope(&mut scope, source)
            .map_err(Error::from)
    }

    /// Look up the transaction stored under `secret` and, when it is live
    /// and the message sender is admissible, dispatch its hook inside a
    /// Moderator sandbox with arguments `(database, message, refCode)`.
    ///
    /// Returns the hook's string result and the transaction's reference
    /// code. Unless the transaction persists, it is consumed by the first
    /// successful trigger; an expired transaction is removed on contact.
    pub fn trigger_transaction(
        &self,
        secret: &str,
        message: &MessageHandle,
    ) -> Result<(String, String)> {
        let transaction = self.db.get_transaction(secret)?;
        if transaction.is_expired() {
            if let Err(err) = self.db.delete_transaction(secret) {
                log::warn!("Could not clear expired transaction: {}", err);
            }
            return Err(ErrorKind::ExpiredTransaction.into());
        }
        let sender = message.borrow().sender().to_string();
        if !transaction.is_permitted(&sender) {
            return Err(ErrorKind::SenderNotPermitted.into());
        }
        let source = std::fs::read_to_string(&transaction.script_name).chain_err(|| {
            format!(
                "Could not read transaction script {}.",
                transaction.script_name
            )
        })?;
        let engine = self.moderator_engine()?;
        let ast = engine
            .compile(&source)
            .map_err(|err| ErrorKind::Script(err.to_string()))?;
        let mut scope = rhai::Scope::new();
        let database = ModeratorDb(Rc::clone(&self.db));
        let result: Dynamic = engine
            .call_fn(
                &mut scope,
                &ast,
                transaction.script_hook.as_str(),
                (database, message.clone(), transaction.ref_code.clone()),
            )
            .map_err(Error::from)?;
        let hook_result = if result.is_unit() {
            String::new()
        } else {
            result.into_string().unwrap_or_default()
        };
        if !transaction.persists {
            self.db.delete_transaction(secret)?;
        }
        Ok((hook_result, transaction.ref_code))
    }

    /// The full-library sandbox for operator-authored scripts.
    fn privileged_engine(&self) -> rhai::Engine {
        let mut engine = rhai::Engine::new();
        register_message_api(&mut engine);
        register_member_api(&mut engine);
        register_kv_api(&mut engine);
        register_privileged_db(&mut engine);
        self.register_transaction_globals(&mut engine);
        engine
    }

    /// The reduced sandbox for mail-triggered hooks: core language,
    /// strings, arrays, maps, math and time, but no key/value store, no
    /// roster enumeration, and no way to reach the raw store.
    fn moderator_engine(&self) -> Result<rhai::Engine> {
        use rhai::packages::{
            BasicArrayPackage, BasicMapPackage, BasicMathPackage, BasicTimePackage, CorePackage,
            MoreStringPackage,
        };

        let mut engine = rhai::Engine::new_raw();
        engine.register_global_module(CorePackage::new().as_shared_module());
        engine.register_global_module(MoreStringPackage::new().as_shared_module());
        engine.register_global_module(BasicArrayPackage::new().as_shared_module());
        engine.register_global_module(BasicMapPackage::new().as_shared_module());
        engine.register_global_module(BasicMathPackage::new().as_shared_module());
        engine.register_global_module(BasicTimePackage::new().as_shared_module());
        register_message_api(&mut engine);
        register_member_api(&mut engine);
        register_moderator_db(&mut engine);

        // An authentic by-value copy of the configuration, JSON-cycled so
        // the sandbox shares no mutable references with the engine.
        let json = serde_json::to_string(&self.config)?;
        let copy: Configuration = serde_json::from_str(&json)?;
        let config = rhai::serde::to_dynamic(&copy).map_err(Error::from)?;
        engine.on_var(move |name, _, _| {
            if name == "config" {
                Ok(Some(config.clone()))
            } else {
                Ok(None)
            }
        });
        Ok(engine)
    }

    /// Transaction registration and dispatch, exposed to the Privileged
    /// sandbox as free functions rather than façade methods.
    fn register_transaction_globals(&self, engine: &mut rhai::Engine) {
        let db = Rc::clone(&self.db);
        engine.register_fn(
            "RegisterTransaction",
            move |secret: &str,
                  script_name: &str,
                  script_hook: &str,
                  ref_code: &str,
                  permitted: rhai::Array,
                  valid_hours: i64,
                  persists: bool|
                  -> std::result::Result<(), Box<EvalAltResult>> {
                let permitted = permitted
                    .into_iter()
                    .map(|entry| entry.to_string())
                    .collect();
                db.register_transaction(
                    secret,
                    script_name,
                    script_hook,
                    ref_code,
                    permitted,
                    valid_hours,
                    persists,
                )
                .map_err(script_err)
            },
        );

        let db = Rc::clone(&self.db);
        engine.register_fn("HasTransaction", move |secret: &str| -> bool {
            db.has_transaction(secret)
        });

        let db = Rc::clone(&self.db);
        let config = self.config.clone();
        engine.register_fn(
            "TriggerTransaction",
            move |secret: &str,
                  message: MessageHandle|
                  -> std::result::Result<rhai::Map, Box<EvalAltResult>> {
                let host = ScriptHost::new(Rc::clone(&db), config.clone());
                let (result, ref_code) = host
                    .trigger_transaction(secret, &message)
                    .map_err(script_err)?;
                let mut map = rhai::Map::new();
                map.insert("result".into(), result.into());
                map.insert("refcode".into(), ref_code.into());
                Ok(map)
            },
        );
    }
}

/// Message fields and methods, identical in both sandboxes.
fn register_message_api(engine: &mut rhai::Engine) {
    engine
        .register_type_with_name::<MessageHandle>("Message")
        .register_get_set(
            "From",
            |m: &mut MessageHandle| m.borrow().from_header().to_string(),
            |m: &mut MessageHandle, from: String| m.borrow_mut().set_from(&from),
        )
        .register_get("Sender", |m: &mut MessageHandle| {
            m.borrow().sender().to_string()
        })
        .register_get_set(
            "Subject",
            |m: &mut MessageHandle| m.borrow().subject().to_string(),
            |m: &mut MessageHandle, subject: String| m.borrow_mut().set_subject(&subject),
        )
        .register_get("To", |m: &mut MessageHandle| -> rhai::Array {
            m.borrow().to().iter().cloned().map(Dynamic::from).collect()
        })
        .register_get("Cc", |m: &mut MessageHandle| -> rhai::Array {
            m.borrow().cc().iter().cloned().map(Dynamic::from).collect()
        })
        .register_get("Bcc", |m: &mut MessageHandle| -> rhai::Array {
            m.borrow()
                .bcc()
                .iter()
                .cloned()
                .map(Dynamic::from)
                .collect()
        })
        .register_fn("GetText", |m: &mut MessageHandle| {
            m.borrow().text().to_string()
        })
        .register_fn("SetText", |m: &mut MessageHandle, text: &str| {
            m.borrow_mut().set_text(text)
        })
        .register_fn("GetHeader", |m: &mut MessageHandle, key: &str| {
            m.borrow().get_header(key)
        })
        .register_fn(
            "AddHeader",
            |m: &mut MessageHandle, key: &str, value: &str| m.borrow_mut().add_header(key, value),
        )
        .register_fn(
            "SetHeader",
            |m: &mut MessageHandle, key: &str, value: &str| m.borrow_mut().set_header(key, value),
        )
        .register_fn("DelHeader", |m: &mut MessageHandle, key: &str| {
            m.borrow_mut().del_header(key)
        })
        .register_fn("AddToRecipient", |m: &mut MessageHandle, address: &str| {
            m.borrow_mut().add_to_recipient(address)
        })
        .register_fn("AddCcRecipient", |m: &mut MessageHandle, address: &str| {
            m.borrow_mut().add_cc_recipient(address)
        })
        .register_fn("AddBccRecipient", |m: &mut MessageHandle, address: &str| {
            m.borrow_mut().add_bcc_recipient(address)
        })
        .register_fn("AddRecipient", |m: &mut MessageHandle, address: &str| {
            m.borrow_mut().add_recipient(address)
        })
        .register_fn(
            "AddRecipientList",
            |m: &mut MessageHandle, addresses: rhai::Array| {
                m.borrow_mut()
                    .add_recipient_list(addresses.iter().map(|entry| entry.to_string()));
            },
        )
        .register_fn("RemoveRecipient", |m: &mut MessageHandle, address: &str| {
            m.borrow_mut().remove_recipient(address)
        })
        .register_fn("ClearRecipients", |m: &mut MessageHandle| {
            m.borrow_mut().clear_recipients()
        })
        .register_fn("NormaliseRecipients", |m: &mut MessageHandle| {
            m.borrow_mut().normalise_recipients()
        });
}

/// Member records as script values.
fn register_member_api(engine: &mut rhai::Engine) {
    engine
        .register_type_with_name::<Member>("Member")
        .register_get_set(
            "Email",
            |m: &mut Member| m.email.clone(),
            |m: &mut Member, email: String| m.email = email,
        )
        .register_get_set(
            "Name",
            |m: &mut Member| m.name.clone(),
            |m: &mut Member, name: String| m.name = name,
        )
        .register_get_set(
            "Moderator",
            |m: &mut Member| m.moderator,
            |m: &mut Member, moderator: bool| m.moderator = moderator,
        )
        .register_get_set(
            "AllowedPost",
            |m: &mut Member| m.allowed_post,
            |m: &mut Member, allowed_post: bool| m.allowed_post = allowed_post,
        )
        .register_get("Joindate", |m: &mut Member| m.join_date.to_rfc3339())
        .register_fn(
            "SetJoinDateUTC",
            |m: &mut Member, year: i64, month: i64, day: i64, hour: i64| {
                m.set_join_date_utc(year as i32, month as u32, day as u32, hour as u32)
            },
        );
}

/// Key/value bucket handles; whitelisted operations only.
fn register_kv_api(engine: &mut rhai::Engine) {
    engine
        .register_type_with_name::<KvStore>("KVStore")
        .register_fn("Store", |kv: &mut KvStore, key: &str, value: &str| {
            kv.store(key, value)
        })
        .register_fn("Retrieve", |kv: &mut KvStore, key: &str| kv.retrieve(key))
        .register_fn("Delete", |kv: &mut KvStore, key: &str| kv.delete(key))
        .register_fn("Keys", |kv: &mut KvStore| -> rhai::Array {
            kv.keys().into_iter().map(Dynamic::from).collect()
        })
        .register_fn("Destroy", |kv: &mut KvStore| kv.destroy())
        .register_get("BucketName", |kv: &mut KvStore| {
            kv.bucket_name().to_string()
        });
}

/// The Privileged whitelist, and nothing else.
fn register_privileged_db(engine: &mut rhai::Engine) {
    engine
        .register_type_with_name::<PrivilegedDb>("Database")
        .register_fn("IsModerator", |db: &mut PrivilegedDb, email: &str| {
            db.0.is_moderator(email)
        })
        .register_fn("IsAllowedPost", |db: &mut PrivilegedDb, email: &str| {
            db.0.is_allowed_post(email)
        })
        .register_fn(
            "CreateSubscriber",
            |db: &mut PrivilegedDb,
             email: &str,
             name: &str,
             allowed_post: bool,
             moderator: bool| {
                db.0.create_subscriber(email, name, allowed_post, moderator)
            },
        )
        .register_fn(
            "UpdateSubscriber",
            |db: &mut PrivilegedDb,
             email: &str,
             member: Member|
             -> std::result::Result<(), Box<EvalAltResult>> {
                db.0.update_subscriber(email, &member).map_err(script_err)
            },
        )
        .register_fn(
            "DelSubscriber",
            |db: &mut PrivilegedDb, email: &str| -> std::result::Result<(), Box<EvalAltResult>> {
                db.0.del_subscriber(email).map_err(script_err)
            },
        )
        .register_fn(
            "GetAllSubscribers",
            |db: &mut PrivilegedDb| -> std::result::Result<rhai::Array, Box<EvalAltResult>> {
                let members = db.0.subscribers().map_err(script_err)?;
                Ok(members.into_iter().map(Dynamic::from).collect())
            },
        )
        .register_fn(
            "KVStore",
            |db: &mut PrivilegedDb,
             bucket_name: &str|
             -> std::result::Result<KvStore, Box<EvalAltResult>> {
                KvStore::open(&db.0, bucket_name)
                    .ok_or_else(|| script_err("could not open key/value bucket"))
            },
        );
}

/// The Moderator whitelist: lookups and roster edits by known address, no
/// enumeration and no key/value store.
fn register_moderator_db(engine: &mut rhai::Engine) {
    engine
        .register_type_with_name::<ModeratorDb>("Database")
        .register_fn("IsModerator", |db: &mut ModeratorDb, email: &str| {
            db.0.is_moderator(email)
        })
        .register_fn("IsAllowedPost", |db: &mut ModeratorDb, email: &str| {
            db.0.is_allowed_post(email)
        })
        .register_fn(
            "CreateSubscriber",
            |db: &mut ModeratorDb,
             email: &str,
             name: &str,
             allowed_post: bool,
             moderator: bool| {
                db.0.create_subscriber(email, name, allowed_post, moderator)
            },
        )
        .register_fn(
            "UpdateSubscriber",
            |db: &mut ModeratorDb,
             email: &str,
             member: Member|
             -> std::result::Result<(), Box<EvalAltResult>> {
                db.0.update_subscriber(email, &member).map_err(script_err)
            },
        )
        .register_fn(
            "GetSubscriber",
            |db: &mut ModeratorDb,
             email: &str|
             -> std::result::Result<Member, Box<EvalAltResult>> {
                db.0.get_subscriber(email).map_err(script_err)
            },
        )
        .register_fn(
            "DelSubscriber",
            |db: &mut ModeratorDb, email: &str| -> std::result::Result<(), Box<EvalAltResult>> {
                db.0.del_subscriber(email).map_err(script_err)
            },
        );
}
