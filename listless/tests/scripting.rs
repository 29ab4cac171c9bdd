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

use std::rc::Rc;

use listless::{
    Configuration, Database, ErrorKind, KvStore, Member, Message, MessageHandle, ScriptHost,
};
use tempfile::TempDir;

mod common;

/// A host whose deliver script is `source`, over a fresh store.
fn host_with_script(tmp_dir: &TempDir, source: &str) -> (ScriptHost, Rc<Database>) {
    common::init_stderr_logging();
    let script_path = tmp_dir.path().join("deliver.rhai");
    std::fs::write(&script_path, source).unwrap();
    let db = Rc::new(Database::open_or_create_db(tmp_dir.path().join("list.db")).unwrap());
    let config = Configuration {
        deliver_script: script_path,
        database: tmp_dir.path().join("list.db"),
        list_address: "list@x.com".into(),
        constants: [("SubjectTag".to_string(), "[list]".to_string())]
            .into_iter()
            .collect(),
        ..Default::default()
    };
    (ScriptHost::new(Rc::clone(&db), config), db)
}

fn write_script(tmp_dir: &TempDir, name: &str, source: &str) -> String {
    let path = tmp_dir.path().join(name);
    std::fs::write(&path, source).unwrap();
    path.display().to_string()
}

fn message_from(sender_line: &str) -> MessageHandle {
    let mut message = Message::default();
    message.set_from(sender_line);
    MessageHandle::new(message)
}

#[test]
fn test_handler_declines_to_send() {
    let tmp_dir = TempDir::new().unwrap();
    let (host, _db) = host_with_script(
        &tmp_dir,
        r#"
fn eventLoop(config, database, message) {
    [message, false, ()]
}
"#,
    );
    let verdict = host.run_event_loop(&message_from("a@x.com")).unwrap();
    assert!(!verdict.send);
    assert!(verdict.error.is_none());
}

#[test]
fn test_handler_error_string_is_reported() {
    let tmp_dir = TempDir::new().unwrap();
    let (host, _db) = host_with_script(
        &tmp_dir,
        r#"
fn eventLoop(config, database, message) {
    [message, false, "handler says no"]
}
"#,
    );
    let verdict = host.run_event_loop(&message_from("a@x.com")).unwrap();
    assert_eq!(verdict.error.as_deref(), Some("handler says no"));
}

#[test]
fn test_handler_ok_not_boolean() {
    let tmp_dir = TempDir::new().unwrap();
    let (host, _db) = host_with_script(
        &tmp_dir,
        r#"
fn eventLoop(config, database, message) {
    [message, "yes", ()]
}
"#,
    );
    let err = host.run_event_loop(&message_from("a@x.com")).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::OkNotBoolean));

    // Not returning a triple at all is the same shape error.
    let (host, _db) = host_with_script(&tmp_dir, "fn eventLoop(c, d, m) { 42 }");
    let err = host.run_event_loop(&message_from("a@x.com")).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::OkNotBoolean));
}

#[test]
fn test_handler_errval_not_string_or_nil() {
    let tmp_dir = TempDir::new().unwrap();
    let (host, _db) = host_with_script(
        &tmp_dir,
        r#"
fn eventLoop(config, database, message) {
    [message, true, 42]
}
"#,
    );
    let err = host.run_event_loop(&message_from("a@x.com")).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::ErrValNotStringOrNil));
}

#[test]
fn test_handler_mutations_are_visible_to_the_engine() {
    let tmp_dir = TempDir::new().unwrap();
    let (host, db) = host_with_script(
        &tmp_dir,
        r#"
fn eventLoop(config, database, message) {
    message.ClearRecipients();
    message.AddToRecipient(config.ListAddress);
    for sub in database.GetAllSubscribers() {
        message.AddRecipient(sub.Email);
    }
    message.RemoveRecipient(message.Sender);
    message.SetHeader("Reply-To", config.ListAddress);
    message.Subject = config.Constants.SubjectTag + " " + message.Subject;
    [message, true, ()]
}
"#,
    );
    for email in ["alice@x.com", "bob@x.com", "carol@x.com"] {
        db.update_subscriber(email, &Member::new(email, "", true, false))
            .unwrap();
    }
    let handle = message_from("Alice <alice@x.com>");
    handle.borrow_mut().set_subject("Hi");
    let verdict = host.run_event_loop(&handle).unwrap();
    assert!(verdict.send);

    let message = handle.borrow();
    assert_eq!(message.to(), &["list@x.com".to_string()]);
    assert_eq!(
        message.bcc(),
        &["bob@x.com".to_string(), "carol@x.com".to_string()]
    );
    assert_eq!(message.subject(), "[list] Hi");
    assert_eq!(message.get_header("Reply-To"), "list@x.com");
}

#[test]
fn test_privileged_scripts_reach_the_kv_store() {
    let tmp_dir = TempDir::new().unwrap();
    let (host, db) = host_with_script(
        &tmp_dir,
        r#"
fn eventLoop(config, database, message) {
    let bucket = database.KVStore("counters");
    let seen = bucket.Retrieve("seen");
    if seen == "" {
        bucket.Store("seen", "1");
    } else {
        bucket.Store("seen", (seen.parse_int() + 1).to_string());
    }
    [message, false, ()]
}
"#,
    );
    host.run_event_loop(&message_from("a@x.com")).unwrap();
    host.run_event_loop(&message_from("a@x.com")).unwrap();
    let bucket = KvStore::open(&db, "counters").unwrap();
    assert_eq!(bucket.retrieve("seen"), "2");
}

#[test]
fn test_exec_scripts_get_config_and_database_globals() {
    let tmp_dir = TempDir::new().unwrap();
    let (host, db) = host_with_script(&tmp_dir, "fn eventLoop(c, d, m) { [m, false, ()] }");
    host.exec(
        r#"
let member = database.CreateSubscriber("new@x.com", "Newcomer", true, false);
database.UpdateSubscriber("new@x.com", member);
"#,
    )
    .unwrap();
    assert!(db.is_allowed_post("new@x.com"));
    assert!(!db.is_moderator("new@x.com"));
}

#[test]
fn test_transaction_trigger_runs_hook_in_moderator_sandbox() {
    let tmp_dir = TempDir::new().unwrap();
    let (host, db) = host_with_script(&tmp_dir, "fn eventLoop(c, d, m) { [m, false, ()] }");
    let hook_path = write_script(
        &tmp_dir,
        "hooks.rhai",
        r#"
fn subscribe(database, message, refcode) {
    let member = database.CreateSubscriber(message.Sender, "", true, false);
    database.UpdateSubscriber(message.Sender, member);
    "subscribed " + refcode
}
"#,
    );
    db.update_subscriber("mod@x.com", &Member::new("mod@x.com", "Mod", true, true))
        .unwrap();
    db.register_transaction(
        "opensesame",
        &hook_path,
        "subscribe",
        "ref-42",
        vec!["mod@x.com".into()],
        24,
        false,
    )
    .unwrap();

    let handle = message_from("Mod <mod@x.com>");
    let (result, ref_code) = host.trigger_transaction("opensesame", &handle).unwrap();
    assert_eq!(result, "subscribed ref-42");
    assert_eq!(ref_code, "ref-42");
    assert!(db.is_allowed_post("mod@x.com"));

    // Single-use: the first successful trigger consumes it.
    assert!(!db.has_transaction("opensesame"));
    let err = host.trigger_transaction("opensesame", &handle).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::TransactionNotFound));
}

#[test]
fn test_persistent_transactions_survive_triggering() {
    let tmp_dir = TempDir::new().unwrap();
    let (host, db) = host_with_script(&tmp_dir, "fn eventLoop(c, d, m) { [m, false, ()] }");
    let hook_path = write_script(&tmp_dir, "hooks.rhai", "fn ping(d, m, r) { \"pong\" }");
    db.register_transaction("secret", &hook_path, "ping", "", vec![], 24, true)
        .unwrap();

    let handle = message_from("anyone@anywhere.example");
    for _ in 0..2 {
        let (result, _) = host.trigger_transaction("secret", &handle).unwrap();
        assert_eq!(result, "pong");
    }
    assert!(db.has_transaction("secret"));
}

#[test]
fn test_trigger_rejects_unpermitted_sender() {
    let tmp_dir = TempDir::new().unwrap();
    let (host, db) = host_with_script(&tmp_dir, "fn eventLoop(c, d, m) { [m, false, ()] }");
    let hook_path = write_script(&tmp_dir, "hooks.rhai", "fn hook(d, m, r) { \"ran\" }");
    db.register_transaction("secret", &hook_path, "hook", "", vec!["mod@x.com".into()], 24, false)
        .unwrap();

    let err = host
        .trigger_transaction("secret", &message_from("stranger@x.com"))
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::SenderNotPermitted));
    // The failed attempt must not consume the transaction.
    assert!(db.has_transaction("secret"));
}

#[test]
fn test_trigger_never_runs_expired_hooks() {
    use listless::{chrono, MailTransaction};

    let tmp_dir = TempDir::new().unwrap();
    let (host, db) = host_with_script(&tmp_dir, "fn eventLoop(c, d, m) { [m, false, ()] }");
    let hook_path = write_script(
        &tmp_dir,
        "hooks.rhai",
        // The hook would fail loudly if it ever ran.
        "fn hook(d, m, r) { throw \"expired hook must not run\"; }",
    );
    db.put_transaction(
        "stale",
        MailTransaction {
            ref_code: "".into(),
            script_name: hook_path,
            script_hook: "hook".into(),
            permitted: vec![],
            expires: chrono::Utc::now() + chrono::Duration::milliseconds(5),
            persists: false,
        },
    )
    .unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));

    let err = host
        .trigger_transaction("stale", &message_from("anyone@x.com"))
        .unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::ExpiredTransaction));
    // Contact with a stale transaction clears it out.
    assert!(matches!(
        host.trigger_transaction("stale", &message_from("anyone@x.com"))
            .unwrap_err()
            .kind(),
        ErrorKind::TransactionNotFound
    ));
}

#[test]
fn test_moderator_sandbox_exposes_exactly_the_whitelist() {
    let tmp_dir = TempDir::new().unwrap();
    let (host, db) = host_with_script(&tmp_dir, "fn eventLoop(c, d, m) { [m, false, ()] }");
    db.update_subscriber("known@x.com", &Member::new("known@x.com", "K", true, false))
        .unwrap();

    // Every whitelisted method resolves.
    let ok_path = write_script(
        &tmp_dir,
        "allowed.rhai",
        r#"
fn hook(database, message, refcode) {
    let member = database.GetSubscriber("known@x.com");
    let fresh = database.CreateSubscriber("fresh@x.com", member.Name, true, false);
    database.UpdateSubscriber("fresh@x.com", fresh);
    database.DelSubscriber("fresh@x.com");
    if database.IsModerator("known@x.com") { throw "not a moderator"; }
    if !database.IsAllowedPost("known@x.com") { throw "should be allowed"; }
    "ok"
}
"#,
    );
    db.register_transaction("allowed", &ok_path, "hook", "", vec![], 1, false)
        .unwrap();
    let (result, _) = host
        .trigger_transaction("allowed", &message_from("anyone@x.com"))
        .unwrap();
    assert_eq!(result, "ok");

    // Off-whitelist access raises a script-level error.
    for (name, source) in [
        (
            "kv.rhai",
            "fn hook(d, m, r) { d.KVStore(\"sneaky\"); \"bad\" }",
        ),
        (
            "enum.rhai",
            "fn hook(d, m, r) { d.GetAllSubscribers(); \"bad\" }",
        ),
    ] {
        let path = write_script(&tmp_dir, name, source);
        let secret = format!("secret-{}", name);
        db.register_transaction(&secret, &path, "hook", "", vec![], 1, false)
            .unwrap();
        let err = host
            .trigger_transaction(&secret, &message_from("anyone@x.com"))
            .unwrap_err();
        assert!(
            matches!(err.kind(), ErrorKind::Script(_)),
            "expected script error for {}, got {:?}",
            name,
            err
        );
    }
}

#[test]
fn test_scripts_can_register_and_trigger_transactions() {
    let tmp_dir = TempDir::new().unwrap();
    let hook_path_str = {
        let path = tmp_dir.path().join("hooks.rhai");
        std::fs::write(
            &path,
            r#"
fn approve(database, message, refcode) {
    let member = database.CreateSubscriber(message.Sender, "", true, false);
    database.UpdateSubscriber(message.Sender, member);
    "approved"
}
"#,
        )
        .unwrap();
        path.display().to_string().replace('\\', "\\\\")
    };
    let deliver = format!(
        r#"
fn eventLoop(config, database, message) {{
    if !HasTransaction(message.GetHeader("X-Secret")) {{
        RegisterTransaction(message.GetHeader("X-Secret"), "{hook}", "approve", "r", [message.Sender], 24, false);
        return [message, false, ()];
    }}
    let outcome = TriggerTransaction(message.GetHeader("X-Secret"), message);
    [message, false, outcome.result]
}}
"#,
        hook = hook_path_str
    );
    let (host, db) = host_with_script(&tmp_dir, &deliver);

    let handle = message_from("Poster <poster@x.com>");
    handle.borrow_mut().set_header("X-Secret", "letmein");

    // First pass registers the transaction.
    let verdict = host.run_event_loop(&handle).unwrap();
    assert!(verdict.error.is_none());
    assert!(db.has_transaction("letmein"));

    // Second pass triggers it; the hook subscribes the sender.
    let verdict = host.run_event_loop(&handle).unwrap();
    assert_eq!(verdict.error.as_deref(), Some("approved"));
    assert!(db.is_allowed_post("poster@x.com"));
    assert!(!db.has_transaction("letmein"));
}
