//! End-to-end state machine scenarios driven through the command log.

use clustermeta::command::Command;
use clustermeta::errors::CoordError;
use clustermeta::fsm::StateMachine;
use clustermeta::pathutil;
use clustermeta::value::Value;
use clustermeta::watch::{WatchEvent, WatchHub};

fn fsm() -> StateMachine {
    StateMachine::new(WatchHub::new())
}

fn set_json(sm: &StateMachine, path: &str, json: &str, merge: bool) {
    let resp = sm.apply(&Command::SetKv {
        path: path.to_string(),
        value: Value::parse_json(json.as_bytes()).unwrap(),
        merge,
    });
    assert!(resp.applied, "apply failed: {:?}", resp.error);
}

fn json(src: &str) -> Value {
    Value::parse_json(src.as_bytes()).unwrap()
}

#[test]
fn nested_kv_set_keeps_siblings() {
    let sm = fsm();
    set_json(&sm, "/", r#"{"a": 1}"#, false);
    set_json(&sm, "/b/bb", r#"{"b": 1}"#, false);

    assert_eq!(sm.get("/b").unwrap(), json(r#"{"bb": {"b": 1}}"#));
    assert_eq!(sm.get("/a").unwrap(), Value::Int(1));
}

#[test]
fn merge_fills_root_while_replace_overwrites_it() {
    let sm = fsm();
    set_json(&sm, "/", r#"{"a": 1}"#, true);
    assert_eq!(sm.get("/a").unwrap(), Value::Int(1));

    set_json(&sm, "/b/bb", r#"{"b": 1}"#, false);
    assert_eq!(sm.get("/b").unwrap(), json(r#"{"bb": {"b": 1}}"#));

    // Non-merge set at the root replaces the whole tree.
    set_json(&sm, "/", r#"{"a": 1}"#, false);
    assert_eq!(sm.get("/").unwrap(), json(r#"{"a": 1}"#));

    // Merge at the root fills the gap and keeps the existing key.
    set_json(&sm, "/", r#"{"b": 2}"#, true);
    assert_eq!(sm.get("/").unwrap(), json(r#"{"a": 1, "b": 2}"#));
}

#[test]
fn path_split_and_selector() {
    assert_eq!(pathutil::split("/a/b/c/d"), vec!["a", "b", "c", "d"]);
    assert_eq!(pathutil::selector("/a/b/c/d"), "a.b.c.d");
}

#[test]
fn set_then_get_returns_equal_value() {
    let cases = [
        ("/s", r#""text""#),
        ("/i", "42"),
        ("/f", "2.5"),
        ("/flag", "true"),
        ("/list", r#"[1, "two", {"three": 3}]"#),
        ("/deep/a/b/c", r#"{"leaf": null}"#),
    ];
    let sm = fsm();
    for (path, src) in cases {
        set_json(&sm, path, src, false);
        assert_eq!(sm.get(path).unwrap(), json(src), "path {}", path);
    }
}

#[test]
fn delete_then_get_is_not_found() {
    let sm = fsm();
    set_json(&sm, "/a/b", "1", false);
    set_json(&sm, "/a/c", "2", false);

    let resp = sm.apply(&Command::DeleteKv {
        path: "/a/b".to_string(),
    });
    assert!(resp.applied);

    assert_eq!(sm.get("/a/b").unwrap_err(), CoordError::NotFound);
    assert!(!sm.has("/a/b").unwrap());
    assert_eq!(sm.get("/a/c").unwrap(), Value::Int(2));
}

#[test]
fn identical_logs_produce_identical_trees() {
    let log: Vec<Command> = vec![
        Command::SetKv {
            path: "/".to_string(),
            value: json(r#"{"config": {"index_type": "upside_down"}}"#),
            merge: false,
        },
        Command::SetKv {
            path: "/config/index_storage_type".to_string(),
            value: Value::Str("boltdb".into()),
            merge: true,
        },
        Command::DeleteKv {
            path: "/missing".to_string(),
        },
        Command::SetKv {
            path: "/config".to_string(),
            value: json(r#"{"replacement": true}"#),
            merge: false,
        },
        Command::DeleteKv {
            path: "/config/replacement".to_string(),
        },
    ];

    let sm1 = fsm();
    let sm2 = fsm();
    for cmd in &log {
        let r1 = sm1.apply(cmd);
        let r2 = sm2.apply(cmd);
        assert_eq!(r1.applied, r2.applied);
        assert_eq!(r1.error, r2.error);
        assert_eq!(r1.revision, r2.revision);
    }
    assert_eq!(sm1.get("/").unwrap(), sm2.get("/").unwrap());
}

#[test]
fn snapshot_restore_preserves_state() {
    let sm = fsm();
    set_json(&sm, "/config/index_mapping", r#"{"analysis": {"analyzers": {}}}"#, false);
    set_json(&sm, "/cluster/nodes/node1", r#"{"id": "node1", "metadata": {"bind_addr": ":16060", "grpc_addr": ":17070", "http_addr": ":18080", "leader": true}}"#, false);

    let snapshot = sm.snapshot_bytes().unwrap();
    let restored = fsm();
    restored.restore_bytes(&snapshot).unwrap();

    assert_eq!(restored.get("/").unwrap(), sm.get("/").unwrap());
    assert_eq!(restored.revision(), sm.revision());
    assert_eq!(
        restored.get_node("node1").unwrap(),
        sm.get_node("node1").unwrap()
    );
}

#[tokio::test]
async fn watcher_observes_every_command_in_order() {
    let hub = WatchHub::new();
    let sm = StateMachine::new(hub.clone());
    let mut sub = hub.subscribe();

    for i in 0..20 {
        sm.apply(&Command::SetKv {
            path: format!("/k{}", i),
            value: Value::Int(i),
            merge: false,
        });
    }

    let mut last = 0;
    for _ in 0..20 {
        let event = sub.recv().await.unwrap();
        let revision = event.revision().unwrap();
        assert_eq!(revision, last + 1, "revisions must be consecutive");
        last = revision;
    }
}

#[tokio::test]
async fn lagging_watcher_resyncs_from_snapshot() {
    let hub = WatchHub::with_capacity(4);
    let sm = StateMachine::new(hub.clone());
    let mut sub = hub.subscribe();

    for i in 0..10 {
        sm.apply(&Command::SetKv {
            path: format!("/k{}", i),
            value: Value::Int(i),
            merge: false,
        });
    }

    match sub.recv().await.unwrap() {
        WatchEvent::Lagging { missed } => assert_eq!(missed, 6),
        other => panic!("expected lagging marker, got {:?}", other),
    }

    // The consumer's documented recovery path: read the full tree again.
    let root = sm.get("/").unwrap();
    assert_eq!(root.as_map().unwrap().len(), 10);

    // The queued tail is still delivered in order after the marker.
    assert_eq!(sub.recv().await.unwrap().revision(), Some(7));
}
