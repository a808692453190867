#![forbid(unsafe_code)]

use std::sync::Arc;

use orka_core::Object;
use orka_store::{Cache, Indexer, Store, StoreError, StoreEvent, NAMESPACE_INDEX};

fn obj(ns: Option<&str>, name: &str, rv: &str) -> Object {
    let mut meta = serde_json::json!({ "name": name, "resourceVersion": rv });
    if let Some(ns) = ns { meta["namespace"] = serde_json::Value::String(ns.to_string()); }
    Object::new(serde_json::json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": meta }))
}

fn canon(store: &Cache) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = store
        .list_keys()
        .into_iter()
        .map(|k| {
            let rv = store.get_by_key(&k).and_then(|o| o.resource_version().map(str::to_string)).unwrap_or_default();
            (k, rv)
        })
        .collect();
    out.sort_unstable();
    out
}

#[test]
fn add_update_delete_by_key() {
    let store = Cache::new();
    store.add(obj(Some("ns"), "a", "1")).unwrap();
    store.add(obj(None, "b", "2")).unwrap();
    store.update(obj(Some("ns"), "a", "3")).unwrap();
    assert_eq!(canon(&store), vec![("b".into(), "2".into()), ("ns/a".into(), "3".into())]);

    store.delete(&obj(None, "b", "4")).unwrap();
    assert_eq!(canon(&store), vec![("ns/a".into(), "3".into())]);
    assert!(store.get(&obj(Some("ns"), "a", "")).unwrap().is_some());
}

#[test]
fn delete_of_absent_key_is_a_noop() {
    let store = Cache::new();
    store.add(obj(Some("ns"), "a", "1")).unwrap();
    let epoch = store.epoch();
    store.delete(&obj(Some("ns"), "missing", "1")).unwrap();
    assert_eq!(store.len(), 1);
    assert_eq!(store.epoch(), epoch);
}

#[test]
fn replace_is_idempotent_and_accepts_empty() {
    let store = Cache::new();
    store.add(obj(Some("old"), "gone", "1")).unwrap();
    let snapshot = vec![obj(Some("ns"), "a", "5"), obj(Some("ns"), "b", "6")];

    store.replace(snapshot.clone(), "6").unwrap();
    let first = canon(&store);
    store.replace(snapshot, "6").unwrap();
    assert_eq!(canon(&store), first);
    assert_eq!(first, vec![("ns/a".into(), "5".into()), ("ns/b".into(), "6".into())]);

    store.replace(Vec::new(), "7").unwrap();
    assert!(store.is_empty());
}

#[test]
fn malformed_item_fails_replace_without_touching_contents() {
    let store = Cache::new();
    store.replace(vec![obj(Some("ns"), "a", "1")], "1").unwrap();

    let bad = Object::new(serde_json::json!({ "kind": "ConfigMap" }));
    let err = store.replace(vec![obj(Some("ns"), "b", "2"), bad.clone()], "2").unwrap_err();
    assert!(matches!(err, StoreError::Key(_)));
    assert_eq!(canon(&store), vec![("ns/a".into(), "1".into())]);

    assert!(store.add(bad).is_err());
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn replace_is_reported_separately_from_deltas() {
    let store = Cache::new();
    let mut rx = store.subscribe();
    store.replace(vec![obj(Some("ns"), "a", "1"), obj(Some("ns"), "b", "1")], "1").unwrap();
    store.add(obj(Some("ns"), "c", "2")).unwrap();
    store.update(obj(Some("ns"), "c", "3")).unwrap();
    store.delete(&obj(Some("ns"), "a", "4")).unwrap();

    assert_eq!(rx.recv().await.unwrap(), StoreEvent::Replaced { items: 2, resource_version: "1".into() });
    assert_eq!(rx.recv().await.unwrap(), StoreEvent::Added { key: "ns/c".into() });
    assert_eq!(rx.recv().await.unwrap(), StoreEvent::Updated { key: "ns/c".into() });
    assert_eq!(rx.recv().await.unwrap(), StoreEvent::Deleted { key: "ns/a".into() });
    assert_eq!(store.epoch(), 4);
}

#[test]
fn namespace_index_follows_mutations() {
    let store = Cache::namespace_keyed();
    store.replace(vec![obj(Some("ns1"), "a", "1"), obj(Some("ns2"), "b", "1"), obj(None, "c", "1")], "1").unwrap();

    let mut in_ns1: Vec<String> = store.index_keys(NAMESPACE_INDEX, "ns1").unwrap();
    in_ns1.sort();
    assert_eq!(in_ns1, vec!["ns1/a".to_string()]);
    assert_eq!(store.by_index(NAMESPACE_INDEX, "").unwrap().len(), 1);

    store.add(obj(Some("ns1"), "d", "2")).unwrap();
    store.delete(&obj(Some("ns2"), "b", "3")).unwrap();
    let mut values = store.list_index_func_values(NAMESPACE_INDEX);
    values.sort();
    assert_eq!(values, vec!["".to_string(), "ns1".to_string()]);
    assert_eq!(store.index(NAMESPACE_INDEX, &obj(Some("ns1"), "zzz", "0")).unwrap().len(), 2);

    assert!(matches!(store.by_index("nope", "x"), Err(StoreError::IndexNotFound(_))));
    assert_eq!(store.get_indexers(), vec![NAMESPACE_INDEX.to_string()]);
}

#[test]
fn readers_never_see_a_partial_replace() {
    let store = Arc::new(Cache::new());
    let a: Vec<Object> = (0..200).map(|i| obj(Some("a"), &format!("o{}", i), "1")).collect();
    let b: Vec<Object> = (0..300).map(|i| obj(Some("b"), &format!("o{}", i), "2")).collect();
    store.replace(a.clone(), "1").unwrap();

    let reader = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for _ in 0..500 {
                let n = store.list().len();
                assert!(n == 200 || n == 300, "observed torn store with {} items", n);
            }
        })
    };
    for i in 0..50 {
        let (items, rv) = if i % 2 == 0 { (b.clone(), "2") } else { (a.clone(), "1") };
        store.replace(items, rv).unwrap();
    }
    reader.join().unwrap();
}
