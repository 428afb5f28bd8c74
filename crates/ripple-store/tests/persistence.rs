use ripple_store::{AdapterRegistry, DbRuntimeSettings, StorageAdapter};
use ripple_types::{Document, FindOptions};
use serde_json::{json, Value};

fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {other}"),
    }
}

#[tokio::test]
async fn sqlite_documents_survive_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let connector = format!("sqlite://{}", dir.path().join("ripple.db").display());
    let registry = AdapterRegistry::with_defaults(DbRuntimeSettings::default());

    let adapter = registry.resolve(&connector).expect("resolve");
    adapter.start().await.expect("start");
    adapter
        .insert_many(
            "notes",
            vec![
                doc(json!({"_id": "a", "title": "first", "rank": 2})),
                doc(json!({"_id": "b", "title": "second", "rank": 1})),
            ],
            None,
        )
        .await
        .expect("insert");
    adapter.stop().await.expect("stop");

    let reopened = registry.resolve(&connector).expect("resolve");
    reopened.start().await.expect("restart");
    let options = FindOptions {
        sort: Some(json!({"rank": 1})),
        ..FindOptions::default()
    };
    let docs = reopened
        .find("notes", &json!({}), None, &options)
        .await
        .expect("find");
    let ids: Vec<_> = docs.iter().filter_map(|d| reopened.item_id(d)).collect();
    assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);
}

#[tokio::test]
async fn backends_agree_on_insertion_order() {
    let registry = AdapterRegistry::with_defaults(DbRuntimeSettings::default());
    for connector in ["memory://", "sqlite://:memory:"] {
        let adapter = registry.resolve(connector).expect("resolve");
        adapter.start().await.expect("start");
        for id in ["c", "a", "b"] {
            adapter
                .insert_one("t", doc(json!({"_id": id})), None)
                .await
                .expect("insert");
        }
        let docs = adapter
            .find("t", &json!({}), None, &FindOptions::default())
            .await
            .expect("find");
        let ids: Vec<_> = docs.iter().filter_map(|d| adapter.item_id(d)).collect();
        assert_eq!(ids, ["c", "a", "b"], "{connector}");

        let filter = adapter.filter_from_item_ids(&["a".to_string(), "b".to_string()]);
        assert_eq!(adapter.count("t", &filter).await.expect("count"), 2);
    }
}
