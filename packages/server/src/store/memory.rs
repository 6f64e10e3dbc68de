//! In-memory metadata store for tests and single-node development.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::common::error::{Error, Result};

use super::{check_tx_size, Document, MetadataStore, Query, TxOp};

type Key = (String, String);

#[derive(Default)]
pub struct MemoryMetadataStore {
    // BTreeMap keeps iteration deterministic; every operation takes the one
    // lock, which makes transactions trivially atomic.
    docs: Mutex<BTreeMap<Key, Document>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(doc: &Document, query: &Query) -> bool {
        for (field, expected) in &query.eq {
            if doc.body.get(field) != Some(expected) {
                return false;
            }
        }
        if let Some((field, bound)) = &query.lte_num {
            match doc.body.get(field).and_then(|v| v.as_i64()) {
                Some(n) if n <= *bound => {}
                _ => return false,
            }
        }
        if let Some(after) = query.created_after {
            if doc.created_at <= after {
                return false;
            }
        }
        if let Some(before) = query.created_before {
            if doc.created_at >= before {
                return false;
            }
        }
        if let Some((cursor_ts, cursor_id)) = &query.after {
            let pos = (doc.created_at, doc.id.as_str());
            if pos <= (*cursor_ts, cursor_id.as_str()) {
                return false;
            }
        }
        true
    }

    fn scan(docs: &BTreeMap<Key, Document>, query: &Query) -> Vec<Document> {
        let mut hits: Vec<Document> = docs
            .values()
            .filter(|d| d.collection == query.collection && Self::matches(d, query))
            .cloned()
            .collect();
        hits.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        hits.truncate(query.limit.max(0) as usize);
        hits
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let docs = self.docs.lock().expect("store lock poisoned");
        Ok(docs.get(&(collection.to_string(), id.to_string())).cloned())
    }

    async fn insert(
        &self,
        collection: &str,
        id: &str,
        body: serde_json::Value,
    ) -> Result<Document> {
        let mut docs = self.docs.lock().expect("store lock poisoned");
        let key = (collection.to_string(), id.to_string());
        if docs.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "document {collection}/{id} already exists"
            )));
        }
        let doc = Document {
            collection: collection.to_string(),
            id: id.to_string(),
            version: 1,
            body,
            created_at: Utc::now(),
        };
        docs.insert(key, doc.clone());
        Ok(doc)
    }

    async fn put(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        body: serde_json::Value,
    ) -> Result<Document> {
        let mut docs = self.docs.lock().expect("store lock poisoned");
        let key = (collection.to_string(), id.to_string());
        let doc = docs.get_mut(&key).ok_or_else(|| {
            Error::Conflict(format!("document {collection}/{id} does not exist"))
        })?;
        if doc.version != expected_version {
            return Err(Error::Conflict(format!(
                "version mismatch on {collection}/{id}: expected {expected_version}, found {}",
                doc.version
            )));
        }
        doc.version += 1;
        doc.body = body;
        Ok(doc.clone())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let mut docs = self.docs.lock().expect("store lock poisoned");
        docs.remove(&(collection.to_string(), id.to_string()));
        Ok(())
    }

    async fn query(&self, query: Query) -> Result<Vec<Document>> {
        let docs = self.docs.lock().expect("store lock poisoned");
        Ok(Self::scan(&docs, &query))
    }

    async fn count(&self, query: Query) -> Result<i64> {
        let docs = self.docs.lock().expect("store lock poisoned");
        let count = docs
            .values()
            .filter(|d| d.collection == query.collection && Self::matches(d, &query))
            .count();
        Ok(count as i64)
    }

    async fn transact(&self, ops: Vec<TxOp>) -> Result<()> {
        check_tx_size(&ops)?;
        let mut docs = self.docs.lock().expect("store lock poisoned");

        // Validate every precondition before mutating anything.
        for op in &ops {
            match op {
                TxOp::Insert { collection, id, .. } => {
                    if docs.contains_key(&(collection.clone(), id.clone())) {
                        return Err(Error::Conflict(format!(
                            "document {collection}/{id} already exists"
                        )));
                    }
                }
                TxOp::Put {
                    collection,
                    id,
                    expected_version,
                    ..
                } => match docs.get(&(collection.clone(), id.clone())) {
                    Some(doc) if doc.version == *expected_version => {}
                    Some(doc) => {
                        return Err(Error::Conflict(format!(
                            "version mismatch on {collection}/{id}: expected {expected_version}, found {}",
                            doc.version
                        )));
                    }
                    None => {
                        return Err(Error::Conflict(format!(
                            "document {collection}/{id} does not exist"
                        )));
                    }
                },
                TxOp::Delete { .. } => {}
            }
        }

        for op in ops {
            match op {
                TxOp::Insert {
                    collection,
                    id,
                    body,
                } => {
                    let doc = Document {
                        collection: collection.clone(),
                        id: id.clone(),
                        version: 1,
                        body,
                        created_at: Utc::now(),
                    };
                    docs.insert((collection, id), doc);
                }
                TxOp::Put {
                    collection,
                    id,
                    body,
                    ..
                } => {
                    let doc = docs
                        .get_mut(&(collection.clone(), id.clone()))
                        .expect("validated above");
                    doc.version += 1;
                    doc.body = body;
                }
                TxOp::Delete { collection, id } => {
                    docs.remove(&(collection, id));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn insert_then_get() {
        let store = MemoryMetadataStore::new();
        store.insert("jobs", "a", json!({"x": 1})).await.unwrap();
        let doc = store.get("jobs", "a").await.unwrap().unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.body["x"], 1);
    }

    #[tokio::test]
    async fn double_insert_conflicts() {
        let store = MemoryMetadataStore::new();
        store.insert("jobs", "a", json!({})).await.unwrap();
        assert!(matches!(
            store.insert("jobs", "a", json!({})).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn put_enforces_version() {
        let store = MemoryMetadataStore::new();
        store.insert("jobs", "a", json!({"n": 1})).await.unwrap();
        let doc = store.put("jobs", "a", 1, json!({"n": 2})).await.unwrap();
        assert_eq!(doc.version, 2);
        // Stale writer loses.
        assert!(matches!(
            store.put("jobs", "a", 1, json!({"n": 3})).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn query_filters_and_orders() {
        let store = MemoryMetadataStore::new();
        store
            .insert("jobs", "a", json!({"status": "active"}))
            .await
            .unwrap();
        store
            .insert("jobs", "b", json!({"status": "cancelled"}))
            .await
            .unwrap();
        store
            .insert("jobs", "c", json!({"status": "active"}))
            .await
            .unwrap();

        let hits = store
            .query(Query::new("jobs").eq("status", "active"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].created_at <= hits[1].created_at);
    }

    #[tokio::test]
    async fn query_lte_num_filter() {
        let store = MemoryMetadataStore::new();
        store.insert("jobs", "a", json!({"due": 100})).await.unwrap();
        store.insert("jobs", "b", json!({"due": 300})).await.unwrap();
        store
            .insert("jobs", "c", json!({"due": serde_json::Value::Null}))
            .await
            .unwrap();

        let hits = store
            .query(Query::new("jobs").lte_num("due", 200))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[tokio::test]
    async fn query_cursor_resumes_past_position() {
        let store = MemoryMetadataStore::new();
        for id in ["a", "b", "c"] {
            store.insert("jobs", id, json!({})).await.unwrap();
        }
        let all = store.query(Query::new("jobs")).await.unwrap();
        let second = &all[1];
        let rest = store
            .query(Query::new("jobs").after(second.created_at, second.id.clone()))
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, all[2].id);
    }

    #[tokio::test]
    async fn failed_transaction_applies_nothing() {
        let store = MemoryMetadataStore::new();
        store.insert("jobs", "a", json!({"n": 1})).await.unwrap();

        let result = store
            .transact(vec![
                TxOp::Put {
                    collection: "jobs".into(),
                    id: "a".into(),
                    expected_version: 1,
                    body: json!({"n": 2}),
                },
                TxOp::Put {
                    collection: "jobs".into(),
                    id: "missing".into(),
                    expected_version: 1,
                    body: json!({}),
                },
            ])
            .await;
        assert!(matches!(result, Err(Error::Conflict(_))));

        let doc = store.get("jobs", "a").await.unwrap().unwrap();
        assert_eq!(doc.body["n"], 1);
        assert_eq!(doc.version, 1);
    }

    #[tokio::test]
    async fn oversized_transaction_rejected() {
        let store = MemoryMetadataStore::new();
        let ops: Vec<TxOp> = (0..26)
            .map(|i| TxOp::Insert {
                collection: "jobs".into(),
                id: format!("doc-{i}"),
                body: json!({}),
            })
            .collect();
        assert!(matches!(
            store.transact(ops).await,
            Err(Error::InvalidRequest(_))
        ));
    }
}
