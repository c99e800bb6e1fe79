//! MongoDB-backed store for multi-instance deployments.
//!
//! Every request is one document keyed by its id. Merges run server-side as
//! pipeline updates, so concurrent writers from several manager instances
//! cannot lose each other's words or regress a terminal status. Each call is
//! bounded by a per-operation timeout.

use super::{PendingTask, RequestState, RequestStore};
use async_trait::async_trait;
use core::{future::IntoFuture, time::Duration};
use crackhash_core::{
    Error, Result,
    types::{RequestId, RequestStatus},
};
use futures::TryStreamExt;
use mongodb::{
    Client, Collection, IndexModel,
    bson::{DateTime, Document, doc},
    options::ReturnDocument,
};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

const COLLECTION: &str = "requests";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct RequestDocument {
    #[serde(rename = "_id")]
    id: String,
    status: RequestStatus,
    #[serde(default)]
    data: Vec<String>,
    started_at: DateTime,
    timeout_ms: i64,
    deadline: DateTime,
    #[serde(default)]
    pending: bool,
    hash: String,
    max_length: i64,
}

impl RequestDocument {
    fn from_state(id: RequestId, state: &RequestState) -> Self {
        Self {
            id: id.to_string(),
            status: state.status,
            data: state.found_words.clone(),
            started_at: DateTime::from_system_time(state.started_at),
            timeout_ms: i64::try_from(state.timeout.as_millis()).unwrap_or(i64::MAX),
            deadline: DateTime::from_system_time(state.deadline),
            pending: state.pending,
            hash: state.hash.clone(),
            max_length: i64::from(state.max_length),
        }
    }

    fn into_state(self) -> Result<(RequestId, RequestState)> {
        let corrupt = |what: &str| Error::Store {
            context: format!("document `{}` has invalid {what}", self.id),
        };
        let id: RequestId = self.id.parse().map_err(|_| corrupt("id"))?;
        let max_length = u32::try_from(self.max_length).map_err(|_| corrupt("max_length"))?;
        let timeout_ms = u64::try_from(self.timeout_ms).map_err(|_| corrupt("timeout_ms"))?;

        Ok((
            id,
            RequestState {
                status: self.status,
                found_words: self.data,
                started_at: self.started_at.to_system_time(),
                timeout: Duration::from_millis(timeout_ms),
                deadline: self.deadline.to_system_time(),
                pending: self.pending,
                hash: self.hash,
                max_length,
            },
        ))
    }
}

/// Server-side equivalent of [`RequestState::merge`], upserting `incoming`
/// when no document exists yet.
fn merge_pipeline(incoming: &RequestDocument) -> Vec<Document> {
    let in_progress = RequestStatus::InProgress.as_str();
    vec![
        doc! {
            "$set": {
                "status": {
                    "$cond": [
                        { "$eq": [{ "$ifNull": ["$status", in_progress] }, in_progress] },
                        incoming.status.as_str(),
                        "$status",
                    ]
                },
                "data": {
                    "$setUnion": [
                        { "$ifNull": ["$data", []] },
                        { "$literal": incoming.data.clone() },
                    ]
                },
                "started_at": { "$ifNull": ["$started_at", incoming.started_at] },
                "timeout_ms": { "$ifNull": ["$timeout_ms", incoming.timeout_ms] },
                "deadline": { "$ifNull": ["$deadline", incoming.deadline] },
                "pending": { "$ifNull": ["$pending", incoming.pending] },
                "hash": { "$ifNull": ["$hash", { "$literal": incoming.hash.clone() }] },
                "max_length": { "$ifNull": ["$max_length", incoming.max_length] },
            }
        },
        doc! {
            "$set": {
                "pending": { "$and": ["$pending", { "$eq": ["$status", in_progress] }] },
            }
        },
    ]
}

async fn timed<F, T>(limit: Duration, op: &str, fut: F) -> Result<T>
where
    F: IntoFuture<Output = mongodb::error::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(Error::Store {
            context: format!("{op}: {e}"),
        }),
        Err(_) => Err(Error::Store {
            context: format!("{op}: timed out after {limit:?}"),
        }),
    }
}

#[derive(Clone, Debug)]
pub struct MongoStore {
    requests: Collection<RequestDocument>,
    op_timeout: Duration,
}

impl MongoStore {
    /// Connects and ensures the indexes used by the pending scan and the
    /// expiry sweep exist.
    pub async fn connect(uri: &str, database: &str, op_timeout: Duration) -> Result<Self> {
        let client = timed(op_timeout, "connect", Client::with_uri_str(uri)).await?;
        let requests = client
            .database(database)
            .collection::<RequestDocument>(COLLECTION);

        for keys in [
            doc! { "pending": 1, "status": 1 },
            doc! { "status": 1, "deadline": 1 },
        ] {
            timed(
                op_timeout,
                "create index",
                requests.create_index(IndexModel::builder().keys(keys).build()),
            )
            .await?;
        }

        tracing::info!(database, collection = COLLECTION, "Connected to MongoDB");
        Ok(Self {
            requests,
            op_timeout,
        })
    }
}

#[async_trait]
impl RequestStore for MongoStore {
    async fn set(&self, id: RequestId, state: RequestState) -> Result<()> {
        let document = RequestDocument::from_state(id, &state);
        timed(
            self.op_timeout,
            "set",
            self.requests
                .replace_one(doc! { "_id": document.id.as_str() }, &document)
                .upsert(true),
        )
        .await?;
        Ok(())
    }

    async fn get(&self, id: RequestId) -> Result<Option<RequestState>> {
        let document = timed(
            self.op_timeout,
            "get",
            self.requests.find_one(doc! { "_id": id.to_string() }),
        )
        .await?;
        document
            .map(|d| d.into_state().map(|(_, state)| state))
            .transpose()
    }

    async fn update(&self, id: RequestId, state: RequestState) -> Result<RequestState> {
        let incoming = RequestDocument::from_state(id, &state);
        let merged = timed(
            self.op_timeout,
            "update",
            self.requests
                .find_one_and_update(doc! { "_id": incoming.id.as_str() }, merge_pipeline(&incoming))
                .upsert(true)
                .return_document(ReturnDocument::After),
        )
        .await?
        .ok_or_else(|| Error::Store {
            context: format!("update of {id} returned no document"),
        })?;
        merged.into_state().map(|(_, state)| state)
    }

    async fn count(&self) -> Result<usize> {
        let count = timed(
            self.op_timeout,
            "count",
            self.requests
                .count_documents(doc! { "status": RequestStatus::InProgress.as_str() }),
        )
        .await?;
        Ok(usize::try_from(count).unwrap_or(usize::MAX))
    }

    async fn mark_pending(&self, id: RequestId, pending: bool) -> Result<bool> {
        let filter = if pending {
            doc! { "_id": id.to_string(), "status": RequestStatus::InProgress.as_str() }
        } else {
            doc! { "_id": id.to_string() }
        };
        let result = timed(
            self.op_timeout,
            "mark pending",
            self.requests
                .update_one(filter, doc! { "$set": { "pending": pending } }),
        )
        .await?;
        Ok(result.matched_count > 0)
    }

    async fn get_pending(&self) -> Result<Vec<PendingTask>> {
        let cursor = timed(
            self.op_timeout,
            "get pending",
            self.requests.find(doc! {
                "pending": true,
                "status": RequestStatus::InProgress.as_str(),
            }),
        )
        .await?;
        let documents: Vec<RequestDocument> =
            timed(self.op_timeout, "get pending", cursor.try_collect()).await?;

        documents
            .into_iter()
            .map(|d| {
                let (id, state) = d.into_state()?;
                Ok(PendingTask::from_state(id, &state))
            })
            .collect()
    }

    async fn expire(&self, now: SystemTime) -> Result<u64> {
        let result = timed(
            self.op_timeout,
            "expire",
            self.requests.update_many(
                doc! {
                    "status": RequestStatus::InProgress.as_str(),
                    "deadline": { "$lte": DateTime::from_system_time(now) },
                },
                doc! {
                    "$set": {
                        "status": RequestStatus::Error.as_str(),
                        "pending": false,
                    }
                },
            ),
        )
        .await?;
        Ok(result.modified_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::Bson;

    fn state() -> RequestState {
        let started_at = SystemTime::UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        let mut state = RequestState::new(
            "0cc175b9c0f1b6a831c399e269772661",
            5,
            started_at,
            Duration::from_secs(180),
        );
        state.pending = true;
        state.found_words = vec!["a".into()];
        state
    }

    #[test]
    fn documents_keep_hash_and_max_length() {
        let id = RequestId::new();
        let original = state();
        let document = RequestDocument::from_state(id, &original);
        assert_eq!(document.hash, original.hash);
        assert_eq!(document.max_length, 5);

        let (decoded_id, decoded) = document.into_state().unwrap();
        assert_eq!(decoded_id, id);
        assert_eq!(decoded, original);

        let pending = PendingTask::from_state(decoded_id, &decoded);
        assert_eq!(pending.hash, "0cc175b9c0f1b6a831c399e269772661");
        assert_eq!(pending.max_length, 5);
    }

    #[test]
    fn documents_serialize_status_as_wire_string() {
        let document = RequestDocument::from_state(RequestId::new(), &state());
        let bson = mongodb::bson::to_document(&document).unwrap();
        assert_eq!(bson.get_str("status").unwrap(), "IN_PROGRESS");
        assert!(matches!(bson.get("started_at"), Some(Bson::DateTime(_))));
    }

    #[test]
    fn corrupt_documents_are_store_errors() {
        let mut document = RequestDocument::from_state(RequestId::new(), &state());
        document.max_length = -1;
        assert!(matches!(document.into_state(), Err(Error::Store { .. })));

        let mut document = RequestDocument::from_state(RequestId::new(), &state());
        document.id = "nope".into();
        assert!(matches!(document.into_state(), Err(Error::Store { .. })));
    }

    /// Evaluates the aggregation operators used by [`merge_pipeline`]
    /// against `doc`.
    fn eval(expr: &Bson, doc: &Document) -> Bson {
        let args = |args: &Bson| match args {
            Bson::Array(items) => items.clone(),
            other => panic!("expected an argument array, got {other}"),
        };
        match expr {
            Bson::String(path) if path.starts_with('$') => {
                doc.get(&path[1..]).cloned().unwrap_or(Bson::Null)
            }
            Bson::Document(op) if op.keys().any(|k| k.starts_with('$')) => {
                let (name, operands) = op.iter().next().unwrap();
                match name.as_str() {
                    "$literal" => operands.clone(),
                    "$ifNull" => {
                        let a = args(operands);
                        match eval(&a[0], doc) {
                            Bson::Null => eval(&a[1], doc),
                            value => value,
                        }
                    }
                    "$eq" => {
                        let a = args(operands);
                        Bson::Boolean(eval(&a[0], doc) == eval(&a[1], doc))
                    }
                    "$cond" => {
                        let a = args(operands);
                        if eval(&a[0], doc) == Bson::Boolean(true) {
                            eval(&a[1], doc)
                        } else {
                            eval(&a[2], doc)
                        }
                    }
                    "$and" => Bson::Boolean(
                        args(operands)
                            .iter()
                            .all(|e| eval(e, doc) == Bson::Boolean(true)),
                    ),
                    "$setUnion" => {
                        let mut union = Vec::new();
                        for set in args(operands) {
                            let Bson::Array(items) = eval(&set, doc) else {
                                panic!("$setUnion over a non-array");
                            };
                            for item in items {
                                if !union.contains(&item) {
                                    union.push(item);
                                }
                            }
                        }
                        Bson::Array(union)
                    }
                    other => panic!("operator {other} is not evaluated here"),
                }
            }
            Bson::Array(items) => Bson::Array(items.iter().map(|e| eval(e, doc)).collect()),
            other => other.clone(),
        }
    }

    /// Runs `update` the way `find_one_and_update(..).upsert(true)` does:
    /// a missing document starts out as just its `_id`, and every `$set`
    /// stage sees the output of the previous one.
    fn apply(id: RequestId, stored: Option<&RequestState>, incoming: &RequestState) -> RequestState {
        let mut current = match stored {
            Some(state) => {
                mongodb::bson::to_document(&RequestDocument::from_state(id, state)).unwrap()
            }
            None => doc! { "_id": id.to_string() },
        };
        for stage in merge_pipeline(&RequestDocument::from_state(id, incoming)) {
            let set = stage.get_document("$set").unwrap();
            let mut next = current.clone();
            for (field, expr) in set {
                next.insert(field.clone(), eval(expr, &current));
            }
            current = next;
        }
        let document: RequestDocument = mongodb::bson::from_document(current).unwrap();
        document.into_state().unwrap().1
    }

    fn with(status: RequestStatus, words: &[&str], pending: bool) -> RequestState {
        let mut state = state();
        state.status = status;
        state.found_words = words.iter().map(|w| (*w).to_owned()).collect();
        state.pending = pending;
        state
    }

    #[test]
    fn merge_pipeline_matches_in_memory_merge() {
        use RequestStatus::{Error as Failed, InProgress, Ready};

        let cases = [
            (with(Ready, &["a"], false), with(InProgress, &["b"], true)),
            (with(Failed, &[], false), with(Ready, &["x"], false)),
            (with(InProgress, &["a"], true), with(Ready, &["a", "b"], false)),
            (with(InProgress, &["a"], true), with(InProgress, &["c"], false)),
            (with(InProgress, &[], false), with(Failed, &[], true)),
        ];
        for (stored, incoming) in cases {
            let id = RequestId::new();
            let mut expected = stored.clone();
            expected.merge(&incoming);
            assert_eq!(
                apply(id, Some(&stored), &incoming),
                expected,
                "{stored:?} <- {incoming:?}"
            );
        }
    }

    #[test]
    fn merge_pipeline_never_regresses_a_terminal_status() {
        let id = RequestId::new();
        for terminal in [RequestStatus::Ready, RequestStatus::Error] {
            let stored = with(terminal, &["a"], false);
            let merged = apply(id, Some(&stored), &with(RequestStatus::InProgress, &["b"], true));
            assert_eq!(merged.status, terminal);
            assert_eq!(merged.found_words, ["a", "b"]);
            assert!(!merged.pending, "terminal requests are never pending");
        }
    }

    #[test]
    fn merge_pipeline_keeps_stored_pending_and_immutable_fields() {
        let id = RequestId::new();
        let stored = with(RequestStatus::InProgress, &["a"], true);
        let mut incoming = with(RequestStatus::InProgress, &["a", "b", "a"], false);
        incoming.hash = String::new();
        incoming.max_length = 1;

        let merged = apply(id, Some(&stored), &incoming);
        assert!(merged.pending);
        assert_eq!(merged.hash, stored.hash);
        assert_eq!(merged.max_length, stored.max_length);
        assert_eq!(merged.found_words, ["a", "b"]);
    }

    #[test]
    fn merge_pipeline_upserts_missing_requests() {
        let id = RequestId::new();
        let incoming = with(RequestStatus::Ready, &["z"], true);
        let merged = apply(id, None, &incoming);
        assert_eq!(merged.status, RequestStatus::Ready);
        assert_eq!(merged.found_words, ["z"]);
        assert_eq!(merged.hash, incoming.hash);
        assert!(!merged.pending);
    }

    /// Runs the store against a real server. Start one with
    /// `docker run -p 27017:27017 mongo` and set `MONGO_URL`.
    #[tokio::test]
    #[ignore = "needs a MongoDB server at MONGO_URL"]
    async fn live_store_merges_concurrent_updates() {
        let url = std::env::var("MONGO_URL").unwrap_or_else(|_| "mongodb://localhost:27017".into());
        let store = MongoStore::connect(&url, "crackhash_test", Duration::from_secs(5))
            .await
            .unwrap();
        let id = RequestId::new();
        store.set(id, with(RequestStatus::InProgress, &[], true)).await.unwrap();

        let updates = (0..8).map(|i| {
            let store = store.clone();
            let word = format!("w{i}");
            tokio::spawn(async move {
                store
                    .update(id, with(RequestStatus::Ready, &[word.as_str()], false))
                    .await
            })
        });
        for update in updates.collect::<Vec<_>>() {
            update.await.unwrap().unwrap();
        }
        store.expire(SystemTime::now() + Duration::from_secs(3600)).await.unwrap();

        let merged = store.get(id).await.unwrap().unwrap();
        assert_eq!(merged.status, RequestStatus::Ready);
        assert_eq!(merged.found_words.len(), 8);
        assert!(!merged.pending);
        assert_eq!(merged.hash, state().hash);
        assert!(store.get_pending().await.unwrap().iter().all(|p| p.id != id));
    }
}
