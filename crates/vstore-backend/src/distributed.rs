//! Adapter for the distributed source-control service.
//!
//! Requests and responses are JSON documents, one per frame. The request
//! carries the fetch context's priority and cause so the service can
//! schedule accordingly. Object bytes travel hex-encoded.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use vstore_config::BackendKind;
use vstore_model::{CommitId, Hash, ObjectKind};

use crate::{
    BackendAdapter, BackendStats, BackendStatsSnapshot, FetchCause, FetchError, FetchPriority,
    FetchResult, ObjectFetchContext, Operation, Transport,
};

const NAME: &str = "distributed";

#[derive(Debug, Serialize)]
struct Request<'a> {
    op: &'static str,
    id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    manifest: Option<&'a str>,
    priority: FetchPriority,
    cause: FetchCause,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_pid: Option<u32>,
    request_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Status {
    Ok,
    NotFound,
    Unavailable,
}

#[derive(Debug, Deserialize)]
struct Response {
    status: Status,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

pub struct DistributedAdapter {
    transport: Arc<dyn Transport>,
    stats: BackendStats,
}

impl DistributedAdapter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            stats: BackendStats::default(),
        }
    }

    async fn request(
        &self,
        op: Operation,
        id: &str,
        manifest: Option<&str>,
        ctx: &ObjectFetchContext,
    ) -> FetchResult<Bytes> {
        let started = Instant::now();
        let result = self.exchange(op, id, manifest, ctx).await;
        self.stats.record(NAME, op, ctx, started, &result);
        result
    }

    async fn exchange(
        &self,
        op: Operation,
        id: &str,
        manifest: Option<&str>,
        ctx: &ObjectFetchContext,
    ) -> FetchResult<Bytes> {
        let request = Request {
            op: op.as_str(),
            id,
            manifest,
            priority: ctx.priority(),
            cause: ctx.cause(),
            client_pid: ctx.client_pid(),
            request_id: ctx.request_id(),
        };
        let encoded = serde_json::to_vec(&request)
            .map_err(|e| FetchError::protocol(NAME, format!("encode request: {}", e)))?;

        let frame = self
            .transport
            .round_trip(Bytes::from(encoded))
            .await
            .map_err(|e| e.into_fetch_error(NAME))?;
        decode_response(op.object_kind(), id, &frame)
    }
}

fn decode_response(kind: ObjectKind, id: &str, frame: &[u8]) -> FetchResult<Bytes> {
    let response: Response = serde_json::from_slice(frame)
        .map_err(|e| FetchError::protocol(NAME, format!("malformed response: {}", e)))?;

    match response.status {
        Status::Ok => {
            let data = response
                .data
                .ok_or_else(|| FetchError::protocol(NAME, "ok response without data"))?;
            let bytes = hex::decode(data)
                .map_err(|e| FetchError::protocol(NAME, format!("data is not hex: {}", e)))?;
            Ok(Bytes::from(bytes))
        }
        Status::NotFound => Err(FetchError::not_found(kind, id)),
        Status::Unavailable => Err(FetchError::unavailable(
            NAME,
            response.message.unwrap_or_else(|| "service unavailable".to_string()),
        )),
    }
}

#[async_trait]
impl BackendAdapter for DistributedAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Distributed
    }

    fn supports(&self, _op: Operation) -> bool {
        true
    }

    #[instrument(skip_all, fields(hash = %hash.short()), level = "debug")]
    async fn fetch_blob(&self, hash: &Hash, ctx: &ObjectFetchContext) -> FetchResult<Bytes> {
        self.request(Operation::FetchBlob, &hash.to_hex(), None, ctx)
            .await
    }

    #[instrument(skip_all, fields(hash = %hash.short()), level = "debug")]
    async fn fetch_tree(&self, hash: &Hash, ctx: &ObjectFetchContext) -> FetchResult<Bytes> {
        self.request(Operation::FetchTree, &hash.to_hex(), None, ctx)
            .await
    }

    #[instrument(skip_all, fields(commit = %commit), level = "debug")]
    async fn fetch_tree_for_commit(
        &self,
        commit: &CommitId,
        ctx: &ObjectFetchContext,
    ) -> FetchResult<Bytes> {
        self.request(Operation::FetchTreeForCommit, &commit.to_hex(), None, ctx)
            .await
    }

    #[instrument(skip_all, fields(commit = %commit, manifest = %manifest.short()), level = "debug")]
    async fn fetch_tree_for_manifest(
        &self,
        commit: &CommitId,
        manifest: &Hash,
        ctx: &ObjectFetchContext,
    ) -> FetchResult<Bytes> {
        let manifest_hex = manifest.to_hex();
        self.request(
            Operation::FetchTreeForManifest,
            &commit.to_hex(),
            Some(&manifest_hex),
            ctx,
        )
        .await
    }

    fn stats(&self) -> BackendStatsSnapshot {
        self.stats.snapshot()
    }
}
