//! Adapter for the legacy version-control server.
//!
//! Line-oriented protocol, one request per frame:
//!
//! ```text
//! getblob <hex>\n          ->  ok <len>\n<payload>
//! gettree <hex>\n          ->  missing\n
//! getcommittree <hex>\n    ->  error <message>\n
//! ```
//!
//! The server has no notion of manifests.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::instrument;

use vstore_config::BackendKind;
use vstore_model::{CommitId, Hash, ObjectKind};

use crate::{
    BackendAdapter, BackendStats, BackendStatsSnapshot, FetchError, FetchResult,
    ObjectFetchContext, Operation, Transport,
};

const NAME: &str = "legacy";

pub struct LegacyServerAdapter {
    transport: Arc<dyn Transport>,
    stats: BackendStats,
}

impl LegacyServerAdapter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            stats: BackendStats::default(),
        }
    }

    async fn request(
        &self,
        op: Operation,
        verb: &str,
        id: String,
        ctx: &ObjectFetchContext,
    ) -> FetchResult<Bytes> {
        let started = Instant::now();
        let kind = op.object_kind();
        let request = Bytes::from(format!("{} {}\n", verb, id));
        let result = match self.transport.round_trip(request).await {
            Ok(frame) => decode_response(kind, &id, frame),
            Err(e) => Err(e.into_fetch_error(NAME)),
        };
        self.stats.record(NAME, op, ctx, started, &result);
        result
    }
}

/// Parse one response frame.
fn decode_response(kind: ObjectKind, id: &str, frame: Bytes) -> FetchResult<Bytes> {
    let newline = frame
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| FetchError::protocol(NAME, "response has no status line"))?;
    let line = std::str::from_utf8(&frame[..newline])
        .map_err(|_| FetchError::protocol(NAME, "status line is not UTF-8"))?;
    let body = frame.slice(newline + 1..);

    let (status, rest) = line.split_once(' ').unwrap_or((line, ""));
    match status {
        "ok" => {
            let len: usize = rest
                .trim()
                .parse()
                .map_err(|_| FetchError::protocol(NAME, format!("bad length {:?}", rest)))?;
            if body.len() != len {
                return Err(FetchError::protocol(
                    NAME,
                    format!("announced {} bytes, received {}", len, body.len()),
                ));
            }
            Ok(body)
        }
        "missing" => Err(FetchError::not_found(kind, id)),
        "error" => Err(FetchError::unavailable(NAME, rest)),
        other => Err(FetchError::protocol(
            NAME,
            format!("unknown status {:?}", other),
        )),
    }
}

#[async_trait]
impl BackendAdapter for LegacyServerAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Legacy
    }

    fn supports(&self, op: Operation) -> bool {
        !matches!(op, Operation::FetchTreeForManifest)
    }

    #[instrument(skip_all, fields(hash = %hash.short()), level = "debug")]
    async fn fetch_blob(&self, hash: &Hash, ctx: &ObjectFetchContext) -> FetchResult<Bytes> {
        self.request(Operation::FetchBlob, "getblob", hash.to_hex(), ctx)
            .await
    }

    #[instrument(skip_all, fields(hash = %hash.short()), level = "debug")]
    async fn fetch_tree(&self, hash: &Hash, ctx: &ObjectFetchContext) -> FetchResult<Bytes> {
        self.request(Operation::FetchTree, "gettree", hash.to_hex(), ctx)
            .await
    }

    #[instrument(skip_all, fields(commit = %commit), level = "debug")]
    async fn fetch_tree_for_commit(
        &self,
        commit: &CommitId,
        ctx: &ObjectFetchContext,
    ) -> FetchResult<Bytes> {
        self.request(
            Operation::FetchTreeForCommit,
            "getcommittree",
            commit.to_hex(),
            ctx,
        )
        .await
    }

    fn stats(&self) -> BackendStatsSnapshot {
        self.stats.snapshot()
    }
}
