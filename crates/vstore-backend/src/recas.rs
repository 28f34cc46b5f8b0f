//! Adapter for the content-addressable remote-execution cache.
//!
//! The cache only knows digests, so it serves blobs and trees by hash and
//! nothing keyed by commit.
//!
//! Request frame:
//!
//! ```text
//! op:u8 | digest:[u8; 32] | instance_len:u16 LE | instance
//! ```
//!
//! Response frame:
//!
//! ```text
//! status:u8 | len:u64 LE | payload
//! ```

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::instrument;

use vstore_config::BackendKind;
use vstore_model::{Hash, ObjectKind, HASH_LEN};

use crate::{
    BackendAdapter, BackendStats, BackendStatsSnapshot, FetchError, FetchResult,
    ObjectFetchContext, Operation, Transport,
};

const NAME: &str = "recas";

const OP_READ_BLOB: u8 = 1;
const OP_READ_TREE: u8 = 2;

const STATUS_OK: u8 = 0;
const STATUS_NOT_FOUND: u8 = 1;
const STATUS_UNAVAILABLE: u8 = 2;

const RESPONSE_HEADER_LEN: usize = 1 + 8;

pub struct RemoteCacheAdapter {
    transport: Arc<dyn Transport>,
    instance_name: String,
    stats: BackendStats,
}

impl RemoteCacheAdapter {
    pub fn new(transport: Arc<dyn Transport>, instance_name: impl Into<String>) -> Self {
        Self {
            transport,
            instance_name: instance_name.into(),
            stats: BackendStats::default(),
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    async fn read(
        &self,
        op: Operation,
        hash: &Hash,
        ctx: &ObjectFetchContext,
    ) -> FetchResult<Bytes> {
        let started = Instant::now();
        let result = self.exchange(op, hash).await;
        self.stats.record(NAME, op, ctx, started, &result);
        result
    }

    async fn exchange(&self, op: Operation, hash: &Hash) -> FetchResult<Bytes> {
        let request = encode_request(op, hash, &self.instance_name)?;
        let frame = self
            .transport
            .round_trip(request)
            .await
            .map_err(|e| e.into_fetch_error(NAME))?;
        decode_response(op.object_kind(), hash, frame)
    }
}

fn encode_request(op: Operation, hash: &Hash, instance: &str) -> FetchResult<Bytes> {
    let code = match op {
        Operation::FetchBlob => OP_READ_BLOB,
        Operation::FetchTree => OP_READ_TREE,
        other => return Err(FetchError::unsupported(NAME, other)),
    };
    let instance_len = u16::try_from(instance.len())
        .map_err(|_| FetchError::protocol(NAME, "instance name too long"))?;

    let mut buf = BytesMut::with_capacity(1 + HASH_LEN + 2 + instance.len());
    buf.put_u8(code);
    buf.put_slice(hash.as_bytes());
    buf.put_u16_le(instance_len);
    buf.put_slice(instance.as_bytes());
    Ok(buf.freeze())
}

fn decode_response(kind: ObjectKind, hash: &Hash, frame: Bytes) -> FetchResult<Bytes> {
    if frame.len() < RESPONSE_HEADER_LEN {
        return Err(FetchError::protocol(
            NAME,
            format!("truncated header: {} bytes", frame.len()),
        ));
    }
    let status = frame[0];
    let mut len_buf = [0u8; 8];
    len_buf.copy_from_slice(&frame[1..RESPONSE_HEADER_LEN]);
    let len = u64::from_le_bytes(len_buf);
    let payload = frame.slice(RESPONSE_HEADER_LEN..);

    match status {
        STATUS_OK => {
            if payload.len() as u64 != len {
                return Err(FetchError::protocol(
                    NAME,
                    format!("announced {} bytes, received {}", len, payload.len()),
                ));
            }
            Ok(payload)
        }
        STATUS_NOT_FOUND => Err(FetchError::not_found(kind, hash)),
        STATUS_UNAVAILABLE => {
            let reason = String::from_utf8_lossy(&payload).into_owned();
            Err(FetchError::unavailable(NAME, reason))
        }
        other => Err(FetchError::protocol(NAME, format!("unknown status {}", other))),
    }
}

#[async_trait]
impl BackendAdapter for RemoteCacheAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Recas
    }

    fn supports(&self, op: Operation) -> bool {
        matches!(op, Operation::FetchBlob | Operation::FetchTree)
    }

    #[instrument(skip_all, fields(hash = %hash.short(), instance = %self.instance_name), level = "debug")]
    async fn fetch_blob(&self, hash: &Hash, ctx: &ObjectFetchContext) -> FetchResult<Bytes> {
        self.read(Operation::FetchBlob, hash, ctx).await
    }

    #[instrument(skip_all, fields(hash = %hash.short(), instance = %self.instance_name), level = "debug")]
    async fn fetch_tree(&self, hash: &Hash, ctx: &ObjectFetchContext) -> FetchResult<Bytes> {
        self.read(Operation::FetchTree, hash, ctx).await
    }

    fn stats(&self) -> BackendStatsSnapshot {
        self.stats.snapshot()
    }
}
