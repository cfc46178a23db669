//! gRPC service implementation.
//!
//! Each RPC validates its request, resolves the tenant's cache engine,
//! runs the storage operation, and stamps a latency breakdown into the
//! response. Validation failures map to `INVALID_ARGUMENT`; resolution
//! and engine failures map to `INTERNAL` carrying the engine's message.
//!
//! ## StreamingRead
//!
//! Requests are processed concurrently but responses keep request order:
//!
//! ```text
//! inbound loop ──spawn──► worker        worker        worker
//!      │                    │             │             │
//!      └── handle FIFO ─────┴─────────────┴─────────────┘
//!                │ (arrival order)
//!                ▼
//!          writer loop ──► response stream
//! ```
//!
//! One gRPC read is outstanding at a time; each incoming request spawns a
//! worker whose join handle enters a FIFO. A single writer drains the
//! FIFO in order, so a slow early read holds back later completions
//! rather than reordering them. Per-item faults (validation, resolution,
//! storage) become `success=false` responses in their FIFO position and
//! the stream stays alive. When the client goes away mid-stream the
//! writer keeps draining handles so every worker runs to completion
//! before the pipeline is torn down.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::{wrappers::ReceiverStream, Stream};
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

use promptcache_proto::kvstore as pb;
use promptcache_proto::kvstore::kv_store_service_server::KvStoreService;
use promptcache_resolver::AccountResolver;

use crate::metrics;

/// The PromptCache gRPC service.
pub struct PromptCacheService {
    resolver: Arc<dyn AccountResolver>,
}

impl PromptCacheService {
    pub fn new(resolver: Arc<dyn AccountResolver>) -> Self {
        Self { resolver }
    }
}

fn request_id<T>(request: &Request<T>) -> String {
    request
        .metadata()
        .get("request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

fn server_metrics(storage_latency_us: i64, total_latency_us: i64) -> pb::ServerMetrics {
    pb::ServerMetrics {
        storage_latency_us,
        total_latency_us,
        overhead_us: total_latency_us - storage_latency_us,
    }
}

fn elapsed_us(started: Instant) -> i64 {
    started.elapsed().as_micros() as i64
}

fn to_proto_chunk(chunk: promptcache_core::PromptChunk) -> pb::PromptChunk {
    pb::PromptChunk {
        hash: chunk.hash,
        partition_key: chunk.partition_key,
        parent_hash: chunk.parent_hash,
        buffer: chunk.buffer.to_vec(),
        tokens: chunk.tokens,
        completion_id: chunk.completion_id,
    }
}

/// A per-item failure inside a read stream; the stream itself stays OK.
fn stream_failure(error: impl Into<String>) -> pb::ReadResponse {
    pb::ReadResponse {
        success: false,
        found: false,
        error: error.into(),
        chunk: None,
        server_metrics: None,
    }
}

/// Process one streaming read request to a response, never failing the
/// stream.
async fn handle_stream_item(
    resolver: Arc<dyn AccountResolver>,
    request: pb::ReadRequest,
) -> pb::ReadResponse {
    if request.resource_name.is_empty()
        || request.container_name.is_empty()
        || request.location.is_empty()
    {
        return stream_failure("Invalid request: missing required fields");
    }

    let engine = match resolver
        .resolve(&request.resource_name, &request.container_name)
        .await
    {
        Ok(engine) => engine,
        Err(e) => return stream_failure(format!("Failed to resolve storage: {e}")),
    };

    let storage_started = Instant::now();
    match engine.read(&request.location, &request.completion_id).await {
        Ok((found, chunk)) => {
            let storage_us = elapsed_us(storage_started);
            pb::ReadResponse {
                success: true,
                found,
                error: String::new(),
                chunk: found.then(|| to_proto_chunk(chunk)),
                server_metrics: Some(server_metrics(storage_us, storage_us)),
            }
        }
        Err(e) => stream_failure(e.to_string()),
    }
}

#[tonic::async_trait]
impl KvStoreService for PromptCacheService {
    async fn lookup(
        &self,
        request: Request<pb::LookupRequest>,
    ) -> Result<Response<pb::LookupResponse>, Status> {
        let started = Instant::now();
        let request_id = request_id(&request);
        let req = request.into_inner();

        if req.resource_name.is_empty() {
            return Err(Status::invalid_argument("resource_name is required"));
        }
        if req.container_name.is_empty() {
            return Err(Status::invalid_argument("container_name is required"));
        }
        if req.tokens.is_empty() {
            return Err(Status::invalid_argument("tokens list cannot be empty"));
        }

        let engine = match self
            .resolver
            .resolve(&req.resource_name, &req.container_name)
            .await
        {
            Ok(engine) => engine,
            Err(e) => {
                metrics::record_rpc("Lookup", &request_id, 0, elapsed_us(started), false, &e.to_string());
                return Err(Status::internal(e.to_string()));
            }
        };

        let storage_started = Instant::now();
        let result = engine
            .lookup(
                &req.partition_key,
                &req.completion_id,
                &req.tokens,
                &req.precomputed_hashes,
            )
            .await;
        let storage_us = elapsed_us(storage_started);
        let total_us = elapsed_us(started);

        let response = pb::LookupResponse {
            success: true,
            error: String::new(),
            cached_blocks: result.cached_blocks as i32,
            last_hash: result.last_hash,
            locations: result
                .locations
                .into_iter()
                .map(|l| pb::BlockLocation {
                    hash: l.hash,
                    location: l.location,
                })
                .collect(),
            server_metrics: Some(server_metrics(storage_us, total_us)),
        };

        metrics::record_rpc("Lookup", &request_id, storage_us, total_us, true, "");
        Ok(Response::new(response))
    }

    async fn read(
        &self,
        request: Request<pb::ReadRequest>,
    ) -> Result<Response<pb::ReadResponse>, Status> {
        let started = Instant::now();
        let request_id = request_id(&request);
        let req = request.into_inner();

        if req.resource_name.is_empty() {
            return Err(Status::invalid_argument("resource_name is required"));
        }
        if req.container_name.is_empty() {
            return Err(Status::invalid_argument("container_name is required"));
        }
        if req.location.is_empty() {
            return Err(Status::invalid_argument("location is required"));
        }

        let engine = match self
            .resolver
            .resolve(&req.resource_name, &req.container_name)
            .await
        {
            Ok(engine) => engine,
            Err(e) => {
                metrics::record_rpc("Read", &request_id, 0, elapsed_us(started), false, &e.to_string());
                return Err(Status::internal(e.to_string()));
            }
        };

        let storage_started = Instant::now();
        match engine.read(&req.location, &req.completion_id).await {
            Ok((found, chunk)) => {
                let storage_us = elapsed_us(storage_started);
                let total_us = elapsed_us(started);

                let response = pb::ReadResponse {
                    success: true,
                    error: String::new(),
                    found,
                    chunk: found.then(|| to_proto_chunk(chunk)),
                    server_metrics: Some(server_metrics(storage_us, total_us)),
                };
                metrics::record_rpc("Read", &request_id, storage_us, total_us, true, "");
                Ok(Response::new(response))
            }
            Err(e) => {
                let total_us = elapsed_us(started);
                metrics::record_rpc("Read", &request_id, 0, total_us, false, &e.to_string());
                Err(Status::internal(e.to_string()))
            }
        }
    }

    async fn write(
        &self,
        request: Request<pb::WriteRequest>,
    ) -> Result<Response<pb::WriteResponse>, Status> {
        let started = Instant::now();
        let request_id = request_id(&request);
        let req = request.into_inner();

        if req.resource_name.is_empty() {
            return Err(Status::invalid_argument("resource_name is required"));
        }
        if req.container_name.is_empty() {
            return Err(Status::invalid_argument("container_name is required"));
        }
        let proto_chunk = req
            .chunk
            .ok_or_else(|| Status::invalid_argument("chunk is required"))?;

        let engine = match self
            .resolver
            .resolve(&req.resource_name, &req.container_name)
            .await
        {
            Ok(engine) => engine,
            Err(e) => {
                metrics::record_rpc("Write", &request_id, 0, elapsed_us(started), false, &e.to_string());
                return Err(Status::internal(e.to_string()));
            }
        };

        let chunk = promptcache_core::PromptChunk::new(
            proto_chunk.hash,
            proto_chunk.partition_key,
            proto_chunk.parent_hash,
            Bytes::from(proto_chunk.buffer),
            proto_chunk.tokens,
            proto_chunk.completion_id,
        );

        let storage_started = Instant::now();
        match engine.write(&chunk).await {
            Ok(()) => {
                let storage_us = elapsed_us(storage_started);
                let total_us = elapsed_us(started);

                let response = pb::WriteResponse {
                    success: true,
                    error: String::new(),
                    server_metrics: Some(server_metrics(storage_us, total_us)),
                };
                metrics::record_rpc("Write", &request_id, storage_us, total_us, true, "");
                Ok(Response::new(response))
            }
            Err(e) => {
                let total_us = elapsed_us(started);
                metrics::record_rpc("Write", &request_id, 0, total_us, false, &e.to_string());
                Err(Status::internal(e.to_string()))
            }
        }
    }

    type StreamingReadStream =
        Pin<Box<dyn Stream<Item = Result<pb::ReadResponse, Status>> + Send + 'static>>;

    async fn streaming_read(
        &self,
        request: Request<Streaming<pb::ReadRequest>>,
    ) -> Result<Response<Self::StreamingReadStream>, Status> {
        let request_id = request_id(&request);
        let mut inbound = request.into_inner();
        let resolver = self.resolver.clone();

        let (response_tx, response_rx) = mpsc::channel::<Result<pb::ReadResponse, Status>>(16);
        let (handle_tx, mut handle_rx) = mpsc::channel::<JoinHandle<pb::ReadResponse>>(64);

        // Inbound loop: one stream read outstanding at a time; every
        // request spawns a worker whose handle enters the FIFO.
        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(request)) => {
                        let resolver = resolver.clone();
                        let handle =
                            tokio::spawn(
                                async move { handle_stream_item(resolver, request).await },
                            );
                        if handle_tx.send(handle).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(status) => {
                        debug!(error = %status, "Read stream ended with transport error");
                        break;
                    }
                }
            }
        });

        // Writer loop: drain workers in arrival order, one write in
        // flight at a time. Keeps draining after the client disappears so
        // no worker outlives the stream unsupervised.
        let stream_request_id = request_id.clone();
        tokio::spawn(async move {
            let stream_started = Instant::now();
            let mut client_gone = false;
            while let Some(handle) = handle_rx.recv().await {
                let response = match handle.await {
                    Ok(response) => response,
                    Err(e) => {
                        warn!(error = %e, "Streaming read worker failed");
                        stream_failure(format!("worker failed: {e}"))
                    }
                };
                if !client_gone && response_tx.send(Ok(response)).await.is_err() {
                    client_gone = true;
                }
            }

            let total_us = elapsed_us(stream_started);
            metrics::record_rpc(
                "StreamingRead",
                &stream_request_id,
                0,
                total_us,
                !client_gone,
                if client_gone { "client disconnected" } else { "" },
            );
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(response_rx))))
    }
}
