//! End-to-end gRPC tests: the service is served over a local socket and
//! exercised with the generated client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::Code;

use promptcache_proto::kvstore::kv_store_service_client::KvStoreServiceClient;
use promptcache_proto::kvstore::kv_store_service_server::KvStoreServiceServer;
use promptcache_proto::kvstore::{
    LookupRequest, PromptChunk, ReadRequest, WriteRequest,
};
use promptcache_resolver::StaticResolver;
use promptcache_server::PromptCacheService;
use promptcache_store::MemoryStoreOpener;

type Client = KvStoreServiceClient<tonic::transport::Channel>;

/// Serve the service on an ephemeral local port backed by in-memory blob
/// stores. Returns a connected client and a shutdown handle.
async fn start_server() -> (Client, oneshot::Sender<()>) {
    let opener = Arc::new(MemoryStoreOpener::new());
    let resolver = Arc::new(StaticResolver::new(".blob.core.windows.net", opener));
    let service = PromptCacheService::new(resolver);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        Server::builder()
            .add_service(KvStoreServiceServer::new(service))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                shutdown_rx.await.ok();
            })
            .await
            .unwrap();
    });

    let endpoint = format!("http://{addr}");
    let client = loop {
        match KvStoreServiceClient::connect(endpoint.clone()).await {
            Ok(client) => break client,
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    };

    (client, shutdown_tx)
}

fn block_tokens(seed: i64) -> Vec<i64> {
    (0..128).map(|i| seed * 1000 + i).collect()
}

fn chunk(hash: u64, parent: u64, tokens: Vec<i64>) -> PromptChunk {
    PromptChunk {
        hash,
        partition_key: "tenant-a".to_string(),
        parent_hash: parent,
        buffer: format!("kv-state-{hash}").into_bytes(),
        tokens,
        completion_id: format!("run-{hash}"),
    }
}

fn write_request(chunk: PromptChunk) -> WriteRequest {
    WriteRequest {
        resource_name: "tenant-a".to_string(),
        container_name: "prompts".to_string(),
        chunk: Some(chunk),
    }
}

fn read_request(location: &str) -> ReadRequest {
    ReadRequest {
        resource_name: "tenant-a".to_string(),
        container_name: "prompts".to_string(),
        location: location.to_string(),
        completion_id: "run-stream".to_string(),
    }
}

#[tokio::test]
async fn test_write_lookup_read_round_trip() {
    let (mut client, _shutdown) = start_server().await;

    let t0 = block_tokens(1);
    let t1 = block_tokens(2);
    client
        .write(write_request(chunk(7, 0, t0.clone())))
        .await
        .unwrap();
    client
        .write(write_request(chunk(11, 7, t1.clone())))
        .await
        .unwrap();

    let combined: Vec<i64> = t0.iter().chain(t1.iter()).copied().collect();
    let lookup = client
        .lookup(LookupRequest {
            resource_name: "tenant-a".to_string(),
            container_name: "prompts".to_string(),
            partition_key: "tenant-a".to_string(),
            completion_id: "run-e2e".to_string(),
            tokens: combined,
            precomputed_hashes: vec![7, 11],
        })
        .await
        .unwrap()
        .into_inner();

    assert!(lookup.success);
    assert_eq!(lookup.cached_blocks, 2);
    assert_eq!(lookup.last_hash, 11);
    assert_eq!(lookup.locations.len(), 2);

    let metrics = lookup.server_metrics.expect("metrics stamped");
    assert!(metrics.total_latency_us >= metrics.storage_latency_us);
    assert_eq!(
        metrics.overhead_us,
        metrics.total_latency_us - metrics.storage_latency_us
    );

    // Read back the second block by its returned location.
    let read = client
        .read(read_request(&lookup.locations[1].location))
        .await
        .unwrap()
        .into_inner();
    assert!(read.success);
    assert!(read.found);
    let block = read.chunk.expect("chunk present");
    assert_eq!(block.hash, 11);
    assert_eq!(block.parent_hash, 7);
    assert_eq!(block.buffer, b"kv-state-11");
}

#[tokio::test]
async fn test_read_miss_is_success_not_found() {
    let (mut client, _shutdown) = start_server().await;

    let read = client
        .read(read_request("absent-location"))
        .await
        .unwrap()
        .into_inner();
    assert!(read.success);
    assert!(!read.found);
    assert!(read.chunk.is_none());
}

#[tokio::test]
async fn test_unary_validation_errors() {
    let (mut client, _shutdown) = start_server().await;

    // Lookup: empty resource name.
    let status = client
        .lookup(LookupRequest {
            container_name: "prompts".to_string(),
            tokens: vec![1],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    // Lookup: empty tokens.
    let status = client
        .lookup(LookupRequest {
            resource_name: "tenant-a".to_string(),
            container_name: "prompts".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    // Read: empty location.
    let status = client.read(read_request("")).await.unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);

    // Write: missing chunk.
    let status = client
        .write(WriteRequest {
            resource_name: "tenant-a".to_string(),
            container_name: "prompts".to_string(),
            chunk: None,
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

// S7: streaming responses arrive in request order; an invalid item
// produces a failed response at its position without disturbing the rest.
#[tokio::test]
async fn test_streaming_read_preserves_order_with_invalid_item() {
    let (mut client, _shutdown) = start_server().await;

    let t0 = block_tokens(1);
    let t1 = block_tokens(2);
    client
        .write(write_request(chunk(7, 0, t0.clone())))
        .await
        .unwrap();
    client
        .write(write_request(chunk(11, 7, t1.clone())))
        .await
        .unwrap();

    let combined: Vec<i64> = t0.iter().chain(t1.iter()).copied().collect();
    let lookup = client
        .lookup(LookupRequest {
            resource_name: "tenant-a".to_string(),
            container_name: "prompts".to_string(),
            tokens: combined,
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    assert_eq!(lookup.cached_blocks, 2);

    let requests = vec![
        read_request(&lookup.locations[0].location),
        read_request(""), // invalid: empty location
        read_request(&lookup.locations[1].location),
    ];

    let mut stream = client
        .streaming_read(tokio_stream::iter(requests))
        .await
        .unwrap()
        .into_inner();

    let mut responses = Vec::new();
    while let Some(response) = stream.message().await.unwrap() {
        responses.push(response);
    }

    assert_eq!(responses.len(), 3);

    assert!(responses[0].success);
    assert!(responses[0].found);
    assert_eq!(responses[0].chunk.as_ref().unwrap().hash, 7);
    assert!(responses[0].server_metrics.is_some());

    assert!(!responses[1].success);
    assert!(!responses[1].found);
    assert!(responses[1].error.contains("missing required fields"));

    assert!(responses[2].success);
    assert!(responses[2].found);
    assert_eq!(responses[2].chunk.as_ref().unwrap().hash, 11);
}

// A missing blob inside a stream is a found=false response, and a larger
// batch still arrives strictly in order.
#[tokio::test]
async fn test_streaming_read_miss_and_ordering_at_depth() {
    let (mut client, _shutdown) = start_server().await;

    let mut locations = Vec::new();
    for i in 0..6u64 {
        let tokens = block_tokens(i as i64 + 1);
        client
            .write(write_request(chunk(
                100 + i,
                if i == 0 { 0 } else { 99 + i },
                tokens.clone(),
            )))
            .await
            .unwrap();
        let lookup = client
            .lookup(LookupRequest {
                resource_name: "tenant-a".to_string(),
                container_name: "prompts".to_string(),
                tokens,
                precomputed_hashes: vec![100 + i],
                ..Default::default()
            })
            .await
            .unwrap()
            .into_inner();
        locations.push(lookup.locations[0].location.clone());
    }

    let mut requests: Vec<ReadRequest> = locations.iter().map(|l| read_request(l)).collect();
    requests.insert(3, read_request("ghost-blob"));

    let mut stream = client
        .streaming_read(tokio_stream::iter(requests))
        .await
        .unwrap()
        .into_inner();

    let mut responses = Vec::new();
    while let Some(response) = stream.message().await.unwrap() {
        responses.push(response);
    }
    assert_eq!(responses.len(), 7);

    for (index, response) in responses.iter().enumerate() {
        if index == 3 {
            assert!(response.success);
            assert!(!response.found, "ghost blob must be a miss");
        } else {
            let expected_hash = 100 + if index < 3 { index } else { index - 1 } as u64;
            assert!(response.success);
            assert!(response.found);
            assert_eq!(response.chunk.as_ref().unwrap().hash, expected_hash);
        }
    }
}

// Dropping the client mid-stream must not wedge the server; subsequent
// RPCs on a fresh connection still work.
#[tokio::test]
async fn test_streaming_read_survives_client_disconnect() {
    let (mut client, _shutdown) = start_server().await;

    let tokens = block_tokens(1);
    client
        .write(write_request(chunk(7, 0, tokens.clone())))
        .await
        .unwrap();
    let lookup = client
        .lookup(LookupRequest {
            resource_name: "tenant-a".to_string(),
            container_name: "prompts".to_string(),
            tokens,
            ..Default::default()
        })
        .await
        .unwrap()
        .into_inner();
    let location = lookup.locations[0].location.clone();

    {
        let requests: Vec<ReadRequest> = (0..16).map(|_| read_request(&location)).collect();
        let mut stream = client
            .streaming_read(tokio_stream::iter(requests))
            .await
            .unwrap()
            .into_inner();
        // Take one response, then drop the stream mid-flight.
        let first = stream.message().await.unwrap().unwrap();
        assert!(first.found);
    }

    // The server keeps serving.
    let read = client.read(read_request(&location)).await.unwrap().into_inner();
    assert!(read.found);
}
