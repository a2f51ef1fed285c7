//! Streaming pipeline tests against a real HTTP server
//!
//! An in-process axum server serves artifacts; the pipeline downloads,
//! hashes, and uploads into an in-memory object store. Covers checksum and
//! size enforcement, abort-on-error semantics, and multi-part streaming.

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::time::sleep;

use exportbox::pipeline::{TransferError, TransferLimits, TransferPipeline, TransferRequest};
use exportbox::storage::StorageClient;

const BODY: &[u8] = b"elevenbytes";

fn large_body() -> Vec<u8> {
    (0..10_240).map(|i| (i % 251) as u8).collect()
}

async fn start_server() -> String {
    let app = Router::new()
        .route("/small.bin", get(|| async { Bytes::from_static(BODY) }))
        .route("/large.bin", get(|| async { Bytes::from(large_body()) }))
        .route(
            "/missing.bin",
            get(|| async { (axum::http::StatusCode::NOT_FOUND, "no such export") }),
        )
        .route(
            "/cranky.bin",
            get(|| async { (axum::http::StatusCode::SERVICE_UNAVAILABLE, "try later") }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    sleep(Duration::from_millis(50)).await;
    format!("http://{addr}")
}

fn pipeline(storage: &Arc<StorageClient>, limits: TransferLimits) -> TransferPipeline {
    TransferPipeline::new(storage.clone(), limits).unwrap()
}

fn request(base: &str, file: &str, key: &str) -> TransferRequest {
    TransferRequest {
        download_url: format!("{base}/{file}"),
        output_key: key.to_string(),
        expected_size: None,
        checksum: None,
    }
}

#[tokio::test]
async fn transfers_and_verifies_sha256() {
    let base = start_server().await;
    let storage = Arc::new(StorageClient::in_memory());
    let pipeline = pipeline(&storage, TransferLimits::default());

    let mut req = request(&base, "small.bin", "jobs/1/0_small.bin");
    req.expected_size = Some(BODY.len() as u64);
    req.checksum = Some(format!("sha256:{}", hex::encode(Sha256::digest(BODY))));

    let receipt = pipeline.transfer(&req).await.unwrap();
    assert_eq!(receipt.bytes, BODY.len() as u64);
    assert_eq!(receipt.uploaded_key, "jobs/1/0_small.bin");

    let stored = storage.download("jobs/1/0_small.bin").await.unwrap();
    assert_eq!(stored, BODY);
}

#[tokio::test]
async fn verifies_md5_hints_too() {
    let base = start_server().await;
    let storage = Arc::new(StorageClient::in_memory());
    let pipeline = pipeline(&storage, TransferLimits::default());

    let mut req = request(&base, "small.bin", "k");
    req.checksum = Some(format!("md5:{}", hex::encode(md5::Md5::digest(BODY))));

    pipeline.transfer(&req).await.unwrap();
    assert!(storage.exists("k").await.unwrap());
}

#[tokio::test]
async fn checksum_mismatch_aborts_the_upload() {
    let base = start_server().await;
    let storage = Arc::new(StorageClient::in_memory());
    let pipeline = pipeline(&storage, TransferLimits::default());

    let mut req = request(&base, "small.bin", "jobs/1/bad.bin");
    req.checksum = Some(format!("sha256:{}", "ab".repeat(32)));

    let error = pipeline.transfer(&req).await.unwrap_err();
    assert!(matches!(error, TransferError::ChecksumMismatch { .. }));
    assert!(error.is_retryable());

    // No partial object under the key.
    assert!(!storage.exists("jobs/1/bad.bin").await.unwrap());
}

#[tokio::test]
async fn http_404_is_a_permanent_download_failure() {
    let base = start_server().await;
    let storage = Arc::new(StorageClient::in_memory());
    let pipeline = pipeline(&storage, TransferLimits::default());

    let error = pipeline
        .transfer(&request(&base, "missing.bin", "k"))
        .await
        .unwrap_err();
    match error {
        TransferError::DownloadFailed {
            status, retryable, ..
        } => {
            assert_eq!(status, Some(404));
            assert!(!retryable);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn http_5xx_is_retryable() {
    let base = start_server().await;
    let storage = Arc::new(StorageClient::in_memory());
    let pipeline = pipeline(&storage, TransferLimits::default());

    let error = pipeline
        .transfer(&request(&base, "cranky.bin", "k"))
        .await
        .unwrap_err();
    assert!(error.is_retryable());
}

#[tokio::test]
async fn expected_size_mismatch_is_rejected_before_streaming() {
    let base = start_server().await;
    let storage = Arc::new(StorageClient::in_memory());
    let pipeline = pipeline(&storage, TransferLimits::default());

    let mut req = request(&base, "small.bin", "k");
    req.expected_size = Some(9999);

    let error = pipeline.transfer(&req).await.unwrap_err();
    match error {
        TransferError::SizeMismatch {
            expected,
            actual,
            retryable,
        } => {
            assert_eq!(expected, 9999);
            assert_eq!(actual, BODY.len() as u64);
            assert!(!retryable);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!storage.exists("k").await.unwrap());
}

#[tokio::test]
async fn large_bodies_stream_in_multiple_parts() {
    let base = start_server().await;
    let storage = Arc::new(StorageClient::in_memory());
    // 1 KiB parts against a 10 KiB body: eleven put_part calls.
    let pipeline = pipeline(
        &storage,
        TransferLimits {
            part_size: 1024,
            ..TransferLimits::default()
        },
    );

    let receipt = pipeline
        .transfer(&request(&base, "large.bin", "jobs/1/large.bin"))
        .await
        .unwrap();
    assert_eq!(receipt.bytes, 10_240);

    let stored = storage.download("jobs/1/large.bin").await.unwrap();
    assert_eq!(stored, large_body());
}

#[tokio::test]
async fn size_ceiling_is_inclusive() {
    let base = start_server().await;
    let storage = Arc::new(StorageClient::in_memory());

    // Exactly at the limit: accepted.
    let at_limit = pipeline(
        &storage,
        TransferLimits {
            max_artifact_bytes: BODY.len() as u64,
            ..TransferLimits::default()
        },
    );
    at_limit
        .transfer(&request(&base, "small.bin", "ok"))
        .await
        .unwrap();

    // One byte under the body size: rejected.
    let over_limit = pipeline(
        &storage,
        TransferLimits {
            max_artifact_bytes: BODY.len() as u64 - 1,
            ..TransferLimits::default()
        },
    );
    let error = over_limit
        .transfer(&request(&base, "small.bin", "too-big"))
        .await
        .unwrap_err();
    assert!(matches!(error, TransferError::SizeExceeded { .. }));
    assert!(!error.is_retryable());
    assert!(!storage.exists("too-big").await.unwrap());
}

#[tokio::test]
async fn malformed_checksum_hint_is_invalid_input() {
    let base = start_server().await;
    let storage = Arc::new(StorageClient::in_memory());
    let pipeline = pipeline(&storage, TransferLimits::default());

    let mut req = request(&base, "small.bin", "k");
    req.checksum = Some("crc32:abcd".to_string());

    let error = pipeline.transfer(&req).await.unwrap_err();
    assert!(matches!(error, TransferError::InvalidInput(_)));
    assert!(!error.is_retryable());
}
