//! Encrypting data-path tests: PUT/GET/HEAD round-trips, algorithm
//! selection, integrity detection, and envelope-namespace isolation.

mod common;

use axum::http::StatusCode;
use common::{
    expect_body, generate_binary, pattern_bytes, read_body_result, sha256_hex, test_proxy,
    test_proxy_with, TestOptions,
};
use s3ep::crypto::metadata::meta_keys;

// ============================================================================
// Small-object GCM path
// ============================================================================

#[tokio::test]
async fn test_small_object_gcm_roundtrip() {
    let proxy = test_proxy();
    let payload = pattern_bytes(1024);

    let put = proxy.put("/bucket/small.bin", payload.clone()).await;
    assert_eq!(put.status(), StatusCode::OK);

    // Stored ciphertext carries the GCM tag and a complete envelope.
    let stored = proxy.store.stored("bucket", "small.bin").unwrap();
    assert!(stored.data.len() >= payload.len() + 16);
    assert_ne!(&stored.data[..64], &payload[..64]);
    assert_eq!(stored.metadata[meta_keys::DEK_ALGORITHM], "aes-gcm");
    assert_eq!(stored.metadata[meta_keys::KEK_PROVIDER], "aes");
    assert_eq!(stored.metadata[meta_keys::PROVIDER_ALIAS], "k1");
    assert!(stored.metadata.contains_key(meta_keys::ENCRYPTED_DEK));
    assert!(stored.metadata.contains_key(meta_keys::IV));
    assert!(stored.metadata.contains_key(meta_keys::KEK_FINGERPRINT));

    let get = proxy.get("/bucket/small.bin").await;
    let body = expect_body(get, StatusCode::OK).await;
    assert_eq!(body.as_ref(), payload.as_slice());
    assert_eq!(sha256_hex(&body), sha256_hex(&payload));
}

#[tokio::test]
async fn test_get_reports_plaintext_content_length() {
    let proxy = test_proxy();
    let payload = pattern_bytes(1024);
    proxy.put("/bucket/len.bin", payload.clone()).await;

    let get = proxy.get("/bucket/len.bin").await;
    assert_eq!(
        get.headers().get("content-length").unwrap(),
        &payload.len().to_string()
    );
    expect_body(get, StatusCode::OK).await;
}

// ============================================================================
// Streaming CTR path
// ============================================================================

#[tokio::test]
async fn test_large_object_ctr_roundtrip() {
    // Threshold is 64 KiB in the test profile; 1 MiB goes streaming.
    let proxy = test_proxy();
    let payload = generate_binary(1024 * 1024, 42);

    let put = proxy.put("/bucket/large.bin", payload.clone()).await;
    assert_eq!(put.status(), StatusCode::OK);

    // CTR preserves length and must carry an HMAC and the plain length.
    let stored = proxy.store.stored("bucket", "large.bin").unwrap();
    assert_eq!(stored.data.len(), payload.len());
    assert_ne!(&stored.data[..256], &payload[..256]);
    assert_eq!(stored.metadata[meta_keys::DEK_ALGORITHM], "aes-ctr");
    assert!(stored.metadata.contains_key(meta_keys::HMAC));
    assert_eq!(
        stored.metadata[meta_keys::CONTENT_LENGTH_PLAIN],
        payload.len().to_string()
    );

    let get = proxy.get("/bucket/large.bin").await;
    let body = expect_body(get, StatusCode::OK).await;
    assert_eq!(sha256_hex(&body), sha256_hex(&payload));
}

#[tokio::test]
async fn test_exact_threshold_uses_ctr() {
    let proxy = test_proxy_with(TestOptions {
        streaming_threshold: 4096,
        ..TestOptions::default()
    });
    let payload = generate_binary(4096, 1);
    proxy.put("/bucket/at-threshold.bin", payload).await;
    let stored = proxy.store.stored("bucket", "at-threshold.bin").unwrap();
    assert_eq!(stored.metadata[meta_keys::DEK_ALGORITHM], "aes-ctr");

    let below = generate_binary(4095, 2);
    proxy.put("/bucket/below.bin", below).await;
    let stored = proxy.store.stored("bucket", "below.bin").unwrap();
    assert_eq!(stored.metadata[meta_keys::DEK_ALGORITHM], "aes-gcm");
}

#[tokio::test]
async fn test_force_ctr_content_type_override() {
    let proxy = test_proxy();
    let payload = generate_binary(512, 3);
    proxy
        .put_with_headers(
            "/bucket/forced.bin",
            payload.clone(),
            &[("content-type", "application/x-s3ep-force-aes-ctr")],
        )
        .await;

    let stored = proxy.store.stored("bucket", "forced.bin").unwrap();
    assert_eq!(stored.metadata[meta_keys::DEK_ALGORITHM], "aes-ctr");
    assert_eq!(stored.data.len(), payload.len());

    let body = expect_body(proxy.get("/bucket/forced.bin").await, StatusCode::OK).await;
    assert_eq!(body.as_ref(), payload.as_slice());
}

// ============================================================================
// Integrity detection
// ============================================================================

#[tokio::test]
async fn test_tampered_ctr_body_aborts_download() {
    let proxy = test_proxy();
    let payload = generate_binary(256 * 1024, 11);
    proxy.put("/bucket/tampered.bin", payload).await;

    // Flip one ciphertext byte behind the proxy's back.
    proxy.store.corrupt("bucket", "tampered.bin", 100_000);

    // Headers may already be flushed; the body must fail, never complete.
    let response = proxy.get("/bucket/tampered.bin").await;
    assert!(read_body_result(response).await.is_err());
}

#[tokio::test]
async fn test_forged_hmac_metadata_aborts_download() {
    let proxy = test_proxy();
    let payload = generate_binary(128 * 1024, 12);
    proxy.put("/bucket/forged.bin", payload).await;

    proxy.store.set_metadata_field(
        "bucket",
        "forged.bin",
        meta_keys::HMAC,
        "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
    );

    let response = proxy.get("/bucket/forged.bin").await;
    assert!(read_body_result(response).await.is_err());
}

#[tokio::test]
async fn test_tampered_gcm_body_fails() {
    let proxy = test_proxy();
    let payload = pattern_bytes(2048);
    proxy.put("/bucket/small-tampered.bin", payload).await;
    proxy.store.corrupt("bucket", "small-tampered.bin", 500);

    let response = proxy.get("/bucket/small-tampered.bin").await;
    // GCM objects are opened before any byte is sent, so this surfaces as
    // a clean error response rather than a mid-stream abort.
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

// ============================================================================
// Metadata namespace isolation
// ============================================================================

#[tokio::test]
async fn test_client_cannot_set_reserved_metadata() {
    let proxy = test_proxy();
    let response = proxy
        .put_with_headers(
            "/bucket/forge-attempt.bin",
            b"payload".to_vec(),
            &[("x-amz-meta-s3ep-hmac", "Zm9yZ2Vk")],
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = read_body_result(response).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("MalformedRequest"));

    // The upstream object must not exist.
    assert!(!proxy.store.contains("bucket", "forge-attempt.bin"));
}

#[tokio::test]
async fn test_head_strips_envelope_fields() {
    let proxy = test_proxy();
    proxy
        .put_with_headers(
            "/bucket/headed.bin",
            generate_binary(100, 4),
            &[("x-amz-meta-owner", "alice")],
        )
        .await;

    let head = proxy.head("/bucket/headed.bin").await;
    assert_eq!(head.status(), StatusCode::OK);
    assert_eq!(head.headers().get("x-amz-meta-owner").unwrap(), "alice");
    assert_eq!(head.headers().get("content-length").unwrap(), "100");
    for (name, _) in head.headers() {
        assert!(
            !name.as_str().starts_with("x-amz-meta-s3ep-"),
            "leaked envelope header {name}"
        );
    }
}

// ============================================================================
// Backward compatibility and edge cases
// ============================================================================

#[tokio::test]
async fn test_unencrypted_object_streams_through() {
    let proxy = test_proxy();
    let legacy = generate_binary(32 * 1024, 99);
    proxy.store.preload_plain("bucket", "legacy.bin", &legacy);

    let body = expect_body(proxy.get("/bucket/legacy.bin").await, StatusCode::OK).await;
    assert_eq!(body.as_ref(), legacy.as_slice());
}

#[tokio::test]
async fn test_get_missing_object_is_404() {
    let proxy = test_proxy();
    let response = proxy.get("/bucket/absent.bin").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = read_body_result(response).await.unwrap();
    assert!(String::from_utf8_lossy(&body).contains("NoSuchKey"));
}

#[tokio::test]
async fn test_directory_marker_not_encrypted() {
    let proxy = test_proxy();
    let response = proxy.put("/bucket/folder/", Vec::new()).await;
    assert_eq!(response.status(), StatusCode::OK);

    let stored = proxy.store.stored("bucket", "folder/").unwrap();
    assert!(stored.data.is_empty());
    assert!(!stored.metadata.contains_key(meta_keys::DEK_ALGORITHM));
}

#[tokio::test]
async fn test_range_get_on_encrypted_object_rejected() {
    let proxy = test_proxy();
    proxy.put("/bucket/ranged.bin", generate_binary(1024, 5)).await;

    let response = proxy
        .request(
            axum::http::Request::builder()
                .method(axum::http::Method::GET)
                .uri("/bucket/ranged.bin")
                .header("range", "bytes=0-99")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn test_path_traversal_key_rejected() {
    let proxy = test_proxy();
    let response = proxy.put("/bucket/../../etc/passwd", b"x".to_vec()).await;
    assert_ne!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_copy_reencrypts_under_destination_key() {
    let proxy = test_proxy();
    let payload = generate_binary(10_000, 21);
    proxy
        .put_with_headers(
            "/bucket/source.bin",
            payload.clone(),
            &[("x-amz-meta-origin", "unit")],
        )
        .await;

    let response = proxy
        .request(
            axum::http::Request::builder()
                .method(axum::http::Method::PUT)
                .uri("/bucket/copy.bin")
                .header("x-amz-copy-source", "/bucket/source.bin")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    // Fresh DEK per object: ciphertexts must differ even for equal plaintext.
    let source = proxy.store.stored("bucket", "source.bin").unwrap();
    let copy = proxy.store.stored("bucket", "copy.bin").unwrap();
    assert_ne!(source.data, copy.data);
    assert_ne!(
        source.metadata[meta_keys::ENCRYPTED_DEK],
        copy.metadata[meta_keys::ENCRYPTED_DEK]
    );
    // COPY directive carries the client metadata along.
    assert_eq!(copy.metadata["origin"], "unit");

    let body = expect_body(proxy.get("/bucket/copy.bin").await, StatusCode::OK).await;
    assert_eq!(body.as_ref(), payload.as_slice());
}
