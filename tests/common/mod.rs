//! Shared test infrastructure for integration tests
//!
//! Provides an in-memory upstream object store, a router wired exactly like
//! the binary's, data generators, and request helpers.

#![allow(dead_code)]

use arc_swap::ArcSwap;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use axum::Router;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use http_body_util::BodyExt;
use rand::{Rng, RngCore, SeedableRng};
use s3ep::api::handlers::AppState;
use s3ep::config::UpstreamConfig;
use s3ep::crypto::{EnvelopeEngine, KekRing};
use s3ep::multipart::MultipartTable;
use s3ep::shutdown::ShutdownSupervisor;
use s3ep::upstream::{Forwarder, ObjectBody, ObjectHead, ObjectStore, UpstreamError};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tower::util::ServiceExt;

/// Deterministic pseudo-random payload for reproducible round-trips.
pub fn generate_binary(size: usize, seed: u64) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut data = vec![0u8; size];
    rng.fill_bytes(&mut data);
    data
}

/// The repeating 0x00..0xFF pattern used by small-object round-trips.
pub fn pattern_bytes(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// One stored object on the fake upstream.
#[derive(Clone)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    pub etag: String,
}

struct MemUpload {
    bucket: String,
    key: String,
    content_type: Option<String>,
    metadata: HashMap<String, String>,
    parts: BTreeMap<u32, (Vec<u8>, String)>,
}

/// In-memory `ObjectStore`, standing in for the S3 upstream.
#[derive(Default)]
pub struct MemoryStore {
    objects: DashMap<String, StoredObject>,
    uploads: DashMap<String, parking_lot::Mutex<MemUpload>>,
    id_counter: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn object_id(bucket: &str, key: &str) -> String {
        format!("{bucket}/{key}")
    }

    fn etag_for(data: &[u8]) -> String {
        format!("\"{}\"", &hex::encode(Sha256::digest(data))[..32])
    }

    /// Raw stored bytes + metadata, for asserting on ciphertext.
    pub fn stored(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.objects
            .get(&Self::object_id(bucket, key))
            .map(|o| o.clone())
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects.contains_key(&Self::object_id(bucket, key))
    }

    /// Flip one stored byte, simulating upstream corruption.
    pub fn corrupt(&self, bucket: &str, key: &str, offset: usize) {
        let mut obj = self
            .objects
            .get_mut(&Self::object_id(bucket, key))
            .expect("object to corrupt must exist");
        obj.data[offset] ^= 0x01;
    }

    /// Overwrite one stored metadata field, simulating envelope forgery.
    pub fn set_metadata_field(&self, bucket: &str, key: &str, field: &str, value: &str) {
        let mut obj = self
            .objects
            .get_mut(&Self::object_id(bucket, key))
            .expect("object must exist");
        obj.metadata.insert(field.to_string(), value.to_string());
    }

    /// Preload an object as if it were written before the proxy existed.
    pub fn preload_plain(&self, bucket: &str, key: &str, data: &[u8]) {
        self.objects.insert(
            Self::object_id(bucket, key),
            StoredObject {
                data: data.to_vec(),
                content_type: Some("application/octet-stream".to_string()),
                metadata: HashMap::new(),
                etag: Self::etag_for(data),
            },
        );
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.len()
    }

    fn head_of(obj: &StoredObject) -> ObjectHead {
        ObjectHead {
            content_length: obj.data.len() as u64,
            content_type: obj.content_type.clone(),
            etag: Some(obj.etag.clone()),
            last_modified: Some(chrono::Utc::now()),
            metadata: obj.metadata.clone(),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<String, UpstreamError> {
        let etag = Self::etag_for(&data);
        self.objects.insert(
            Self::object_id(bucket, key),
            StoredObject {
                data: data.to_vec(),
                content_type,
                metadata,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<ObjectBody, UpstreamError> {
        let obj = self
            .objects
            .get(&Self::object_id(bucket, key))
            .ok_or_else(|| UpstreamError::NotFound(format!("{bucket}/{key}")))?;
        let head = Self::head_of(&obj);
        // Feed the proxy in small chunks so streaming paths are exercised.
        let chunks: Vec<Result<Bytes, UpstreamError>> = obj
            .data
            .chunks(8 * 1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(ObjectBody {
            head,
            stream: futures::stream::iter(chunks).boxed(),
        })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectHead, UpstreamError> {
        let obj = self
            .objects
            .get(&Self::object_id(bucket, key))
            .ok_or_else(|| UpstreamError::NotFound(format!("{bucket}/{key}")))?;
        Ok(Self::head_of(&obj))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), UpstreamError> {
        self.objects.remove(&Self::object_id(bucket, key));
        Ok(())
    }

    async fn create_multipart(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<String, UpstreamError> {
        let upload_id = format!("mem-upload-{}", self.id_counter.fetch_add(1, Ordering::SeqCst));
        self.uploads.insert(
            upload_id.clone(),
            parking_lot::Mutex::new(MemUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                content_type,
                metadata,
                parts: BTreeMap::new(),
            }),
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> Result<String, UpstreamError> {
        let upload = self
            .uploads
            .get(upload_id)
            .ok_or_else(|| UpstreamError::NoSuchUpload(upload_id.to_string()))?;
        let etag = Self::etag_for(&data);
        upload
            .lock()
            .parts
            .insert(part_number, (data.to_vec(), etag.clone()));
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> Result<String, UpstreamError> {
        let (_, upload) = self
            .uploads
            .remove(upload_id)
            .ok_or_else(|| UpstreamError::NoSuchUpload(upload_id.to_string()))?;
        let upload = upload.into_inner();

        let mut data = Vec::new();
        for (number, etag) in parts {
            let (part_data, part_etag) = upload.parts.get(number).ok_or_else(|| {
                UpstreamError::Service {
                    status: 400,
                    code: "InvalidPart".to_string(),
                    message: format!("part {number} missing"),
                }
            })?;
            if part_etag != etag {
                return Err(UpstreamError::Service {
                    status: 400,
                    code: "InvalidPart".to_string(),
                    message: format!("etag mismatch for part {number}"),
                });
            }
            data.extend_from_slice(part_data);
        }

        let etag = format!("\"{}-{}\"", &sha256_hex(&data)[..32], parts.len());
        self.objects.insert(
            Self::object_id(bucket, key),
            StoredObject {
                data,
                content_type: upload.content_type,
                metadata: upload.metadata,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn abort_multipart(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), UpstreamError> {
        self.uploads.remove(upload_id);
        Ok(())
    }

    async fn replace_metadata(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<String>,
        metadata: HashMap<String, String>,
    ) -> Result<(), UpstreamError> {
        let mut obj = self
            .objects
            .get_mut(&Self::object_id(bucket, key))
            .ok_or_else(|| UpstreamError::NotFound(format!("{bucket}/{key}")))?;
        obj.content_type = content_type;
        obj.metadata = metadata;
        Ok(())
    }
}

/// A proxy instance over the in-memory upstream.
pub struct TestProxy {
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub state: Arc<AppState>,
}

/// Knobs the tests tweak per scenario.
pub struct TestOptions {
    pub streaming_threshold: u64,
    pub part_size: u64,
    pub kek_aliases: Vec<(&'static str, u8)>,
    pub active_alias: &'static str,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            streaming_threshold: 64 * 1024,
            part_size: 64 * 1024,
            kek_aliases: vec![("k1", 1)],
            active_alias: "k1",
        }
    }
}

pub fn test_ring(aliases: &[(&'static str, u8)], active: &str) -> KekRing {
    let providers = aliases
        .iter()
        .map(|(alias, seed)| s3ep::crypto::LoadedKek {
            alias: alias.to_string(),
            provider: s3ep::crypto::KekProvider::Aes(s3ep::crypto::AesKek::new([*seed; 32])),
        })
        .collect();
    KekRing::new(providers, active.to_string()).expect("test ring")
}

pub fn test_proxy_with(options: TestOptions) -> TestProxy {
    let store = MemoryStore::new();
    let ring = test_ring(&options.kek_aliases, options.active_alias);
    let engine = EnvelopeEngine::new(Arc::new(ArcSwap::from_pointee(ring)));
    let multipart = Arc::new(MultipartTable::new(store.clone(), options.part_size));
    let forwarder = Arc::new(
        Forwarder::new(&UpstreamConfig {
            // Unroutable: pass-through is not exercised against a live upstream.
            endpoint: "http://127.0.0.1:9".to_string(),
            region: "us-east-1".to_string(),
            access_key_id: "test".to_string(),
            secret_access_key: "test".to_string(),
            force_path_style: true,
            verify_tls: true,
        })
        .expect("forwarder"),
    );

    let state = Arc::new(AppState {
        store: store.clone(),
        engine,
        multipart,
        forwarder,
        supervisor: ShutdownSupervisor::new(),
        streaming_threshold: options.streaming_threshold,
        max_object_size: 256 * 1024 * 1024,
    });

    TestProxy {
        router: s3ep::api::router(state.clone()),
        store,
        state,
    }
}

pub fn test_proxy() -> TestProxy {
    test_proxy_with(TestOptions::default())
}

impl TestProxy {
    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router never errors")
    }

    pub async fn put(&self, path: &str, body: Vec<u8>) -> Response<Body> {
        self.request(
            Request::builder()
                .method(Method::PUT)
                .uri(path)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
    }

    pub async fn put_with_headers(
        &self,
        path: &str,
        body: Vec<u8>,
        headers: &[(&str, &str)],
    ) -> Response<Body> {
        let mut builder = Request::builder().method(Method::PUT).uri(path);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        self.request(builder.body(Body::from(body)).unwrap()).await
    }

    pub async fn get(&self, path: &str) -> Response<Body> {
        self.request(
            Request::builder()
                .method(Method::GET)
                .uri(path)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn head(&self, path: &str) -> Response<Body> {
        self.request(
            Request::builder()
                .method(Method::HEAD)
                .uri(path)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn delete(&self, path: &str) -> Response<Body> {
        self.request(
            Request::builder()
                .method(Method::DELETE)
                .uri(path)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn post(&self, path: &str, body: Vec<u8>) -> Response<Body> {
        self.request(
            Request::builder()
                .method(Method::POST)
                .uri(path)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
    }
}

/// Read a whole response body; panics on status mismatch to keep tests terse.
pub async fn expect_body(response: Response<Body>, expected_status: StatusCode) -> Bytes {
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body must be readable")
        .to_bytes();
    assert_eq!(
        status,
        expected_status,
        "unexpected status, body: {}",
        String::from_utf8_lossy(&body)
    );
    body
}

/// Read a body that is expected to fail mid-stream (integrity aborts).
pub async fn read_body_result(response: Response<Body>) -> Result<Bytes, axum::Error> {
    match response.into_body().collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => Err(e),
    }
}

/// Encode a payload with SigV4 streaming-chunked framing.
pub fn aws_chunked_encode(payload: &[u8], chunk_size: usize) -> Vec<u8> {
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let mut wire = Vec::new();
    for chunk in payload.chunks(chunk_size) {
        let sig: String = (0..64)
            .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap())
            .collect();
        wire.extend_from_slice(format!("{:x};chunk-signature={}\r\n", chunk.len(), sig).as_bytes());
        wire.extend_from_slice(chunk);
        wire.extend_from_slice(b"\r\n");
    }
    wire.extend_from_slice(b"0;chunk-signature=0000\r\n\r\n");
    wire
}
