//! In-process HLS origin for integration tests.
//!
//! Each registered stream serves `/{name}/index.m3u8`, `/{name}/seg{i}.ts`
//! and `/{name}/key.bin`. Failures, latency and encryption are configured
//! per stream; every request is counted by path.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use cipher::block_padding::Pkcs7;
use cipher::{BlockEncryptMut, KeyIvInit};
use hlsgrab_engine::hls::derive_iv;
use hlsgrab_engine::{HttpConfig, JobConfig, MergeTool};
use parking_lot::Mutex;
use tokio::net::TcpListener;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// Every request gets this status.
    Always(StatusCode),
    /// The first `n` requests get this status.
    Times(usize, StatusCode),
}

#[derive(Debug, Clone, Default)]
pub struct StreamSpec {
    pub segments: usize,
    pub key: Option<[u8; 16]>,
    /// Written as `IV=0x..` on the key tag.
    pub explicit_iv: Option<[u8; 16]>,
    /// Value of `EXT-X-MEDIA-SEQUENCE`.
    pub media_sequence: u64,
    /// Encrypt with the media sequence number as IV instead of the index.
    pub sequence_iv: bool,
    /// Key bytes served instead of `key`.
    pub served_key: Option<Vec<u8>>,
    pub manifest_status: Option<StatusCode>,
    pub manifest_delay: Duration,
    pub segment_delay: Duration,
    pub failures: HashMap<usize, Failure>,
}

impl StreamSpec {
    pub fn plain(segments: usize) -> Self {
        Self {
            segments,
            ..Default::default()
        }
    }

    pub fn encrypted(segments: usize, key: [u8; 16]) -> Self {
        Self {
            segments,
            key: Some(key),
            ..Default::default()
        }
    }

    pub fn fail(mut self, index: usize, failure: Failure) -> Self {
        self.failures.insert(index, failure);
        self
    }
}

/// Plaintext of segment `index` of stream `name`.
pub fn segment_payload(name: &str, index: usize) -> Vec<u8> {
    let unit = format!("{name}:{index:05}|");
    unit.as_bytes()
        .iter()
        .copied()
        .cycle()
        .take(1000 + index * 7)
        .collect()
}

/// What a complete download of the stream must produce.
pub fn expected_output(name: &str, segments: usize) -> Vec<u8> {
    (0..segments).flat_map(|i| segment_payload(name, i)).collect()
}

pub fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    let cipher = Aes128CbcEnc::new_from_slices(key, iv).unwrap();
    let padded_len = ((plaintext.len() / 16) + 1) * 16;
    let mut buffer = vec![0u8; padded_len];
    buffer[..plaintext.len()].copy_from_slice(plaintext);
    cipher
        .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
        .unwrap()
        .to_vec()
}

#[derive(Default)]
struct Origin {
    streams: Mutex<HashMap<String, StreamSpec>>,
    counts: Mutex<HashMap<String, usize>>,
    headers: Mutex<HashMap<String, HeaderMap>>,
}

pub struct TestServer {
    base_url: String,
    origin: Arc<Origin>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let origin = Arc::new(Origin::default());

        let app = Router::new()
            .route("/{stream}/{file}", get(serve))
            .with_state(origin.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://127.0.0.1:{}", addr.port()),
            origin,
        }
    }

    pub fn add_stream(&self, name: &str, spec: StreamSpec) -> String {
        self.origin.streams.lock().insert(name.to_string(), spec);
        self.playlist_url(name)
    }

    pub fn update_stream(&self, name: &str, apply: impl FnOnce(&mut StreamSpec)) {
        if let Some(spec) = self.origin.streams.lock().get_mut(name) {
            apply(spec);
        }
    }

    pub fn playlist_url(&self, name: &str) -> String {
        format!("{}/{name}/index.m3u8", self.base_url)
    }

    pub fn count(&self, path: &str) -> usize {
        self.origin.counts.lock().get(path).copied().unwrap_or(0)
    }

    pub fn segment_count(&self, name: &str, index: usize) -> usize {
        self.count(&format!("/{name}/seg{index}.ts"))
    }

    /// Headers of the most recent request to `path`.
    pub fn last_headers(&self, path: &str) -> Option<HeaderMap> {
        self.origin.headers.lock().get(path).cloned()
    }
}

async fn serve(
    State(origin): State<Arc<Origin>>,
    Path((stream, file)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let path = format!("/{stream}/{file}");
    let seen = {
        let mut counts = origin.counts.lock();
        let count = counts.entry(path.clone()).or_insert(0);
        *count += 1;
        *count
    };
    origin.headers.lock().insert(path, headers);

    let Some(spec) = origin.streams.lock().get(&stream).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if file == "index.m3u8" {
        tokio::time::sleep(spec.manifest_delay).await;
        if let Some(status) = spec.manifest_status {
            return status.into_response();
        }
        return media_playlist(&spec).into_response();
    }

    if file == "key.bin" {
        return match (&spec.served_key, spec.key) {
            (Some(bytes), _) => bytes.clone().into_response(),
            (None, Some(key)) => key.to_vec().into_response(),
            (None, None) => StatusCode::NOT_FOUND.into_response(),
        };
    }

    let Some(index) = file
        .strip_prefix("seg")
        .and_then(|f| f.strip_suffix(".ts"))
        .and_then(|i| i.parse::<usize>().ok())
        .filter(|i| *i < spec.segments)
    else {
        return StatusCode::NOT_FOUND.into_response();
    };

    tokio::time::sleep(spec.segment_delay).await;
    match spec.failures.get(&index) {
        Some(Failure::Always(status)) => return status.into_response(),
        Some(Failure::Times(n, status)) if seen <= *n => return status.into_response(),
        _ => {}
    }

    let payload = segment_payload(&stream, index);
    match spec.key {
        Some(key) => {
            let n = if spec.sequence_iv {
                spec.media_sequence + index as u64
            } else {
                index as u64
            };
            let iv = spec.explicit_iv.unwrap_or_else(|| derive_iv(n));
            encrypt(&payload, &key, &iv).into_response()
        }
        None => payload.into_response(),
    }
}

fn media_playlist(spec: &StreamSpec) -> String {
    let mut out = format!(
        "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n#EXT-X-MEDIA-SEQUENCE:{}\n",
        spec.media_sequence
    );
    if spec.key.is_some() {
        out.push_str("#EXT-X-KEY:METHOD=AES-128,URI=\"key.bin\"");
        if let Some(iv) = spec.explicit_iv {
            out.push_str(&format!(",IV=0x{}", hex::encode(iv)));
        }
        out.push('\n');
    }
    for i in 0..spec.segments {
        out.push_str(&format!("#EXTINF:4.0,\nseg{i}.ts\n"));
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}

/// Fast retries, byte concatenation, no system proxy.
pub fn job_config() -> JobConfig {
    JobConfig {
        segment_concurrency: 4,
        retry_delay: Duration::from_millis(10),
        merge_tool: MergeTool::Binary,
        http: HttpConfig {
            segment_timeout: Duration::from_secs(10),
            manifest_timeout: Duration::from_secs(10),
            use_system_proxy: false,
            ..HttpConfig::default()
        },
        ..JobConfig::default()
    }
}
