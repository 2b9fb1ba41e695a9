// HLS Decryption: resolves AES-128 keys once per job and decrypts segment payloads.

use std::sync::Arc;
use std::time::Duration;

use aes::Aes128;
use bytes::Bytes;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::IvSource;
use crate::error::JobError;
use crate::headers::HeaderProfile;
use crate::hls::playlist::{KeyRef, Playlist, Segment};

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// IV used when the key tag has none: `n` as a big-endian 128-bit integer.
pub fn derive_iv(n: u64) -> [u8; 16] {
    (n as u128).to_be_bytes()
}

/// Key bytes plus the IV policy of the tag they came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub key: [u8; 16],
    pub iv: Option<[u8; 16]>,
}

impl ResolvedKey {
    /// An explicit IV always wins; otherwise it is derived from `source`.
    pub fn iv_for(&self, segment: &Segment, source: IvSource) -> [u8; 16] {
        self.iv.unwrap_or_else(|| match source {
            IvSource::SegmentIndex => derive_iv(segment.index as u64),
            IvSource::MediaSequence => derive_iv(segment.media_sequence),
        })
    }
}

/// All keys of a playlist, in the order of [`Playlist::keys`].
/// Read-only once resolved and shared by every segment task of the job.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: Vec<ResolvedKey>,
}

impl KeySet {
    pub fn for_segment(&self, segment: &Segment) -> Option<&ResolvedKey> {
        segment.key.and_then(|slot| self.keys.get(slot))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl From<Vec<ResolvedKey>> for KeySet {
    fn from(keys: Vec<ResolvedKey>) -> Self {
        Self { keys }
    }
}

/// Fetches raw key bytes with the job's header profile.
pub struct KeyResolver {
    client: Client,
    profile: Arc<HeaderProfile>,
    timeout: Duration,
    token: CancellationToken,
}

impl KeyResolver {
    pub fn new(
        client: Client,
        profile: Arc<HeaderProfile>,
        timeout: Duration,
        token: CancellationToken,
    ) -> Self {
        Self {
            client,
            profile,
            timeout,
            token,
        }
    }

    /// Resolve every distinct key of the playlist. One GET per key, no retry.
    pub async fn resolve_all(&self, playlist: &Playlist) -> Result<KeySet, JobError> {
        let mut keys = Vec::with_capacity(playlist.keys.len());
        for key_ref in &playlist.keys {
            let key = self.fetch_key(key_ref).await?;
            keys.push(ResolvedKey {
                key,
                iv: key_ref.iv,
            });
        }
        if !keys.is_empty() {
            info!(keys = keys.len(), "Resolved decryption keys");
        }
        Ok(KeySet::from(keys))
    }

    pub async fn fetch_key(&self, key_ref: &KeyRef) -> Result<[u8; 16], JobError> {
        let url = key_ref.uri.as_str();
        debug!(url, "Fetching decryption key");

        let request = self
            .profile
            .apply(self.client.get(key_ref.uri.clone()))
            .timeout(self.timeout)
            .send();
        let response = tokio::select! {
            _ = self.token.cancelled() => return Err(JobError::Cancelled),
            response = request => response.map_err(|e| JobError::key_fetch(url, e))?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(JobError::key_fetch(url, format!("HTTP {status}")));
        }

        let bytes = tokio::select! {
            _ = self.token.cancelled() => return Err(JobError::Cancelled),
            bytes = response.bytes() => bytes.map_err(|e| JobError::key_fetch(url, e))?,
        };

        // AES-128 keys are 16 bytes
        <[u8; 16]>::try_from(bytes.as_ref()).map_err(|_| {
            JobError::key_fetch(
                url,
                format!("key has incorrect length: {} bytes (expected 16)", bytes.len()),
            )
        })
    }
}

/// Decrypts segment payloads, optionally on the blocking thread pool.
#[derive(Debug, Clone, Copy)]
pub struct Decryptor {
    offload: bool,
}

impl Decryptor {
    pub fn new(offload: bool) -> Self {
        Self { offload }
    }

    pub async fn decrypt(
        &self,
        index: usize,
        data: Bytes,
        key: &[u8; 16],
        iv: &[u8; 16],
    ) -> Result<Bytes, JobError> {
        if self.offload {
            let key = *key;
            let iv = *iv;
            tokio::task::spawn_blocking(move || Self::decrypt_sync(index, data, &key, &iv))
                .await
                .map_err(|e| JobError::decryption(index, format!("decryption task failed: {e}")))?
        } else {
            Self::decrypt_sync(index, data, key, iv)
        }
    }

    /// AES-128-CBC with PKCS#7 padding removal.
    pub fn decrypt_sync(
        index: usize,
        data: Bytes,
        key: &[u8; 16],
        iv: &[u8; 16],
    ) -> Result<Bytes, JobError> {
        let mut buffer = data.to_vec();

        let cipher = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| {
            JobError::decryption(index, format!("failed to initialize AES decryptor: {e}"))
        })?;

        let decrypted_len = cipher
            .decrypt_padded_mut::<Pkcs7>(&mut buffer)
            .map_err(|e| JobError::decryption(index, format!("bad padding or length: {e}")))?
            .len();

        buffer.truncate(decrypted_len);
        Ok(Bytes::from(buffer))
    }
}
