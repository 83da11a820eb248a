//! Attachment mirroring
//!
//! Downloads eligible remote media, runs images through the transcoder and
//! stores the result content-addressed in `files`.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use super::single_flight::SingleFlight;
use super::transport::{Transport, TransportError};
use crate::data::{Attachment, Database, EntityId};
use crate::error::AppError;

/// Largest non-image attachment stored locally.
pub const MAX_TEXT_ATTACHMENT_BYTES: usize = 100_000;

/// Output of the image transcoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcoded {
    pub data: Vec<u8>,
    pub media_type: String,
}

/// External image shrinking service.
#[async_trait]
pub trait ImageTranscoder: Send + Sync {
    async fn transcode(&self, data: Vec<u8>, media_type: &str) -> Result<Transcoded, String>;
}

/// Stores images unchanged after a magic-number check.
pub struct PassthroughTranscoder;

#[async_trait]
impl ImageTranscoder for PassthroughTranscoder {
    async fn transcode(&self, data: Vec<u8>, media_type: &str) -> Result<Transcoded, String> {
        let detected = match data.as_slice() {
            [0x89, b'P', b'N', b'G', ..] => "image/png",
            [0xff, 0xd8, 0xff, ..] => "image/jpeg",
            [b'G', b'I', b'F', b'8', ..] => "image/gif",
            [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "image/webp",
            _ => return Err(format!("unrecognized image data for {media_type}")),
        };
        Ok(Transcoded {
            data,
            media_type: detected.to_string(),
        })
    }
}

/// Remote media as described by an object.
#[derive(Debug, Clone, Default)]
pub struct RemoteMedia {
    pub url: String,
    pub media_type: String,
    pub name: String,
    pub description: String,
}

/// Content hash used as the `files` key.
pub fn content_hash(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(data))
}

pub struct MediaMirror {
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    transcoder: Arc<dyn ImageTranscoder>,
    transcode_slots: Semaphore,
    downloads: SingleFlight<String, Result<Vec<u8>, TransportError>>,
    timeout: Duration,
}

impl MediaMirror {
    pub fn new(
        db: Arc<Database>,
        transport: Arc<dyn Transport>,
        transcoder: Arc<dyn ImageTranscoder>,
        max_concurrent_transcodes: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            transport,
            transcoder,
            transcode_slots: Semaphore::new(max_concurrent_transcodes),
            downloads: SingleFlight::new(),
            timeout,
        }
    }

    /// Build the attachment record for `media`, mirroring it when `localize`.
    ///
    /// Failures to download or transcode fall back to a bare reference.
    pub async fn save(
        &self,
        media: RemoteMedia,
        position: i64,
        localize: bool,
    ) -> Result<Option<Attachment>, AppError> {
        if media.url.is_empty() {
            return Ok(None);
        }

        let mut media_type = media.media_type.to_ascii_lowercase();
        let file_hash = if localize {
            match self.db.find_file_hash_by_url(&media.url).await? {
                Some(hash) => Some(hash),
                None => match self.mirror(&media.url, &media_type).await? {
                    Some((hash, stored_type)) => {
                        media_type = stored_type;
                        Some(hash)
                    }
                    None => None,
                },
            }
        } else {
            None
        };

        Ok(Some(Attachment {
            id: EntityId::new().0,
            post_id: String::new(),
            position,
            url: media.url,
            media_type,
            name: media.name,
            description: media.description,
            file_hash,
        }))
    }

    async fn mirror(&self, url: &str, media_type: &str) -> Result<Option<(String, String)>, AppError> {
        let downloaded = self
            .downloads
            .run(url.to_string(), || async {
                self.transport.fetch(url, "*/*", self.timeout).await
            })
            .await;

        let data = match downloaded {
            Ok(data) => data,
            Err(error) => {
                tracing::info!(%url, %error, "Failed to fetch attachment");
                return Ok(None);
            }
        };

        let (data, media_type) = if media_type.starts_with("image/") {
            let _permit = self
                .transcode_slots
                .acquire()
                .await
                .map_err(|e| AppError::Internal(e.into()))?;
            match self.transcoder.transcode(data, media_type).await {
                Ok(transcoded) => (transcoded.data, transcoded.media_type),
                Err(reason) => {
                    tracing::info!(%url, %reason, "Unable to transcode image");
                    return Ok(None);
                }
            }
        } else if data.len() > MAX_TEXT_ATTACHMENT_BYTES {
            tracing::info!(%url, size = data.len(), "Not storing large attachment");
            return Ok(None);
        } else {
            (data, media_type.to_string())
        };

        let hash = content_hash(&data);
        self.db.save_file(&hash, &media_type, &data).await?;
        tracing::debug!(%url, %hash, "Mirrored attachment");
        Ok(Some((hash, media_type)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::federation::transport::MockTransport;
    use tempfile::TempDir;

    async fn mirror_with(transport: MockTransport) -> (MediaMirror, Arc<Database>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&temp_dir.path().join("m.db")).await.unwrap());
        let mirror = MediaMirror::new(
            db.clone(),
            Arc::new(transport),
            Arc::new(PassthroughTranscoder),
            4,
            Duration::from_secs(5),
        );
        (mirror, db, temp_dir)
    }

    fn text(url: &str) -> RemoteMedia {
        RemoteMedia {
            url: url.to_string(),
            media_type: "text/plain".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn identical_content_is_stored_once() {
        let mut transport = MockTransport::new();
        transport
            .expect_fetch()
            .times(2)
            .returning(|_, _, _| Ok(b"same words".to_vec()));
        let (mirror, db, _dir) = mirror_with(transport).await;

        let first = mirror.save(text("https://b.example/a.txt"), 0, true).await.unwrap().unwrap();
        let second = mirror.save(text("https://b.example/b.txt"), 1, true).await.unwrap().unwrap();

        assert!(first.is_mirrored() && second.is_mirrored());
        assert_eq!(first.file_hash, second.file_hash);
        assert_eq!(db.count_files().await.unwrap(), 1);

        let (media_type, content) = db
            .get_file(first.file_hash.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(media_type, "text/plain");
        assert_eq!(content, b"same words");
    }

    #[tokio::test]
    async fn large_text_is_only_referenced() {
        let mut transport = MockTransport::new();
        transport
            .expect_fetch()
            .times(1)
            .returning(|_, _, _| Ok(vec![b'x'; MAX_TEXT_ATTACHMENT_BYTES + 1]));
        let (mirror, db, _dir) = mirror_with(transport).await;

        let attachment = mirror.save(text("https://b.example/big.txt"), 0, true).await.unwrap().unwrap();
        assert!(!attachment.is_mirrored());
        assert_eq!(attachment.url, "https://b.example/big.txt");
        assert_eq!(db.count_files().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unlocalized_media_is_never_fetched() {
        let mut transport = MockTransport::new();
        transport.expect_fetch().times(0);
        let (mirror, _db, _dir) = mirror_with(transport).await;

        let attachment = mirror.save(text("https://b.example/a.txt"), 0, false).await.unwrap().unwrap();
        assert!(!attachment.is_mirrored());
        assert!(mirror.save(text(""), 1, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn passthrough_detects_image_type() {
        let png = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a];
        let out = PassthroughTranscoder
            .transcode(png.clone(), "image/jpeg")
            .await
            .unwrap();
        assert_eq!(out.media_type, "image/png");
        assert_eq!(out.data, png);

        assert!(PassthroughTranscoder
            .transcode(b"not an image".to_vec(), "image/png")
            .await
            .is_err());
    }

    #[test]
    fn content_hash_is_url_safe() {
        let hash = content_hash(b"hello");
        assert_eq!(hash.len(), 43);
        assert!(!hash.contains('+') && !hash.contains('/') && !hash.contains('='));
    }
}
