//! Fetching attachment bodies into the media store.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("failed to write {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// Something that can copy a remote resource to a local path.
///
/// One attempt per call. On error the destination must not be left holding a
/// partial file.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Returns the number of bytes written.
    async fn fetch_to(&self, url: &str, dest: &Path) -> Result<u64, DownloadError>;
}

#[cfg(feature = "io")]
pub use self::http_fetcher::HttpFetcher;

#[cfg(feature = "io")]
mod http_fetcher {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tracing::{debug, warn};

    /// [`Fetch`] over plain HTTP(S) with reqwest. No timeout beyond the
    /// client's defaults.
    #[derive(Debug, Clone, Default)]
    pub struct HttpFetcher {
        client: reqwest::Client,
    }

    impl HttpFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        async fn stream_to(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
            let transport = |e: reqwest::Error| DownloadError::Transport {
                url: url.to_string(),
                message: e.to_string(),
            };
            let local = |source: io::Error| DownloadError::Io {
                path: dest.to_path_buf(),
                source,
            };

            let mut response = self.client.get(url).send().await.map_err(transport)?;
            let status = response.status();
            if !status.is_success() {
                return Err(DownloadError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }

            // Never write through an existing name or link.
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(dest)
                .await
                .map_err(local)?;

            let copied = async {
                let mut written = 0u64;
                while let Some(chunk) = response.chunk().await.map_err(transport)? {
                    file.write_all(&chunk).await.map_err(local)?;
                    written += chunk.len() as u64;
                }
                file.flush().await.map_err(local)?;
                file.sync_all().await.map_err(local)?;
                Ok::<_, DownloadError>(written)
            }
            .await;

            if copied.is_err() {
                drop(file);
                if let Err(rm) = tokio::fs::remove_file(dest).await {
                    debug!(error = %rm, file = %dest.display(), "partial file not removed");
                }
            }
            copied
        }
    }

    #[async_trait]
    impl Fetch for HttpFetcher {
        async fn fetch_to(&self, url: &str, dest: &Path) -> Result<u64, DownloadError> {
            let result = self.stream_to(url, dest).await;
            match &result {
                Ok(bytes) => debug!(file = %dest.display(), bytes, "download complete"),
                Err(e) => warn!(error = %e, file = %dest.display(), "download failed"),
            }
            result
        }
    }
}
