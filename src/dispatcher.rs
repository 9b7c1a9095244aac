//! Per-message routing: uploads, the refresh command, and trigger replies.
//!
//! [`Dispatcher::handle`] is called once per incoming message and keeps no
//! state between calls other than the media list rebuilt by
//! [`Dispatcher::refresh`].

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::downloader::{DownloadError, Fetch};
use crate::registry::{Response, ResponseRegistry};
use crate::store::{extension_for_content_type, MediaKind, MediaStore, StoreError};
use crate::types::{Attachment, Message, Snowflake};

pub const UPLOAD_COMMAND: &str = "!upload";
pub const REFRESH_COMMAND: &str = "!refresh";

pub const NOTHING_UPLOADED_REPLY: &str = "file not uploaded";
pub const UPLOAD_ERROR_REPLY: &str = "error uploading files. try again.";
pub const REFRESHED_REPLY: &str = "file lists refreshed!";

pub fn uploaded_reply(count: usize) -> String {
    format!("you have uploaded {} file!", count)
}

/// Error type returned by a [`ReplySink`]. Only ever logged.
pub type SendError = Box<dyn std::error::Error + Send + Sync>;

/// Where the dispatcher's answers go.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Answer `to` with a reply that references it.
    async fn reply(&self, to: &Message, text: &str) -> Result<(), SendError>;

    /// Post plain text in a channel.
    async fn send_text(&self, channel_id: &str, text: &str) -> Result<(), SendError>;

    /// Post a local file in a channel, optionally with a caption.
    async fn send_file(
        &self,
        channel_id: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<(), SendError>;
}

/// Which route a message took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Sent by a bot; nothing done.
    Ignored,
    /// Upload command stored this many files.
    Uploaded(usize),
    /// Upload command without any media attachment.
    NothingUploaded,
    /// Upload aborted part-way; files stored before the failure are kept.
    UploadFailed,
    /// Refresh command.
    Refreshed,
    /// A trigger produced a reply.
    Responded { trigger: String },
    /// No trigger produced a reply.
    NoMatch,
}

#[derive(Debug, Error)]
enum UploadError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Download(#[from] DownloadError),
}

pub struct Dispatcher<F, R = StdRng> {
    store: MediaStore,
    registry: ResponseRegistry,
    fetcher: F,
    rng: R,
    bot_user_id: Option<Snowflake>,
}

impl<F: Fetch> Dispatcher<F, StdRng> {
    pub fn new(store: MediaStore, registry: ResponseRegistry, fetcher: F) -> Self {
        Self::with_rng(store, registry, fetcher, StdRng::from_entropy())
    }
}

impl<F: Fetch, R: Rng> Dispatcher<F, R> {
    /// Build a dispatcher with an explicit random source, e.g. a seeded
    /// `StdRng` in tests.
    pub fn with_rng(store: MediaStore, registry: ResponseRegistry, fetcher: F, rng: R) -> Self {
        Self {
            store,
            registry,
            fetcher,
            rng,
            bot_user_id: None,
        }
    }

    /// Remember the bot's own id (from READY) so its messages are skipped.
    pub fn set_bot_user_id(&mut self, id: impl Into<Snowflake>) {
        self.bot_user_id = Some(id.into());
    }

    pub fn registry(&self) -> &ResponseRegistry {
        &self.registry
    }

    pub fn store(&self) -> &MediaStore {
        &self.store
    }

    /// Rebuild the media list from disk: images first, then videos.
    ///
    /// Both directories are scanned before anything is assigned, so a failed
    /// scan leaves the previous list in place.
    pub fn refresh(&mut self) -> Result<usize, StoreError> {
        let scanned = self
            .store
            .scan(MediaKind::Image)
            .and_then(|images| Ok((images, self.store.scan(MediaKind::Video)?)));

        match scanned {
            Ok((images, videos)) => {
                info!(
                    images = images.len(),
                    videos = videos.len(),
                    "refreshed file lists"
                );
                let files: Vec<PathBuf> = images.into_iter().chain(videos).collect();
                let total = files.len();
                self.registry.set_media_files(files);
                Ok(total)
            }
            Err(e) => {
                error!(error = %e, "error refreshing file lists");
                Err(e)
            }
        }
    }

    /// Handle one incoming message.
    pub async fn handle<S: ReplySink>(&mut self, msg: &Message, sink: &S) -> Outcome {
        if msg.author.bot || self.bot_user_id.as_deref() == Some(msg.author.id.as_str()) {
            return Outcome::Ignored;
        }

        let text = msg.content.to_lowercase();

        if text.starts_with(UPLOAD_COMMAND) {
            return self.handle_upload(msg, sink).await;
        }

        if text == REFRESH_COMMAND {
            // The reply doesn't depend on whether the scan worked.
            let _ = self.refresh();
            send_reply(sink, msg, REFRESHED_REPLY).await;
            return Outcome::Refreshed;
        }

        self.respond_to_trigger(&text, msg, sink).await
    }

    async fn handle_upload<S: ReplySink>(&mut self, msg: &Message, sink: &S) -> Outcome {
        match self.store_attachments(msg).await {
            Ok(0) => {
                send_reply(sink, msg, NOTHING_UPLOADED_REPLY).await;
                Outcome::NothingUploaded
            }
            Ok(count) => {
                let _ = self.refresh();
                send_reply(sink, msg, &uploaded_reply(count)).await;
                Outcome::Uploaded(count)
            }
            Err(e) => {
                error!(error = %e, author = %msg.author.tag(), "error uploading files");
                send_reply(sink, msg, UPLOAD_ERROR_REPLY).await;
                Outcome::UploadFailed
            }
        }
    }

    /// Download each media attachment in turn. Stops at the first failure.
    async fn store_attachments(&self, msg: &Message) -> Result<usize, UploadError> {
        let mut uploaded = 0;
        for attachment in &msg.attachments {
            let Some((kind, content_type)) = media_kind(attachment) else {
                info!(
                    file = %attachment.filename,
                    content_type = attachment.content_type.as_deref().unwrap_or("none"),
                    "skipped non-media file"
                );
                continue;
            };

            let extension = extension_for_content_type(content_type);
            let filename = self.store.next_filename(kind, extension)?;
            let path = self.store.dir(kind).join(&filename);

            self.fetcher.fetch_to(&attachment.url, &path).await?;
            uploaded += 1;

            info!(file = %filename, author = %msg.author.tag(), "uploaded");
        }
        Ok(uploaded)
    }

    /// First trigger (in registry order) found in `text` that manages to send
    /// something wins.
    async fn respond_to_trigger<S: ReplySink>(
        &mut self,
        text: &str,
        msg: &Message,
        sink: &S,
    ) -> Outcome {
        let Self { registry, rng, .. } = self;

        for entry in registry.iter() {
            if !text.contains(entry.trigger.as_str()) {
                continue;
            }

            let sent = match &entry.response {
                Response::Random { content, files } => {
                    let Some(file) = files.choose(rng) else {
                        warn!(trigger = %entry.trigger, "no files defined for trigger");
                        continue;
                    };
                    sink.send_file(&msg.channel_id, file, content.as_deref())
                        .await
                }
                Response::Text { content } => {
                    let Some(line) = content.choose(rng) else {
                        warn!(trigger = %entry.trigger, "no text defined for trigger");
                        continue;
                    };
                    sink.send_text(&msg.channel_id, line).await
                }
            };

            match sent {
                Ok(()) => {
                    debug!(trigger = %entry.trigger, kind = entry.response.kind(), "responded");
                    return Outcome::Responded {
                        trigger: entry.trigger.clone(),
                    };
                }
                Err(e) => error!(error = %e, trigger = %entry.trigger, "error sending response"),
            }
        }

        Outcome::NoMatch
    }
}

/// Media kind plus declared content type, for `image/*` and `video/*` only.
fn media_kind(attachment: &Attachment) -> Option<(MediaKind, &str)> {
    let content_type = attachment.content_type.as_deref()?;
    MediaKind::from_content_type(content_type).map(|kind| (kind, content_type))
}

async fn send_reply<S: ReplySink>(sink: &S, to: &Message, text: &str) {
    if let Err(e) = sink.reply(to, text).await {
        error!(error = %e, "failed to send reply");
    }
}
