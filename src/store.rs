//! On-disk media pool.
//!
//! Two sibling directories under a root, `images/` and `videos/`. Files are
//! named `<prefix><n><ext>` where `n` is one past the largest number already
//! present for that prefix.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

/// Extension used when a declared content type is not in the lookup table.
pub const FALLBACK_EXTENSION: &str = ".bin";

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "avi"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to list {}: {source}", path.display())]
    ReadDir { path: PathBuf, source: io::Error },
}

/// Which half of the pool a file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classify a declared MIME type. Anything that isn't `image/*` or
    /// `video/*` is not media.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        if content_type.starts_with("image/") {
            Some(MediaKind::Image)
        } else if content_type.starts_with("video/") {
            Some(MediaKind::Video)
        } else {
            None
        }
    }

    pub fn prefix(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    pub fn dir_name(self) -> &'static str {
        match self {
            MediaKind::Image => "images",
            MediaKind::Video => "videos",
        }
    }

    /// Extensions (without the dot) picked up when the directory is scanned.
    pub fn listed_extensions(self) -> &'static [&'static str] {
        match self {
            MediaKind::Image => IMAGE_EXTENSIONS,
            MediaKind::Video => VIDEO_EXTENSIONS,
        }
    }
}

/// Map a declared content type to the extension a stored file gets.
pub fn extension_for_content_type(content_type: &str) -> &'static str {
    match content_type {
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "video/mp4" => ".mp4",
        "video/webm" => ".webm",
        "video/quicktime" => ".mov",
        "video/x-msvideo" => ".avi",
        _ => FALLBACK_EXTENSION,
    }
}

/// The number a stored file name carries: the first maximal run of ASCII
/// digits, or 0 when there is none (or it doesn't fit in a `u64`).
pub fn sequence_number(file_name: &str) -> u64 {
    let Some(start) = file_name.find(|c: char| c.is_ascii_digit()) else {
        return 0;
    };
    let rest = &file_name[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    rest[..end].parse().unwrap_or(0)
}

fn has_listed_extension(file_name: &str, kind: MediaKind) -> bool {
    let Some((_, ext)) = file_name.rsplit_once('.') else {
        return false;
    };
    kind.listed_extensions()
        .iter()
        .any(|allowed| ext.eq_ignore_ascii_case(allowed))
}

/// Handle to the media directories under one root.
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir(&self, kind: MediaKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    /// Create both directories if they are missing. Idempotent.
    pub fn ensure_directories(&self) -> Result<(), StoreError> {
        for kind in [MediaKind::Image, MediaKind::Video] {
            let path = self.dir(kind);
            std::fs::create_dir_all(&path)
                .map_err(|source| StoreError::CreateDir { path, source })?;
        }
        Ok(())
    }

    /// Next free name in `kind`'s directory, e.g. `image7.png`.
    ///
    /// Only names starting with the kind's prefix are counted. Numbers are
    /// never reused, but gaps left by external deletions are not filled.
    pub fn next_filename(&self, kind: MediaKind, extension: &str) -> Result<String, StoreError> {
        let highest = self
            .file_names(kind)?
            .iter()
            .filter(|name| name.starts_with(kind.prefix()))
            .map(|name| sequence_number(name))
            .max()
            .unwrap_or(0);

        Ok(format!(
            "{}{}{}",
            kind.prefix(),
            highest.saturating_add(1),
            extension
        ))
    }

    /// Paths of the listable media files in `kind`'s directory, sorted by
    /// file name.
    pub fn scan(&self, kind: MediaKind) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.dir(kind);
        let files: Vec<PathBuf> = self
            .file_names(kind)?
            .into_iter()
            .filter(|name| has_listed_extension(name, kind))
            .map(|name| dir.join(name))
            // Follows symlinks; dangling links and directories are skipped.
            .filter(|path| std::fs::metadata(path).is_ok_and(|meta| meta.is_file()))
            .collect();
        debug!(dir = %dir.display(), count = files.len(), "scanned media directory");
        Ok(files)
    }

    /// Every entry name in `kind`'s directory, sorted. Links, directories,
    /// and anything else occupying a name are included.
    fn file_names(&self, kind: MediaKind) -> Result<Vec<String>, StoreError> {
        let path = self.dir(kind);
        let read_err = |source| StoreError::ReadDir {
            path: path.clone(),
            source,
        };

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&path).map_err(read_err)? {
            let entry = entry.map_err(read_err)?;
            // Non-UTF-8 names can't match any prefix or extension.
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, MediaStore) {
        let tmp = TempDir::new().expect("tempdir");
        let store = MediaStore::new(tmp.path());
        store.ensure_directories().expect("dirs");
        (tmp, store)
    }

    fn touch(store: &MediaStore, kind: MediaKind, name: &str) {
        std::fs::write(store.dir(kind).join(name), b"x").expect("write fixture");
    }

    #[test]
    fn ensure_directories_is_idempotent() {
        let (_tmp, store) = store();
        store.ensure_directories().expect("second call");
        assert!(store.dir(MediaKind::Image).is_dir());
        assert!(store.dir(MediaKind::Video).is_dir());
    }

    #[test]
    fn empty_directory_starts_at_one() {
        let (_tmp, store) = store();
        assert_eq!(
            store.next_filename(MediaKind::Image, ".png").unwrap(),
            "image1.png"
        );
        assert_eq!(
            store.next_filename(MediaKind::Video, ".mp4").unwrap(),
            "video1.mp4"
        );
    }

    #[test]
    fn next_filename_follows_the_highest_number() {
        let (_tmp, store) = store();
        touch(&store, MediaKind::Image, "image1.png");
        touch(&store, MediaKind::Image, "image12.jpg");
        touch(&store, MediaKind::Image, "image3.gif");
        assert_eq!(
            store.next_filename(MediaKind::Image, ".webp").unwrap(),
            "image13.webp"
        );
    }

    #[test]
    fn gaps_are_not_filled() {
        let (_tmp, store) = store();
        touch(&store, MediaKind::Video, "video2.mp4");
        touch(&store, MediaKind::Video, "video9.mov");
        assert_eq!(
            store.next_filename(MediaKind::Video, ".mp4").unwrap(),
            "video10.mp4"
        );
    }

    #[test]
    fn files_without_the_prefix_are_ignored() {
        let (_tmp, store) = store();
        touch(&store, MediaKind::Image, "cat99.png");
        touch(&store, MediaKind::Image, "image4.png");
        assert_eq!(
            store.next_filename(MediaKind::Image, ".png").unwrap(),
            "image5.png"
        );
    }

    #[test]
    fn prefixed_name_without_digits_counts_as_zero() {
        let (_tmp, store) = store();
        touch(&store, MediaKind::Image, "image.png");
        assert_eq!(
            store.next_filename(MediaKind::Image, ".png").unwrap(),
            "image1.png"
        );
    }

    #[test]
    fn sequence_number_takes_first_digit_run() {
        assert_eq!(sequence_number("image12.jpg"), 12);
        assert_eq!(sequence_number("image3_v2.png"), 3);
        assert_eq!(sequence_number("image.png"), 0);
        assert_eq!(sequence_number("image99999999999999999999999.png"), 0);
    }

    #[test]
    fn content_types_map_to_extensions() {
        assert_eq!(extension_for_content_type("image/jpeg"), ".jpg");
        assert_eq!(extension_for_content_type("image/jpg"), ".jpg");
        assert_eq!(extension_for_content_type("image/png"), ".png");
        assert_eq!(extension_for_content_type("video/quicktime"), ".mov");
        assert_eq!(extension_for_content_type("video/x-msvideo"), ".avi");
        assert_eq!(extension_for_content_type("image/heic"), ".bin");
    }

    #[test]
    fn media_kind_from_content_type() {
        assert_eq!(
            MediaKind::from_content_type("image/png"),
            Some(MediaKind::Image)
        );
        assert_eq!(
            MediaKind::from_content_type("video/webm"),
            Some(MediaKind::Video)
        );
        assert_eq!(MediaKind::from_content_type("application/pdf"), None);
    }

    #[test]
    fn scan_filters_by_extension_and_sorts() {
        let (_tmp, store) = store();
        touch(&store, MediaKind::Image, "image2.PNG");
        touch(&store, MediaKind::Image, "image1.jpg");
        touch(&store, MediaKind::Image, "notes.txt");
        touch(&store, MediaKind::Image, "image3.bin");
        std::fs::create_dir(store.dir(MediaKind::Image).join("nested.png")).unwrap();

        let files = store.scan(MediaKind::Image).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["image1.jpg", "image2.PNG"]);
        assert!(files[0].starts_with(store.dir(MediaKind::Image)));
    }

    #[test]
    fn video_scan_uses_video_extensions() {
        let (_tmp, store) = store();
        touch(&store, MediaKind::Video, "video1.mp4");
        touch(&store, MediaKind::Video, "video2.png");
        assert_eq!(store.scan(MediaKind::Video).unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_count_toward_numbering_and_are_scanned() {
        use std::os::unix::fs::symlink;

        let (tmp, store) = store();
        let outside = tmp.path().join("keep.png");
        std::fs::write(&outside, b"keep").unwrap();
        let dir = store.dir(MediaKind::Image);
        touch(&store, MediaKind::Image, "image1.png");
        symlink(&outside, dir.join("image2.png")).unwrap();
        symlink(tmp.path().join("gone.png"), dir.join("image3.png")).unwrap();

        assert_eq!(
            store.next_filename(MediaKind::Image, ".png").unwrap(),
            "image4.png"
        );
        let files = store.scan(MediaKind::Image).unwrap();
        assert_eq!(files, vec![dir.join("image1.png"), dir.join("image2.png")]);
    }

    #[test]
    fn directories_occupy_a_number() {
        let (_tmp, store) = store();
        std::fs::create_dir(store.dir(MediaKind::Video).join("video7")).unwrap();
        assert_eq!(
            store.next_filename(MediaKind::Video, ".mp4").unwrap(),
            "video8.mp4"
        );
        assert!(store.scan(MediaKind::Video).unwrap().is_empty());
    }

    #[test]
    fn scanning_a_missing_directory_errors() {
        let tmp = TempDir::new().unwrap();
        let store = MediaStore::new(tmp.path().join("absent"));
        assert!(matches!(
            store.scan(MediaKind::Image),
            Err(StoreError::ReadDir { .. })
        ));
    }
}
