//! Asset catalog for per-stream media directories.
//!
//! Each stream owns `<uploads_dir>/<stream_id>/video` and
//! `<uploads_dir>/<stream_id>/audio`. The catalog re-reads those directories
//! on every query and classifies files into the two media classes that the
//! transcoder consumes. Still images are part of the video class.

use crate::error::{EngineError, PreconditionError};
use crate::stream::StreamId;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// Motion video extensions (case-insensitive matching).
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "avi", "wmv", "flv", "mkv", "m4v", "ts"];

/// Still image extensions; folded into the video class.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];

/// Audio extensions.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "m4a", "aac", "flac", "opus"];

/// Containers that carry either audio-only or video content. The declared
/// content type decides; without one the listed default applies.
const AMBIGUOUS_EXTENSIONS: &[(&str, MediaClass)] =
    &[("webm", MediaClass::Video), ("ogg", MediaClass::Audio)];

/// Media class of a manifest (and of a stream sub-directory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaClass {
    Video,
    Audio,
}

impl MediaClass {
    pub const ALL: [MediaClass; 2] = [MediaClass::Video, MediaClass::Audio];

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaClass::Video => "video",
            MediaClass::Audio => "audio",
        }
    }

    /// The content-type prefix a file in this class' directory is declared with.
    fn declared_content_type(&self) -> &'static str {
        match self {
            MediaClass::Video => "video/",
            MediaClass::Audio => "audio/",
        }
    }
}

impl fmt::Display for MediaClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a single asset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssetKind {
    Video,
    Audio,
    /// A still image shown for a fixed number of seconds.
    Image { duration_secs: f64 },
}

impl AssetKind {
    pub fn class(&self) -> MediaClass {
        match self {
            AssetKind::Video | AssetKind::Image { .. } => MediaClass::Video,
            AssetKind::Audio => MediaClass::Audio,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, AssetKind::Image { .. })
    }
}

/// A media file belonging to a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Asset {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_time: SystemTime,
    pub kind: AssetKind,
}

/// Assets of one stream, split by class and ordered oldest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetListing {
    pub video: Vec<Asset>,
    pub audio: Vec<Asset>,
}

impl AssetListing {
    pub fn is_empty(&self) -> bool {
        self.video.is_empty() && self.audio.is_empty()
    }

    pub fn has_stills(&self) -> bool {
        self.video.iter().any(|a| a.kind.is_image())
    }

    pub fn class(&self, class: MediaClass) -> &[Asset] {
        match class {
            MediaClass::Video => &self.video,
            MediaClass::Audio => &self.audio,
        }
    }
}

/// Classifies a file path, falling back to a declared content type.
///
/// The extension wins when it is known and unambiguous. Otherwise the
/// content-type prefix (`video/`, `image/`, `audio/`) decides. Returns `None`
/// for anything that is not playable media.
pub fn classify(path: &Path, declared_content_type: Option<&str>, image_duration_secs: f64) -> Option<AssetKind> {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase());

    if let Some(ext) = ext.as_deref() {
        if VIDEO_EXTENSIONS.contains(&ext) {
            return Some(AssetKind::Video);
        }
        if IMAGE_EXTENSIONS.contains(&ext) {
            return Some(AssetKind::Image {
                duration_secs: image_duration_secs,
            });
        }
        if AUDIO_EXTENSIONS.contains(&ext) {
            return Some(AssetKind::Audio);
        }
        if let Some((_, default_class)) = AMBIGUOUS_EXTENSIONS.iter().find(|(e, _)| *e == ext) {
            return Some(
                declared_content_type
                    .and_then(|ct| classify_content_type(ct, image_duration_secs))
                    .unwrap_or(match default_class {
                        MediaClass::Video => AssetKind::Video,
                        MediaClass::Audio => AssetKind::Audio,
                    }),
            );
        }
        // Unknown extension: not media.
        return None;
    }

    declared_content_type.and_then(|ct| classify_content_type(ct, image_duration_secs))
}

fn classify_content_type(content_type: &str, image_duration_secs: f64) -> Option<AssetKind> {
    let ct = content_type.trim().to_ascii_lowercase();
    if ct.starts_with("video/") {
        Some(AssetKind::Video)
    } else if ct.starts_with("image/") {
        Some(AssetKind::Image {
            duration_secs: image_duration_secs,
        })
    } else if ct.starts_with("audio/") {
        Some(AssetKind::Audio)
    } else {
        None
    }
}

/// Read-only view over the uploads directory.
#[derive(Debug, Clone)]
pub struct AssetCatalog {
    uploads_dir: PathBuf,
    image_duration_secs: f64,
}

impl AssetCatalog {
    pub fn new(uploads_dir: PathBuf, image_duration_secs: f64) -> Self {
        Self {
            uploads_dir,
            image_duration_secs,
        }
    }

    pub fn stream_dir(&self, id: &StreamId) -> PathBuf {
        self.uploads_dir.join(id.as_str())
    }

    pub fn class_dir(&self, id: &StreamId, class: MediaClass) -> PathBuf {
        self.stream_dir(id).join(class.as_str())
    }

    pub fn stream_exists(&self, id: &StreamId) -> bool {
        self.stream_dir(id).is_dir()
    }

    /// Creates the stream's storage with both class sub-directories.
    pub fn create_stream(&self, id: &StreamId) -> Result<(), EngineError> {
        if self.stream_exists(id) {
            return Err(PreconditionError::StreamExists(id.to_string()).into());
        }
        for class in MediaClass::ALL {
            fs::create_dir_all(self.class_dir(id, class))?;
        }
        Ok(())
    }

    /// Lists every stream directory whose name is a valid stream id, sorted.
    pub fn list_stream_ids(&self) -> Vec<StreamId> {
        let entries = match fs::read_dir(&self.uploads_dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!(dir = %self.uploads_dir.display(), error = %e, "cannot read uploads directory");
                }
                return Vec::new();
            }
        };

        let mut ids: Vec<StreamId> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().to_str().and_then(|name| StreamId::parse(name).ok()))
            .collect();
        ids.sort();
        ids
    }

    /// Lists and classifies the stream's assets.
    ///
    /// A stream without storage yields an empty listing. Within each class,
    /// assets are ordered by modification time (oldest first), ties broken by
    /// name, which is the loop playback order.
    pub fn list(&self, id: &StreamId) -> AssetListing {
        let mut listing = AssetListing::default();

        for class in MediaClass::ALL {
            for asset in self.scan_class_dir(id, class) {
                match asset.kind.class() {
                    MediaClass::Video => listing.video.push(asset),
                    MediaClass::Audio => listing.audio.push(asset),
                }
            }
        }

        sort_playback_order(&mut listing.video);
        sort_playback_order(&mut listing.audio);

        debug!(
            stream_id = %id,
            video = listing.video.len(),
            audio = listing.audio.len(),
            "catalog listed assets"
        );
        listing
    }

    fn scan_class_dir(&self, id: &StreamId, class: MediaClass) -> Vec<Asset> {
        use walkdir::WalkDir;

        let dir = self.class_dir(id, class);
        if !dir.is_dir() {
            return Vec::new();
        }

        let mut assets = Vec::new();
        let walker = WalkDir::new(&dir).min_depth(1).max_depth(1);

        for entry in walker.into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }

            let name = match entry.file_name().to_str() {
                Some(name) => name.to_string(),
                None => continue,
            };
            // In-progress uploads and editor droppings
            if name.starts_with('.') {
                continue;
            }

            let kind = match classify(
                entry.path(),
                Some(class.declared_content_type()),
                self.image_duration_secs,
            ) {
                Some(kind) => kind,
                None => continue,
            };

            if let Ok(metadata) = entry.metadata() {
                assets.push(Asset {
                    name,
                    path: absolute(entry.path()),
                    size_bytes: metadata.len(),
                    modified_time: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
                    kind,
                });
            }
        }

        assets
    }

    /// Deletes one asset by file name from whichever class directory holds it.
    ///
    /// Returns `Ok(false)` when no such file exists.
    pub fn remove_asset(&self, id: &StreamId, name: &str) -> Result<bool, EngineError> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains('/')
            || name.contains('\\')
        {
            return Err(PreconditionError::InvalidAssetName(name.to_string()).into());
        }

        for class in MediaClass::ALL {
            let path = self.class_dir(id, class).join(name);
            if path.is_file() {
                fs::remove_file(&path)?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn sort_playback_order(assets: &mut [Asset]) {
    assets.sort_by(|a, b| {
        a.modified_time
            .cmp(&b.modified_time)
            .then_with(|| a.name.cmp(&b.name))
    });
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::File;
    use std::time::Duration;
    use tempfile::TempDir;

    fn stream(id: &str) -> StreamId {
        StreamId::parse(id).unwrap()
    }

    /// Creates a file and pins its mtime to `UNIX_EPOCH + secs`.
    fn touch(path: &Path, secs: u64) {
        let file = File::create(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    #[test]
    fn test_classify_by_extension() {
        assert_eq!(classify(Path::new("a.MP4"), None, 5.0), Some(AssetKind::Video));
        assert_eq!(classify(Path::new("a.mov"), None, 5.0), Some(AssetKind::Video));
        assert_eq!(classify(Path::new("a.mp3"), None, 5.0), Some(AssetKind::Audio));
        assert_eq!(classify(Path::new("a.WAV"), None, 5.0), Some(AssetKind::Audio));
        assert_eq!(
            classify(Path::new("a.png"), None, 7.5),
            Some(AssetKind::Image { duration_secs: 7.5 })
        );
        assert_eq!(classify(Path::new("a.txt"), None, 5.0), None);
        assert_eq!(classify(Path::new("a.txt"), Some("video/mp4"), 5.0), None);
    }

    #[test]
    fn test_classify_falls_back_to_content_type() {
        assert_eq!(classify(Path::new("noext"), None, 5.0), None);
        assert_eq!(
            classify(Path::new("noext"), Some("audio/mpeg"), 5.0),
            Some(AssetKind::Audio)
        );
        assert_eq!(
            classify(Path::new("noext"), Some("image/jpeg"), 3.0),
            Some(AssetKind::Image { duration_secs: 3.0 })
        );
        assert_eq!(classify(Path::new("noext"), Some("text/plain"), 5.0), None);
    }

    #[test]
    fn test_classify_ambiguous_extension() {
        assert_eq!(classify(Path::new("a.webm"), None, 5.0), Some(AssetKind::Video));
        assert_eq!(
            classify(Path::new("a.webm"), Some("audio/webm"), 5.0),
            Some(AssetKind::Audio)
        );
        assert_eq!(classify(Path::new("a.ogg"), None, 5.0), Some(AssetKind::Audio));
        assert_eq!(
            classify(Path::new("a.ogg"), Some("video/ogg"), 5.0),
            Some(AssetKind::Video)
        );
    }

    #[test]
    fn test_missing_stream_lists_empty() {
        let temp = TempDir::new().unwrap();
        let catalog = AssetCatalog::new(temp.path().to_path_buf(), 5.0);
        let listing = catalog.list(&stream("ghost"));
        assert!(listing.is_empty());
    }

    #[test]
    fn test_list_classifies_and_orders_by_mtime() {
        let temp = TempDir::new().unwrap();
        let catalog = AssetCatalog::new(temp.path().to_path_buf(), 5.0);
        let id = stream("demo-1");
        catalog.create_stream(&id).unwrap();

        let video_dir = catalog.class_dir(&id, MediaClass::Video);
        let audio_dir = catalog.class_dir(&id, MediaClass::Audio);
        touch(&video_dir.join("c.mp4"), 300);
        touch(&video_dir.join("a.png"), 100);
        touch(&video_dir.join("b.mov"), 200);
        touch(&video_dir.join("notes.txt"), 50);
        touch(&video_dir.join(".partial.mp4"), 10);
        touch(&audio_dir.join("z.mp3"), 20);
        touch(&audio_dir.join("y.wav"), 10);
        // An audio file dropped in the video directory is still audio
        touch(&video_dir.join("x.m4a"), 30);

        let listing = catalog.list(&id);
        let video: Vec<&str> = listing.video.iter().map(|a| a.name.as_str()).collect();
        let audio: Vec<&str> = listing.audio.iter().map(|a| a.name.as_str()).collect();

        assert_eq!(video, vec!["a.png", "b.mov", "c.mp4"]);
        assert_eq!(audio, vec!["y.wav", "z.mp3", "x.m4a"]);
        assert!(listing.has_stills());
        assert!(listing.video.iter().all(|a| a.path.is_absolute()));
    }

    #[test]
    fn test_equal_mtime_breaks_tie_by_name() {
        let temp = TempDir::new().unwrap();
        let catalog = AssetCatalog::new(temp.path().to_path_buf(), 5.0);
        let id = stream("tie");
        catalog.create_stream(&id).unwrap();
        let dir = catalog.class_dir(&id, MediaClass::Audio);
        touch(&dir.join("b.mp3"), 100);
        touch(&dir.join("a.mp3"), 100);

        let names: Vec<String> = catalog.list(&id).audio.into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["a.mp3", "b.mp3"]);
    }

    #[test]
    fn test_create_stream_twice_fails() {
        let temp = TempDir::new().unwrap();
        let catalog = AssetCatalog::new(temp.path().to_path_buf(), 5.0);
        let id = stream("dup");
        catalog.create_stream(&id).unwrap();
        let err = catalog.create_stream(&id).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Precondition(PreconditionError::StreamExists(_))
        ));
    }

    #[test]
    fn test_list_stream_ids_skips_invalid_names() {
        let temp = TempDir::new().unwrap();
        let catalog = AssetCatalog::new(temp.path().to_path_buf(), 5.0);
        catalog.create_stream(&stream("beta")).unwrap();
        catalog.create_stream(&stream("alpha")).unwrap();
        fs::create_dir_all(temp.path().join("not valid")).unwrap();
        File::create(temp.path().join("stray-file")).unwrap();

        let ids: Vec<String> = catalog
            .list_stream_ids()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(ids, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_remove_asset() {
        let temp = TempDir::new().unwrap();
        let catalog = AssetCatalog::new(temp.path().to_path_buf(), 5.0);
        let id = stream("rm");
        catalog.create_stream(&id).unwrap();
        touch(&catalog.class_dir(&id, MediaClass::Audio).join("song.mp3"), 1);

        assert!(catalog.remove_asset(&id, "song.mp3").unwrap());
        assert!(!catalog.remove_asset(&id, "song.mp3").unwrap());
        assert!(catalog.list(&id).is_empty());
        assert!(catalog.remove_asset(&id, "../escape.mp3").is_err());
    }

    // Playback order is independent of the order files were written in.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(30))]

        #[test]
        fn prop_listing_order_follows_mtime(
            mtimes in prop::collection::hash_set(1u64..1_000_000, 1..8),
        ) {
            let temp = TempDir::new().unwrap();
            let catalog = AssetCatalog::new(temp.path().to_path_buf(), 5.0);
            let id = stream("prop");
            catalog.create_stream(&id).unwrap();
            let dir = catalog.class_dir(&id, MediaClass::Video);

            // file names deliberately unrelated to mtime order
            for (i, secs) in mtimes.iter().enumerate() {
                touch(&dir.join(format!("clip{}.mp4", 100 - i)), *secs);
            }

            let listing = catalog.list(&id);
            let listed: Vec<SystemTime> = listing.video.iter().map(|a| a.modified_time).collect();
            let mut expected: Vec<u64> = mtimes.into_iter().collect();
            expected.sort();
            let expected: Vec<SystemTime> = expected
                .into_iter()
                .map(|s| SystemTime::UNIX_EPOCH + Duration::from_secs(s))
                .collect();
            prop_assert_eq!(listed, expected);
        }
    }
}
