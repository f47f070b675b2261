//! Concat manifests fed to the transcoder.
//!
//! A manifest is the ordered playback list of one media class, rendered in
//! ffmpeg's concat demuxer syntax:
//!
//! ```text
//! file '/uploads/demo/video/intro.png'
//! duration 5
//! file '/uploads/demo/video/clip.mp4'
//! ```
//!
//! Still images carry an explicit `duration`. The demuxer ignores the
//! duration of the final entry, so when the list ends on an image its path is
//! repeated once more; without that sentinel the last image flashes for a
//! single frame before the loop wraps.

use crate::catalog::{Asset, AssetKind, MediaClass};
use crate::stream::StreamId;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One line group of a manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestEntry {
    pub path: PathBuf,
    /// Fixed display time; `None` lets the media's own timing drive playback.
    pub duration_secs: Option<f64>,
}

/// Ordered playback list for one media class.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub class: MediaClass,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Builds the manifest for `class` from catalog assets, keeping their order.
    ///
    /// Assets of another class are skipped.
    pub fn build(assets: &[Asset], class: MediaClass) -> Self {
        let mut entries: Vec<ManifestEntry> = assets
            .iter()
            .filter(|asset| asset.kind.class() == class)
            .map(|asset| ManifestEntry {
                path: asset.path.clone(),
                duration_secs: match asset.kind {
                    AssetKind::Image { duration_secs } => Some(duration_secs),
                    AssetKind::Video | AssetKind::Audio => None,
                },
            })
            .collect();

        if let Some(last) = entries.last() {
            if last.duration_secs.is_some() {
                let sentinel = ManifestEntry {
                    path: last.path.clone(),
                    duration_secs: None,
                };
                entries.push(sentinel);
            }
        }

        Self { class, entries }
    }

    /// An empty manifest must never reach the transcoder.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str("file ");
            out.push_str(&quote_path(&entry.path));
            out.push('\n');
            if let Some(secs) = entry.duration_secs {
                out.push_str(&format!("duration {}\n", secs));
            }
        }
        out
    }

    /// Writes the rendered manifest to `path`.
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.render())
    }
}

/// Quotes a path for the concat demuxer: single quotes, with embedded
/// quotes closed, escaped and reopened (`'\''`).
fn quote_path(path: &Path) -> String {
    let raw = path.to_string_lossy();
    format!("'{}'", raw.replace('\'', "'\\''"))
}

fn unquote(token: &str) -> String {
    let mut out = String::new();
    let mut chars = token.chars();
    let mut quoted = false;
    while let Some(c) = chars.next() {
        match c {
            '\'' => quoted = !quoted,
            '\\' if !quoted => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Parses rendered manifest text back into entries.
///
/// Understands the subset [`Manifest::render`] produces; unknown directives
/// are ignored.
pub fn parse_manifest(text: &str) -> Vec<ManifestEntry> {
    let mut entries: Vec<ManifestEntry> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("file ") {
            entries.push(ManifestEntry {
                path: PathBuf::from(unquote(rest.trim())),
                duration_secs: None,
            });
        } else if let Some(rest) = line.strip_prefix("duration ") {
            if let (Some(last), Ok(secs)) = (entries.last_mut(), rest.trim().parse::<f64>()) {
                last.duration_secs = Some(secs);
            }
        }
    }
    entries
}

/// Deterministic manifest location: `<transient_dir>/<id>_<class>_playlist.txt`.
pub fn manifest_path(transient_dir: &Path, id: &StreamId, class: MediaClass) -> PathBuf {
    transient_dir.join(format!("{}_{}_playlist.txt", id, class))
}

/// Deletes manifest files, tolerating ones that are already gone.
///
/// Failures are logged and otherwise ignored; cleanup never blocks a status
/// transition.
pub fn remove_manifests(paths: &[PathBuf]) {
    for path in paths {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to remove manifest");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn asset(name: &str, kind: AssetKind, secs: u64) -> Asset {
        Asset {
            name: name.to_string(),
            path: PathBuf::from(format!("/uploads/demo/{}", name)),
            size_bytes: 1024,
            modified_time: SystemTime::UNIX_EPOCH + Duration::from_secs(secs),
            kind,
        }
    }

    fn image(name: &str, secs: u64) -> Asset {
        asset(name, AssetKind::Image { duration_secs: 5.0 }, secs)
    }

    #[test]
    fn test_video_manifest_without_images() {
        let assets = vec![
            asset("a.mp4", AssetKind::Video, 1),
            asset("b.mov", AssetKind::Video, 2),
        ];
        let manifest = Manifest::build(&assets, MediaClass::Video);
        assert_eq!(
            manifest.render(),
            "file '/uploads/demo/a.mp4'\nfile '/uploads/demo/b.mov'\n"
        );
    }

    #[test]
    fn test_image_manifest_has_durations_and_sentinel() {
        let assets = vec![image("one.png", 1), image("two.jpg", 2)];
        let manifest = Manifest::build(&assets, MediaClass::Video);
        assert_eq!(
            manifest.render(),
            "file '/uploads/demo/one.png'\nduration 5\n\
             file '/uploads/demo/two.jpg'\nduration 5\n\
             file '/uploads/demo/two.jpg'\n"
        );
    }

    #[test]
    fn test_mixed_manifest_ending_with_video_has_no_sentinel() {
        let assets = vec![image("cover.png", 1), asset("clip.mp4", AssetKind::Video, 2)];
        let manifest = Manifest::build(&assets, MediaClass::Video);
        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.entries[0].duration_secs, Some(5.0));
        assert_eq!(manifest.entries[1].duration_secs, None);
    }

    #[test]
    fn test_custom_image_duration() {
        let assets = vec![asset("slide.png", AssetKind::Image { duration_secs: 2.5 }, 1)];
        let text = Manifest::build(&assets, MediaClass::Video).render();
        assert!(text.contains("duration 2.5\n"));
    }

    #[test]
    fn test_small_duration_renders_without_exponent() {
        let assets = vec![asset("blink.png", AssetKind::Image { duration_secs: 1e-7 }, 1)];
        let text = Manifest::build(&assets, MediaClass::Video).render();
        assert!(text.contains("duration 0.0000001\n"), "{text}");
        assert_eq!(parse_manifest(&text)[0].duration_secs, Some(1e-7));
    }

    #[test]
    fn test_audio_manifest_has_no_durations() {
        let assets = vec![
            asset("a.mp3", AssetKind::Audio, 1),
            asset("b.wav", AssetKind::Audio, 2),
        ];
        let manifest = Manifest::build(&assets, MediaClass::Audio);
        assert!(!manifest.render().contains("duration"));
        assert_eq!(manifest.entries.len(), 2);
    }

    #[test]
    fn test_build_filters_other_class() {
        let assets = vec![
            asset("a.mp3", AssetKind::Audio, 1),
            asset("b.mp4", AssetKind::Video, 2),
        ];
        let manifest = Manifest::build(&assets, MediaClass::Audio);
        assert_eq!(manifest.entries.len(), 1);
    }

    #[test]
    fn test_empty_assets_yield_empty_manifest() {
        let manifest = Manifest::build(&[], MediaClass::Video);
        assert!(manifest.is_empty());
        assert_eq!(manifest.render(), "");
    }

    #[test]
    fn test_quote_escaping_survives_parse() {
        let mut a = asset("x.mp4", AssetKind::Video, 1);
        a.path = PathBuf::from("/uploads/demo/it's here.mp4");
        let manifest = Manifest::build(&[a], MediaClass::Video);
        let text = manifest.render();
        assert_eq!(text, "file '/uploads/demo/it'\\''s here.mp4'\n");

        let parsed = parse_manifest(&text);
        assert_eq!(parsed[0].path, PathBuf::from("/uploads/demo/it's here.mp4"));
    }

    #[test]
    fn test_manifest_path_naming() {
        let id = StreamId::parse("demo-1").unwrap();
        assert_eq!(
            manifest_path(Path::new("/tmp/streams"), &id, MediaClass::Audio),
            PathBuf::from("/tmp/streams/demo-1_audio_playlist.txt")
        );
    }

    #[test]
    fn test_write_and_remove_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let id = StreamId::parse("w").unwrap();
        let path = manifest_path(&temp.path().join("nested"), &id, MediaClass::Video);
        let manifest = Manifest::build(&[image("a.png", 1)], MediaClass::Video);

        manifest.write_to(&path).unwrap();
        assert_eq!(parse_manifest(&fs::read_to_string(&path).unwrap()), manifest.entries);

        remove_manifests(&[path.clone()]);
        remove_manifests(&[path.clone()]);
        assert!(!path.exists());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        // Image-only manifests always end with the last image repeated.
        #[test]
        fn prop_still_manifest_ends_with_sentinel(count in 1usize..10) {
            let assets: Vec<Asset> = (0..count)
                .map(|i| image(&format!("img{}.png", i), i as u64))
                .collect();
            let text = Manifest::build(&assets, MediaClass::Video).render();
            let parsed = parse_manifest(&text);

            prop_assert_eq!(parsed.len(), count + 1);
            let n = parsed.len();
            prop_assert_eq!(&parsed[n - 1].path, &parsed[n - 2].path);
            prop_assert_eq!(parsed[n - 1].duration_secs, None);
            prop_assert_eq!(parsed[n - 2].duration_secs, Some(5.0));
        }

        // The manifest preserves catalog order exactly.
        #[test]
        fn prop_manifest_preserves_order(
            kinds in prop::collection::vec(prop::bool::ANY, 1..10),
        ) {
            let assets: Vec<Asset> = kinds
                .iter()
                .enumerate()
                .map(|(i, is_image)| {
                    if *is_image {
                        image(&format!("f{}.png", i), i as u64)
                    } else {
                        asset(&format!("f{}.mp4", i), AssetKind::Video, i as u64)
                    }
                })
                .collect();
            let parsed = parse_manifest(&Manifest::build(&assets, MediaClass::Video).render());

            for (i, a) in assets.iter().enumerate() {
                prop_assert_eq!(&parsed[i].path, &a.path);
            }
        }
    }
}
