//! Scratch directory for raw sinks and artifacts

use std::path::{Path, PathBuf};

use crate::Result;
use crate::config::Container;

/// Extension of raw recording sinks
pub const SINK_EXTENSION: &str = "pcm";

/// Suffix of artifacts still being written
pub const PARTIAL_EXTENSION: &str = "part";

/// Everything a recording can leave in the scratch directory
const SCRATCH_EXTENSIONS: [&str; 4] = [
    SINK_EXTENSION,
    PARTIAL_EXTENSION,
    Container::Wav.extension(),
    Container::Mp3.extension(),
];

/// Unique sink path for one recording: `<speaker>-<unix millis>-<uuid8>.pcm`
#[must_use]
pub fn sink_path(dir: &Path, speaker: &str) -> PathBuf {
    let millis = chrono::Utc::now().timestamp_millis();
    let id = uuid::Uuid::new_v4().simple().to_string();
    dir.join(format!(
        "{}-{millis}-{}.{SINK_EXTENSION}",
        file_safe(speaker),
        &id[..8]
    ))
}

/// Artifact path for a sink: same stem, container extension
#[must_use]
pub fn artifact_path(sink: &Path, container: Container) -> PathBuf {
    sink.with_extension(container.extension())
}

/// Where an artifact is written before it is renamed into place
#[must_use]
pub fn partial_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_owned();
    name.push(".");
    name.push(PARTIAL_EXTENSION);
    PathBuf::from(name)
}

/// Replace anything that is not safe in a file name
fn file_safe(speaker: &str) -> String {
    let cleaned: String = speaker
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() {
        "speaker".to_string()
    } else {
        cleaned
    }
}

/// Create the scratch directory if needed
///
/// # Errors
///
/// Returns error if the directory cannot be created
pub fn ensure_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

/// Remove sinks and artifacts left behind by an earlier run. Returns how
/// many files were removed.
///
/// # Errors
///
/// Returns error if the directory cannot be read
pub fn sweep(dir: &Path) -> Result<usize> {
    let mut removed = 0;

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_stale = path.is_file()
            && path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| SCRATCH_EXTENSIONS.contains(&ext));

        if is_stale {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove stale scratch file"),
            }
        }
    }

    if removed > 0 {
        tracing::info!(dir = %dir.display(), removed, "swept stale recording files");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_names_are_unique_and_safe() {
        let dir = Path::new("/tmp/scratch");
        let a = sink_path(dir, "user/../42");
        let b = sink_path(dir, "user/../42");

        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(dir));
        let name = a.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("user____42-"));
        assert!(name.ends_with(".pcm"));
    }

    #[test]
    fn test_artifact_names_follow_the_sink() {
        let sink = Path::new("/tmp/scratch/alice-1-abcd1234.pcm");
        let artifact = artifact_path(sink, Container::Mp3);

        assert_eq!(artifact, Path::new("/tmp/scratch/alice-1-abcd1234.mp3"));
        assert_eq!(
            partial_path(&artifact),
            Path::new("/tmp/scratch/alice-1-abcd1234.mp3.part")
        );
    }

    #[test]
    fn test_sweep_removes_sinks_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "a-1-00000000.pcm",
            "b-1-00000000.wav",
            "c-1-00000000.mp3",
            "d-1-00000000.wav.part",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.wav")).unwrap();

        assert_eq!(sweep(dir.path()).unwrap(), 4);
        assert!(dir.path().join("notes.txt").exists());
        assert!(dir.path().join("nested.wav").is_dir());
        assert!(!dir.path().join("c-1-00000000.mp3").exists());
    }
}
