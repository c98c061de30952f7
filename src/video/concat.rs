use super::ffmpeg::Ffmpeg;
use super::ClipConcatenator;
use crate::artifact::{Artifact, ArtifactKind, ArtifactStore};
use crate::error::{Result, VideoError};
use async_trait::async_trait;
use std::path::Path;
use tracing::info;

/// Concat-demuxer playlist listing `clips` in the given order, relative to `base`.
pub fn manifest(base: &Path, clips: &[Artifact]) -> String {
    clips
        .iter()
        .map(|clip| {
            let path = clip.path.strip_prefix(base).unwrap_or(&clip.path);
            let escaped = path.to_string_lossy().replace('\'', "'\\''");
            format!("file '{}'\n", escaped)
        })
        .collect()
}

/// Joins clips by stream copy; every clip must come from the same composer settings.
pub struct FfmpegConcatenator {
    ffmpeg: Ffmpeg,
}

impl FfmpegConcatenator {
    pub fn new(ffmpeg: Ffmpeg) -> Self {
        Self { ffmpeg }
    }
}

#[async_trait]
impl ClipConcatenator for FfmpegConcatenator {
    async fn concatenate(&self, store: &ArtifactStore, clips: &[Artifact]) -> Result<Artifact> {
        if clips.is_empty() {
            return Err(VideoError::MissingInput("no clips to concatenate".into()));
        }
        for clip in clips {
            if tokio::fs::metadata(&clip.path).await.is_err() {
                return Err(VideoError::MissingInput(format!(
                    "clip {} is missing",
                    clip.path.display()
                )));
            }
        }
        info!("Concatenating {} clips...", clips.len());

        let list = store
            .write(
                ArtifactKind::Manifest,
                None,
                "txt",
                manifest(store.dir(), clips).as_bytes(),
            )
            .await?;
        let combined = store.reserve(ArtifactKind::CombinedVideo, None, "mp4");

        let result = self.ffmpeg.concat_clips(&list.path, &combined.path).await;
        store.discard(&list).await.ok();
        if let Err(e) = result {
            store.discard(&combined).await.ok();
            return Err(e);
        }
        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EncoderConfig;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn clip(dir: &Path, name: &str, owner: usize) -> Artifact {
        Artifact {
            id: Uuid::new_v4(),
            path: dir.join(name),
            kind: ArtifactKind::Clip,
            owner: Some(owner),
        }
    }

    #[test]
    fn test_manifest_is_relative_and_ordered() {
        let base = Path::new("/tmp/scratch/run-1");
        let clips = vec![clip(base, "b.mp4", 0), clip(base, "a.mp4", 1)];
        assert_eq!(manifest(base, &clips), "file 'b.mp4'\nfile 'a.mp4'\n");

        let reversed: Vec<Artifact> = clips.iter().rev().cloned().collect();
        assert_eq!(manifest(base, &reversed), "file 'a.mp4'\nfile 'b.mp4'\n");
    }

    #[test]
    fn test_manifest_escapes_quotes_and_keeps_foreign_paths() {
        let base = Path::new("/tmp/scratch");
        let clips = vec![
            clip(base, "it's.mp4", 0),
            clip(Path::new("/elsewhere"), "x.mp4", 1),
        ];
        assert_eq!(
            manifest(base, &clips),
            "file 'it'\\''s.mp4'\nfile '/elsewhere/x.mp4'\n"
        );
    }

    #[tokio::test]
    async fn test_manifest_removed_after_tool_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path()).await.unwrap();
        let a = store.write(ArtifactKind::Clip, Some(0), "mp4", b"a").await.unwrap();

        let config = EncoderConfig {
            ffmpeg: PathBuf::from("/nonexistent/ffmpeg-binary"),
            ..EncoderConfig::default()
        };
        let concatenator = FfmpegConcatenator::new(Ffmpeg::new(config));
        let err = concatenator.concatenate(&store, &[a.clone()]).await.unwrap_err();
        assert!(matches!(err, VideoError::ExternalTool { .. }));

        let left: Vec<Artifact> = store.artifacts();
        assert_eq!(left, vec![a]);
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_missing_clip_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path()).await.unwrap();
        let ghost = store.reserve(ArtifactKind::Clip, Some(0), "mp4");
        let concatenator = FfmpegConcatenator::new(Ffmpeg::new(EncoderConfig::default()));

        assert!(matches!(
            concatenator.concatenate(&store, &[ghost]).await,
            Err(VideoError::MissingInput(_))
        ));
        assert!(matches!(
            concatenator.concatenate(&store, &[]).await,
            Err(VideoError::MissingInput(_))
        ));
    }
}
