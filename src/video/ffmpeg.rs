use crate::config::EncoderConfig;
use crate::error::{Result, VideoError};
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, error, info};

const STDERR_TAIL_LINES: usize = 20;

fn secs(d: Duration) -> String {
    d.as_secs_f64().to_string()
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    lines[start..].join("\n")
}

/// Thin wrapper over the `ffmpeg` binary.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    config: EncoderConfig,
}

impl Ffmpeg {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    async fn run(&self, stage: &str, args: Vec<OsString>) -> Result<()> {
        debug!("ffmpeg {:?}", args);
        let mut command = Command::new(&self.config.ffmpeg);
        command
            .arg("-hide_banner")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.config.timeout, command.output())
            .await
            .map_err(|_| VideoError::Timeout(self.config.timeout, format!("running ffmpeg ({})", stage)))?
            .map_err(|e| VideoError::tool("ffmpeg", stage, format!("failed to start: {}", e)))?;

        if !output.status.success() {
            let tail = stderr_tail(&output.stderr);
            error!("FFmpeg {} failed ({}): {}", stage, output.status, tail);
            return Err(VideoError::tool(
                "ffmpeg",
                stage,
                format!("{}: {}", output.status, tail),
            ));
        }
        Ok(())
    }

    pub(crate) fn silence_args(&self, duration: Duration, output: &Path) -> Vec<OsString> {
        vec![
            "-y".into(),
            "-f".into(),
            "lavfi".into(),
            "-i".into(),
            self.config.silence_source.clone().into(),
            "-t".into(),
            secs(duration).into(),
            output.into(),
        ]
    }

    pub(crate) fn concat_audio_args(&self, inputs: &[&Path], output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-y".into()];
        for input in inputs {
            args.push("-i".into());
            args.push((*input).into());
        }
        let labels: String = (0..inputs.len()).map(|i| format!("[{}:a]", i)).collect();
        args.push("-filter_complex".into());
        args.push(format!("{}concat=n={}:v=0:a=1", labels, inputs.len()).into());
        args.push(output.into());
        args
    }

    pub(crate) fn still_clip_args(
        &self,
        image: &Path,
        audio: &Path,
        duration: Duration,
        output: &Path,
    ) -> Vec<OsString> {
        vec![
            "-y".into(),
            "-loop".into(),
            "1".into(),
            "-i".into(),
            image.into(),
            "-i".into(),
            audio.into(),
            "-c:v".into(),
            self.config.video_codec.clone().into(),
            "-t".into(),
            secs(duration).into(),
            "-pix_fmt".into(),
            self.config.pixel_format.clone().into(),
            "-vf".into(),
            format!("fps={}", self.config.frame_rate).into(),
            "-c:a".into(),
            self.config.audio_codec.clone().into(),
            "-shortest".into(),
            output.into(),
        ]
    }

    pub(crate) fn concat_clips_args(&self, manifest: &Path, output: &Path) -> Vec<OsString> {
        vec![
            "-y".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            manifest.into(),
            "-c".into(),
            "copy".into(),
            output.into(),
        ]
    }

    /// Writes `duration` of silence to `output`.
    pub async fn silence(&self, duration: Duration, output: &Path) -> Result<()> {
        self.run("generating silence", self.silence_args(duration, output))
            .await
    }

    /// Concatenates audio files back to back.
    pub async fn concat_audio(&self, inputs: &[&Path], output: &Path) -> Result<()> {
        if inputs.is_empty() {
            return Err(VideoError::MissingInput("no audio to concatenate".into()));
        }
        self.run("padding narration", self.concat_audio_args(inputs, output))
            .await
    }

    /// Renders a still image over an audio track.
    pub async fn still_clip(
        &self,
        image: &Path,
        audio: &Path,
        duration: Duration,
        output: &Path,
    ) -> Result<()> {
        self.run("composing clip", self.still_clip_args(image, audio, duration, output))
            .await?;
        info!("Created clip: {}", output.display());
        Ok(())
    }

    /// Stream-copies the clips listed in `manifest` into one file.
    pub async fn concat_clips(&self, manifest: &Path, output: &Path) -> Result<()> {
        self.run("concatenating clips", self.concat_clips_args(manifest, output))
            .await?;
        info!("Concatenated video: {}", output.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn ffmpeg() -> Ffmpeg {
        Ffmpeg::new(EncoderConfig {
            ffmpeg: PathBuf::from("ffmpeg"),
            frame_rate: 24,
            pixel_format: "yuv420p".into(),
            video_codec: "libx264".into(),
            audio_codec: "aac".into(),
            silence_source: "anullsrc=r=44100:cl=stereo".into(),
            timeout: Duration::from_secs(5),
        })
    }

    #[test]
    fn test_silence_args() {
        let args = strings(ffmpeg().silence_args(Duration::from_millis(500), Path::new("s.wav")));
        assert_eq!(
            args,
            vec!["-y", "-f", "lavfi", "-i", "anullsrc=r=44100:cl=stereo", "-t", "0.5", "s.wav"]
        );
    }

    #[test]
    fn test_concat_audio_filter_matches_input_count() {
        let args = strings(ffmpeg().concat_audio_args(
            &[Path::new("a.wav"), Path::new("b.wav"), Path::new("a.wav")],
            Path::new("out.wav"),
        ));
        assert!(args.contains(&"[0:a][1:a][2:a]concat=n=3:v=0:a=1".to_string()));
        assert_eq!(args.iter().filter(|a| *a == "-i").count(), 3);
        assert_eq!(args.last().unwrap(), "out.wav");
    }

    #[test]
    fn test_still_clip_args() {
        let args = strings(ffmpeg().still_clip_args(
            Path::new("img.jpg"),
            Path::new("pad.wav"),
            Duration::from_secs(10),
            Path::new("clip.mp4"),
        ));
        let joined = args.join(" ");
        assert!(joined.starts_with("-y -loop 1 -i img.jpg -i pad.wav"));
        assert!(joined.contains("-t 10 "));
        assert!(joined.contains("-pix_fmt yuv420p"));
        assert!(joined.contains("-vf fps=24"));
        assert!(joined.contains("-shortest clip.mp4"));
    }

    #[test]
    fn test_concat_clips_is_stream_copy() {
        let args = strings(ffmpeg().concat_clips_args(Path::new("list.txt"), Path::new("all.mp4")));
        assert_eq!(
            args,
            vec!["-y", "-f", "concat", "-safe", "0", "-i", "list.txt", "-c", "copy", "all.mp4"]
        );
    }

    #[test]
    fn test_stderr_tail_keeps_last_lines() {
        let stderr: String = (0..30).map(|i| format!("line {}\n", i)).collect();
        let tail = stderr_tail(stderr.as_bytes());
        assert!(tail.starts_with("line 10"));
        assert!(tail.ends_with("line 29"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_tool_failure() {
        let mut config = ffmpeg().config().clone();
        config.ffmpeg = PathBuf::from("/nonexistent/ffmpeg-binary");
        let err = Ffmpeg::new(config)
            .silence(Duration::from_secs(1), Path::new("x.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, VideoError::ExternalTool { .. }));
    }
}
