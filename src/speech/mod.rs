//! Narration: splits a segment's text into sentence units, synthesizes each
//! unit, and joins the successful ones into a single WAV with a short gap
//! between them.

use crate::api::VoiceEngine;
use crate::artifact::{Artifact, ArtifactKind, ArtifactStore};
use crate::config::VoiceConfig;
use crate::error::{Result, VideoError};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Splits narration into units on `terminator`, re-terminating each unit.
pub fn split_units(text: &str, terminator: char) -> Vec<String> {
    text.replace("\n\n", "")
        .split(terminator)
        .map(str::trim)
        .filter(|unit| !unit.is_empty())
        .map(|unit| format!("{}{}", unit, terminator))
        .collect()
}

enum Samples {
    Int(Vec<i32>),
    Float(Vec<f32>),
}

struct DecodedUnit {
    spec: WavSpec,
    samples: Samples,
}

fn decode_wav(bytes: &[u8]) -> Result<DecodedUnit> {
    let mut reader = WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let samples = match spec.sample_format {
        SampleFormat::Int => Samples::Int(reader.samples::<i32>().collect::<std::result::Result<_, _>>()?),
        SampleFormat::Float => Samples::Float(reader.samples::<f32>().collect::<std::result::Result<_, _>>()?),
    };
    Ok(DecodedUnit { spec, samples })
}

/// Joins decoded units in order with `gap` of silence between neighbours.
fn join_wav(units: &[DecodedUnit], gap: Duration) -> Result<Vec<u8>> {
    let spec = match units.first() {
        Some(first) => first.spec,
        None => return Err(VideoError::SynthesisTotal("nothing to join".into())),
    };
    let gap_samples = (spec.sample_rate as f64 * gap.as_secs_f64()).round() as usize
        * spec.channels as usize;

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut cursor, spec)?;
        for (i, unit) in units.iter().enumerate() {
            if i > 0 {
                for _ in 0..gap_samples {
                    match spec.sample_format {
                        SampleFormat::Int => writer.write_sample(0i32)?,
                        SampleFormat::Float => writer.write_sample(0f32)?,
                    }
                }
            }
            match &unit.samples {
                Samples::Int(samples) => {
                    for &s in samples {
                        writer.write_sample(s)?;
                    }
                }
                Samples::Float(samples) => {
                    for &s in samples {
                        writer.write_sample(s)?;
                    }
                }
            }
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Speech stage adapter: text in, WAV artifact (or nothing) out.
#[derive(Clone)]
pub struct Narrator {
    engine: Arc<dyn VoiceEngine>,
    terminator: char,
    gap: Duration,
}

impl Narrator {
    pub fn new(engine: Arc<dyn VoiceEngine>, config: &VoiceConfig) -> Self {
        Self {
            engine,
            terminator: config.terminator,
            gap: config.unit_gap,
        }
    }

    /// Synthesizes every unit, dropping the ones that fail.
    ///
    /// Returns `None` when no unit produced audio. Failed units are logged and
    /// leave no trace in the output; surviving units keep their order.
    pub async fn synthesize(&self, text: &str) -> Result<Option<Vec<u8>>> {
        let units = split_units(text, self.terminator);
        let mut decoded: Vec<DecodedUnit> = Vec::with_capacity(units.len());

        for (i, unit) in units.iter().enumerate() {
            info!("Processing speech unit {}/{}...", i + 1, units.len());
            let bytes = match self.engine.synthesize_unit(unit).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Speech unit {} dropped: {}", i + 1, e);
                    continue;
                }
            };
            let unit_audio = match decode_wav(&bytes) {
                Ok(audio) => audio,
                Err(e) => {
                    warn!("Speech unit {} is not valid WAV, dropped: {}", i + 1, e);
                    continue;
                }
            };
            if let Some(first) = decoded.first() {
                if first.spec != unit_audio.spec {
                    warn!(
                        "Speech unit {} format {:?} differs from {:?}, dropped",
                        i + 1,
                        unit_audio.spec,
                        first.spec
                    );
                    continue;
                }
            }
            decoded.push(unit_audio);
        }

        if decoded.is_empty() {
            return Ok(None);
        }
        join_wav(&decoded, self.gap).map(Some)
    }

    /// Narrates one segment into the store; `None` means no audio was produced
    /// and nothing was written.
    pub async fn narrate(
        &self,
        store: &ArtifactStore,
        segment: usize,
        text: &str,
    ) -> Result<Option<Artifact>> {
        if text.trim().is_empty() {
            warn!("Segment {} has no narration, skipping speech", segment);
            return Ok(None);
        }
        match self.synthesize(text).await? {
            Some(audio) => {
                let artifact = store
                    .write(ArtifactKind::Audio, Some(segment), "wav", &audio)
                    .await?;
                info!("Segment {} narration saved: {}", segment, artifact.path.display());
                Ok(Some(artifact))
            }
            None => {
                warn!("{}", VideoError::SynthesisTotal(format!("segment {}", segment)));
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const RATE: u32 = 1000;

    fn wav(value: i16, len: usize) -> Vec<u8> {
        let spec = WavSpec {
            channels: 1,
            sample_rate: RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..len {
                writer.write_sample(value).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    fn read_samples(bytes: &[u8]) -> Vec<i16> {
        WavReader::new(Cursor::new(bytes))
            .unwrap()
            .samples::<i16>()
            .map(|s| s.unwrap())
            .collect()
    }

    /// Answers each unit with a constant-valued WAV, or fails the listed units.
    struct ScriptedVoice {
        answers: HashMap<String, Option<Vec<u8>>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl VoiceEngine for ScriptedVoice {
        async fn synthesize_unit(&self, text: &str) -> Result<Vec<u8>> {
            self.calls.lock().unwrap().push(text.to_string());
            match self.answers.get(text) {
                Some(Some(bytes)) => Ok(bytes.clone()),
                _ => Err(VideoError::SynthesisUnit("HTTP 500".into())),
            }
        }
    }

    fn narrator(answers: Vec<(&str, Option<Vec<u8>>)>) -> (Narrator, Arc<ScriptedVoice>) {
        let voice = Arc::new(ScriptedVoice {
            answers: answers
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            calls: Mutex::new(Vec::new()),
        });
        let config = VoiceConfig {
            unit_gap: Duration::from_millis(10),
            ..VoiceConfig::default()
        };
        (Narrator::new(voice.clone(), &config), voice)
    }

    #[test]
    fn test_split_units() {
        assert_eq!(
            split_units("これはサンプルです。宇宙人はいます。\n\n会ったことがあります！", '。'),
            vec!["これはサンプルです。", "宇宙人はいます。", "会ったことがあります！。"]
        );
        assert!(split_units("。。 。", '。').is_empty());
    }

    #[tokio::test]
    async fn test_units_joined_in_order_with_gap() {
        let (narrator, _) = narrator(vec![
            ("一。", Some(wav(1, 5))),
            ("二。", Some(wav(2, 3))),
        ]);
        let audio = narrator.synthesize("一。二。").await.unwrap().unwrap();
        let samples = read_samples(&audio);
        // 10ms gap at 1kHz is 10 samples
        let mut expected = vec![1; 5];
        expected.extend(vec![0; 10]);
        expected.extend(vec![2; 3]);
        assert_eq!(samples, expected);
    }

    #[tokio::test]
    async fn test_failed_unit_is_omitted_without_reordering() {
        let (narrator, voice) = narrator(vec![
            ("一。", Some(wav(1, 2))),
            ("二。", None),
            ("三。", Some(wav(3, 2))),
        ]);
        let audio = narrator.synthesize("一。二。三。").await.unwrap().unwrap();
        let samples = read_samples(&audio);
        assert_eq!(samples.first(), Some(&1));
        assert_eq!(samples.last(), Some(&3));
        assert!(!samples.contains(&2));
        assert_eq!(samples.len(), 2 + 10 + 2);
        assert_eq!(voice.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_garbage_unit_is_omitted() {
        let (narrator, _) = narrator(vec![
            ("一。", Some(b"not a wav".to_vec())),
            ("二。", Some(wav(2, 4))),
        ]);
        let audio = narrator.synthesize("一。二。").await.unwrap().unwrap();
        assert_eq!(read_samples(&audio), vec![2; 4]);
    }

    #[tokio::test]
    async fn test_total_failure_creates_no_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path()).await.unwrap();
        let (narrator, _) = narrator(vec![]);

        let audio = narrator.narrate(&store, 0, "一。二。").await.unwrap();
        assert!(audio.is_none());
        assert!(store.artifacts().is_empty());
        assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_empty_narration_is_not_sent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path()).await.unwrap();
        let (narrator, voice) = narrator(vec![]);

        assert!(narrator.narrate(&store, 0, "   ").await.unwrap().is_none());
        assert!(voice.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_narrate_writes_audio_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(tmp.path()).await.unwrap();
        let (narrator, _) = narrator(vec![("一。", Some(wav(7, 8)))]);

        let artifact = narrator.narrate(&store, 3, "一。").await.unwrap().unwrap();
        assert_eq!(artifact.kind, ArtifactKind::Audio);
        assert_eq!(artifact.owner, Some(3));
        assert_eq!(read_samples(&std::fs::read(&artifact.path).unwrap()), vec![7; 8]);
    }
}
