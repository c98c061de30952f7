//! Many topics from one theme: ideas, then one pipeline run per idea.

use crate::api::{Publisher, VideoMetadata};
use crate::error::{Result, VideoError};
use crate::pipeline::Pipeline;
use crate::script::Script;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// One produced video.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub topic: String,
    pub output: PathBuf,
    pub script: Script,
    /// Platform id, when the video was published.
    pub video_id: Option<String>,
}

pub struct BatchDriver {
    pipeline: Pipeline,
    publisher: Option<Arc<dyn Publisher>>,
    privacy_status: String,
}

impl BatchDriver {
    pub fn new(pipeline: Pipeline) -> Self {
        let privacy_status = pipeline.config().publish.privacy_status.clone();
        Self {
            pipeline,
            publisher: None,
            privacy_status,
        }
    }

    /// Uploads every finished video through `publisher`.
    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn with_privacy_status(mut self, privacy_status: impl Into<String>) -> Self {
        self.privacy_status = privacy_status.into();
        self
    }

    /// Generates up to `idea_count` topics from `meta_topic` and runs the pipeline for each.
    ///
    /// A topic whose run aborts is logged and skipped. A publish failure is
    /// returned to the caller and ends the batch.
    pub async fn run_batch(
        &self,
        meta_topic: &str,
        idea_count: usize,
        segments_per_video: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<BatchEntry>> {
        info!("Generating {} ideas for '{}'", idea_count, meta_topic);
        let ideas = self
            .pipeline
            .services()
            .script_writer
            .generate_ideas(meta_topic, idea_count)
            .await?;
        info!("Got {} ideas", ideas.len());

        let mut used = HashSet::new();
        let mut entries = Vec::new();
        for (n, idea) in ideas.iter().enumerate() {
            info!("[{}/{}] {}", n + 1, ideas.len(), idea);
            let output = self
                .pipeline
                .config()
                .output_dir
                .join(unique_file_name(idea, &mut used));

            let report = match self
                .pipeline
                .run(idea, segments_per_video, &output, cancel)
                .await
            {
                Ok(report) => report,
                Err(failure) if matches!(failure.source, VideoError::Cancelled) => {
                    return Err(VideoError::Cancelled)
                }
                Err(failure) => {
                    error!("Skipping topic: {}", failure);
                    continue;
                }
            };

            let video_id = match &self.publisher {
                Some(publisher) => {
                    let metadata = VideoMetadata::from_script(&report.script, &self.privacy_status);
                    let id = publisher.publish(&report.output, &metadata).await?;
                    info!("Published '{}' as {}", metadata.title, id);
                    Some(id)
                }
                None => None,
            };

            entries.push(BatchEntry {
                topic: idea.clone(),
                output: report.output,
                script: report.script,
                video_id,
            });
        }
        Ok(entries)
    }
}

/// Turns a topic into a file name safe on common filesystems.
pub fn sanitize_file_name(topic: &str) -> String {
    let cleaned: String = topic
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if cleaned.is_empty() {
        "untitled".to_string()
    } else {
        cleaned.to_string()
    }
}

fn unique_file_name(topic: &str, used: &mut HashSet<String>) -> String {
    let base = sanitize_file_name(topic);
    let mut name = base.clone();
    let mut n = 2;
    while !used.insert(name.clone()) {
        name = format!("{}-{}", base, n);
        n += 1;
    }
    format!("{}.mp4", name)
}
