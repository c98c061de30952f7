use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use topic2video::api::youtube::ClientSecrets;
use topic2video::api::YouTubePublisher;
use topic2video::batch::sanitize_file_name;
use topic2video::config::{ImageFailurePolicy, MissingAudioPolicy};
use topic2video::secrets::FileTokenStore;
use topic2video::{BatchDriver, Pipeline, PipelineConfig, Services};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "topic2video")]
#[command(about = "Generate narrated slideshow videos from a topic", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Directory for per-run scratch files
    #[arg(long, global = true)]
    scratch_dir: Option<PathBuf>,

    /// Directory for finished videos
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Length of every clip, in seconds
    #[arg(long, global = true)]
    clip_duration: Option<f64>,

    /// Silence before and after each narration, in seconds
    #[arg(long, global = true)]
    silence: Option<f64>,

    /// Segments processed at once
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    /// What to do with a segment that has no narration
    #[arg(long, global = true, value_enum)]
    missing_audio: Option<MissingAudioPolicy>,

    /// What to do when a segment's image cannot be generated
    #[arg(long, global = true, value_enum)]
    image_failure: Option<ImageFailurePolicy>,

    /// Keep scratch files of a failed run for inspection
    #[arg(long, global = true)]
    keep_scratch: bool,

    /// Also write the script as JSON next to each video
    #[arg(long, global = true)]
    save_script: bool,

    /// OpenAI API key
    #[arg(long, global = true, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate one video for a topic
    Video {
        #[arg(short, long)]
        topic: String,

        #[arg(short, long, default_value_t = 5)]
        segments: usize,

        /// Output video path (defaults to <output_dir>/<topic>.mp4)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print topic ideas for a broad theme
    Ideas {
        #[arg(short, long)]
        meta_topic: String,

        #[arg(short, long, default_value_t = 3)]
        count: usize,
    },
    /// Generate ideas, then one video per idea
    Batch {
        #[arg(short, long)]
        meta_topic: String,

        #[arg(short, long, default_value_t = 3)]
        ideas: usize,

        #[arg(short, long, default_value_t = 5)]
        segments: usize,

        /// Upload every finished video to YouTube
        #[arg(long)]
        upload: bool,

        /// Visibility of uploaded videos
        #[arg(long)]
        privacy: Option<String>,
    },
}

impl GlobalArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(dir) = &self.scratch_dir {
            config.scratch_dir = dir.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(secs) = self.clip_duration {
            config.clip_duration = Duration::from_secs_f64(secs.max(0.0));
        }
        if let Some(secs) = self.silence {
            config.silence_duration = Duration::from_secs_f64(secs.max(0.0));
        }
        if let Some(n) = self.concurrency {
            config.segment_concurrency = n.max(1);
        }
        if let Some(policy) = self.missing_audio {
            config.missing_audio = policy;
        }
        if let Some(policy) = self.image_failure {
            config.image_failure = policy;
        }
        if self.keep_scratch {
            config.keep_scratch_on_failure = true;
        }
        if self.save_script {
            config.save_script = true;
        }
        if let Some(key) = &self.api_key {
            config.openai.api_key = Some(key.clone());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::default();
    cli.global.apply(&mut config);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current step...");
            on_signal.cancel();
        }
    });

    if let Err(e) = run(cli.command, config, cancel).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(command: Command, config: PipelineConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    match command {
        Command::Video {
            topic,
            segments,
            output,
        } => {
            let output = output.unwrap_or_else(|| {
                config
                    .output_dir
                    .join(format!("{}.mp4", sanitize_file_name(&topic)))
            });
            let pipeline = Pipeline::from_config(config).context("Failed to set up pipeline")?;
            let report = pipeline.run(&topic, segments, &output, &cancel).await?;
            info!("Video generation completed: {}", report.output.display());
            if !report.skipped.is_empty() {
                warn!("Segments left out: {:?}", report.skipped);
            }
            println!("{}", report.output.display());
        }
        Command::Ideas { meta_topic, count } => {
            let services = Services::from_config(&config).context("Failed to set up services")?;
            let ideas = services
                .script_writer
                .generate_ideas(&meta_topic, count)
                .await
                .context("Failed to generate ideas")?;
            for idea in ideas {
                println!("{}", idea);
            }
        }
        Command::Batch {
            meta_topic,
            ideas,
            segments,
            upload,
            privacy,
        } => {
            let publisher = if upload {
                let secrets = ClientSecrets::load(&config.publish.client_secrets_file)
                    .await
                    .with_context(|| {
                        format!(
                            "Failed to read client secrets: {}",
                            config.publish.client_secrets_file.display()
                        )
                    })?;
                let tokens = Arc::new(FileTokenStore::new(&config.publish.token_cache_file));
                Some(Arc::new(YouTubePublisher::new(
                    secrets,
                    tokens,
                    config.publish.clone(),
                    config.request_timeout,
                )?))
            } else {
                None
            };

            let mut driver =
                BatchDriver::new(Pipeline::from_config(config).context("Failed to set up pipeline")?);
            if let Some(publisher) = publisher {
                driver = driver.with_publisher(publisher);
            }
            if let Some(privacy) = privacy {
                driver = driver.with_privacy_status(privacy);
            }

            let entries = driver
                .run_batch(&meta_topic, ideas, segments, &cancel)
                .await
                .context("Batch failed")?;
            info!("Batch finished: {} videos", entries.len());
            for entry in entries {
                match entry.video_id {
                    Some(id) => println!("{}\t{}", entry.output.display(), id),
                    None => println!("{}", entry.output.display()),
                }
            }
        }
    }
    Ok(())
}
