mod settings;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use snafu::{ResultExt, Snafu, ensure};
use storyreel_producer::{
    AssetDirectory, ElevenLabsConfig, ElevenLabsSpeechProducer, Gateway, OpenAiConfig,
    OpenAiImageProducer, ProducerError, RigScriptProducer,
};
use storyreel_sequence::{
    GenerationContext, Sequence, SequenceError, load_sequence, save_sequence, update_sequence,
};
use storyreel_storage::{NewUser, SequenceId, SqliteStorage, StorageError, UserId, UserStore};
use tracing_subscriber::EnvFilter;

use settings::{DEFAULT_SETTINGS_FILE, Settings, SettingsError};

#[derive(Parser, Debug)]
#[command(author, version, about = "Generate narrated image sequences from a subject")]
struct Args {
    /// Path to the JSON settings file
    #[arg(short, long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the effective settings (defaults, file and environment) to the settings file
    Init,
    /// Generate a sequence and save it for an owner
    Generate {
        /// What the script should be about
        #[arg(short, long)]
        subject: Option<String>,

        /// Sequence name, also the prefix of every asset file
        #[arg(short, long)]
        name: String,

        /// Owner username; created when unknown
        #[arg(short, long)]
        owner: String,
    },
    /// Print a stored sequence as JSON
    Show {
        /// Sequence id
        #[arg(short, long)]
        sequence: String,
    },
    /// Move one segment of a stored sequence
    Move {
        /// Sequence id
        #[arg(short, long)]
        sequence: String,

        /// Current position of the segment
        #[arg(long)]
        from: usize,

        /// New position, clamped to the last one
        #[arg(long)]
        to: usize,
    },
    /// Remove one segment of a stored sequence
    Remove {
        /// Sequence id
        #[arg(short, long)]
        sequence: String,

        /// Position of the segment
        #[arg(short, long)]
        position: usize,
    },
}

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(display("settings failed: {source}"))]
    Settings { source: SettingsError },
    #[snafu(display("producer setup failed on `{stage}`: {source}"))]
    Producer {
        stage: &'static str,
        source: ProducerError,
    },
    #[snafu(display("storage failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("sequence failed on `{stage}`: {source}"))]
    Sequence {
        stage: &'static str,
        source: SequenceError,
    },
    #[snafu(display("no segment at position {position}; the sequence has {len}"))]
    NoSegment { position: usize, len: usize },
    #[snafu(display("failed to render output on `{stage}`: {source}"))]
    Render {
        stage: &'static str,
        source: serde_json::Error,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "storyreel failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), AppError> {
    let settings = Settings::load(&args.config).context(SettingsSnafu)?;

    match args.command {
        Command::Init => settings.persist(&args.config).context(SettingsSnafu),
        Command::Generate {
            subject,
            name,
            owner,
        } => generate(&settings, subject.as_deref(), &name, &owner).await,
        Command::Show { sequence } => show(&settings, &sequence).await,
        Command::Move { sequence, from, to } => {
            edit(&settings, &sequence, |reel| {
                ensure!(
                    reel.move_segment(from, to),
                    NoSegmentSnafu {
                        position: from,
                        len: reel.len(),
                    }
                );
                Ok(())
            })
            .await
        }
        Command::Remove { sequence, position } => {
            edit(&settings, &sequence, |reel| {
                reel.remove(position).map(|_| ()).context(SequenceSnafu {
                    stage: "remove-segment",
                })
            })
            .await
        }
    }
}

async fn generate(
    settings: &Settings,
    subject: Option<&str>,
    name: &str,
    owner: &str,
) -> Result<(), AppError> {
    let gateway = build_gateway(settings)?;
    let prompts = settings.load_prompt_book().context(SettingsSnafu)?;
    let context = GenerationContext::new(Arc::new(gateway))
        .with_prompts(prompts)
        .with_voice_id(settings.elevenlabs.voice_id.clone());

    let storage = open_storage(settings).await?;
    let owner_id = resolve_owner(&storage, owner).await?;

    let mut sequence = Sequence::new(name);
    let count = match subject {
        Some(subject) => sequence.generate_from_subject(&context, Some(subject)).await,
        None => {
            let covered = storage.subjects(owner_id).await.context(StorageSnafu {
                stage: "list-subjects",
            })?;
            sequence.generate_avoiding(&context, &covered).await
        }
    }
    .context(SequenceSnafu {
        stage: "generate-sequence",
    })?;
    let sequence_id = save_sequence(&storage, owner_id, &sequence)
        .await
        .context(SequenceSnafu {
            stage: "save-sequence",
        })?;
    record_subject(&storage, &context, owner_id, subject, &sequence).await;

    tracing::info!(sequence_id = %sequence_id, segments = count, "sequence ready");
    println!("{sequence_id}");
    print!("{}", sequence.compiled_script());
    Ok(())
}

async fn show(settings: &Settings, raw_id: &str) -> Result<(), AppError> {
    let sequence_id = raw_id.parse::<SequenceId>().context(StorageSnafu {
        stage: "parse-sequence-id",
    })?;
    let storage = open_storage(settings).await?;

    let sequence = load_sequence(&storage, sequence_id)
        .await
        .context(SequenceSnafu {
            stage: "load-sequence",
        })?;
    let json = sequence.to_json().context(SequenceSnafu {
        stage: "export-sequence",
    })?;
    let rendered = serde_json::to_string_pretty(&json).context(RenderSnafu {
        stage: "render-sequence",
    })?;

    println!("{rendered}");
    Ok(())
}

/// Loads a stored sequence, applies `change` and writes the result back.
async fn edit(
    settings: &Settings,
    raw_id: &str,
    change: impl FnOnce(&mut Sequence) -> Result<(), AppError>,
) -> Result<(), AppError> {
    let sequence_id = raw_id.parse::<SequenceId>().context(StorageSnafu {
        stage: "parse-sequence-id",
    })?;
    let storage = open_storage(settings).await?;

    let mut sequence = load_sequence(&storage, sequence_id)
        .await
        .context(SequenceSnafu {
            stage: "load-sequence",
        })?;
    change(&mut sequence)?;
    update_sequence(&storage, sequence_id, &sequence)
        .await
        .context(SequenceSnafu {
            stage: "update-sequence",
        })?;

    print!("{}", sequence.compiled_script());
    Ok(())
}

// Subject history is best effort; a failed summary only skips the record.
async fn record_subject(
    storage: &SqliteStorage,
    context: &GenerationContext,
    owner_id: UserId,
    subject: Option<&str>,
    sequence: &Sequence,
) {
    let subject = match subject {
        Some(subject) => subject.to_string(),
        None => match sequence.summarize_subject(context).await {
            Ok(subject) => subject,
            Err(error) => {
                tracing::warn!(error = %error, "could not summarize the script subject");
                return;
            }
        },
    };

    if let Err(error) = storage.add_subject(owner_id, &subject).await {
        tracing::warn!(error = %error, subject = %subject, "could not record the subject");
    }
}

/// Registers a producer for every capability whose credentials are configured.
fn build_gateway(settings: &Settings) -> Result<Gateway, AppError> {
    let mut gateway = Gateway::new(settings.gate_limits());

    if settings.openai.api_key.is_empty() {
        tracing::warn!("no OpenAI api key configured; script and image production disabled");
    } else {
        let config = OpenAiConfig::new(&settings.openai.api_key)
            .with_endpoint(&settings.openai.endpoint)
            .with_script_model(&settings.openai.script_model)
            .with_image_model(&settings.openai.image_model)
            .with_image_size(&settings.openai.image_size);

        let script = RigScriptProducer::new(config.clone()).context(ProducerSnafu {
            stage: "build-script-producer",
        })?;
        let image = OpenAiImageProducer::new(config, AssetDirectory::new(&settings.image_dir, "png"))
            .context(ProducerSnafu {
                stage: "build-image-producer",
            })?;
        gateway = gateway
            .with_producer(Arc::new(script))
            .with_producer(Arc::new(image));
    }

    if settings.elevenlabs.api_key.is_empty() {
        tracing::warn!("no ElevenLabs api key configured; speech production disabled");
    } else {
        let config = ElevenLabsConfig::new(&settings.elevenlabs.api_key)
            .with_endpoint(&settings.elevenlabs.endpoint);
        let speech =
            ElevenLabsSpeechProducer::new(config, AssetDirectory::new(&settings.audio_dir, "mp3"))
                .context(ProducerSnafu {
                    stage: "build-speech-producer",
                })?;
        gateway = gateway.with_producer(Arc::new(speech));
    }

    Ok(gateway)
}

async fn open_storage(settings: &Settings) -> Result<SqliteStorage, AppError> {
    SqliteStorage::open(&settings.database)
        .await
        .context(StorageSnafu {
            stage: "open-storage",
        })
}

async fn resolve_owner(storage: &SqliteStorage, username: &str) -> Result<UserId, AppError> {
    let existing = storage
        .user_id_for_username(username)
        .await
        .context(StorageSnafu {
            stage: "lookup-owner",
        })?;
    if let Some(user_id) = existing {
        return Ok(user_id);
    }

    let created = storage
        .add_user(NewUser {
            username: username.to_string(),
        })
        .await
        .context(StorageSnafu {
            stage: "create-owner",
        })?;
    tracing::info!(user_id = %created.id, username = %created.username, "owner created");
    Ok(created.id)
}
