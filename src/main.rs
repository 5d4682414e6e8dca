use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use jpk_transfer::{
    config::AppConfig,
    context::AppContext,
    core::{DocumentUpload, FormCode, JpkType, StatusPoller, TransferPipeline, TransferState},
    db, logging,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser)]
#[command(name = "jpkt")]
#[command(about = "Encrypted JPK declaration transfer to the e-document gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file used instead of /etc/jpkt/config.toml and ./jpkt.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,
}

#[derive(Args, Serialize)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    database_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verbose: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    json_logs: Option<bool>,

    #[serde(skip_serializing_if = "SettingsOverrides::is_empty")]
    #[command(flatten)]
    settings: SettingsOverrides,
}

#[derive(Args, Serialize)]
struct SettingsOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    endpoint_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    public_key_path: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    max_chunk_size: Option<u64>,
}

impl SettingsOverrides {
    fn is_empty(&self) -> bool {
        self.endpoint_url.is_none() && self.public_key_path.is_none() && self.max_chunk_size.is_none()
    }
}

#[derive(Args)]
struct FormArgs {
    #[arg(long, default_value = "JPK_VAT")]
    form_code: String,

    #[arg(long, default_value = "JPK_V7M (1)")]
    system_code: String,

    #[arg(long, default_value = "1-2E")]
    schema_version: String,
}

impl From<FormArgs> for FormCode {
    fn from(args: FormArgs) -> Self {
        Self {
            form_code: args.form_code,
            system_code: args.system_code,
            schema_version: args.schema_version,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database schema
    InitDb,
    /// Print the effective configuration
    Config,
    /// Create a draft transfer, optionally with its first document
    Create {
        #[arg(long)]
        name: String,
        #[arg(long = "type", value_enum, default_value_t = JpkType::Jpk)]
        jpk_type: JpkType,
        #[arg(long)]
        file: Option<PathBuf>,
        #[command(flatten)]
        form: FormArgs,
    },
    /// Attach a declaration file to a draft transfer
    AddDocument {
        id: String,
        file: PathBuf,
        #[command(flatten)]
        form: FormArgs,
    },
    /// Encrypt the documents and generate the metadata to sign
    Prepare {
        id: String,
        /// Write the unsigned metadata to this path
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Attach the signed metadata
    Sign {
        id: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Upload the parts and finalize
    Send { id: String },
    /// Check the processing status of a sent transfer
    Status { id: String },
    /// Decline a transfer that was not sent yet
    Abandon { id: String },
    Archive { id: String },
    Unarchive { id: String },
    Delete { id: String },
    List {
        #[arg(long, value_parser = parse_state)]
        state: Option<TransferState>,
        /// Include archived transfers
        #[arg(long)]
        all: bool,
    },
    Show { id: String },
    /// Poll sent transfers until interrupted
    Daemon,
}

fn parse_state(s: &str) -> std::result::Result<TransferState, String> {
    s.parse::<TransferState>().map_err(|e| {
        let known: Vec<_> = TransferState::ALL.iter().map(|s| s.as_str()).collect();
        format!("{e}, expected one of: {}", known.join(", "))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))?;
    logging::init((&config).into());

    if let Commands::Config = cli.command {
        print!("{}", toml::to_string_pretty(&config).context("Failed to serialize config")?);
        return Ok(());
    }

    let db_conn = db::init(&config.database_path)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_path.display()))?;
    let poll_interval = Duration::from_secs(config.poll_interval_secs);
    let ctx = AppContext::from_config(config, db_conn)?;
    let pipeline = TransferPipeline::new(ctx.clone());

    match cli.command {
        Commands::InitDb | Commands::Config => {
            println!("Database ready");
        }
        Commands::Create {
            name,
            jpk_type,
            file,
            form,
        } => {
            let transfer = match file {
                Some(path) => {
                    let upload = read_upload(&path, form.into()).await?;
                    pipeline.create_with_document(&name, jpk_type, upload).await?.0
                }
                None => pipeline.create_transfer(&name, jpk_type).await?,
            };
            println!("{}", transfer.id);
        }
        Commands::AddDocument { id, file, form } => {
            let upload = read_upload(&file, form.into()).await?;
            let document = pipeline.add_document(&id, upload).await?;
            println!("Attached {}", document.name);
        }
        Commands::Prepare { id, export } => {
            pipeline
                .create_transfer_request(&id)
                .await
                .context("Failed to prepare transfer")?;
            if let Some(path) = export {
                let metadata = pipeline
                    .unsigned_metadata(&id)
                    .await?
                    .ok_or_else(|| anyhow!("Transfer {id} has no unsigned metadata"))?;
                tokio::fs::write(&path, &metadata.content)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                println!("Unsigned metadata written to {}", path.display());
            }
            print_state(&pipeline, &id).await?;
        }
        Commands::Sign { id, file } => {
            let content = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            pipeline
                .attach_signed_metadata(&id, &file_name(&file)?, content)
                .await?;
            println!("Signed metadata attached");
        }
        Commands::Send { id } => {
            pipeline
                .send_initial_request(&id)
                .await
                .context("Failed to send transfer")?;
            print_state(&pipeline, &id).await?;
        }
        Commands::Status { id } => {
            let outcome = StatusPoller::new(ctx.clone()).poll(&id).await?;
            info!(?outcome, "Status checked");
            print_state(&pipeline, &id).await?;
        }
        Commands::Abandon { id } => {
            pipeline.abandon(&id).await?;
            print_state(&pipeline, &id).await?;
        }
        Commands::Archive { id } => {
            pipeline.archive(&id).await?;
            println!("Archived {id}");
        }
        Commands::Unarchive { id } => {
            pipeline.unarchive(&id).await?;
            println!("Restored {id}");
        }
        Commands::Delete { id } => {
            pipeline.delete(&id).await?;
            println!("Deleted {id}");
        }
        Commands::List { state, all } => {
            for transfer in db::transfers::list(&ctx.db, state, all).await? {
                println!(
                    "{}  {:<10} {:<6} {}{}",
                    transfer.id,
                    transfer.state.as_str(),
                    transfer.jpk_type.as_str(),
                    transfer.name,
                    if transfer.active { "" } else { "  (archived)" }
                );
            }
        }
        Commands::Show { id } => show(&ctx, &pipeline, &id).await?,
        Commands::Daemon => run_daemon(ctx, poll_interval).await?,
    }

    Ok(())
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("{} is not a file path", path.display()))
}

async fn read_upload(path: &Path, form: FormCode) -> Result<DocumentUpload> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(DocumentUpload {
        file_name: file_name(path)?,
        data,
        form,
    })
}

async fn print_state(pipeline: &TransferPipeline, id: &str) -> Result<()> {
    let transfer = pipeline.load(id).await?;
    println!("{}: {}", transfer.id, transfer.state.label());
    if let Some(error) = &transfer.error_description {
        println!("  error: {error}");
    }
    Ok(())
}

async fn show(ctx: &AppContext, pipeline: &TransferPipeline, id: &str) -> Result<()> {
    let transfer = pipeline.load(id).await?;

    println!("Transfer   {}", transfer.id);
    println!("Name       {}", transfer.name);
    println!("Type       {}", transfer.jpk_type.as_str());
    println!("State      {}", transfer.state.label());
    println!("Active     {}", transfer.active);
    println!("Created    {}", transfer.created_at);
    if let Some(reference) = &transfer.reference_number {
        println!("Reference  {reference}");
    }
    if let Some(description) = &transfer.last_description {
        println!("Status     {description}");
    }
    if let Some(error) = &transfer.error_description {
        println!("Error      {error}");
    }

    let documents = pipeline.documents(id).await?;
    let parts = db::documents::parts_for_transfer(&ctx.db, transfer.id.clone()).await?;
    for document in &documents {
        println!(
            "\n  {} [{} / {} / {}]",
            document.name,
            document.form.form_code,
            document.form.system_code,
            document.form.schema_version
        );
        for part in parts.iter().filter(|p| p.document_id == document.id) {
            println!(
                "    #{:03} {} {}",
                part.part_number,
                part.name,
                if part.uploaded { "uploaded" } else { "pending" }
            );
        }
    }

    let messages = db::transfers::messages(&ctx.db, transfer.id.clone()).await?;
    if !messages.is_empty() {
        println!();
        for message in messages {
            println!("  {}  {}", message.created_at, message.body);
        }
    }

    Ok(())
}

async fn run_daemon(ctx: AppContext, interval: Duration) -> Result<()> {
    let shutdown = CancellationToken::new();
    let poller = StatusPoller::new(ctx);

    let handle = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { poller.run(interval, shutdown).await })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    shutdown.cancel();
    handle.await.context("Poller task failed")?;
    Ok(())
}
