use anyhow::{Context, Result, anyhow};
use blobfs::cadapter::client::ObjectBackend;
use blobfs::cadapter::localfs::LocalFsBackend;
use blobfs::cadapter::memory::MemoryBackend;
use blobfs::cadapter::s3::S3Backend;
use blobfs::config::{BackendConfig, load_config};
use blobfs::vfs::BlobFs;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blobfs")]
#[command(version, about = "File operations over object storage", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "BLOBFS_CONFIG", default_value = "blobfs.yaml")]
    config: String,

    /// Override the metadata store URL from the config file
    #[arg(long, env = "BLOBFS_METADATA_URL")]
    metadata_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "List one directory level")]
    Ls {
        #[arg(value_name = "URI")]
        uri: String,
    },
    #[command(about = "Print an object to stdout")]
    Cat {
        #[arg(value_name = "URI")]
        uri: String,
    },
    #[command(about = "Upload a file (or stdin) to an object")]
    Put {
        #[arg(value_name = "URI")]
        uri: String,
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },
    #[command(about = "Append a file (or stdin) to an object")]
    Append {
        #[arg(value_name = "URI")]
        uri: String,
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },
    #[command(about = "Show size, mode and times")]
    Stat {
        #[arg(value_name = "URI")]
        uri: String,
    },
    Mkdir {
        #[arg(value_name = "URI")]
        uri: String,
    },
    Rm {
        #[arg(value_name = "URI")]
        uri: String,
    },
    Rmdir {
        #[arg(value_name = "URI")]
        uri: String,
    },
    Mv {
        #[arg(value_name = "FROM")]
        from: String,
        #[arg(value_name = "TO")]
        to: String,
    },
    #[command(about = "Print the public URL of an object")]
    Url {
        #[arg(value_name = "URI")]
        uri: String,
    },
    #[command(about = "Rebuild the metadata store from a bucket listing")]
    Refresh,
}

async fn read_input(file: Option<PathBuf>) -> Result<Vec<u8>> {
    match file {
        Some(path) => tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("Failed to read stdin")?;
            Ok(buf)
        }
    }
}

async fn run<B: ObjectBackend>(fs: BlobFs<B>, command: Commands) -> Result<()> {
    match command {
        Commands::Ls { uri } => {
            let mut dir = fs
                .opendir(&uri)
                .await?
                .ok_or_else(|| anyhow!("{uri}: no such directory"))?;
            while let Some(name) = dir.next().await? {
                println!("{name}");
            }
            dir.close();
        }
        Commands::Cat { uri } => {
            let data = fs.read(&uri).await?;
            let mut out = tokio::io::stdout();
            out.write_all(&data).await?;
            out.flush().await?;
        }
        Commands::Put { uri, file } => {
            let data = read_input(file).await?;
            fs.write(&uri, &data).await?;
        }
        Commands::Append { uri, file } => {
            let data = read_input(file).await?;
            fs.append(&uri, &data).await?;
        }
        Commands::Stat { uri } => {
            let stat = fs
                .stat(&uri)
                .await
                .ok_or_else(|| anyhow!("{uri}: not found"))?;
            println!("mode:  {:o}", stat.mode);
            println!("size:  {}", stat.size);
            if let Some(mtime) = stat.mtime {
                println!("mtime: {}", mtime.to_rfc3339());
            }
        }
        Commands::Mkdir { uri } => fs.mkdir(&uri).await?,
        Commands::Rm { uri } => fs.unlink(&uri).await?,
        Commands::Rmdir { uri } => fs.rmdir(&uri).await?,
        Commands::Mv { from, to } => fs.rename(&from, &to).await?,
        Commands::Url { uri } => println!("{}", fs.external_url(&uri)?),
        Commands::Refresh => {
            let records = fs.refresh_metadata().await?;
            println!("{records} metadata records written");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let mut cfg = load_config(&cli.config)?;
    if let Some(url) = cli.metadata_url {
        cfg.metadata_url = url;
    }

    match &cfg.backend {
        BackendConfig::S3 { .. } => {
            let s3 = cfg
                .backend
                .s3_config()
                .ok_or_else(|| anyhow!("invalid s3 backend config"))?;
            let bucket = s3.bucket.clone();
            let backend = S3Backend::new(s3).await?;
            if !backend.bucket_exists().await? {
                return Err(anyhow!("bucket {bucket} does not exist"));
            }
            run(BlobFs::from_config(backend, &cfg).await?, cli.command).await
        }
        BackendConfig::Local { root } => {
            let backend = LocalFsBackend::new(root);
            run(BlobFs::from_config(backend, &cfg).await?, cli.command).await
        }
        BackendConfig::Memory { bucket } => {
            let backend = MemoryBackend::new(bucket.clone());
            run(BlobFs::from_config(backend, &cfg).await?, cli.command).await
        }
    }
}
