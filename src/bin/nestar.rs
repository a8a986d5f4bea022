//! Nestar command line
//!
//! Works on host paths that may run through archives, e.g.
//! `nestar ls backup.sar/photos.sar/2024`.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use nestar_rs::{Access, FsBuilder, FsConfig, FsError, StaticKeys};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "nestar")]
#[command(about = "Browse and edit nested archives as directories")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Secret for encrypted containers (or NESTAR_SECRET)
    #[arg(long, env = "NESTAR_SECRET", hide_env_values = true)]
    secret: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List a directory or archive
    Ls { path: PathBuf },
    /// Print a file to stdout
    Cat { path: PathBuf },
    /// Store stdin (or --from) as a file
    Put {
        path: PathBuf,
        #[arg(long)]
        from: Option<PathBuf>,
    },
    /// Create a directory or an empty archive
    Mkdir {
        path: PathBuf,
        #[arg(short, long)]
        parents: bool,
    },
    /// Delete a file, empty directory or empty archive
    Rm { path: PathBuf },
    /// Set the modification time to now
    Touch { path: PathBuf },
    /// Copy a file, keeping its times
    Cp { from: PathBuf, to: PathBuf },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => FsConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => FsConfig::default(),
    };
    let mut builder = FsBuilder::new().config(config).with_tracing();
    if let Some(secret) = &args.secret {
        builder = builder.keys(Arc::new(StaticKeys::with_default(secret.as_bytes())));
    }
    let fs = builder.build()?;

    let outcome = run(&fs, args.command);
    // Always write back what was changed, even after a failed command
    let synced = fs.shutdown();
    outcome?;
    if let Err(chain) = synced {
        bail!("{}", chain);
    }
    Ok(())
}

fn run(fs: &nestar_rs::FsManager, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ls { path } => {
            for name in fs.list(&path)? {
                let child = path.join(&name);
                match fs.stat(&child) {
                    Ok(e) if e.is_directory() => println!("{}/", name),
                    Ok(e) => println!("{}\t{}", name, e.size().unwrap_or(0)),
                    Err(_) => println!("{}", name),
                }
            }
        }
        Command::Cat { path } => {
            let data = fs.read(&path)?;
            std::io::stdout().write_all(&data)?;
        }
        Command::Put { path, from } => {
            let mut data = Vec::new();
            match from {
                Some(src) => {
                    data = std::fs::read(&src).with_context(|| format!("reading {}", src.display()))?
                }
                None => {
                    std::io::stdin().read_to_end(&mut data)?;
                }
            }
            fs.write(&path, &data)?;
            info!("Stored {} bytes in {}", data.len(), path.display());
        }
        Command::Mkdir { path, parents } => fs.mkdir(&path, parents)?,
        Command::Rm { path } => fs.delete(&path)?,
        Command::Touch { path } => {
            let now = nestar_rs::core::entry::now_millis();
            match fs.set_time(&path, Access::WRITE, now) {
                Ok(_) => {}
                Err(FsError::NotFound(_)) => fs.write(&path, &[])?,
                Err(e) => return Err(e.into()),
            }
        }
        Command::Cp { from, to } => {
            let n = fs.copy(&from, &to)?;
            info!("Copied {} -> {} ({} bytes decoded)", from.display(), to.display(), n);
        }
    }
    Ok(())
}
