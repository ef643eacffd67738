//! kvfs command-line shell.
//!
//! Drives a kvfs filesystem stored in a SQLite file, one engine call per
//! subcommand.
//!
//! ## Usage
//!
//! ```bash
//! kvfs --db fs.db mkdir /docs
//! echo hello | kvfs --db fs.db put /docs/hello.txt
//! kvfs --db fs.db cat /docs/hello.txt
//! kvfs --db fs.db ls /docs
//! kvfs --db fs.db xattr set /docs/hello.txt user.tag draft --create
//! RUST_LOG=kvfs_core=debug kvfs --db fs.db mv /docs/hello.txt /hello.txt
//! ```

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kvfs_core::{Engine, EngineConfig, FsOps, NodeKind, OpenFlags, XattrMode};
use kvfs_kv::SqliteKv;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Filesystem shell over a transactional KV store.
#[derive(Parser, Debug)]
#[command(name = "kvfs")]
#[command(about = "Inspect and edit a kvfs filesystem stored in SQLite")]
struct Args {
    /// SQLite database holding the filesystem
    #[arg(long, default_value = "kvfs.db")]
    db: PathBuf,

    /// Engine configuration (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a directory
    Mkdir {
        path: String,
        /// Permission bits, octal
        #[arg(long, default_value = "755", value_parser = parse_mode)]
        mode: u32,
    },
    /// Write stdin (or a local file) to a path, replacing its contents
    Put {
        path: String,
        /// Local file to read instead of stdin
        #[arg(long)]
        from: Option<PathBuf>,
        /// Append instead of replacing
        #[arg(long)]
        append: bool,
    },
    /// Print a file's contents
    Cat { path: String },
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Show node attributes
    Stat { path: String },
    /// Remove a file or symlink
    Rm { path: String },
    /// Remove an empty directory
    Rmdir { path: String },
    /// Rename or move an entry
    Mv { from: String, to: String },
    /// Create a hard link
    Ln { target: String, link: String },
    /// Create a symbolic link
    Symlink { target: String, link: String },
    /// Print a symbolic link's target
    Readlink { path: String },
    /// Set a file's size
    Truncate { path: String, size: u64 },
    /// Extended attributes
    Xattr {
        #[command(subcommand)]
        command: XattrCommand,
    },
    /// Show filesystem statistics
    Statfs,
}

#[derive(Subcommand, Debug)]
enum XattrCommand {
    /// Print an attribute value
    Get { path: String, name: String },
    /// Set an attribute value
    Set {
        path: String,
        name: String,
        value: String,
        /// Fail if the attribute exists
        #[arg(long, conflicts_with = "replace")]
        create: bool,
        /// Fail if the attribute is missing
        #[arg(long)]
        replace: bool,
    },
    /// Remove an attribute
    Rm { path: String, name: String },
    /// List attribute names
    Ls { path: String },
}

fn parse_mode(s: &str) -> Result<u32, String> {
    let digits = s.strip_prefix("0o").unwrap_or(s);
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|m| *m <= 0o7777)
        .ok_or_else(|| format!("invalid octal mode: {s}"))
}

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::debug!(error = ?e, "command failed");
            eprintln!("kvfs: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let store = SqliteKv::open(&args.db)
        .with_context(|| format!("opening {}", args.db.display()))?
        .with_policy(config.retry_policy());
    let fs = Engine::new(store, config)?;

    match args.command {
        Command::Mkdir { path, mode } => {
            fs.mkdir(&path, mode)?;
        }
        Command::Put { path, from, append } => {
            let data = match &from {
                Some(file) => std::fs::read(file)
                    .with_context(|| format!("reading {}", file.display()))?,
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            if append {
                let flags = OpenFlags {
                    append: true,
                    ..OpenFlags::create()
                };
                let fh = fs.open(&path, flags)?;
                let written = fs.write(fh, 0, &data);
                fs.release(fh)?;
                written?;
            } else {
                fs.write_all(&path, &data)?;
            }
        }
        Command::Cat { path } => {
            let data = fs.read_all(&path)?;
            std::io::stdout().write_all(&data)?;
        }
        Command::Ls { path } => cmd_ls(&fs, &path)?,
        Command::Stat { path } => cmd_stat(&fs, &path)?,
        Command::Rm { path } => fs.unlink(&path)?,
        Command::Rmdir { path } => fs.rmdir(&path)?,
        Command::Mv { from, to } => fs.rename(&from, &to)?,
        Command::Ln { target, link } => {
            fs.link(&target, &link)?;
        }
        Command::Symlink { target, link } => {
            fs.symlink(&link, target.as_bytes())?;
        }
        Command::Readlink { path } => {
            println!("{}", String::from_utf8_lossy(&fs.readlink(&path)?));
        }
        Command::Truncate { path, size } => fs.truncate(&path, size)?,
        Command::Xattr { command } => cmd_xattr(&fs, command)?,
        Command::Statfs => {
            let st = fs.statfs()?;
            println!("block size:   {}", st.bsize);
            println!("blocks:       {} ({} free, {} available)", st.blocks, st.bfree, st.bavail);
            println!("inodes:       {} ({} free)", st.files, st.ffree);
            println!("name max:     {}", st.namelen);
        }
    }
    Ok(())
}

/// List a directory, one entry per line
fn cmd_ls(fs: &impl FsOps, path: &str) -> Result<()> {
    let entries = fs.readdir(path)?;
    if entries.is_empty() {
        return Ok(());
    }
    println!("{:<5} {:>6} {:>12}  {}", "TYPE", "MODE", "SIZE", "NAME");
    for entry in entries {
        let child = format!("{}/{}", path.trim_end_matches('/'), entry.name);
        let attr = fs.getattr(&child)?;
        let name = match entry.kind {
            NodeKind::Directory => format!("{}/", entry.name),
            NodeKind::Symlink => {
                let target = fs.readlink(&child)?;
                format!("{} -> {}", entry.name, String::from_utf8_lossy(&target))
            }
            NodeKind::RegularFile => entry.name,
        };
        println!(
            "{:<5} {:>6o} {:>12}  {}",
            kind_label(attr.kind),
            attr.mode,
            attr.size,
            name
        );
    }
    Ok(())
}

/// Print every attribute of one node
fn cmd_stat(fs: &Engine<SqliteKv>, path: &str) -> Result<()> {
    let attr = fs.getattr(path)?;
    println!("  Path: {path}");
    println!("    Id: {}", attr.id);
    println!("  Kind: {}", attr.kind);
    println!("  Mode: {:o}", attr.mode);
    println!(" Owner: {}:{}", attr.uid, attr.gid);
    println!(" Links: {}", attr.nlink);
    println!("  Size: {}", attr.size);
    if attr.is_file() {
        println!("Stored: {} (highest chunk end)", fs.chunk_extent(path)?);
    }
    println!("Access: {}", format_age(attr.atime));
    println!("Modify: {}", format_age(attr.mtime));
    println!("Change: {}", format_age(attr.ctime));
    println!(" Birth: {}", format_age(attr.crtime));
    Ok(())
}

fn cmd_xattr(fs: &impl FsOps, command: XattrCommand) -> Result<()> {
    match command {
        XattrCommand::Get { path, name } => {
            let value = fs.getxattr(&path, &name)?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        XattrCommand::Set {
            path,
            name,
            value,
            create,
            replace,
        } => {
            let mode = match (create, replace) {
                (true, _) => XattrMode::CreateOnly,
                (_, true) => XattrMode::ReplaceOnly,
                _ => XattrMode::Upsert,
            };
            fs.setxattr(&path, &name, value.as_bytes(), mode)?;
        }
        XattrCommand::Rm { path, name } => fs.removexattr(&path, &name)?,
        XattrCommand::Ls { path } => {
            for name in fs.listxattr(&path)? {
                println!("{name}");
            }
        }
    }
    Ok(())
}

fn kind_label(kind: NodeKind) -> &'static str {
    match kind {
        NodeKind::RegularFile => "file",
        NodeKind::Directory => "dir",
        NodeKind::Symlink => "link",
    }
}

/// Format a timestamp as seconds since the epoch plus a relative age
fn format_age(time: SystemTime) -> String {
    let epoch = time
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let age = match SystemTime::now().duration_since(time) {
        Ok(elapsed) => {
            let secs = elapsed.as_secs();
            if secs < 60 {
                format!("{}s ago", secs)
            } else if secs < 3600 {
                format!("{}m ago", secs / 60)
            } else if secs < 86400 {
                format!("{}h ago", secs / 3600)
            } else {
                format!("{}d ago", secs / 86400)
            }
        }
        Err(_) => "in the future".to_string(),
    };
    format!("{epoch} ({age})")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::time::Duration;

    #[test]
    fn test_cli_definition_is_valid() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("755"), Ok(0o755));
        assert_eq!(parse_mode("0o644"), Ok(0o644));
        assert!(parse_mode("9").is_err());
        assert!(parse_mode("17777").is_err());
    }

    #[test]
    fn test_parse_subcommands() {
        let args = Args::try_parse_from(["kvfs", "--db", "x.db", "mv", "/a", "/b"]).unwrap();
        assert_eq!(args.db, PathBuf::from("x.db"));
        assert!(matches!(args.command, Command::Mv { ref from, ref to } if from == "/a" && to == "/b"));

        let args = Args::try_parse_from(["kvfs", "xattr", "set", "/f", "k", "v", "--create"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Xattr {
                command: XattrCommand::Set { create: true, replace: false, .. }
            }
        ));
        assert!(
            Args::try_parse_from(["kvfs", "xattr", "set", "/f", "k", "v", "--create", "--replace"])
                .is_err()
        );
    }

    #[test]
    fn test_format_age() {
        let old = SystemTime::now() - Duration::from_secs(7200);
        assert!(format_age(old).ends_with("(2h ago)"));
        let future = SystemTime::now() + Duration::from_secs(600);
        assert!(format_age(future).ends_with("(in the future)"));
    }
}
