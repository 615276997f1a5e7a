// Copyright (C) 2024 rk8s authors
// SPDX-License-Identifier: MIT OR Apache-2.0
// Example binary listing a directory of a union of host directories.

use std::ffi::OsStr;
use std::path::{Component, PathBuf};

use clap::Parser;
use libunion_fs::{BranchConfig, Cursor, UnionConfig, UnionFs};

#[derive(Parser, Debug)]
#[command(author, version, about = "List a directory of an aufs style union")]
struct Args {
    /// Branch as `path` or `path=perm`, top first (repeatable)
    #[arg(long)]
    branch: Vec<String>,
    /// aufs mount options, e.g. `br:/upper=rw:/lower=ro+wh,rdblk=1024`
    #[arg(long, conflicts_with_all = ["branch", "config"])]
    options: Option<String>,
    /// JSON configuration file
    #[arg(long, conflicts_with = "branch")]
    config: Option<PathBuf>,
    /// Directory inside the union to list
    #[arg(long, default_value = "/")]
    path: PathBuf,
    /// Print one line per directory block instead of per entry
    #[arg(long, default_value_t = false)]
    blocks: bool,
}

fn load_config(args: &Args) -> libunion_fs::Result<UnionConfig> {
    if let Some(opts) = &args.options {
        return UnionConfig::parse_options(opts);
    }
    if let Some(path) = &args.config {
        return UnionConfig::from_file(path);
    }
    let config = UnionConfig {
        branches: args
            .branch
            .iter()
            .map(|br| {
                let (path, perm) = match br.rsplit_once('=') {
                    Some((path, perm)) => (path, Some(perm.to_string())),
                    None => (br.as_str(), None),
                };
                BranchConfig {
                    path: path.into(),
                    perm,
                    xino: None,
                }
            })
            .collect(),
        ..Default::default()
    };
    config.validate()?;
    Ok(config)
}

async fn run(args: Args) -> libunion_fs::Result<()> {
    let fs = UnionFs::mount(load_config(&args)?).await?;
    let mut dir = fs.root();
    for c in args.path.components() {
        if let Component::Normal(name) = c {
            dir = fs.lookup(&dir, OsStr::new(name)).await?;
        }
    }

    let file = fs.open(&dir, libc::O_RDONLY as u32).await?;
    let mut cursor = Cursor::START;
    let mut nblk = 0;
    loop {
        let blk = fs.read_next_block(&file, cursor).await?;
        if args.blocks {
            println!("block {nblk}: {} entries", blk.entries.len());
        } else {
            for e in &blk.entries {
                println!(
                    "{:>10} b{} {:?} {}",
                    e.ino,
                    e.bindex,
                    e.kind,
                    e.name.to_string_lossy()
                );
            }
        }
        nblk += 1;
        match blk.next {
            Some(next) => cursor = next,
            None => break,
        }
    }
    fs.release(&file).await
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("unionfs_ls: {e}");
        std::process::exit(1);
    }
}
