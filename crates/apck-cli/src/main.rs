#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use apck_core::{check_container_at_path, inspect_container};
use apck_error::CheckError;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "apfsck", about = "APFS filesystem consistency checker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Walk and verify every B-tree of the first volume.
    Check {
        /// Path to the filesystem image or block device.
        image: PathBuf,
        /// Output the report in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// Print the container superblock without walking trees.
    Inspect {
        /// Path to the filesystem image or block device.
        image: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

fn run_check(image: &PathBuf, json: bool) -> Result<ExitCode> {
    match check_container_at_path(image) {
        Ok((report, _volume)) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("container: block_size={} blocks={} xid={}",
                    report.block_size, report.block_count, report.xid);
                println!(
                    "container omap: {} nodes, {} keys",
                    report.container_omap.node_count, report.container_omap.key_count
                );
                println!(
                    "volume omap:    {} nodes, {} keys",
                    report.volume_omap.node_count, report.volume_omap.key_count
                );
                println!(
                    "catalog:        {} nodes, {} keys",
                    report.catalog.node_count, report.catalog.key_count
                );
                println!(
                    "extentref:     {} nodes, {} keys",
                    report.extentref.node_count, report.extentref.key_count
                );
                println!("volume appears to be clean");
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(err @ CheckError::Corruption { .. }) => {
            eprintln!("{err}");
            Ok(ExitCode::FAILURE)
        }
        Err(CheckError::UnknownFeature(feature)) => {
            eprintln!("this volume uses features the checker does not support: {feature}");
            Ok(ExitCode::FAILURE)
        }
        Err(err) => Err(err).context("failed to read image"),
    }
}

fn run_inspect(image: &PathBuf, json: bool) -> Result<ExitCode> {
    let dev = apck_block::FileByteDevice::open(image).context("failed to open image")?;
    let nxsb = inspect_container(&dev).context("failed to parse container superblock")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&nxsb)?);
    } else {
        println!("block size:  {}", nxsb.block_size);
        println!("block count: {}", nxsb.block_count);
        println!("xid:         {}", nxsb.header.xid);
        println!("omap oid:    {}", nxsb.omap_oid);
        println!("volume oid:  {}", nxsb.first_fs_oid);
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Check { image, json } => run_check(image, *json),
        Command::Inspect { image, json } => run_inspect(image, *json),
    }
}
