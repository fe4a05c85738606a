//! courtcam_probe - inspect recorded sessions
//!
//! Prints dimensions, frame count, rate and duration of one or more
//! recordings, or of every `.avi` file in a directory.

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::{Path, PathBuf};

use courtcam::record::avi::{probe, AviInfo};
use courtcam::record::RECORDING_EXTENSION;

#[derive(Parser, Debug)]
#[command(name = "courtcam_probe", about = "Inspect courtcam recordings")]
struct Args {
    /// Recording files or directories of recordings
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Print one JSON object per file
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut files = Vec::new();
    for path in &args.paths {
        collect(path, &mut files)?;
    }
    if files.is_empty() {
        return Err(anyhow!("no recordings found"));
    }

    let mut failures = 0usize;
    for file in &files {
        match probe(file) {
            Ok(info) => print_info(file, &info, args.json),
            Err(err) => {
                failures += 1;
                log::error!("{}: {:#}", file.display(), err);
            }
        }
    }
    if failures > 0 {
        return Err(anyhow!("{} of {} files could not be read", failures, files.len()));
    }
    Ok(())
}

fn collect(path: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    if !path.is_dir() {
        files.push(path.to_path_buf());
        return Ok(());
    }
    let mut found: Vec<PathBuf> = std::fs::read_dir(path)
        .map_err(|e| anyhow!("failed to read {}: {}", path.display(), e))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|p| {
            p.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(RECORDING_EXTENSION))
        })
        .collect();
    found.sort();
    files.extend(found);
    Ok(())
}

fn print_info(path: &Path, info: &AviInfo, json: bool) {
    let duration = if info.fps > 0.0 {
        f64::from(info.frame_count) / info.fps
    } else {
        0.0
    };
    if json {
        let value = serde_json::json!({
            "path": path.display().to_string(),
            "width": info.width,
            "height": info.height,
            "frames": info.frame_count,
            "fps": info.fps,
            "codec": info.codec,
            "duration_secs": duration,
            "bytes": info.file_size,
        });
        println!("{}", value);
    } else {
        println!(
            "{}: {}x{} {} frames @ {:.2} fps ({:.1}s, {}, {} bytes)",
            path.display(),
            info.width,
            info.height,
            info.frame_count,
            info.fps,
            duration,
            info.codec,
            info.file_size
        );
    }
}
