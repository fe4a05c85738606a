//! courtcam_worker - isolated stream decoder
//!
//! Spawned by `ProcessIsolatedStreamSource`; not meant to be run by hand.
//! Reads single-byte requests on stdin and writes framed replies on stdout.
//! Logs go to stderr, which the parent inherits.
//!
//! Exit codes: 0 after a clean close, 1 on a protocol or pipe failure,
//! 2 when the stream could not be opened.

use anyhow::Result;
use clap::Parser;

use courtcam::ingest::stream::decoder::open_decoder;
use courtcam::ingest::stream::protocol::{write_reply, Reply};
use courtcam::ingest::stream::worker::run_worker;

#[derive(Parser, Debug)]
#[command(name = "courtcam_worker", about = "Decode one stream for a courtcam parent process")]
struct Args {
    /// Stream address (rtsp://, http(s):// MJPEG, or stub://)
    #[arg(long)]
    source: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();
    let args = Args::parse();

    let decoder = match open_decoder(&args.source) {
        Ok(decoder) => decoder,
        Err(err) => {
            log::error!("StreamWorker: cannot open {}: {:#}", args.source, err);
            let mut stdout = std::io::stdout().lock();
            let _ = write_reply(&mut stdout, &Reply::Error(format!("{:#}", err)));
            std::process::exit(2);
        }
    };

    let stdout = std::io::stdout();
    let summary = run_worker(decoder, std::io::stdin(), stdout.lock())?;
    log::debug!("StreamWorker: {:?}", summary);
    Ok(())
}
