use std::path::Path;

use clap::Parser;
use log::warn;

use vmedia::chunk::{self, PacketChunk};
use vmedia::error::MediaError;
use vmedia::scanner::ChunkScanner;
use vmedia::storage::{BlockFile, VirtualFile};

#[derive(Parser)]
#[command(
    name = "vmedia-info",
    about = "Parse and display the chunk structure of a virtual media file"
)]
struct Args {
    /// Input chunk-stream file
    #[arg(short = 'f', long = "file")]
    file: Option<String>,

    /// Input chunk-stream file (positional)
    #[arg(conflicts_with = "file", required_unless_present = "file")]
    input: Option<String>,

    /// Read-ahead block size in bytes
    #[arg(long, default_value_t = 4096)]
    block_size: u32,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Reset SIGPIPE to default so piped output (e.g. head/tail) exits cleanly
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    env_logger::init();
    let args = Args::parse();

    let path = args.file.or(args.input).expect("file argument required");
    let file = BlockFile::open(Path::new(&path))?;

    // File-level time range from the side channel, if present.
    let info = match file.optional_data() {
        Ok(data) if !data.is_empty() => chunk::decode_info(&data).ok(),
        _ => None,
    };

    let mut scanner = ChunkScanner::new(args.block_size);
    let mut chunks: Vec<PacketChunk> = Vec::new();
    loop {
        match scanner.next_chunk(&file) {
            Ok(c) => chunks.push(c),
            Err(MediaError::EndOfStream) => break,
            Err(e @ MediaError::Io(_)) => return Err(e.into()),
            Err(e) => {
                // The scanner already skipped the bad record's span.
                warn!("skipping undecodable chunk record: {e}");
            }
        }
    }

    if args.json {
        println!("{}", serde_json::to_string(&chunks)?);
        return Ok(());
    }

    if let Some(info) = info {
        println!("File time range: {} .. {}", info.start_time, info.end_time);
    } else {
        println!("File time range: (no media info)");
    }

    println!(
        "{:>6} {:>15} {:>15} {:>6} {:>10} {:>10}",
        "IDX", "START", "END", "PKTS", "PREVSIZE", "PREVADDR"
    );
    for c in &chunks {
        println!(
            "{:>6} {:>15} {:>15} {:>6} {:>10} {:>10}",
            c.index,
            c.start_time,
            c.end_time,
            c.packets.len(),
            c.prev_chunk_size,
            c.prev_chunk_start,
        );
    }

    Ok(())
}
