use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use xorpeel::frame::FrameReader;
use xorpeel::{DecodeSession, SessionOptions};

#[derive(Parser)]
#[command(name = "xorpeel", about = "Peeling decoder for XOR fountain-coded block streams")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a frame stream and write the recovered file
    Decode {
        /// Probability of dropping each received frame (loss simulation)
        drop_rate: Option<f64>,
        /// Frame stream to read (default: stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Where to write the recovered file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Give up after this many processed frames
        #[arg(long)]
        max_blocks: Option<u64>,
        /// Seed for the drop RNG
        #[arg(long)]
        seed: Option<u64>,
        /// JSON file with session options; flags override it
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Also write transfer statistics as JSON
        #[arg(long)]
        stats_json: Option<PathBuf>,
    },
    /// Print frame headers without decoding
    Inspect {
        /// Frame stream to read (default: stdin)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    match Cli::parse().command {

        // ── Decode ───────────────────────────────────────────────────────────
        Commands::Decode { drop_rate, input, output, max_blocks, seed, config, stats_json } => {
            let mut opts = match &config {
                Some(path) => SessionOptions::load(path)?,
                None       => SessionOptions::default(),
            };
            if let Some(rate) = drop_rate { opts.drop_rate = rate; }
            if max_blocks.is_some() { opts.max_blocks = max_blocks; }
            if seed.is_some() { opts.seed = seed; }

            let mut session = DecodeSession::new(opts)?;
            session.run(open_input(&input)?)?;

            let stats = session.stats();
            eprintln!("{}", stats.summary());
            if let Some(path) = &stats_json {
                std::fs::write(path, stats.to_json()?)?;
            }

            // Fails with `Stalled` if the stream ran dry first, before any
            // existing output file is touched.
            let written = match &output {
                Some(path) => session.save_output(path)?,
                None => {
                    let stdout = io::stdout();
                    let mut w = stdout.lock();
                    let n = session.write_output(&mut w)?;
                    w.flush()?;
                    n
                }
            };
            tracing::debug!(bytes = written, "output written");
        }

        // ── Inspect ──────────────────────────────────────────────────────────
        Commands::Inspect { input } => {
            let mut frames      = 0u64;
            let mut bytes       = 0u64;
            let mut degree_sum  = 0u64;
            let mut degree_max  = 0usize;
            let mut covered     = BTreeSet::new();

            println!("{:>6} {:>10} {:>8} {:>6}  {:<24} Payload", "Frame", "File size", "Block", "Degree", "Ids");
            for frame in FrameReader::new(open_input(&input)?) {
                let frame = frame?;
                let ids = format_ids(&frame.dependencies);
                let head = &frame.payload[..frame.payload.len().min(6)];
                println!("{:>6} {:>10} {:>8} {:>6}  {:<24} {}",
                    frames, frame.header.file_size, frame.header.block_size,
                    frame.header.degree, ids, hex::encode(head));

                frames     += 1;
                bytes      += frame.payload.len() as u64;
                degree_sum += frame.dependencies.len() as u64;
                degree_max  = degree_max.max(frame.dependencies.len());
                covered.extend(frame.dependencies.iter().copied());
            }

            println!("── Stream ───────────────────────────────────────────────");
            println!("  Frames         {}", frames);
            println!("  Payload bytes  {}", bytes);
            if frames > 0 {
                println!("  Mean degree    {:.2}", degree_sum as f64 / frames as f64);
                println!("  Max degree     {}", degree_max);
            }
            println!("  Ids covered    {}", covered.len());
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn open_input(path: &Option<PathBuf>) -> io::Result<Box<dyn Read>> {
    Ok(match path {
        Some(p) => Box::new(BufReader::new(File::open(p)?)),
        None    => Box::new(io::stdin().lock()),
    })
}

fn format_ids(ids: &[u32]) -> String {
    const SHOWN: usize = 5;
    let mut s = ids.iter().take(SHOWN).map(u32::to_string).collect::<Vec<_>>().join(",");
    if ids.len() > SHOWN {
        s.push_str(",…");
    }
    s
}
