use bustrace::capture::{CaptureConfig, CaptureObserver, CaptureSession};
use bustrace::capture::DEFAULT_HOOK_ADDR;
use bustrace::hook::{
    ConsoleService, EchoService, HookError, SVC_CONSOLE, SVC_ECHO,
};
use bustrace::patch::HwPatch;
use bustrace::trace::{Burst, BurstKind, DecodeError};
use bustrace::transport::ReplayTransport;
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

//===========================================================================//

#[derive(Parser)]
#[clap(author, about, long_about = None, version)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decodes a raw trace capture and lists its bursts.
    Decode {
        /// The raw capture file to replay.
        capture: PathBuf,
        /// Ignores I/O hook calls instead of servicing them.
        #[clap(long)]
        no_hooks: bool,
        /// The byte address of the I/O hook buffer.
        #[clap(
            long,
            value_parser = parse_addr,
            default_value_t = DEFAULT_HOOK_ADDR
        )]
        hook_addr: u32,
        /// The number of bytes to replay per chunk.
        #[clap(long, default_value_t = 4096)]
        chunk_size: usize,
        /// Prints only the summary, not every burst.
        #[clap(long, short)]
        quiet: bool,
    },
    /// Shows the CAM blocks that would cover a patch region.
    Layout {
        /// The base byte address of the region.
        #[clap(value_parser = parse_addr)]
        base: u32,
        /// The size of the region, in bytes.
        #[clap(value_parser = parse_addr)]
        size: u32,
    },
}

fn parse_addr(text: &str) -> Result<u32, String> {
    let result = match text.strip_prefix("0x").or(text.strip_prefix("$")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse::<u32>(),
    };
    result.map_err(|error| format!("invalid address {text:?}: {error}"))
}

//===========================================================================//

struct BurstPrinter<W> {
    output: W,
    quiet: bool,
}

impl<W: Write> CaptureObserver for BurstPrinter<W> {
    fn burst(&mut self, burst: &Burst) {
        if self.quiet {
            return;
        }
        let direction = match burst.kind() {
            BurstKind::Read => 'R',
            BurstKind::Write => 'W',
        };
        let mut line = format!(
            "{} {} {:#08x}:",
            burst.timestamp(),
            direction,
            burst.start()
        );
        for byte in burst.data() {
            line.push_str(&format!(" {byte:02x}"));
        }
        if let Err(error) = writeln!(self.output, "{line}") {
            log::warn!("failed to print burst: {error}");
        }
    }

    fn decode_error(&mut self, error: &DecodeError) {
        if error.is_fatal() && !self.quiet {
            if let Err(write_error) = writeln!(self.output, "-- {error}") {
                log::warn!("failed to print decode error: {write_error}");
            }
        }
    }

    fn hook_error(&mut self, error: &HookError) {
        if !self.quiet {
            if let Err(write_error) = writeln!(self.output, "-- hook: {error}")
            {
                log::warn!("failed to print hook error: {write_error}");
            }
        }
    }
}

//===========================================================================//

fn main() -> io::Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();
    let cli = Cli::parse();
    match cli.command {
        Command::Decode { capture, no_hooks, hook_addr, chunk_size, quiet } => {
            let config = CaptureConfig {
                hook_addr,
                enable_hooks: !no_hooks,
                ..CaptureConfig::default()
            };
            let mut session = CaptureSession::new(config, HwPatch::new())
                .map_err(io::Error::other)?;
            let console = ConsoleService::new(io::stderr());
            session.register_service(SVC_CONSOLE, console);
            session.register_service(SVC_ECHO, EchoService);
            let file = File::open(&capture)?;
            let mut transport = ReplayTransport::new(io::BufReader::new(file))
                .with_chunk_size(chunk_size);
            let mut printer =
                BurstPrinter { output: io::stdout().lock(), quiet };
            let stats = session
                .run(&mut transport, None, &mut printer)
                .map_err(io::Error::other)?;
            println!("{stats}");
        }
        Command::Layout { base, size } => {
            let mut patch = HwPatch::new();
            let region = patch
                .allocate_region(base, size as usize)
                .map_err(io::Error::other)?
                .len();
            println!("{region} bytes at {base:#08x}:");
            for block in patch.blocks() {
                println!(
                    "  {:#08x}..={:#08x}  mask {:#08x}  content +{:#x}",
                    block.addr,
                    block.last(),
                    block.mask,
                    block.content_offset
                );
            }
        }
    }
    Ok(())
}

//===========================================================================//
