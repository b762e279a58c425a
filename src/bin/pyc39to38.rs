// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
use std::error::Error;
use std::fs;
use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config as LogConfig, Root};
use log4rs::encode::pattern::PatternEncoder;

use pyc39to38::container::{self, MIN_PYC_SIZE};
use pyc39to38::{walk, Config};

/// Downgrades a compiled Python 3.9 bytecode module to 3.8.
#[derive(Parser)]
#[clap(name = "pyc39to38", version, about)]
struct Args {
    /// Path to the 3.9 .pyc file to convert.
    input: PathBuf,
    /// Path the rewritten 3.8 .pyc file is written to.
    output: PathBuf,
    /// Overwrite `output` if it already exists.
    #[clap(short, long)]
    force: bool,
    /// Don't correct a line number that trails an EXTENDED_ARG prefix.
    #[clap(long)]
    preserve_lineno_after_extarg: bool,
    /// Skip synthesizing BEGIN_FINALLY for try/finally blocks.
    #[clap(long)]
    no_begin_finally: bool,
    /// Show info-level progress output.
    #[clap(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    // Logging is always active, matching the original CLI's unconditional
    // basicConfig(level=INFO, ...): --verbose only raises the level, it
    // doesn't gate whether errors are ever reported at all.
    init_logging(if args.verbose { LevelFilter::Info } else { LevelFilter::Warn });
    let ok = run(&args)?;
    std::process::exit(if ok { 0 } else { 1 });
}

fn run(args: &Args) -> Result<bool, Box<dyn Error>> {
    if !args.input.is_file() {
        log::error!("{} does not exist or is not a file", args.input.display());
        return Ok(false);
    }
    if args.output.exists() && !args.force {
        log::error!("{} already exists; pass --force to overwrite", args.output.display());
        return Ok(false);
    }
    let input_size = fs::metadata(&args.input)?.len();
    if input_size < MIN_PYC_SIZE {
        log::error!("{} is smaller than the minimum valid .pyc size of {MIN_PYC_SIZE} bytes", args.input.display());
        return Ok(false);
    }

    let cfg = Config {
        preserve_lineno_after_extarg: args.preserve_lineno_after_extarg,
        no_begin_finally: args.no_begin_finally,
    };

    let tmp_path = args.output.with_extension("tmp");
    match convert(args, &cfg, &tmp_path) {
        Ok(()) => {
            fs::rename(&tmp_path, &args.output)?;
            log::info!("wrote {}", args.output.display());
            Ok(true)
        }
        Err(e) => {
            if tmp_path.exists() {
                let _ = fs::remove_file(&tmp_path);
            }
            log::error!("failed to convert {}: {e}", args.input.display());
            Ok(false)
        }
    }
}

fn convert(args: &Args, cfg: &Config, tmp_path: &PathBuf) -> Result<(), pyc39to38::Error> {
    let parsed = container::read_module(&args.input)?;
    let rewritten = walk::walk_module(&parsed, cfg)?;
    container::write_module(tmp_path, &rewritten, parsed.timestamp)?;
    Ok(())
}

pub fn init_logging(level: LevelFilter) {
    let encoder = PatternEncoder::new("[{l}] {m}{n}");
    let stdout = ConsoleAppender::builder().encoder(Box::new(encoder)).build();
    let config = LogConfig::builder()
        .appender(Appender::builder().build("stdout", Box::new(stdout)))
        .build(Root::builder().appender("stdout").build(level))
        .unwrap();
    let _handle = log4rs::init_config(config).unwrap();
}
