use anyhow::{bail, Context};
use clap::Parser;
use klippy_mcu::configfile::Configfile;
use klippy_mcu::printer::{Printer, StartArgs};
use klippy_mcu::reactor::Reactor;
use log::{debug, info};
use std::collections::HashMap;
use std::path::PathBuf;

/// Build the micro-controller configuration for a printer config file and
/// write the resulting command stream to a file
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file
    #[arg()]
    config_file: PathBuf,

    /// write output to file instead of to serial port
    #[arg(short, long)]
    debugoutput: PathBuf,

    /// file to read for mcu protocol dictionary ("name=path" for secondary mcus)
    #[arg(short = 'D', long, required = true)]
    dictionary: Vec<String>,

    /// write log to file instead of stderr
    #[arg(short, long)]
    logfile: Option<PathBuf>,

    /// enable debug messages
    #[arg(short, long)]
    verbose: bool,
}

fn parse_dictionaries(args: &[String]) -> anyhow::Result<HashMap<String, PathBuf>> {
    let mut dictionaries = HashMap::new();
    for arg in args {
        let (name, path) = match arg.split_once('=') {
            Some((name, path)) => (name.trim(), path.trim()),
            None => ("mcu", arg.trim()),
        };
        if dictionaries.insert(name.to_string(), PathBuf::from(path)).is_some() {
            bail!("Dictionary for mcu '{}' given more than once", name);
        }
    }
    Ok(dictionaries)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if args.verbose {
        builder.filter(None, log::LevelFilter::Debug);
    } else {
        builder.filter(None, log::LevelFilter::Info);
    }
    if let Some(ref logfile) = args.logfile {
        let target = Box::new(
            std::fs::File::create(logfile).with_context(|| format!("Can't create logfile {}", logfile.display()))?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }
    builder.init();

    info!("Starting klippy-mcu...");

    let config = Configfile::read_file(&args.config_file)?;
    let start_args = StartArgs {
        config_file: Some(args.config_file.clone()),
        debugoutput: Some(args.debugoutput.clone()),
        dictionaries: parse_dictionaries(&args.dictionary)?,
        start_reason: None,
    };

    let reactor = Reactor::new();
    let printer = Printer::new(reactor, start_args, None);
    printer.add_printer_objects(&config)?;
    printer.connect()?;

    for mcu in printer.mcus() {
        for cmd in mcu.config_cmds() {
            debug!("{}: {}", mcu.name(), cmd);
        }
        info!(
            "MCU '{}': {} config commands, crc {}",
            mcu.name(),
            mcu.config_cmds().len(),
            mcu.config_crc().unwrap_or(0)
        );
        mcu.disconnect();
    }
    info!("Wrote {}", args.debugoutput.display());
    Ok(())
}
