use std::env;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

use deferred_rsm::app::{self, SceneSummary, WindowInitError};
use deferred_rsm::SceneConfig;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const USAGE: &str = "Usage: deferred-rsm <scene.xml> [--summary-only] [--width N] [--height N]";

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let options = CliOptions::parse(env::args().skip(1))?;
    let config = SceneConfig::load(&options.path)?;

    if options.summary_only {
        return print_summary(&config);
    }
    match app::run(config.clone(), options.width, options.height) {
        Ok(()) => Ok(()),
        Err(err) if err.downcast_ref::<WindowInitError>().is_some() => {
            eprintln!(
                "{err}. Falling back to --summary-only mode (set DISPLAY or install X11 libs to enable rendering)."
            );
            print_summary(&config)
        }
        Err(err) => Err(err),
    }
}

fn print_summary(config: &SceneConfig) -> Result<()> {
    let summary = SceneSummary::collect(config).context("failed to summarize scene")?;
    println!("{summary}");
    Ok(())
}

#[derive(Debug, PartialEq)]
struct CliOptions {
    path: PathBuf,
    summary_only: bool,
    width: u32,
    height: u32,
}

impl CliOptions {
    fn parse(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let mut args = args.into_iter();
        let Some(path) = args.next() else {
            return Err(anyhow!(USAGE));
        };
        let mut options = Self {
            path: PathBuf::from(path),
            summary_only: false,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        };
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--summary-only" => options.summary_only = true,
                "--width" => options.width = dimension(&arg, args.next())?,
                "--height" => options.height = dimension(&arg, args.next())?,
                other => {
                    return Err(anyhow!(
                        "Unknown argument: {other}. Expected --summary-only, --width or --height"
                    ));
                }
            }
        }
        Ok(options)
    }
}

fn dimension(flag: &str, value: Option<String>) -> Result<u32> {
    let value = value.ok_or_else(|| anyhow!("{flag} needs a value"))?;
    match value.parse::<u32>() {
        Ok(size) if size > 0 => Ok(size),
        _ => Err(anyhow!("{flag} expects a positive integer, got '{value}'")),
    }
}
