use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};
use std::path::PathBuf;

use localiser_core::session::DUMP_DIR;
use localiser_core::{LocaliserSettings, Result, Session, TextEncoding};

#[derive(Debug, Parser)]
#[command(name = "scene-localiser", version, about = "Scene script localisation tool")]
struct Args {
    /// JSON settings file; missing fields take their defaults.
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Game directory holding FILE/SCENE00.afs.
    #[arg(long, global = true)]
    game: Option<PathBuf>,

    /// Encoding strings are written back in.
    #[arg(long, global = true, value_parser = parse_encoding)]
    encoding: Option<TextEncoding>,

    #[arg(long, global = true)]
    no_en_tweaks: bool,

    #[arg(long, global = true)]
    no_line_wrap: bool,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Back up FILE/SCENE00.afs before the first edit.
    Prepare,
    /// Restore FILE/SCENE00.afs from its backup.
    Revert,
    /// Write every script dump to FILE/SCENE00TXT.
    Export,
    /// Merge <entry>.json translation sets from a directory, then save.
    Import { dir: PathBuf },
    /// Apply edited <entry>.txt dumps from a directory, then save.
    Apply {
        /// Defaults to FILE/SCENE00TXT.
        dir: Option<PathBuf>,
    },
    /// Rebuild every script from its dump and save.
    Save,
}

fn parse_encoding(s: &str) -> std::result::Result<TextEncoding, String> {
    match s.to_ascii_lowercase().as_str() {
        "big5" => Ok(TextEncoding::Big5),
        "sjis" | "shift_jis" | "shift-jis" => Ok(TextEncoding::Sjis),
        other => Err(format!("unknown encoding '{other}', expected big5 or sjis")),
    }
}

fn setup_logging(verbose: bool) -> std::result::Result<(), fern::InitError> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    fern::Dispatch::new()
        .format(|out, message, _record| {
            out.finish(format_args!(
                "[{}] {}",
                chrono::Local::now().format("%-H:%M:%S"),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .apply()?;
    Ok(())
}

fn settings(args: &Args) -> Result<LocaliserSettings> {
    let mut settings = match &args.settings {
        Some(path) => LocaliserSettings::load(path)?,
        None => LocaliserSettings::default(),
    };
    if let Some(game) = &args.game {
        settings.game_path = game.clone();
    }
    if let Some(encoding) = args.encoding {
        settings.target_encoding = encoding;
    }
    if args.no_en_tweaks {
        settings.en_tweaks = false;
    }
    if args.no_line_wrap {
        settings.line_wrap = false;
    }
    Ok(settings)
}

fn run(args: Args) -> Result<()> {
    let settings = settings(&args)?;
    match args.command {
        Command::Prepare => {
            Session::prepare(&settings)?;
            info!("Scripts prepared");
        }
        Command::Revert => {
            Session::load(&settings)?.revert()?;
        }
        Command::Export => {
            Session::load(&settings)?.export()?;
        }
        Command::Import { dir } => {
            let session = Session::load(&settings)?;
            if session.import_translations(&dir)? > 0 {
                session.save()?;
                info!("Saved successfully");
            }
        }
        Command::Apply { dir } => {
            let session = Session::load(&settings)?;
            let dir = dir.unwrap_or_else(|| settings.game_path.join(DUMP_DIR));
            if session.apply_edits_dir(&dir)? > 0 {
                session.save()?;
                info!("Saved successfully");
            }
        }
        Command::Save => {
            Session::load(&settings)?.save()?;
            info!("Saved successfully");
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    if let Err(e) = setup_logging(args.verbose) {
        eprintln!("Failed to set up logging: {e}");
    }

    if let Err(err) = run(args) {
        error!("{err}");
        std::process::exit(1);
    }
}
