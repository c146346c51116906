use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use compat_pak::pak::{self, PakDirectory};
use inject_core::codec::PngFactory;
use inject_core::config::EngineConfig;
use inject_core::index::{FingerprintIndex, SourceLocation};
use inject_core::pipeline::LoadOutcome;
use inject_core::{Fingerprint, TextureEngine, MIB};

const EXIT_SUCCESS: i32 = 0;
const EXIT_USAGE: i32 = 2;
const EXIT_CONFIG: i32 = 10;
const EXIT_IO: i32 = 11;
const EXIT_PAK: i32 = 12;
const EXIT_ENGINE: i32 = 13;

const WARM_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(name = "inject-tools", version, about = "Texture injection tools")]
struct Cli {
    /// Log at debug level (RUST_LOG still wins when set).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan an inject root and list the replacements it provides.
    Index(IndexArgs),
    /// Print the fingerprint of each file.
    Fingerprint {
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },
    /// Load a directory of original textures through the engine and report
    /// what got replaced.
    Warm(WarmArgs),
    Pak(PakArgs),
}

#[derive(Parser)]
struct IndexArgs {
    #[arg(long, value_name = "PATH", conflicts_with = "root")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "DIR")]
    root: Option<PathBuf>,

    #[arg(long, default_value = "png")]
    extension: String,
}

#[derive(Parser)]
struct WarmArgs {
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory of original (unreplaced) texture files.
    #[arg(long, value_name = "DIR")]
    sources: PathBuf,
}

#[derive(Parser)]
struct PakArgs {
    #[command(subcommand)]
    command: PakCommand,
}

#[derive(Subcommand)]
enum PakCommand {
    List {
        #[arg(long, value_name = "PATH")]
        pak: PathBuf,
    },
    Extract {
        #[arg(long, value_name = "PATH")]
        pak: PathBuf,
        #[arg(long, value_name = "DIR")]
        out: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();
    let default_level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let _ = env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .try_init();
    inject_core::observability::install_panic_hook();

    let exit_code = match cli.command {
        Commands::Index(args) => run_index(args),
        Commands::Fingerprint { files } => run_fingerprint(&files),
        Commands::Warm(args) => run_warm(args),
        Commands::Pak(args) => run_pak(args),
    };
    std::process::exit(exit_code);
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, i32> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    EngineConfig::load(path).map_err(|err| {
        eprintln!("{}", err);
        EXIT_CONFIG
    })
}

fn run_index(args: IndexArgs) -> i32 {
    let (root, extension) = match (&args.config, args.root) {
        (Some(path), _) => match load_config(Some(path.as_path())) {
            Ok(config) => (config.index.root, config.index.extension),
            Err(code) => return code,
        },
        (None, Some(root)) => (root, args.extension),
        (None, None) => {
            eprintln!("either --config or --root is required");
            return EXIT_USAGE;
        }
    };
    if !root.is_dir() {
        eprintln!("inject root not found: {}", root.display());
        return EXIT_IO;
    }

    let index = FingerprintIndex::new(root, extension);
    let summary = index.rebuild();
    let archives = index.archives();
    for record in index.records() {
        let location = match &record.location {
            SourceLocation::Loose(path) => path.display().to_string(),
            SourceLocation::Archive { archive, entry } => {
                let container = archives
                    .get(*archive)
                    .map(|container| container.path.display().to_string())
                    .unwrap_or_else(|| format!("archive #{}", archive));
                format!("{}#{}", container, entry)
            }
        };
        println!(
            "{} {:>10} {:<11} {}",
            record.fingerprint,
            record.size,
            format!("{:?}", record.method).to_lowercase(),
            location
        );
    }
    println!(
        "{} replacements, {} archives, {} MiB",
        summary.records,
        summary.archives,
        summary.total_bytes / MIB
    );
    EXIT_SUCCESS
}

fn run_fingerprint(files: &[PathBuf]) -> i32 {
    let mut code = EXIT_SUCCESS;
    for path in files {
        match fs::read(path) {
            Ok(bytes) => println!("{}  {}", Fingerprint::of(&bytes), path.display()),
            Err(err) => {
                eprintln!("read failed ({}): {}", path.display(), err);
                code = EXIT_IO;
            }
        }
    }
    code
}

fn run_warm(args: WarmArgs) -> i32 {
    let config = match load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(code) => return code,
    };
    let sources = match sorted_files(&args.sources) {
        Ok(files) => files,
        Err(err) => {
            eprintln!("sources unreadable ({}): {}", args.sources.display(), err);
            return EXIT_IO;
        }
    };
    let engine = match TextureEngine::new(config, Arc::new(PngFactory)) {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("engine start failed: {}", err);
            return EXIT_ENGINE;
        }
    };

    let started = Instant::now();
    let mut textures = Vec::with_capacity(sources.len());
    for path in &sources {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("skipping {}: {}", path.display(), err);
                continue;
            }
        };
        match engine.create_texture(&bytes) {
            Ok(texture) => textures.push(texture),
            Err(err) => log::warn!("skipping {}: {}", path.display(), err),
        }
    }

    let mut completed = 0usize;
    let mut failed = 0usize;
    while engine.has_pending_loads() && started.elapsed() < WARM_TIMEOUT {
        let report = engine.tick();
        completed += report.completed.len();
        failed += report
            .completed
            .iter()
            .filter(|load| matches!(load.outcome, LoadOutcome::Failed(_)))
            .count();
        thread::sleep(Duration::from_millis(5));
    }
    let report = engine.tick();
    completed += report.completed.len();

    let telemetry = engine.telemetry();
    println!(
        "created {} textures, {} loads finished ({} failed) in {} ms",
        textures.len(),
        completed,
        failed,
        started.elapsed().as_millis()
    );
    println!(
        "cache: {} entries, {} replaced, {} MiB base + {} MiB injected",
        telemetry.cache.entries,
        telemetry.cache.injected_count,
        telemetry.cache.basic_bytes / MIB,
        telemetry.cache.injected_bytes / MIB
    );
    for texture in &textures {
        engine.destroyed(texture);
    }
    let timed_out = engine.has_pending_loads();
    let reset = engine.reset();
    if reset.leaked > 0 {
        eprintln!("{} textures still referenced at reset", reset.leaked);
    }
    engine.shutdown();
    if timed_out {
        eprintln!("loads still pending after {} s", WARM_TIMEOUT.as_secs());
        return EXIT_ENGINE;
    }
    EXIT_SUCCESS
}

fn run_pak(args: PakArgs) -> i32 {
    match args.command {
        PakCommand::List { pak } => pak_list(&pak),
        PakCommand::Extract { pak, out } => pak_extract(&pak, &out),
    }
}

fn open_pak(path: &Path) -> Result<(fs::File, PakDirectory), i32> {
    pak::open_pak(path).map_err(|err| {
        eprintln!("pak open failed ({}): {}", path.display(), err);
        EXIT_PAK
    })
}

fn pak_list(path: &Path) -> i32 {
    let (_file, directory) = match open_pak(path) {
        Ok(result) => result,
        Err(code) => return code,
    };
    println!("pak: {}", path.display());
    for entry in directory.entries() {
        println!("{:>10} {:>10} {}", entry.offset, entry.size, entry.name);
    }
    EXIT_SUCCESS
}

fn pak_extract(path: &Path, out_dir: &Path) -> i32 {
    let (mut file, directory) = match open_pak(path) {
        Ok(result) => result,
        Err(code) => return code,
    };
    if let Err(err) = directory.extract_all(&mut file, out_dir) {
        eprintln!("pak extract failed: {}", err);
        return EXIT_PAK;
    }
    println!(
        "extracted {} entries to {}",
        directory.len(),
        out_dir.display()
    );
    EXIT_SUCCESS
}

fn sorted_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
