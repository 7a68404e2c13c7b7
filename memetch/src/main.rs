use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use memetch_core::codec::{self, CodecKind, Compressor, HEADER_LEN};
use memetch_core::digest::HashingSink;
use memetch_core::platform::{self, DEFAULT_DEVICE_PATH, DEFAULT_SERVICE_NAME};
use memetch_core::{AcquisitionEngine, AcquisitionMode, ConsoleLogger, Logger, PAGE_SIZE};
use std::fmt;
use std::fs::File;
use std::io::{IsTerminal, Read, Seek, SeekFrom, stderr, stdout};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[cfg(unix)]
use libc::ECHOCTL;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;
#[cfg(unix)]
use termios::{TCSANOW, Termios, tcsetattr};

/// Pages per dot when progress is drawn as text instead of a bar.
const DOT_GRANULARITY: u64 = 1024;

#[derive(Parser)]
#[command(name = "memetch")]
#[command(about = "A fault-tolerant physical memory acquisition tool", version)]
struct Cli {
    /// Print per-chunk and per-page diagnostics
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire a memory image, or print the memory layout when no file is given
    Acquire {
        /// Output path to write the image to
        filename: Option<PathBuf>,

        /// Device object exposed by the driver
        #[arg(long, default_value = DEFAULT_DEVICE_PATH)]
        device: PathBuf,

        /// Driver file to load for the duration of the acquisition
        #[arg(long)]
        driver_path: Option<PathBuf>,

        /// Name of the driver service
        #[arg(long, default_value = DEFAULT_SERVICE_NAME)]
        service_name: String,

        /// Compression to apply (none, stored, s2, snappy, gzip, gz)
        #[arg(long, default_value = "none")]
        compression: CodecKind,

        /// Write gaps as zeroes instead of leaving holes in the output
        #[arg(long)]
        nosparse: bool,

        /// Show acquisition progress
        #[arg(long)]
        progress: bool,

        /// Print the memory layout as JSON
        #[arg(long)]
        json: bool,

        /// Print the SHA-256 of the raw image when done
        #[arg(long)]
        hash: bool,

        /// Overwrite the output file without asking
        #[arg(short, long)]
        force: bool,
    },
    /// Decompress an image produced by `acquire`
    Extract {
        /// Compressed image
        image: PathBuf,

        /// Output path for the raw image
        filename: PathBuf,

        /// Overwrite the output file without asking
        #[arg(short, long)]
        force: bool,
    },
    /// Install and start the driver service, then exit
    Install {
        /// Driver file to register
        #[arg(long)]
        driver_path: PathBuf,

        /// Name of the service to create
        #[arg(long, default_value = DEFAULT_SERVICE_NAME)]
        service_name: String,
    },
    /// Stop and remove the driver service, then exit
    Uninstall {
        /// Name of the service to remove
        #[arg(long, default_value = DEFAULT_SERVICE_NAME)]
        service_name: String,
    },
}

/// On Unix, disables `ECHOCTL` so Ctrl+C is not echoed as `^C` over the
/// progress output. The original terminal state is restored on drop.
struct TermRestorer {
    #[cfg(unix)]
    original_termios: Option<Termios>,
}

impl TermRestorer {
    fn new() -> Self {
        #[cfg(unix)]
        {
            if !stdout().is_terminal() {
                return Self {
                    original_termios: None,
                };
            }

            let fd = stdout().as_raw_fd();
            let original_termios = Termios::from_fd(fd).ok().filter(|original| {
                let mut quiet = *original;
                quiet.c_lflag &= !ECHOCTL;
                tcsetattr(fd, TCSANOW, &quiet).is_ok()
            });
            Self { original_termios }
        }
        #[cfg(not(unix))]
        {
            Self {}
        }
    }
}

impl Drop for TermRestorer {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let Some(ref original_termios) = self.original_termios {
            tcsetattr(stdout().as_raw_fd(), TCSANOW, original_termios).ok();
        }
    }
}

/// Routes engine output through an `indicatif` bar so log lines do not tear
/// it. The bar counts pages.
struct BarLogger {
    bar: ProgressBar,
    verbose: bool,
}

impl BarLogger {
    fn new(verbose: bool) -> Self {
        Self {
            bar: ProgressBar::hidden(),
            verbose,
        }
    }

    fn line(&self, message: fmt::Arguments<'_>) {
        self.bar.suspend(|| println!("{message}"));
    }

    /// Makes the bar visible with `pages` as its length.
    fn start(&self, pages: u64) -> Result<()> {
        self.bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        self.bar.set_length(pages);
        self.bar.set_prefix("Acquiring");
        self.bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{prefix:12} [{elapsed_precise}] [{bar:40.green/black}] {pos}/{len} pages ({per_sec}, {eta})",
                )?
                .progress_chars("■ "),
        );
        Ok(())
    }
}

impl Logger for BarLogger {
    fn info(&self, message: fmt::Arguments<'_>) {
        self.line(message);
    }

    fn debug(&self, message: fmt::Arguments<'_>) {
        if self.verbose {
            self.line(message);
        }
    }

    fn progress(&self, pages: u64) {
        self.bar.inc(pages);
    }

    // The bar redraws on its own schedule.
    fn set_progress_granularity(&self, _pages_per_tick: u64) {}
}

/// Shows decompression throughput as a byte spinner.
struct SpinnerLogger {
    spinner: ProgressBar,
    verbose: bool,
}

impl SpinnerLogger {
    fn new(verbose: bool) -> Result<Self> {
        let spinner = ProgressBar::new_spinner();
        spinner.set_prefix("Extracting");
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{prefix:12} [{elapsed_precise}] [{spinner:.blue}] {bytes} ({bytes_per_sec}) {msg}")?
                .tick_strings(&["■    ", " ■   ", "  ■  ", "   ■ ", "    ■", "   ■ ", "  ■  ", " ■   ", "■■■■■"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));
        Ok(Self { spinner, verbose })
    }
}

impl Logger for SpinnerLogger {
    fn info(&self, message: fmt::Arguments<'_>) {
        self.spinner.suspend(|| println!("{message}"));
    }

    fn debug(&self, message: fmt::Arguments<'_>) {
        if self.verbose {
            self.info(message);
        }
    }

    fn progress(&self, pages: u64) {
        self.spinner.inc(pages * PAGE_SIZE as u64);
    }

    fn set_progress_granularity(&self, _pages_per_tick: u64) {}
}

/// Removes the driver service when the acquisition is over, however it ends.
struct ServiceGuard {
    service_name: String,
    logger: Arc<dyn Logger>,
}

impl Drop for ServiceGuard {
    fn drop(&mut self) {
        if let Err(e) = platform::uninstall_driver(&self.service_name, &*self.logger) {
            self.logger.info(format_args!(
                "{} {e}",
                style("Could not remove driver service:").yellow()
            ));
        }
    }
}

/// Returns `false` if `path` exists and the user declines to overwrite it.
fn confirm_overwrite(path: &Path, force: bool) -> Result<bool> {
    if force || !path.exists() {
        return Ok(true);
    }

    let confirmation = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("'{}' already exists. Overwrite it?", path.display()))
        .default(false)
        .interact()?;

    Ok(confirmation)
}

#[allow(clippy::too_many_arguments)]
fn acquire(
    filename: Option<PathBuf>,
    device: &Path,
    driver_path: Option<PathBuf>,
    service_name: String,
    compression: CodecKind,
    nosparse: bool,
    progress: bool,
    json: bool,
    hash: bool,
    force: bool,
    verbose: bool,
    running: Arc<AtomicBool>,
) -> Result<()> {
    let bar_logger = (progress && stderr().is_terminal()).then(|| Arc::new(BarLogger::new(verbose)));
    let logger: Arc<dyn Logger> = match &bar_logger {
        Some(bar_logger) => bar_logger.clone(),
        None => {
            let console = ConsoleLogger::new(verbose);
            if progress {
                console.set_progress_granularity(DOT_GRANULARITY);
            }
            Arc::new(console)
        }
    };

    // Declared before the engine so the handle is closed before the service
    // is stopped.
    let _service = match driver_path {
        Some(driver_path) => {
            platform::install_driver(&driver_path, &service_name, &*logger)?;
            Some(ServiceGuard {
                service_name,
                logger: logger.clone(),
            })
        }
        None => None,
    };

    let device = platform::open_device(device)
        .with_context(|| format!("Is the driver loaded? Tried {}", device.display()))?;
    let engine = AcquisitionEngine::new(device, logger.clone())?;

    // PTE remapping is the most reliable mode; the driver keeps its default
    // if it refuses.
    if let Err(e) = engine.set_mode(AcquisitionMode::Pte) {
        logger.info(format_args!("Could not select PTE mode: {e}"));
    }

    if json {
        println!("{}", engine.info().to_json()?);
    } else {
        println!("{}", style("Memory Info:").bold());
        print!("{}", engine.info());
    }

    let Some(filename) = filename else {
        return Ok(());
    };

    if !confirm_overwrite(&filename, force)? {
        println!("Acquisition cancelled.");
        return Ok(());
    }

    // Holes only survive in uncompressed output.
    let sparse = !nosparse && !compression.is_compressed();
    if sparse {
        logger.info(format_args!("Setting sparse output file {}", filename.display()));
    }
    engine.set_sparse(sparse);

    let output = platform::create_output(&filename, sparse)
        .with_context(|| format!("Could not create {}", filename.display()))?;
    let mut sink = HashingSink::new(Compressor::new(compression, output));

    if let Some(bar_logger) = &bar_logger {
        bar_logger.start(engine.info().image_pages())?;
    }

    let start = Instant::now();
    let result = engine.sequential_dump(&mut sink, &running);

    if let Some(bar_logger) = &bar_logger {
        match &result {
            Ok(()) => bar_logger.bar.finish_with_message("Acquisition complete."),
            Err(_) => bar_logger.bar.abandon_with_message("❌ Operation failed."),
        }
    }

    // Close the stream even when the dump stopped early, so the bytes
    // imaged so far stay decodable.
    let (compressor, digest) = sink.finish();
    let finished = compressor.finish();
    result?;
    finished?;
    engine.close()?;

    println!(
        "\n✨ Acquired {} of memory into {} in {}.",
        indicatif::HumanBytes(engine.info().image_size()),
        style(filename.display()).cyan(),
        HumanDuration(start.elapsed())
    );
    if hash {
        println!("  SHA-256: {}", style(digest).green());
    }
    Ok(())
}

fn extract(image: &Path, filename: &Path, force: bool, verbose: bool, running: Arc<AtomicBool>) -> Result<()> {
    let mut input =
        File::open(image).with_context(|| format!("Could not open {}", image.display()))?;

    let mut header = Vec::with_capacity(HEADER_LEN);
    (&mut input).take(HEADER_LEN as u64).read_to_end(&mut header)?;
    input.seek(SeekFrom::Start(0))?;

    let mut decompressor = codec::select_decompressor(&header, input)?;

    if !confirm_overwrite(filename, force)? {
        println!("Extraction cancelled.");
        return Ok(());
    }

    let output = platform::create_output(filename, true)
        .with_context(|| format!("Could not create {}", filename.display()))?;
    let mut sink = HashingSink::new(output);

    let logger = SpinnerLogger::new(verbose)?;
    logger.info(format_args!(
        "Decompressing {} stream from {}",
        decompressor.kind(),
        image.display()
    ));

    match codec::copy_with_progress(&mut decompressor, &mut sink, &running, &logger) {
        Ok(total) => {
            logger
                .spinner
                .finish_with_message(format!("Extracted {}.", indicatif::HumanBytes(total)));
        }
        Err(e) => {
            logger.spinner.abandon_with_message("❌ Operation failed.");
            return Err(e.into());
        }
    }

    let (_, digest) = sink.finish();
    println!(
        "\n✨ Extracted {} to {}.",
        style(image.display()).cyan(),
        style(filename.display()).cyan()
    );
    println!("  SHA-256: {}", style(digest).green());
    Ok(())
}

fn main() -> Result<()> {
    // This guard will be dropped when main() exits, restoring the terminal.
    let _term_restorer = TermRestorer::new();

    // This flag allows for graceful cancellation of operations.
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Acquire {
            filename,
            device,
            driver_path,
            service_name,
            compression,
            nosparse,
            progress,
            json,
            hash,
            force,
        } => acquire(
            filename,
            &device,
            driver_path,
            service_name,
            compression,
            nosparse,
            progress,
            json,
            hash,
            force,
            cli.verbose,
            running,
        ),
        Commands::Extract {
            image,
            filename,
            force,
        } => extract(&image, &filename, force, cli.verbose, running),
        Commands::Install {
            driver_path,
            service_name,
        } => {
            let logger = ConsoleLogger::new(cli.verbose);
            platform::install_driver(&driver_path, &service_name, &logger)?;
            println!("✨ Driver service {} is running.", style(service_name).cyan());
            Ok(())
        }
        Commands::Uninstall { service_name } => {
            let logger = ConsoleLogger::new(cli.verbose);
            platform::uninstall_driver(&service_name, &logger)?;
            println!("✨ Driver service {} removed.", style(service_name).cyan());
            Ok(())
        }
    }
}
