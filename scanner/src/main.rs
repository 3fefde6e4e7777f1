//! Command-line entry point: replays a JSON-lines capture of advertisement
//! records through a scan and prints the resulting summary.

use accessory_scanner::{spawn_history_writer, DiscoveryCoordinator, InMemoryHistory, LogObserver};
use chrono::Local;
use clap::{Parser, ValueEnum};
use env_logger::fmt::Color;
use env_logger::Builder;
use futures::stream::{self, Stream};
use log::{info, warn, LevelFilter};
use scan_common::{AdvertisementRecord, DiscoveryError, Result, ScanConfig, ScanMode};
use std::io::Write;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

const BANNER: &str = r#"
╔═══════════════════════════════════════════════════════════════════╗
║                                                                   ║
║   Accessory Scanner v0.1.0                                        ║
║   Smart-home discovery & trust scoring                            ║
║                                                                   ║
╚═══════════════════════════════════════════════════════════════════╝
"#;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Quick,
    Full,
    Custom,
}

#[derive(Parser, Debug)]
#[command(name = "accessory-scanner", version, about = "Scores discovered smart-home accessories")]
struct Args {
    /// JSON-lines capture of advertisement records (stdin when omitted)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// JSON scan configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long, value_enum)]
    mode: Option<ModeArg>,

    /// Scan duration for `--mode custom`
    #[arg(long, default_value_t = 60)]
    duration_secs: u64,

    /// Only admit hosts inside this CIDR block
    #[arg(short, long)]
    range: Option<String>,

    #[arg(long)]
    max_devices: Option<usize>,

    /// Write the JSON summary here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn setup_logger() {
    let mut builder = Builder::from_default_env();

    builder
        .format(|buf, record| {
            let mut timestamp_style = buf.style();
            let mut level_style = buf.style();
            let mut target_style = buf.style();

            let level_color = match record.level() {
                log::Level::Error => Color::Red,
                log::Level::Warn => Color::Yellow,
                log::Level::Info => Color::Green,
                log::Level::Debug => Color::Cyan,
                log::Level::Trace => Color::White,
            };

            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            writeln!(
                buf,
                "{} {} [{}] {}",
                timestamp_style.set_color(Color::Rgb(100, 100, 100)).value(timestamp),
                level_style.set_color(level_color).value(record.level()),
                target_style.set_color(Color::Blue).value(record.target()),
                record.args()
            )
        })
        .filter(None, LevelFilter::Info)
        .parse_default_env()
        .init();
}

type RecordStream = Pin<Box<dyn Stream<Item = Result<AdvertisementRecord>> + Send>>;

/// One record per line; malformed lines are skipped, read errors end the source.
fn line_source<R>(reader: R) -> RecordStream
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::unfold(reader.lines(), |mut lines| async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<AdvertisementRecord>(line) {
                        Ok(record) => return Some((Ok(record), lines)),
                        Err(e) => warn!("Skipping malformed capture line: {}", e),
                    }
                }
                Ok(None) => return None,
                Err(e) => return Some((Err(DiscoveryError::from(e)), lines)),
            }
        }
    }))
}

fn build_config(args: &Args) -> Result<ScanConfig> {
    let mut config = ScanConfig::load(args.config.as_deref())?;
    if let Some(mode) = args.mode {
        config.mode = match mode {
            ModeArg::Quick => ScanMode::Quick,
            ModeArg::Full => ScanMode::Full,
            ModeArg::Custom => ScanMode::Custom { duration_secs: args.duration_secs },
        };
    }
    if let Some(range) = &args.range {
        config.network_range = Some(range.parse()?);
    }
    if let Some(max_devices) = args.max_devices {
        config.max_devices = max_devices;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logger();
    let args = Args::parse();

    eprintln!("{}", BANNER);

    let config = build_config(&args)?;
    info!("Configuration loaded successfully");

    let store = Arc::new(InMemoryHistory::new());
    let (history, writer) = spawn_history_writer(store.clone());
    let coordinator = DiscoveryCoordinator::new(Arc::new(LogObserver)).with_history(history);
    coordinator.start(config)?;

    let source = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| DiscoveryError::SourceFailure(format!("{}: {}", path.display(), e)))?;
            line_source(BufReader::new(file))
        }
        None => line_source(BufReader::new(tokio::io::stdin())),
    };

    let summary = coordinator.run(source).await?;

    // Dropping the coordinator closes the history sink so the writer can drain.
    drop(coordinator);
    if let Err(e) = writer.await {
        warn!("History writer ended abnormally: {}", e);
    }
    info!("History holds {} device records", store.len());

    let json = serde_json::to_string_pretty(&summary)?;
    match &args.output {
        Some(path) => {
            tokio::fs::write(path, json).await?;
            info!("Summary written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
