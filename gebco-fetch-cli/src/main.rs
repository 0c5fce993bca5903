use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use gebco_fetch::{
    spawn_download, AcquisitionStatus, DatasetKind, DownloadConfig, DownloadPlan,
    DownloadRequest, GeographicBounds, ImageServerClient, OutputMode, OutputTarget,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download an area as GeoTIFF
    Download(DownloadArgs),
    /// Show the snapped pixel window and tile count for an area, without downloading
    Estimate(EstimateArgs),
    /// Print the remote service description
    Info(InfoArgs),
}

#[derive(Args, Debug)]
struct AreaArgs {
    /// Western edge in decimal degrees
    #[arg(long, allow_hyphen_values = true)]
    west: f64,

    /// Southern edge in decimal degrees
    #[arg(long, allow_hyphen_values = true)]
    south: f64,

    /// Eastern edge in decimal degrees
    #[arg(long, allow_hyphen_values = true)]
    east: f64,

    /// Northern edge in decimal degrees
    #[arg(long, allow_hyphen_values = true)]
    north: f64,
}

impl AreaArgs {
    fn bounds(&self) -> GeographicBounds {
        GeographicBounds::new(self.west, self.south, self.east, self.north)
    }
}

#[derive(Args, Debug)]
struct DownloadArgs {
    #[command(flatten)]
    area: AreaArgs,

    /// Dataset to download (gebco or tid)
    #[arg(long, default_value = "gebco")]
    dataset: DatasetKind,

    /// Output mode; repeat for several files (combined, bathymetry, land, direct, direct_unknown)
    #[arg(short, long = "mode", default_value = "combined")]
    modes: Vec<OutputMode>,

    /// Output directory, or a .tif path
    #[arg(short, long, value_name = "PATH")]
    output: PathBuf,

    /// Fetch the whole area in one request instead of tiles
    #[arg(long)]
    no_tile: bool,

    /// Override the ImageServer URL of the selected dataset
    #[arg(long)]
    base_url: Option<String>,

    /// Override the ImageServer URL of the type identifier grid
    #[arg(long)]
    tid_url: Option<String>,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[derive(Args, Debug)]
struct EstimateArgs {
    #[command(flatten)]
    area: AreaArgs,

    /// Estimate for a single request instead of tiles
    #[arg(long)]
    no_tile: bool,

    #[command(flatten)]
    tuning: TuningArgs,
}

#[derive(Args, Debug)]
struct InfoArgs {
    /// Dataset to describe (gebco or tid)
    #[arg(long, default_value = "gebco")]
    dataset: DatasetKind,

    /// Override the ImageServer URL
    #[arg(long)]
    base_url: Option<String>,
}

#[derive(Args, Debug)]
struct TuningArgs {
    /// Simultaneous tile requests
    #[arg(short, long)]
    threads: Option<usize>,

    /// Tile edge in pixels
    #[arg(long)]
    tile_size: Option<usize>,

    /// Per-request timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Retries for timeouts and server errors
    #[arg(long)]
    retries: Option<u32>,
}

impl TuningArgs {
    fn config(&self) -> DownloadConfig {
        let mut config = DownloadConfig::default();
        if let Some(threads) = self.threads {
            config.max_concurrency = threads;
        }
        if let Some(tile_size) = self.tile_size {
            config.max_tile_dim = tile_size;
        }
        if let Some(timeout) = self.timeout {
            config.request_timeout = Duration::from_secs(timeout);
        }
        if let Some(retries) = self.retries {
            config.max_retries = retries;
        }
        config
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let start_time = std::time::Instant::now();

    match cli.command {
        Command::Download(args) => download(args)?,
        Command::Estimate(args) => estimate(args)?,
        Command::Info(args) => service_info(args)?,
    }

    info!("Total processing time: {:?}", start_time.elapsed());

    Ok(())
}

fn download(args: DownloadArgs) -> Result<()> {
    let config = args.tuning.config();

    let mut client = ImageServerClient::new(&config)?;
    if let Some(url) = &args.base_url {
        client = client.with_base_url(args.dataset, url.as_str());
    }
    if let Some(url) = &args.tid_url {
        client = client.with_base_url(DatasetKind::Tid, url.as_str());
    }

    let request = DownloadRequest::new(
        args.area.bounds(),
        args.dataset,
        args.modes.iter().copied(),
        OutputTarget::from_path(&args.output),
    )
    .with_tiling(!args.no_tile);

    let handle = spawn_download(request, client, config)?;
    for event in handle.events().iter() {
        info!("[{:>5.1}%] {}: {}", event.percent, event.phase, event.message);
    }
    let results = handle.join()?;

    let mut failures = 0;
    for result in &results {
        println!(
            "{}\t{}\t{}\t{}",
            result.mode,
            result.status,
            result.output_path.display(),
            result.message
        );
        if result.status != AcquisitionStatus::Success {
            failures += 1;
        }
    }

    if failures > 0 {
        error!("{} of {} outputs did not complete", failures, results.len());
        anyhow::bail!("{} output(s) did not complete successfully", failures);
    }
    Ok(())
}

fn estimate(args: EstimateArgs) -> Result<()> {
    let config = args.tuning.config();
    let plan = DownloadPlan::new(&args.area.bounds(), DatasetKind::Gebco, !args.no_tile, &config)?;

    println!("Snapped bounds: {}", plan.snapped_bounds);
    println!("Pixel window:   {}", plan.window);
    println!("Pixel count:    {}", plan.pixel_count());
    println!(
        "Tiles:          {} ({} rows x {} cols of up to {} px)",
        plan.tile_count(),
        plan.tile_grid.0,
        plan.tile_grid.1,
        plan.tile_dim
    );
    Ok(())
}

fn service_info(args: InfoArgs) -> Result<()> {
    let mut client = ImageServerClient::new(&DownloadConfig::default())?;
    if let Some(url) = &args.base_url {
        client = client.with_base_url(args.dataset, url.as_str());
    }

    let info = client.service_info(args.dataset)?;
    println!("Service:    {}", client.base_url(args.dataset));
    println!("Name:       {}", info.name.as_deref().unwrap_or("-"));
    println!("Pixel type: {}", info.pixel_type.as_deref().unwrap_or("-"));
    if let (Some(x), Some(y)) = (info.pixel_size_x, info.pixel_size_y) {
        println!("Pixel size: {} x {} degrees", x, y);
    }
    if let Some(extent) = &info.extent {
        println!(
            "Extent:     {}, {}, {}, {}",
            extent.xmin, extent.ymin, extent.xmax, extent.ymax
        );
    }
    Ok(())
}
