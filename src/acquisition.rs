//! One download request, end to end: validate, fetch, mask, write.
//!
//! [`request_download`] is the single entry point. It takes an immutable
//! [`DownloadRequest`], checks every precondition before touching the
//! network, assembles the primary raster (and the TID raster when a mode
//! needs it), derives one raster per requested [`OutputMode`] and writes each
//! to its own GeoTIFF. Failures after the preconditions are reported per
//! output in the returned [`AcquisitionResult`]s.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use crate::classify::{apply_mode, OutputMode};
use crate::client::TileSource;
use crate::config::DownloadConfig;
use crate::dataset::DatasetKind;
use crate::error::AcquisitionError;
use crate::grid::{GeographicBounds, PixelWindow};
use crate::mosaic::{Assembled, FailedTile, MosaicAssembler};
use crate::partition::{partition, tile_grid_shape, TileRequest};
use crate::raster::{RasterBuffer, Sample};
use crate::writer::{GeoTiffWriter, RasterMetadata};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

const FETCH_END: f64 = 70.0;
const WRITE_END: f64 = 100.0;

/// Cooperative cancellation flag shared between a caller and a running download.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fetching,
    Masking,
    Writing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Fetching => "fetching",
            Phase::Masking => "masking",
            Phase::Writing => "writing",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub phase: Phase,
    /// Overall completion of the request, 0 to 100.
    pub percent: f64,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionStatus {
    Success,
    PartialFailure,
    Failure,
    Cancelled,
}

impl fmt::Display for AcquisitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AcquisitionStatus::Success => "success",
            AcquisitionStatus::PartialFailure => "partial failure",
            AcquisitionStatus::Failure => "failure",
            AcquisitionStatus::Cancelled => "cancelled",
        })
    }
}

/// Outcome for one requested output file.
#[derive(Debug, Clone)]
pub struct AcquisitionResult {
    pub mode: OutputMode,
    /// Where the file was, or would have been, written.
    pub output_path: PathBuf,
    pub status: AcquisitionStatus,
    pub message: String,
    /// Geographic footprints of tiles that could not be fetched.
    pub missing_regions: Vec<GeographicBounds>,
}

/// Where output files go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Files are named `<stem>[_<mode>]_<timestamp>.tif` inside this directory.
    Directory(PathBuf),
    /// Explicit file path; with several modes `_<mode>` is inserted before the extension.
    File(PathBuf),
}

impl OutputTarget {
    /// Treats paths ending in `.tif`/`.tiff` as files, anything else as a directory.
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let is_tiff = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("tif") || ext.eq_ignore_ascii_case("tiff"))
            .unwrap_or(false);
        if is_tiff {
            OutputTarget::File(path)
        } else {
            OutputTarget::Directory(path)
        }
    }
}

/// Everything needed to run one download.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub bounds: GeographicBounds,
    pub dataset: DatasetKind,
    pub modes: BTreeSet<OutputMode>,
    pub output: OutputTarget,
    pub tile_enabled: bool,
}

impl DownloadRequest {
    pub fn new(
        bounds: GeographicBounds,
        dataset: DatasetKind,
        modes: impl IntoIterator<Item = OutputMode>,
        output: OutputTarget,
    ) -> Self {
        Self {
            bounds,
            dataset,
            modes: modes.into_iter().collect(),
            output,
            tile_enabled: true,
        }
    }

    pub fn with_tiling(mut self, tile_enabled: bool) -> Self {
        self.tile_enabled = tile_enabled;
        self
    }
}

/// The pixel footprint of a request, computed without any I/O.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadPlan {
    pub dataset: DatasetKind,
    pub window: PixelWindow,
    pub snapped_bounds: GeographicBounds,
    /// Edge length handed to the partitioner.
    pub tile_dim: usize,
    /// (rows, cols) of the tile grid.
    pub tile_grid: (usize, usize),
}

impl DownloadPlan {
    /// Validates `bounds` and `config` and resolves the pixel window.
    pub fn new(
        bounds: &GeographicBounds,
        dataset: DatasetKind,
        tile_enabled: bool,
        config: &DownloadConfig,
    ) -> Result<Self, AcquisitionError> {
        config.validate()?;
        bounds
            .validate()
            .map_err(|reason| AcquisitionError::InvalidBounds {
                bounds: *bounds,
                reason,
            })?;

        let grid = dataset.grid();
        let window = grid.bounds_to_window(bounds);

        if !tile_enabled
            && (window.width > config.max_single_request_dim
                || window.height > config.max_single_request_dim)
        {
            return Err(AcquisitionError::WindowTooLarge {
                width: window.width,
                height: window.height,
                max: config.max_single_request_dim,
            });
        }

        let tile_dim = if tile_enabled {
            config.max_tile_dim
        } else {
            window.width.max(window.height)
        };

        Ok(Self {
            dataset,
            window,
            snapped_bounds: grid.window_to_bounds(&window),
            tile_dim,
            tile_grid: tile_grid_shape(&window, tile_dim),
        })
    }

    pub fn pixel_count(&self) -> u64 {
        self.window.pixel_count()
    }

    pub fn tile_count(&self) -> usize {
        self.tile_grid.0 * self.tile_grid.1
    }

    pub fn tiles(&self, dataset: DatasetKind) -> Vec<TileRequest> {
        partition(&self.window, dataset, self.tile_dim)
    }
}

/// Runs `request` to completion on the calling thread.
///
/// Returns `Err` only for precondition failures, before any network I/O.
/// Everything after that is reported per output mode: a primary raster with
/// no fetched tile at all yields `Failure` for every mode and writes nothing.
pub fn request_download<S: TileSource>(
    request: &DownloadRequest,
    source: &S,
    config: &DownloadConfig,
    progress: &dyn Fn(ProgressEvent),
    cancel: &CancellationToken,
) -> Result<Vec<AcquisitionResult>, AcquisitionError> {
    if request.modes.is_empty() {
        return Err(AcquisitionError::NoModes);
    }
    if let Some(&mode) = request.modes.iter().find(|m| !request.dataset.supports(**m)) {
        return Err(AcquisitionError::UnsupportedMode {
            dataset: request.dataset,
            mode,
        });
    }

    let plan = DownloadPlan::new(&request.bounds, request.dataset, request.tile_enabled, config)?;

    if plan.window.width > config.large_request_warning_dim
        || plan.window.height > config.large_request_warning_dim
    {
        warn!(
            width = plan.window.width,
            height = plan.window.height,
            "Large request, this may take a long time and use a lot of memory"
        );
    }

    if let OutputTarget::Directory(dir) = &request.output {
        fs::create_dir_all(dir)?;
    }
    let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT).to_string();
    let outputs = resolve_output_paths(request, &timestamp);

    info!(
        dataset = %request.dataset,
        bounds = %request.bounds,
        window = %plan.window,
        pixels = plan.pixel_count(),
        tiles = plan.tile_count(),
        "Starting download"
    );

    let assembler = MosaicAssembler::new(config.max_concurrency)?;
    let run = Run {
        request,
        plan: &plan,
        assembler: &assembler,
        outputs: &outputs,
        progress,
        cancel,
    };

    let results = match request.dataset {
        DatasetKind::Gebco => run.execute::<i16, _>(source),
        DatasetKind::Tid => run.execute::<i8, _>(source),
    };

    for result in &results {
        info!(
            mode = %result.mode,
            status = %result.status,
            path = %result.output_path.display(),
            "{}",
            result.message
        );
    }
    Ok(results)
}

/// Output path for every requested mode, in mode order.
pub fn resolve_output_paths(
    request: &DownloadRequest,
    timestamp: &str,
) -> Vec<(OutputMode, PathBuf)> {
    let stem = request.dataset.file_stem();
    let single = request.modes.len() == 1;

    request
        .modes
        .iter()
        .map(|&mode| {
            let path = match &request.output {
                OutputTarget::Directory(dir) => {
                    let name = match request.dataset {
                        DatasetKind::Tid => format!("{}_{}.tif", stem, timestamp),
                        DatasetKind::Gebco => {
                            format!("{}_{}_{}.tif", stem, mode.as_str(), timestamp)
                        }
                    };
                    dir.join(name)
                }
                OutputTarget::File(path) if single => path.clone(),
                OutputTarget::File(path) => with_mode_suffix(path, mode),
            };
            (mode, path)
        })
        .collect()
}

fn with_mode_suffix(path: &Path, mode: OutputMode) -> PathBuf {
    let file_stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}_{}.{}", file_stem, mode.as_str(), ext.to_string_lossy()),
        None => format!("{}_{}", file_stem, mode.as_str()),
    };
    path.with_file_name(name)
}

/// Distinct geographic footprints of failed tiles.
fn missing_regions(dataset: DatasetKind, failed: &[&FailedTile]) -> Vec<GeographicBounds> {
    let grid = dataset.grid();
    let mut windows: Vec<PixelWindow> = Vec::new();
    for tile in failed {
        if !windows.contains(&tile.request.window) {
            windows.push(tile.request.window);
        }
    }
    windows.sort_by_key(|w| (w.row_offset, w.col_offset));
    windows.iter().map(|w| grid.window_to_bounds(w)).collect()
}

fn describe_regions(regions: &[GeographicBounds]) -> String {
    regions
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

struct Run<'a> {
    request: &'a DownloadRequest,
    plan: &'a DownloadPlan,
    assembler: &'a MosaicAssembler,
    outputs: &'a [(OutputMode, PathBuf)],
    progress: &'a dyn Fn(ProgressEvent),
    cancel: &'a CancellationToken,
}

impl Run<'_> {
    fn emit(&self, phase: Phase, percent: f64, message: String) {
        (self.progress)(ProgressEvent {
            phase,
            percent: percent.clamp(0.0, 100.0),
            message,
        });
    }

    fn all_with_status(&self, status: AcquisitionStatus, message: &str) -> Vec<AcquisitionResult> {
        self.outputs
            .iter()
            .map(|(mode, path)| AcquisitionResult {
                mode: *mode,
                output_path: path.clone(),
                status,
                message: message.to_string(),
                missing_regions: Vec::new(),
            })
            .collect()
    }

    fn fetch<T: Sample, S: TileSource>(
        &self,
        source: &S,
        dataset: DatasetKind,
        start: f64,
        end: f64,
    ) -> Assembled<T> {
        let tiles = self.plan.tiles(dataset);
        self.assembler
            .assemble::<T, S>(source, &tiles, self.plan.window, self.cancel, |done, total| {
                let percent = start + (end - start) * done as f64 / total as f64;
                self.emit(
                    Phase::Fetching,
                    percent,
                    format!("Fetched {} tile {}/{}", dataset, done, total),
                );
            })
    }

    fn execute<T: Sample, S: TileSource>(&self, source: &S) -> Vec<AcquisitionResult> {
        let needs_tid = self.request.modes.iter().any(|m| m.requires_tid());
        let primary_end = if needs_tid { FETCH_END / 2.0 } else { FETCH_END };

        let (primary, primary_failed) =
            match self.fetch::<T, S>(source, self.request.dataset, 0.0, primary_end) {
                Assembled::Complete(buffer) => (buffer, Vec::new()),
                Assembled::PartialFailure { buffer, failed } => (buffer, failed),
                Assembled::Failure { failed } => {
                    error!(tiles = failed.len(), "No tile could be fetched, nothing written");
                    let reason = failed
                        .first()
                        .map(|f| f.error.to_string())
                        .unwrap_or_default();
                    let all = failed.iter().collect::<Vec<_>>();
                    let regions = missing_regions(self.request.dataset, &all);
                    return self
                        .all_with_status(
                            AcquisitionStatus::Failure,
                            &format!("Download failed, no data received: {}", reason),
                        )
                        .into_iter()
                        .map(|mut r| {
                            r.missing_regions = regions.clone();
                            r
                        })
                        .collect();
                }
                Assembled::Cancelled => {
                    return self.all_with_status(
                        AcquisitionStatus::Cancelled,
                        "Cancelled before the download finished",
                    )
                }
            };

        let mut tid_failed = Vec::new();
        let tid = if needs_tid {
            if self.cancel.is_cancelled() {
                return self.all_with_status(
                    AcquisitionStatus::Cancelled,
                    "Cancelled before the type identifier grid was fetched",
                );
            }
            match self.fetch::<i8, S>(source, DatasetKind::Tid, primary_end, FETCH_END) {
                Assembled::Complete(buffer) => Some(buffer),
                Assembled::PartialFailure { buffer, failed } => {
                    tid_failed = failed;
                    Some(buffer)
                }
                Assembled::Failure { failed } => {
                    warn!(
                        tiles = failed.len(),
                        "Type identifier grid unavailable, filtered outputs will be empty"
                    );
                    tid_failed = failed;
                    Some(RasterBuffer::filled_nodata(self.plan.window))
                }
                Assembled::Cancelled => {
                    return self.all_with_status(
                        AcquisitionStatus::Cancelled,
                        "Cancelled before the type identifier grid was fetched",
                    )
                }
            }
        } else {
            None
        };

        let writer = GeoTiffWriter::new();
        let grid = self.request.dataset.grid();
        let count = self.outputs.len() as f64;
        let mut results = Vec::with_capacity(self.outputs.len());

        for (i, (mode, path)) in self.outputs.iter().enumerate() {
            let mode = *mode;
            if self.cancel.is_cancelled() {
                info!(mode = %mode, "Cancelled before writing");
                results.push(AcquisitionResult {
                    mode,
                    output_path: path.clone(),
                    status: AcquisitionStatus::Cancelled,
                    message: "Cancelled before this file was written".to_string(),
                    missing_regions: Vec::new(),
                });
                continue;
            }

            // each output gets an equal slice of the remaining range
            let slice = (WRITE_END - FETCH_END) / count;
            let slice_start = FETCH_END + slice * i as f64;
            self.emit(
                Phase::Masking,
                slice_start,
                format!("Applying {} mask", mode),
            );
            let masked = apply_mode(&primary, tid.as_ref(), mode);

            self.emit(
                Phase::Writing,
                slice_start + slice / 3.0,
                format!("Writing {}", path.display()),
            );
            let metadata = RasterMetadata {
                geo_transform: grid.geo_transform(&self.plan.window),
                epsg: grid.epsg,
                dataset: self.request.dataset,
                mode,
                source_url: source.source_url(self.request.dataset),
            };

            let result = match writer.write(&masked, &metadata, path) {
                Ok(()) => {
                    let mut failed: Vec<&FailedTile> = primary_failed.iter().collect();
                    if mode.requires_tid() {
                        failed.extend(tid_failed.iter());
                    }
                    let regions = missing_regions(self.request.dataset, &failed);
                    if regions.is_empty() {
                        AcquisitionResult {
                            mode,
                            output_path: path.clone(),
                            status: AcquisitionStatus::Success,
                            message: format!(
                                "Saved {} x {} pixels",
                                masked.width(),
                                masked.height()
                            ),
                            missing_regions: regions,
                        }
                    } else {
                        AcquisitionResult {
                            mode,
                            output_path: path.clone(),
                            status: AcquisitionStatus::PartialFailure,
                            message: format!(
                                "Saved with {} missing region(s): {}",
                                regions.len(),
                                describe_regions(&regions)
                            ),
                            missing_regions: regions,
                        }
                    }
                }
                Err(err) => {
                    error!(mode = %mode, path = %path.display(), "Write failed: {:#}", err);
                    AcquisitionResult {
                        mode,
                        output_path: path.clone(),
                        status: AcquisitionStatus::Failure,
                        message: format!("Write failed: {:#}", err),
                        missing_regions: Vec::new(),
                    }
                }
            };
            results.push(result);
        }

        self.emit(Phase::Writing, WRITE_END, "Done".to_string());
        results
    }
}

/// A download running on its own thread.
pub struct DownloadHandle {
    events: Receiver<ProgressEvent>,
    cancel: CancellationToken,
    thread: JoinHandle<Result<Vec<AcquisitionResult>, AcquisitionError>>,
}

impl DownloadHandle {
    /// Progress events; the channel closes when the download finishes.
    pub fn events(&self) -> &Receiver<ProgressEvent> {
        &self.events
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the download and returns its results.
    pub fn join(self) -> Result<Vec<AcquisitionResult>, AcquisitionError> {
        match self.thread.join() {
            Ok(results) => results,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Starts [`request_download`] on a dedicated thread.
pub fn spawn_download<S>(
    request: DownloadRequest,
    source: S,
    config: DownloadConfig,
) -> Result<DownloadHandle, AcquisitionError>
where
    S: TileSource + Send + 'static,
{
    let (sender, events) = mpsc::channel();
    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();

    let thread = thread::Builder::new()
        .name("gebco-download".to_string())
        .spawn(move || {
            let progress = move |event: ProgressEvent| {
                // The receiver may have been dropped; the download carries on.
                let _ = sender.send(event);
            };
            request_download(&request, &source, &config, &progress, &worker_cancel)
        })?;

    Ok(DownloadHandle {
        events,
        cancel,
        thread,
    })
}
