use gebco_fetch::acquisition::resolve_output_paths;
use gebco_fetch::partition::TileRequest;
use gebco_fetch::writer::read_geotiff;
use gebco_fetch::{
    request_download, spawn_download, AcquisitionError, AcquisitionStatus, CancellationToken,
    DatasetKind, DownloadConfig, DownloadRequest, FetchError, GeographicBounds, OutputMode,
    OutputTarget, Phase, ProgressEvent, RasterBuffer, Sample, TileSource,
};
use gdal::Metadata;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn gdal_available() -> bool {
    gdal::DriverManager::get_driver_by_name("GTiff").is_ok()
}

/// Synthetic depth for an absolute grid cell.
fn depth(row: usize, col: usize) -> i64 {
    ((row * 7 + col * 3) % 2000) as i64 - 1500
}

/// Synthetic TID: land, multibeam and interpolated cells in a fixed pattern.
fn tid(row: usize, col: usize) -> i64 {
    match (row + col) % 3 {
        0 => 0,
        1 => 11,
        _ => 40,
    }
}

struct SyntheticSource {
    failing: HashSet<(DatasetKind, usize, usize)>,
    calls: Mutex<usize>,
}

impl SyntheticSource {
    fn new() -> Self {
        Self::failing(&[])
    }

    fn failing(tiles: &[(DatasetKind, usize, usize)]) -> Self {
        Self {
            failing: tiles.iter().copied().collect(),
            calls: Mutex::new(0),
        }
    }
}

impl TileSource for SyntheticSource {
    fn fetch_tile<T: Sample>(&self, request: &TileRequest) -> Result<RasterBuffer<T>, FetchError> {
        *self.calls.lock().unwrap() += 1;
        if self
            .failing
            .contains(&(request.dataset, request.tile_row, request.tile_col))
        {
            return Err(FetchError::Server {
                status: 503,
                message: "Service Unavailable".into(),
            });
        }

        let w = request.window;
        let mut data = Vec::with_capacity(w.width * w.height);
        for row in w.row_offset..w.row_end() {
            for col in w.col_offset..w.col_end() {
                let value = match request.dataset {
                    DatasetKind::Gebco => depth(row, col),
                    DatasetKind::Tid => tid(row, col),
                };
                data.push(T::try_from(value).ok().unwrap());
            }
        }
        Ok(RasterBuffer::from_vec(w, data).unwrap())
    }

    fn source_url(&self, dataset: DatasetKind) -> String {
        mirror_url(dataset)
    }
}

fn mirror_url(dataset: DatasetKind) -> String {
    format!("http://mirror.local/{}/ImageServer", dataset)
}

/// Blocks every fetch until the gate opens or its sender is dropped.
struct GatedSource {
    gate: Mutex<Receiver<()>>,
}

impl TileSource for GatedSource {
    fn fetch_tile<T: Sample>(&self, request: &TileRequest) -> Result<RasterBuffer<T>, FetchError> {
        let _ = self.gate.lock().unwrap().recv();
        Ok(RasterBuffer::filled_nodata(request.window))
    }
}

fn config() -> DownloadConfig {
    DownloadConfig {
        max_tile_dim: 500,
        ..DownloadConfig::default()
    }
}

fn biscay() -> GeographicBounds {
    GeographicBounds::new(-10.0, 40.0, -5.0, 45.0)
}

fn run(
    request: &DownloadRequest,
    source: &SyntheticSource,
) -> Vec<gebco_fetch::AcquisitionResult> {
    request_download(
        request,
        source,
        &config(),
        &|_| {},
        &CancellationToken::new(),
    )
    .unwrap()
}

fn tif_count(dir: &Path) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().map(|x| x == "tif").unwrap_or(false))
        .count()
}

#[test]
fn test_combined_and_bathymetry_end_to_end() {
    if !gdal_available() {
        eprintln!("Skipping test: GTiff driver not available");
        return;
    }
    let temp_dir = TempDir::new().unwrap();
    let request = DownloadRequest::new(
        biscay(),
        DatasetKind::Gebco,
        [OutputMode::Combined, OutputMode::BathymetryOnly],
        OutputTarget::Directory(temp_dir.path().to_path_buf()),
    );
    let source = SyntheticSource::new();

    let results = run(&request, &source);

    assert_eq!(results.len(), 2);
    assert!(results
        .iter()
        .all(|r| r.status == AcquisitionStatus::Success));
    assert_eq!(tif_count(temp_dir.path()), 2);
    // 9 bathymetry tiles and 9 TID tiles
    assert_eq!(*source.calls.lock().unwrap(), 18);

    let window = DatasetKind::Gebco.grid().bounds_to_window(&biscay());
    let combined = read_geotiff::<i16>(&results[0].output_path).unwrap();
    let bathymetry = read_geotiff::<i16>(&results[1].output_path).unwrap();

    for file in [&combined, &bathymetry] {
        assert_eq!(file.size, (1200, 1200));
        assert_eq!((file.size.0 * file.size.1) as u64, window.pixel_count());
    }

    for row in 0..1200 {
        for col in 0..1200 {
            let i = row * 1200 + col;
            let (grid_row, grid_col) = (row + window.row_offset, col + window.col_offset);
            assert_eq!(combined.data[i] as i64, depth(grid_row, grid_col));
            if tid(grid_row, grid_col) == 0 {
                assert_eq!(bathymetry.data[i], i16::NODATA);
            } else {
                assert_eq!(bathymetry.data[i], combined.data[i]);
            }
        }
    }
}

#[test]
fn test_combined_only_skips_tid() {
    if !gdal_available() {
        eprintln!("Skipping test: GTiff driver not available");
        return;
    }
    let temp_dir = TempDir::new().unwrap();
    let request = DownloadRequest::new(
        GeographicBounds::new(-10.0, 40.0, -9.0, 41.0),
        DatasetKind::Gebco,
        [OutputMode::Combined],
        OutputTarget::File(temp_dir.path().join("area.tif")),
    );
    let source = SyntheticSource::new();

    let results = run(&request, &source);

    assert_eq!(results[0].status, AcquisitionStatus::Success);
    assert_eq!(results[0].output_path, temp_dir.path().join("area.tif"));
    // 240 x 240 fits one tile
    assert_eq!(*source.calls.lock().unwrap(), 1);

    // provenance names the endpoint that actually served the tiles
    let dataset = gdal::Dataset::open(&results[0].output_path).unwrap();
    assert_eq!(
        dataset.metadata_item("SOURCE_URL", ""),
        Some(mirror_url(DatasetKind::Gebco))
    );
}

#[test]
fn test_failed_tile_is_reported_as_missing_region() {
    if !gdal_available() {
        eprintln!("Skipping test: GTiff driver not available");
        return;
    }
    let temp_dir = TempDir::new().unwrap();
    let request = DownloadRequest::new(
        biscay(),
        DatasetKind::Gebco,
        [OutputMode::Combined, OutputMode::LandOnly],
        OutputTarget::Directory(temp_dir.path().to_path_buf()),
    );
    let source = SyntheticSource::failing(&[(DatasetKind::Gebco, 1, 1)]);

    let results = run(&request, &source);

    let grid = DatasetKind::Gebco.grid();
    let window = grid.bounds_to_window(&biscay());
    let centre = grid.window_to_bounds(&gebco_fetch::PixelWindow::new(
        window.col_offset + 500,
        window.row_offset + 500,
        500,
        500,
    ));

    for result in &results {
        assert_eq!(result.status, AcquisitionStatus::PartialFailure);
        assert_eq!(result.missing_regions.len(), 1);
        let region = result.missing_regions[0];
        assert!(region.contains(&centre, 1e-9) && centre.contains(&region, 1e-9));
        assert!(result.output_path.exists());
    }

    let combined = read_geotiff::<i16>(&results[0].output_path).unwrap();
    assert_eq!(combined.data[600 * 1200 + 600], i16::NODATA);
    assert_eq!(combined.data[0] as i64, depth(window.row_offset, window.col_offset));
}

#[test]
fn test_missing_tid_tile_only_affects_filtered_modes() {
    if !gdal_available() {
        eprintln!("Skipping test: GTiff driver not available");
        return;
    }
    let temp_dir = TempDir::new().unwrap();
    let request = DownloadRequest::new(
        biscay(),
        DatasetKind::Gebco,
        [OutputMode::Combined, OutputMode::BathymetryOnly],
        OutputTarget::Directory(temp_dir.path().to_path_buf()),
    );
    let source = SyntheticSource::failing(&[(DatasetKind::Tid, 0, 0)]);

    let results = run(&request, &source);

    assert_eq!(results[0].mode, OutputMode::Combined);
    assert_eq!(results[0].status, AcquisitionStatus::Success);
    assert_eq!(results[1].status, AcquisitionStatus::PartialFailure);

    let bathymetry = read_geotiff::<i16>(&results[1].output_path).unwrap();
    // Inside the missing TID tile every cell is unclassifiable
    assert!((0..500).all(|col| bathymetry.data[col] == i16::NODATA));
}

#[test]
fn test_total_failure_writes_nothing() {
    let temp_dir = TempDir::new().unwrap();
    let request = DownloadRequest::new(
        GeographicBounds::new(-10.0, 40.0, -9.0, 41.0),
        DatasetKind::Gebco,
        [OutputMode::Combined, OutputMode::LandOnly],
        OutputTarget::Directory(temp_dir.path().to_path_buf()),
    );
    let source = SyntheticSource::failing(&[(DatasetKind::Gebco, 0, 0)]);

    let results = run(&request, &source);

    assert_eq!(results.len(), 2);
    for result in &results {
        assert_eq!(result.status, AcquisitionStatus::Failure);
        assert!(!result.output_path.exists());
    }
    assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    // The TID grid is not fetched when the primary fails
    assert_eq!(*source.calls.lock().unwrap(), 1);
}

#[test]
fn test_write_failure_is_isolated_per_mode() {
    if !gdal_available() {
        eprintln!("Skipping test: GTiff driver not available");
        return;
    }
    let temp_dir = TempDir::new().unwrap();
    let request = DownloadRequest::new(
        GeographicBounds::new(-10.0, 40.0, -9.0, 41.0),
        DatasetKind::Gebco,
        [OutputMode::Combined, OutputMode::LandOnly],
        OutputTarget::File(temp_dir.path().join("area.tif")),
    );
    // A directory in the way of the land output
    let paths = resolve_output_paths(&request, "unused");
    fs::create_dir(&paths[1].1).unwrap();

    let results = run(&request, &SyntheticSource::new());

    assert_eq!(results[0].status, AcquisitionStatus::Success);
    assert!(results[0].output_path.is_file());
    assert_eq!(results[1].status, AcquisitionStatus::Failure);
    assert!(results[1].output_path.is_dir());
}

#[test]
fn test_cancellation_during_fetch() {
    let temp_dir = TempDir::new().unwrap();
    let request = DownloadRequest::new(
        biscay(),
        DatasetKind::Gebco,
        [OutputMode::Combined, OutputMode::DirectMeasurementsOnly],
        OutputTarget::Directory(temp_dir.path().to_path_buf()),
    );
    let source = SyntheticSource::new();
    let cancel = CancellationToken::new();

    let results = request_download(
        &request,
        &source,
        &DownloadConfig {
            max_concurrency: 2,
            ..config()
        },
        &|_| cancel.cancel(),
        &cancel,
    )
    .unwrap();

    assert!(results
        .iter()
        .all(|r| r.status == AcquisitionStatus::Cancelled));
    assert_eq!(*source.calls.lock().unwrap(), 2);
    assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 0);
}

#[test]
fn test_cancelling_a_spawned_download() {
    let temp_dir = TempDir::new().unwrap();
    let request = DownloadRequest::new(
        biscay(),
        DatasetKind::Gebco,
        [OutputMode::Combined, OutputMode::LandOnly],
        OutputTarget::Directory(temp_dir.path().to_path_buf()),
    );
    let (open_gate, gate) = mpsc::channel();
    let source = GatedSource {
        gate: Mutex::new(gate),
    };
    let serial = DownloadConfig {
        max_concurrency: 1,
        ..config()
    };

    let handle = spawn_download(request, source, serial).unwrap();
    let token = handle.cancellation_token();
    assert!(!token.is_cancelled());

    handle.cancel();
    assert!(token.is_cancelled());
    assert!(handle.cancellation_token().is_cancelled());
    // release the tile that may already be in flight
    drop(open_gate);

    let deadline = Instant::now() + Duration::from_secs(10);
    while !handle.is_finished() {
        assert!(Instant::now() < deadline, "download did not stop");
        thread::sleep(Duration::from_millis(10));
    }
    let results = handle.join().unwrap();

    assert_eq!(results.len(), 2);
    assert!(results
        .iter()
        .all(|r| r.status == AcquisitionStatus::Cancelled));
    assert_eq!(tif_count(temp_dir.path()), 0);
}

#[test]
fn test_progress_phases_are_ordered() {
    if !gdal_available() {
        eprintln!("Skipping test: GTiff driver not available");
        return;
    }
    let temp_dir = TempDir::new().unwrap();
    let request = DownloadRequest::new(
        GeographicBounds::new(-10.0, 40.0, -9.0, 41.0),
        DatasetKind::Gebco,
        [OutputMode::Combined, OutputMode::LandOnly],
        OutputTarget::Directory(temp_dir.path().to_path_buf()),
    );
    let events: Mutex<Vec<ProgressEvent>> = Mutex::new(Vec::new());

    request_download(
        &request,
        &SyntheticSource::new(),
        &config(),
        &|e| events.lock().unwrap().push(e),
        &CancellationToken::new(),
    )
    .unwrap();

    let events = events.into_inner().unwrap();
    assert!(events
        .windows(2)
        .all(|pair| pair[0].percent <= pair[1].percent));
    assert_eq!(events.first().map(|e| e.phase), Some(Phase::Fetching));
    assert!(events.iter().any(|e| e.phase == Phase::Masking));
    let last = events.last().unwrap();
    assert_eq!(last.phase, Phase::Writing);
    assert_eq!(last.percent, 100.0);
}

#[test]
fn test_spawned_download_streams_events() {
    if !gdal_available() {
        eprintln!("Skipping test: GTiff driver not available");
        return;
    }
    let temp_dir = TempDir::new().unwrap();
    let request = DownloadRequest::new(
        GeographicBounds::new(-10.0, 40.0, -9.0, 41.0),
        DatasetKind::Tid,
        [OutputMode::Combined],
        OutputTarget::Directory(temp_dir.path().to_path_buf()),
    );

    let handle = spawn_download(request, SyntheticSource::new(), config()).unwrap();
    let events: Vec<ProgressEvent> = handle.events().iter().collect();
    let results = handle.join().unwrap();

    assert!(!events.is_empty());
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, AcquisitionStatus::Success);
    let name = results[0].output_path.file_name().unwrap().to_string_lossy();
    assert!(name.starts_with("GEBCO_2025_TID_"));

    let tid_file = read_geotiff::<i8>(&results[0].output_path).unwrap();
    assert_eq!(tid_file.size, (240, 240));
    assert_eq!(tid_file.nodata, Some(-128.0));
}

#[test]
fn test_preconditions_fail_before_any_fetch() {
    let temp_dir = TempDir::new().unwrap();
    let source = SyntheticSource::new();
    let target = OutputTarget::Directory(temp_dir.path().join("never_created"));

    let inverted = DownloadRequest::new(
        GeographicBounds::new(-5.0, 40.0, -10.0, 45.0),
        DatasetKind::Gebco,
        [OutputMode::Combined],
        target.clone(),
    );
    let too_large = DownloadRequest::new(
        GeographicBounds::new(-180.0, -90.0, 180.0, 90.0),
        DatasetKind::Gebco,
        [OutputMode::Combined],
        target.clone(),
    )
    .with_tiling(false);
    let bad_config = DownloadConfig {
        max_concurrency: 0,
        ..config()
    };

    let cancel = CancellationToken::new();
    assert!(matches!(
        request_download(&inverted, &source, &config(), &|_| {}, &cancel),
        Err(AcquisitionError::InvalidBounds { .. })
    ));
    assert!(matches!(
        request_download(&too_large, &source, &config(), &|_| {}, &cancel),
        Err(AcquisitionError::WindowTooLarge { .. })
    ));
    assert!(matches!(
        request_download(
            &DownloadRequest::new(biscay(), DatasetKind::Gebco, [OutputMode::Combined], target),
            &source,
            &bad_config,
            &|_| {},
            &cancel
        ),
        Err(AcquisitionError::InvalidConfig(_))
    ));

    assert_eq!(*source.calls.lock().unwrap(), 0);
    assert!(!temp_dir.path().join("never_created").exists());
}
