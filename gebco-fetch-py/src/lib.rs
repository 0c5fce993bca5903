use gebco_fetch::acquisition::{request_download as run_download, AcquisitionResult};
use gebco_fetch::{
    AcquisitionError, CancellationToken, DatasetKind, DownloadConfig, DownloadPlan,
    DownloadRequest, GeographicBounds, ImageServerClient, OutputMode, OutputTarget,
    ProgressEvent,
};
use pyo3::prelude::*;

#[pymodule]
#[pyo3(name = "gebco_fetch")]
fn gebco_fetch_py(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyAcquisitionResult>()?;
    m.add_class::<PyCancellationToken>()?;
    m.add_function(wrap_pyfunction!(snap_bounds, m)?)?;
    m.add_function(wrap_pyfunction!(pixel_count, m)?)?;
    m.add_function(wrap_pyfunction!(request_download, m)?)?;
    Ok(())
}

#[pyclass(name = "AcquisitionResult")]
#[derive(Clone)]
pub struct PyAcquisitionResult {
    #[pyo3(get)]
    pub mode: String,
    #[pyo3(get)]
    pub output_path: String,
    #[pyo3(get)]
    pub status: String,
    #[pyo3(get)]
    pub message: String,
    /// (west, south, east, north) of every region that could not be fetched
    #[pyo3(get)]
    pub missing_regions: Vec<(f64, f64, f64, f64)>,
}

impl From<AcquisitionResult> for PyAcquisitionResult {
    fn from(result: AcquisitionResult) -> Self {
        PyAcquisitionResult {
            mode: result.mode.to_string(),
            output_path: result.output_path.display().to_string(),
            status: result.status.to_string(),
            message: result.message,
            missing_regions: result
                .missing_regions
                .iter()
                .map(|b| (b.west, b.south, b.east, b.north))
                .collect(),
        }
    }
}

#[pymethods]
impl PyAcquisitionResult {
    #[getter]
    fn ok(&self) -> bool {
        self.status == "success"
    }

    fn __repr__(&self) -> String {
        format!(
            "AcquisitionResult(mode='{}', status='{}', output_path='{}')",
            self.mode, self.status, self.output_path
        )
    }
}

/// Shared cancel switch; pass it to `request_download` and call `cancel()`
/// from another thread to stop the download.
#[pyclass(name = "CancellationToken")]
#[derive(Clone, Default)]
pub struct PyCancellationToken {
    inner: CancellationToken,
}

#[pymethods]
impl PyCancellationToken {
    #[new]
    fn new() -> Self {
        Self::default()
    }

    fn cancel(&self) {
        self.inner.cancel();
    }

    #[getter]
    fn cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    fn __repr__(&self) -> String {
        format!("CancellationToken(cancelled={})", self.inner.is_cancelled())
    }
}

fn value_error(err: impl std::fmt::Display) -> PyErr {
    PyErr::new::<pyo3::exceptions::PyValueError, _>(err.to_string())
}

fn acquisition_error(err: AcquisitionError) -> PyErr {
    match err {
        AcquisitionError::Io(e) => {
            PyErr::new::<pyo3::exceptions::PyIOError, _>(format!("Failed to prepare output: {}", e))
        }
        other => value_error(other),
    }
}

fn plan(
    west: f64,
    south: f64,
    east: f64,
    north: f64,
    tile_enabled: bool,
) -> PyResult<DownloadPlan> {
    DownloadPlan::new(
        &GeographicBounds::new(west, south, east, north),
        DatasetKind::Gebco,
        tile_enabled,
        &DownloadConfig::default(),
    )
    .map_err(acquisition_error)
}

/// Bounds expanded outward to the 15 arc-second grid.
#[pyfunction]
pub fn snap_bounds(west: f64, south: f64, east: f64, north: f64) -> PyResult<(f64, f64, f64, f64)> {
    let b = plan(west, south, east, north, true)?.snapped_bounds;
    Ok((b.west, b.south, b.east, b.north))
}

/// Number of pixels a download of these bounds delivers.
#[pyfunction]
pub fn pixel_count(west: f64, south: f64, east: f64, north: f64) -> PyResult<u64> {
    Ok(plan(west, south, east, north, true)?.pixel_count())
}

#[pyfunction]
#[pyo3(signature = (
    west, south, east, north, dataset, modes, output,
    tile_enabled=true, progress=None, cancel=None
))]
#[allow(clippy::too_many_arguments)]
pub fn request_download(
    py: Python<'_>,
    west: f64,
    south: f64,
    east: f64,
    north: f64,
    dataset: &str,
    modes: Vec<String>,
    output: &str,
    tile_enabled: bool,
    progress: Option<PyObject>,
    cancel: Option<PyRef<'_, PyCancellationToken>>,
) -> PyResult<Vec<PyAcquisitionResult>> {
    let cancel = cancel
        .map(|token| token.inner.clone())
        .unwrap_or_default();

    let dataset: DatasetKind = dataset.parse().map_err(value_error)?;
    let modes = modes
        .iter()
        .map(|m| m.parse::<OutputMode>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(value_error)?;

    let request = DownloadRequest::new(
        GeographicBounds::new(west, south, east, north),
        dataset,
        modes,
        OutputTarget::from_path(output),
    )
    .with_tiling(tile_enabled);

    let config = DownloadConfig::default();
    let client = ImageServerClient::new(&config).map_err(|e| {
        PyErr::new::<pyo3::exceptions::PyIOError, _>(format!("Failed to create HTTP client: {}", e))
    })?;

    let results = py.allow_threads(|| {
        let report = |event: ProgressEvent| {
            if let Some(callback) = &progress {
                Python::with_gil(|py| {
                    let args = (event.phase.to_string(), event.percent, event.message);
                    if let Err(err) = callback.call1(py, args) {
                        err.print(py);
                    }
                });
            }
        };
        run_download(&request, &client, &config, &report, &cancel)
    });

    results
        .map(|results| results.into_iter().map(PyAcquisitionResult::from).collect())
        .map_err(acquisition_error)
}
