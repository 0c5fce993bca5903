//! ArcGIS ImageServer client for raw tile exports.
//!
//! Tiles are requested with `exportImage` as uncompressed-sample TIFFs in
//! the dataset's native pixel type, with a bounding box taken from the tile's
//! pixel window so the service returns native grid cells untouched.
//!
//! Timeouts, connection failures, HTTP 5xx and HTTP 429 are retried with a
//! capped exponential backoff. Other HTTP errors and undecodable payloads
//! are returned immediately.

use std::io::Cursor;

use serde::Deserialize;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tracing::{debug, warn};

use crate::config::DownloadConfig;
use crate::dataset::DatasetKind;
use crate::error::FetchError;
use crate::grid::PixelWindow;
use crate::partition::TileRequest;
use crate::raster::{RasterBuffer, Sample};

const USER_AGENT: &str = concat!("gebco-fetch/", env!("CARGO_PKG_VERSION"));

/// Longest error body kept in a [`FetchError::Server`] message.
const MAX_ERROR_BODY: usize = 512;

/// Anything that can deliver the raster for one tile request.
pub trait TileSource: Sync {
    /// Fetches one tile, decoded to exactly `request.window`'s shape.
    fn fetch_tile<T: Sample>(&self, request: &TileRequest) -> Result<RasterBuffer<T>, FetchError>;

    /// Endpoint the tiles of `dataset` come from, recorded in output metadata.
    fn source_url(&self, dataset: DatasetKind) -> String {
        dataset.service_url().to_string()
    }
}

/// Metadata advertised by an ImageServer at `{base}?f=json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub extent: Option<ServiceExtent>,
    #[serde(default)]
    pub pixel_size_x: Option<f64>,
    #[serde(default)]
    pub pixel_size_y: Option<f64>,
    #[serde(default)]
    pub pixel_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceExtent {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

/// Blocking HTTP client for the GEBCO ImageServers.
pub struct ImageServerClient {
    client: reqwest::blocking::Client,
    gebco_url: String,
    tid_url: String,
    config: DownloadConfig,
}

impl std::fmt::Debug for ImageServerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageServerClient")
            .field("gebco_url", &self.gebco_url)
            .field("tid_url", &self.tid_url)
            .field("max_retries", &self.config.max_retries)
            .finish()
    }
}

impl ImageServerClient {
    /// Create a client for the public GEBCO 2025 services.
    pub fn new(config: &DownloadConfig) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            gebco_url: DatasetKind::Gebco.service_url().to_string(),
            tid_url: DatasetKind::Tid.service_url().to_string(),
            config: config.clone(),
        })
    }

    /// Point one dataset at another ImageServer (a mirror, or a test server).
    pub fn with_base_url(mut self, dataset: DatasetKind, url: impl Into<String>) -> Self {
        let url = url.into().trim_end_matches('/').to_string();
        match dataset {
            DatasetKind::Gebco => self.gebco_url = url,
            DatasetKind::Tid => self.tid_url = url,
        }
        self
    }

    pub fn base_url(&self, dataset: DatasetKind) -> &str {
        match dataset {
            DatasetKind::Gebco => &self.gebco_url,
            DatasetKind::Tid => &self.tid_url,
        }
    }

    /// Fetch the service description of `dataset`.
    pub fn service_info(&self, dataset: DatasetKind) -> Result<ServiceInfo, FetchError> {
        let url = self.base_url(dataset).to_string();
        self.with_retry(&url, || {
            let response = self.client.get(&url).query(&[("f", "json")]).send()?;
            let bytes = read_success_body(response)?;
            serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()))
        })
    }

    /// Query parameters of the `exportImage` call for one tile.
    pub fn export_params<T: Sample>(request: &TileRequest) -> Vec<(&'static str, String)> {
        let bounds = request.dataset.grid().window_to_bounds(&request.window);
        let epsg = request.dataset.grid().epsg.to_string();
        let nodata: i64 = T::NODATA.into();

        vec![
            (
                "bbox",
                format!(
                    "{},{},{},{}",
                    bounds.west, bounds.south, bounds.east, bounds.north
                ),
            ),
            ("bboxSR", epsg.clone()),
            ("imageSR", epsg),
            (
                "size",
                format!("{},{}", request.window.width, request.window.height),
            ),
            ("format", "tiff".to_string()),
            ("pixelType", T::PIXEL_TYPE.to_string()),
            ("noData", nodata.to_string()),
            ("interpolation", "RSP_NearestNeighbor".to_string()),
            ("f", "image".to_string()),
        ]
    }

    fn fetch_once<T: Sample>(&self, request: &TileRequest) -> Result<RasterBuffer<T>, FetchError> {
        let url = format!("{}/exportImage", self.base_url(request.dataset));
        let response = self
            .client
            .get(&url)
            .query(&Self::export_params::<T>(request))
            .send()?;
        let bytes = read_success_body(response)?;
        if let Some(err) = embedded_service_error(&bytes) {
            return Err(err);
        }

        debug!(
            tile_row = request.tile_row,
            tile_col = request.tile_col,
            bytes = bytes.len(),
            "Received tile payload"
        );

        decode_tiff(&bytes, request.window)
    }

    fn with_retry<R>(
        &self,
        label: &str,
        mut op: impl FnMut() -> Result<R, FetchError>,
    ) -> Result<R, FetchError> {
        let mut retries = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && retries < self.config.max_retries => {
                    retries += 1;
                    let delay = self.config.retry_delay(retries);
                    warn!(
                        error = %err,
                        retry = retries,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "{} failed, retrying",
                        label
                    );
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl TileSource for ImageServerClient {
    fn fetch_tile<T: Sample>(&self, request: &TileRequest) -> Result<RasterBuffer<T>, FetchError> {
        let label = format!(
            "{} tile ({}, {})",
            request.dataset, request.tile_row, request.tile_col
        );
        self.with_retry(&label, || self.fetch_once(request))
    }

    fn source_url(&self, dataset: DatasetKind) -> String {
        self.base_url(dataset).to_string()
    }
}

fn read_success_body(response: reqwest::blocking::Response) -> Result<Vec<u8>, FetchError> {
    let status = response.status();
    if !status.is_success() {
        let mut message = response.text().unwrap_or_default();
        if message.len() > MAX_ERROR_BODY {
            let mut end = MAX_ERROR_BODY;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        return Err(FetchError::Server {
            status: status.as_u16(),
            message,
        });
    }
    Ok(response.bytes()?.to_vec())
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: u16,
    #[serde(default)]
    message: String,
}

/// ArcGIS reports many failures as HTTP 200 with a JSON `error` object.
fn embedded_service_error(bytes: &[u8]) -> Option<FetchError> {
    if bytes.first() != Some(&b'{') {
        return None;
    }
    let envelope: ErrorEnvelope = serde_json::from_slice(bytes).ok()?;
    Some(FetchError::Server {
        status: envelope.error.code,
        message: envelope.error.message,
    })
}

/// Decodes a single-band TIFF payload into a raster for `window`.
///
/// Integer payloads of any width are accepted as long as every sample fits
/// `T`. Floating-point data, a size other than the window's, or extra bands
/// are rejected.
pub fn decode_tiff<T: Sample>(
    bytes: &[u8],
    window: PixelWindow,
) -> Result<RasterBuffer<T>, FetchError> {
    let mut decoder = Decoder::new(Cursor::new(bytes))?.with_limits(Limits::unlimited());

    let (width, height) = decoder.dimensions()?;
    if width as usize != window.width || height as usize != window.height {
        return Err(FetchError::Decode(format!(
            "expected {}x{} pixels, got {}x{}",
            window.width, window.height, width, height
        )));
    }

    let samples: Vec<T> = match decoder.read_image()? {
        DecodingResult::I8(data) => narrow(data.into_iter().map(i64::from))?,
        DecodingResult::U8(data) => narrow(data.into_iter().map(i64::from))?,
        DecodingResult::I16(data) => narrow(data.into_iter().map(i64::from))?,
        DecodingResult::U16(data) => narrow(data.into_iter().map(i64::from))?,
        DecodingResult::I32(data) => narrow(data.into_iter().map(i64::from))?,
        DecodingResult::U32(data) => narrow(data.into_iter().map(i64::from))?,
        DecodingResult::I64(data) => narrow(data.into_iter())?,
        DecodingResult::U64(data) => {
            narrow(data.into_iter().map(|v| i64::try_from(v).unwrap_or(i64::MAX)))?
        }
        DecodingResult::F32(_) | DecodingResult::F64(_) => {
            return Err(FetchError::Decode(format!(
                "floating-point samples where {} integers were requested",
                T::PIXEL_TYPE
            )))
        }
    };

    RasterBuffer::from_vec(window, samples).map_err(|samples| {
        FetchError::Decode(format!(
            "expected {} samples, got {} (multi-band payload?)",
            window.pixel_count(),
            samples.len()
        ))
    })
}

fn narrow<T: Sample>(values: impl Iterator<Item = i64>) -> Result<Vec<T>, FetchError> {
    values
        .map(|v| {
            T::try_from(v).map_err(|_| {
                FetchError::Decode(format!(
                    "sample value {} does not fit pixel type {}",
                    v,
                    T::PIXEL_TYPE
                ))
            })
        })
        .collect()
}
