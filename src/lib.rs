//! Tiled acquisition of GEBCO 2025 bathymetry and type-identifier rasters.
//!
//! A geographic box is snapped to the native 15 arc-second grid, fetched
//! from the GEBCO ImageServers in bounded tiles, stitched into one raster,
//! optionally masked by measurement source, and written as LZW GeoTIFF.

pub mod acquisition;
pub mod classify;
pub mod client;
pub mod config;
pub mod dataset;
pub mod error;
pub mod grid;
pub mod mosaic;
pub mod partition;
pub mod raster;
pub mod writer;

pub use acquisition::{
    request_download, spawn_download, AcquisitionResult, AcquisitionStatus, CancellationToken,
    DownloadHandle, DownloadPlan, DownloadRequest, OutputTarget, Phase, ProgressEvent,
};
pub use classify::{apply_mode, OutputMode};
pub use client::{ImageServerClient, ServiceInfo, TileSource};
pub use config::DownloadConfig;
pub use dataset::DatasetKind;
pub use error::{AcquisitionError, FetchError};
pub use grid::{GeographicBounds, GridSpec, PixelWindow};
pub use raster::{RasterBuffer, Sample};
pub use writer::GeoTiffWriter;
