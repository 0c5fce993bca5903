use anyhow::{Context, Result};
use gdal::cpl::CslStringList;
use gdal::raster::Buffer;
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager, Metadata};
use std::fs;
use std::path::{Path, PathBuf};

use crate::classify::OutputMode;
use crate::dataset::{DatasetKind, GEBCO_ATTRIBUTION};
use crate::raster::{RasterBuffer, Sample};

/// Georeferencing and provenance written alongside the samples.
#[derive(Debug, Clone)]
pub struct RasterMetadata {
    /// GDAL affine transform: `[west, cell, 0, north, 0, -cell]`.
    pub geo_transform: [f64; 6],
    pub epsg: u32,
    pub dataset: DatasetKind,
    pub mode: OutputMode,
    pub source_url: String,
}

/// A GeoTIFF read back from disk.
#[derive(Debug, Clone)]
pub struct GeoTiffContents<T> {
    /// (cols, rows)
    pub size: (usize, usize),
    pub geo_transform: [f64; 6],
    pub nodata: Option<f64>,
    pub projection: String,
    pub data: Vec<T>,
}

#[derive(Default)]
pub struct GeoTiffWriter {}

impl GeoTiffWriter {
    pub fn new() -> Self {
        Self {}
    }

    /// Writes `raster` as a single-band LZW GeoTIFF at `output_path`.
    ///
    /// The file is produced under a temporary sibling name and renamed into
    /// place once GDAL has closed it, so `output_path` either holds a
    /// complete file or is untouched.
    pub fn write<T: Sample>(
        &self,
        raster: &RasterBuffer<T>,
        metadata: &RasterMetadata,
        output_path: &Path,
    ) -> Result<()> {
        let partial_path = partial_path(output_path);

        let written = self.write_standard(raster, metadata, &partial_path);
        if let Err(err) = written {
            let _ = fs::remove_file(&partial_path);
            return Err(err);
        }

        if let Err(err) = fs::rename(&partial_path, output_path) {
            let _ = fs::remove_file(&partial_path);
            return Err(err).with_context(|| {
                format!("Failed to move GeoTIFF into place at {}", output_path.display())
            });
        }

        tracing::info!(
            "Written GeoTIFF: {} ({} x {} pixels)",
            output_path.display(),
            raster.width(),
            raster.height()
        );
        Ok(())
    }

    fn write_standard<T: Sample>(
        &self,
        raster: &RasterBuffer<T>,
        metadata: &RasterMetadata,
        output_path: &Path,
    ) -> Result<()> {
        let driver =
            DriverManager::get_driver_by_name("GTiff").context("Failed to get GTiff driver")?;

        let mut options = CslStringList::new();
        options
            .set_name_value("COMPRESS", "LZW")
            .context("Failed to set COMPRESS option")?;
        options
            .set_name_value("TILED", "YES")
            .context("Failed to set TILED option")?;

        let (cols, rows) = raster.size();
        let mut dataset = driver
            .create_with_band_type_with_options::<T, _>(output_path, cols, rows, 1, &options)
            .context("Failed to create dataset")?;

        self.set_geo_metadata(&mut dataset, metadata)?;

        let mut band = dataset.rasterband(1).context("Failed to get raster band")?;

        let nodata: i64 = T::NODATA.into();
        band.set_no_data_value(Some(nodata as f64))
            .context("Failed to set no data value")?;

        // row-major, top row first
        let mut buffer = Buffer::new((cols, rows), raster.data().to_vec());
        band.write((0, 0), (cols, rows), &mut buffer)
            .context("Failed to write raster data")?;

        // Drop closes the dataset and flushes it to disk
        drop(band);
        drop(dataset);
        Ok(())
    }

    fn set_geo_metadata(&self, dataset: &mut Dataset, metadata: &RasterMetadata) -> Result<()> {
        dataset
            .set_geo_transform(&metadata.geo_transform)
            .context("Failed to set geo transform")?;

        let srs = SpatialRef::from_epsg(metadata.epsg)
            .context(format!("Failed to create SpatialRef from EPSG:{}", metadata.epsg))?;
        let wkt = srs
            .to_wkt()
            .context("Failed to convert SpatialRef to WKT")?;
        dataset
            .set_projection(&wkt)
            .context("Failed to set projection")?;

        dataset
            .set_metadata_item("DATASET", metadata.dataset.file_stem(), "")
            .context("Failed to set dataset metadata")?;
        dataset
            .set_metadata_item("OUTPUT_MODE", metadata.mode.as_str(), "")
            .context("Failed to set output mode metadata")?;
        dataset
            .set_metadata_item("SOURCE_URL", &metadata.source_url, "")
            .context("Failed to set source url metadata")?;
        dataset
            .set_metadata_item("ATTRIBUTION", GEBCO_ATTRIBUTION, "")
            .context("Failed to set attribution metadata")?;

        Ok(())
    }
}

/// Reads band 1 of a GeoTIFF with its georeferencing.
pub fn read_geotiff<T: Sample>(path: &Path) -> Result<GeoTiffContents<T>> {
    let dataset = Dataset::open(path).context(format!("Failed to open {}", path.display()))?;
    let size = dataset.raster_size();
    let geo_transform = dataset
        .geo_transform()
        .context("Failed to read geo transform")?;
    let projection = dataset.projection();

    let band = dataset.rasterband(1).context("Failed to get raster band")?;
    let nodata = band.no_data_value();
    let buffer = band
        .read_as::<T>((0, 0), size, size, None)
        .context("Failed to read raster data")?;

    Ok(GeoTiffContents {
        size,
        geo_transform,
        nodata,
        projection,
        data: buffer.data().to_vec(),
    })
}

fn partial_path(output_path: &Path) -> PathBuf {
    let file_name = output_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output.tif".to_string());
    output_path.with_file_name(format!(".{}.partial", file_name))
}
