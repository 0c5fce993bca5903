//! Type-identifier (TID) based masking of bathymetry rasters.
//!
//! Every GEBCO cell carries a TID describing where its value came from:
//! `0` is land, `10..=20` are direct measurements (singlebeam, multibeam,
//! lidar, ...), `44` and `70` are sources of unknown type. Each
//! [`OutputMode`] keeps the cells whose TID satisfies its predicate and sets
//! every other cell to the bathymetry no-data value.

use std::fmt;
use std::str::FromStr;

use crate::raster::{RasterBuffer, Sample};

/// TID of land cells.
pub const TID_LAND: i8 = 0;
/// Inclusive TID range of direct measurements.
pub const TID_DIRECT: std::ops::RangeInclusive<i8> = 10..=20;
/// TIDs of measurements whose source type is unknown.
pub const TID_UNKNOWN: [i8; 2] = [44, 70];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OutputMode {
    /// Bathymetry and land, unfiltered.
    Combined,
    /// Cells with TID != 0.
    BathymetryOnly,
    /// Cells with TID == 0.
    LandOnly,
    /// Cells with TID in 10..=20.
    DirectMeasurementsOnly,
    /// Cells with TID in 10..=20, 44 or 70.
    DirectAndUnknownOnly,
}

impl OutputMode {
    pub const ALL: [OutputMode; 5] = [
        OutputMode::Combined,
        OutputMode::BathymetryOnly,
        OutputMode::LandOnly,
        OutputMode::DirectMeasurementsOnly,
        OutputMode::DirectAndUnknownOnly,
    ];

    /// Short token used in file names and on the command line.
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputMode::Combined => "combined",
            OutputMode::BathymetryOnly => "bathymetry",
            OutputMode::LandOnly => "land",
            OutputMode::DirectMeasurementsOnly => "direct",
            OutputMode::DirectAndUnknownOnly => "direct_unknown",
        }
    }

    /// Whether this mode needs the TID grid.
    pub fn requires_tid(&self) -> bool {
        *self != OutputMode::Combined
    }

    /// Whether a cell with type identifier `tid` is kept.
    ///
    /// A TID equal to the TID no-data value is never kept by a filtering
    /// mode, since its source is unknown to us.
    pub fn keeps(&self, tid: i8) -> bool {
        if *self != OutputMode::Combined && tid == i8::NODATA {
            return false;
        }
        match self {
            OutputMode::Combined => true,
            OutputMode::BathymetryOnly => tid != TID_LAND,
            OutputMode::LandOnly => tid == TID_LAND,
            OutputMode::DirectMeasurementsOnly => TID_DIRECT.contains(&tid),
            OutputMode::DirectAndUnknownOnly => {
                TID_DIRECT.contains(&tid) || TID_UNKNOWN.contains(&tid)
            }
        }
    }
}

impl fmt::Display for OutputMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "combined" => Ok(OutputMode::Combined),
            "bathymetry" | "bathymetry_only" => Ok(OutputMode::BathymetryOnly),
            "land" | "land_only" => Ok(OutputMode::LandOnly),
            "direct" | "direct_measurements_only" => Ok(OutputMode::DirectMeasurementsOnly),
            "direct_unknown" | "direct_unknown_measurements_only" => {
                Ok(OutputMode::DirectAndUnknownOnly)
            }
            other => Err(format!(
                "unknown output mode '{}' (expected combined, bathymetry, land, direct or direct_unknown)",
                other
            )),
        }
    }
}

/// Derives the `mode` variant of a bathymetry raster.
///
/// Always returns a new buffer; the inputs are left untouched so several
/// modes can be derived from one fetched pair. Cells that are no-data in the
/// bathymetry stay no-data in every mode.
///
/// # Panics
/// Panics if `mode` needs a TID raster and none is given, or if the two
/// rasters do not cover the same window. Both come from the same request
/// window, so either case is a bug in the caller.
pub fn apply_mode<T: Sample>(
    bathymetry: &RasterBuffer<T>,
    tid: Option<&RasterBuffer<i8>>,
    mode: OutputMode,
) -> RasterBuffer<T> {
    if !mode.requires_tid() {
        return bathymetry.clone();
    }

    let tid = match tid {
        Some(tid) => tid,
        None => panic!("output mode {} requires a TID raster", mode),
    };
    assert_eq!(
        bathymetry.window(),
        tid.window(),
        "bathymetry and TID rasters cover different windows"
    );

    let codes = tid.data();
    bathymetry.map_indexed(|value, i| {
        if mode.keeps(codes[i]) {
            value
        } else {
            T::NODATA
        }
    })
}
