//! Geographic ↔ pixel arithmetic for fixed global grids.
//!
//! Rows increase southward from the grid origin (its top-left corner) and
//! columns increase eastward. A [`GeographicBounds`] is mapped to the
//! smallest [`PixelWindow`] whose footprint covers it, so a delivered
//! raster is never smaller than the requested area.
//!
//! Pixel edges are always computed as `origin ± index / cells_per_degree`,
//! both when snapping and when mapping a window back to degrees. Snapping
//! compares the requested coordinates against those same edge values, which
//! makes coverage exact and re-snapping a snapped box a no-op.

use std::fmt;

/// A WGS84 bounding box in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeographicBounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl GeographicBounds {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Self {
        Self {
            west,
            south,
            east,
            north,
        }
    }

    /// Checks the bounds invariants, returning the violated one.
    pub fn validate(&self) -> Result<(), &'static str> {
        let values = [self.west, self.south, self.east, self.north];
        if values.iter().any(|v| !v.is_finite()) {
            return Err("coordinates must be finite numbers");
        }
        if self.west >= self.east {
            return Err("west must be less than east");
        }
        if self.south >= self.north {
            return Err("south must be less than north");
        }
        if self.west < -180.0 || self.east > 180.0 {
            return Err("longitudes must lie within [-180, 180]");
        }
        if self.south < -90.0 || self.north > 90.0 {
            return Err("latitudes must lie within [-90, 90]");
        }
        Ok(())
    }

    /// True when `other` lies inside these bounds, allowing `tolerance` degrees.
    pub fn contains(&self, other: &GeographicBounds, tolerance: f64) -> bool {
        self.west <= other.west + tolerance
            && self.south <= other.south + tolerance
            && self.east >= other.east - tolerance
            && self.north >= other.north - tolerance
    }
}

impl fmt::Display for GeographicBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[W {:.6}, S {:.6}, E {:.6}, N {:.6}]",
            self.west, self.south, self.east, self.north
        )
    }
}

/// A rectangular region in pixel coordinates of a [`GridSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PixelWindow {
    pub col_offset: usize,
    pub row_offset: usize,
    pub width: usize,
    pub height: usize,
}

impl PixelWindow {
    pub fn new(col_offset: usize, row_offset: usize, width: usize, height: usize) -> Self {
        Self {
            col_offset,
            row_offset,
            width,
            height,
        }
    }

    /// Number of samples delivered for this window.
    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Exclusive end column.
    pub fn col_end(&self) -> usize {
        self.col_offset + self.width
    }

    /// Exclusive end row.
    pub fn row_end(&self) -> usize {
        self.row_offset + self.height
    }

    /// True when `inner` lies entirely within this window.
    pub fn contains(&self, inner: &PixelWindow) -> bool {
        inner.col_offset >= self.col_offset
            && inner.row_offset >= self.row_offset
            && inner.col_end() <= self.col_end()
            && inner.row_end() <= self.row_end()
    }

    /// True when the two windows share at least one pixel.
    pub fn overlaps(&self, other: &PixelWindow) -> bool {
        self.col_offset < other.col_end()
            && other.col_offset < self.col_end()
            && self.row_offset < other.row_end()
            && other.row_offset < self.row_end()
    }
}

impl fmt::Display for PixelWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} px at (col {}, row {})",
            self.width, self.height, self.col_offset, self.row_offset
        )
    }
}

/// Addressing scheme of one global dataset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSpec {
    /// Longitude of the west edge of column 0.
    pub origin_lon: f64,
    /// Latitude of the north edge of row 0.
    pub origin_lat: f64,
    /// Degrees per pixel on both axes.
    pub cell_size: f64,
    /// Pixels per degree, the exact reciprocal of `cell_size`.
    pub cells_per_degree: f64,
    pub columns: usize,
    pub rows: usize,
    /// EPSG code of the grid's geographic CRS.
    pub epsg: u32,
}

impl GridSpec {
    /// GEBCO 2025 global grid: 15 arc-second cells, WGS84.
    pub const GEBCO_2025: GridSpec = GridSpec {
        origin_lon: -180.0,
        origin_lat: 90.0,
        cell_size: 1.0 / 240.0,
        cells_per_degree: 240.0,
        columns: 86_400,
        rows: 43_200,
        epsg: 4326,
    };

    /// Maps bounds to the smallest window whose footprint covers them.
    ///
    /// Edges are expanded outward to whole pixels and clamped to the grid.
    /// The result always has at least one row and one column.
    pub fn bounds_to_window(&self, bounds: &GeographicBounds) -> PixelWindow {
        let (col_offset, width) = clamp_span(
            self.first_col(bounds.west),
            self.end_col(bounds.east),
            self.columns,
        );
        let (row_offset, height) = clamp_span(
            self.first_row(bounds.north),
            self.end_row(bounds.south),
            self.rows,
        );

        PixelWindow {
            col_offset,
            row_offset,
            width,
            height,
        }
    }

    /// Geographic footprint of a window's outer pixel corners.
    pub fn window_to_bounds(&self, window: &PixelWindow) -> GeographicBounds {
        GeographicBounds {
            west: self.col_edge(window.col_offset as i64),
            east: self.col_edge(window.col_end() as i64),
            north: self.row_edge(window.row_offset as i64),
            south: self.row_edge(window.row_end() as i64),
        }
    }

    /// Bounds expanded outward to the pixel grid.
    pub fn snap_bounds(&self, bounds: &GeographicBounds) -> GeographicBounds {
        self.window_to_bounds(&self.bounds_to_window(bounds))
    }

    /// GDAL-style affine transform for a raster covering `window`.
    pub fn geo_transform(&self, window: &PixelWindow) -> [f64; 6] {
        let bounds = self.window_to_bounds(window);
        [
            bounds.west,
            self.cell_size,
            0.0,
            bounds.north,
            0.0,
            -self.cell_size,
        ]
    }

    /// Whole grid as a window.
    pub fn full_window(&self) -> PixelWindow {
        PixelWindow::new(0, 0, self.columns, self.rows)
    }

    /// Longitude of the west edge of column `col`.
    fn col_edge(&self, col: i64) -> f64 {
        self.origin_lon + col as f64 / self.cells_per_degree
    }

    /// Latitude of the north edge of row `row`.
    fn row_edge(&self, row: i64) -> f64 {
        self.origin_lat - row as f64 / self.cells_per_degree
    }

    /// Last column whose west edge lies at or west of `west`.
    fn first_col(&self, west: f64) -> i64 {
        let max = self.columns as i64;
        let guess = ((west - self.origin_lon) * self.cells_per_degree).floor() as i64;
        let mut col = guess.clamp(0, max);
        while col < max && self.col_edge(col + 1) <= west {
            col += 1;
        }
        while col > 0 && self.col_edge(col) > west {
            col -= 1;
        }
        col
    }

    /// First column edge at or east of `east`.
    fn end_col(&self, east: f64) -> i64 {
        let max = self.columns as i64;
        let guess = ((east - self.origin_lon) * self.cells_per_degree).ceil() as i64;
        let mut col = guess.clamp(0, max);
        while col > 0 && self.col_edge(col - 1) >= east {
            col -= 1;
        }
        while col < max && self.col_edge(col) < east {
            col += 1;
        }
        col
    }

    /// Last row whose north edge lies at or north of `north`.
    fn first_row(&self, north: f64) -> i64 {
        let max = self.rows as i64;
        let guess = ((self.origin_lat - north) * self.cells_per_degree).floor() as i64;
        let mut row = guess.clamp(0, max);
        while row < max && self.row_edge(row + 1) >= north {
            row += 1;
        }
        while row > 0 && self.row_edge(row) < north {
            row -= 1;
        }
        row
    }

    /// First row edge at or south of `south`.
    fn end_row(&self, south: f64) -> i64 {
        let max = self.rows as i64;
        let guess = ((self.origin_lat - south) * self.cells_per_degree).ceil() as i64;
        let mut row = guess.clamp(0, max);
        while row > 0 && self.row_edge(row - 1) <= south {
            row -= 1;
        }
        while row < max && self.row_edge(row) > south {
            row += 1;
        }
        row
    }
}

/// Clamps a half-open pixel span to `[0, limit)` and returns (offset, length >= 1).
fn clamp_span(start: i64, end: i64, limit: usize) -> (usize, usize) {
    let max = limit as i64;
    let start = start.clamp(0, max - 1);
    let end = end.clamp(start + 1, max);
    (start as usize, (end - start) as usize)
}
