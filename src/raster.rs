//! In-memory rasters sized to a [`PixelWindow`].

use std::fmt::Debug;

use gdal::raster::GdalType;

use crate::grid::PixelWindow;

/// Integer sample type of a source dataset.
pub trait Sample:
    Copy + PartialEq + Debug + Send + Sync + GdalType + TryFrom<i64> + Into<i64> + 'static
{
    /// Reserved value meaning "no valid measurement here".
    const NODATA: Self;

    /// ArcGIS `pixelType` requested from the image service.
    const PIXEL_TYPE: &'static str;
}

impl Sample for i16 {
    const NODATA: Self = i16::MIN;
    const PIXEL_TYPE: &'static str = "S16";
}

impl Sample for i8 {
    const NODATA: Self = i8::MIN;
    const PIXEL_TYPE: &'static str = "S8";
}

/// Row-major samples covering one pixel window, north row first.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterBuffer<T: Sample> {
    window: PixelWindow,
    data: Vec<T>,
}

impl<T: Sample> RasterBuffer<T> {
    /// A buffer for `window` with every cell at the no-data sentinel.
    pub fn filled_nodata(window: PixelWindow) -> Self {
        Self {
            data: vec![T::NODATA; window.width * window.height],
            window,
        }
    }

    /// Wraps decoded samples, returning them back if the length is wrong.
    pub fn from_vec(window: PixelWindow, data: Vec<T>) -> Result<Self, Vec<T>> {
        if data.len() != window.width * window.height {
            return Err(data);
        }
        Ok(Self { window, data })
    }

    pub fn window(&self) -> &PixelWindow {
        &self.window
    }

    pub fn width(&self) -> usize {
        self.window.width
    }

    pub fn height(&self) -> usize {
        self.window.height
    }

    /// (cols, rows), the order GDAL expects.
    pub fn size(&self) -> (usize, usize) {
        (self.window.width, self.window.height)
    }

    pub fn nodata(&self) -> T {
        T::NODATA
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Sample at (row, col) relative to the buffer's own window.
    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        if row >= self.window.height || col >= self.window.width {
            return None;
        }
        self.data.get(row * self.window.width + col).copied()
    }

    pub fn nodata_count(&self) -> usize {
        self.data.iter().filter(|&&v| v == T::NODATA).count()
    }

    /// Copies `tile` into the sub-region its window occupies in this buffer.
    ///
    /// # Panics
    /// Panics if the tile's window is not contained in this buffer's window.
    pub fn blit(&mut self, tile: &RasterBuffer<T>) {
        assert!(
            self.window.contains(&tile.window),
            "tile {} lies outside destination {}",
            tile.window,
            self.window
        );

        let col_start = tile.window.col_offset - self.window.col_offset;
        let row_start = tile.window.row_offset - self.window.row_offset;
        let tile_width = tile.window.width;

        for (tile_row, src) in tile.data.chunks_exact(tile_width).enumerate() {
            let dst_start = (row_start + tile_row) * self.window.width + col_start;
            self.data[dst_start..dst_start + tile_width].copy_from_slice(src);
        }
    }

    /// A new buffer with `f(sample, index)` applied to every cell.
    pub fn map_indexed(&self, f: impl Fn(T, usize) -> T) -> Self {
        Self {
            window: self.window,
            data: self
                .data
                .iter()
                .enumerate()
                .map(|(i, &v)| f(v, i))
                .collect(),
        }
    }
}
