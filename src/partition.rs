//! Splitting large pixel windows into bounded tile requests.

use crate::dataset::DatasetKind;
use crate::grid::PixelWindow;

/// One unit of remote fetch work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileRequest {
    /// Absolute window in the dataset grid.
    pub window: PixelWindow,
    pub dataset: DatasetKind,
    /// Position in the tile grid, row-major from the north-west corner.
    pub tile_row: usize,
    pub tile_col: usize,
}

/// Number of tiles along each axis: (tile rows, tile cols).
pub fn tile_grid_shape(window: &PixelWindow, max_tile_dim: usize) -> (usize, usize) {
    (
        window.height.div_ceil(max_tile_dim),
        window.width.div_ceil(max_tile_dim),
    )
}

/// Splits `window` into a disjoint row-major cover of tiles no larger than
/// `max_tile_dim` on either axis.
///
/// A window that already fits is returned unchanged as the only tile. Tiles
/// in the last row and column take whatever remains.
///
/// # Panics
/// Panics if `max_tile_dim` is zero.
pub fn partition(
    window: &PixelWindow,
    dataset: DatasetKind,
    max_tile_dim: usize,
) -> Vec<TileRequest> {
    assert!(max_tile_dim > 0, "max_tile_dim must be positive");

    let (tile_rows, tile_cols) = tile_grid_shape(window, max_tile_dim);
    let mut tiles = Vec::with_capacity(tile_rows * tile_cols);

    for tile_row in 0..tile_rows {
        let row_start = tile_row * max_tile_dim;
        let height = max_tile_dim.min(window.height - row_start);

        for tile_col in 0..tile_cols {
            let col_start = tile_col * max_tile_dim;
            let width = max_tile_dim.min(window.width - col_start);

            tiles.push(TileRequest {
                window: PixelWindow::new(
                    window.col_offset + col_start,
                    window.row_offset + row_start,
                    width,
                    height,
                ),
                dataset,
                tile_row,
                tile_col,
            });
        }
    }

    tiles
}
