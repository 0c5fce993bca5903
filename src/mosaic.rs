//! Fetching tiles with bounded concurrency and stitching them into one raster.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info, warn};

use crate::acquisition::CancellationToken;
use crate::client::TileSource;
use crate::error::{AcquisitionError, FetchError};
use crate::grid::PixelWindow;
use crate::partition::TileRequest;
use crate::raster::{RasterBuffer, Sample};

/// A tile that could not be fetched after retries.
#[derive(Debug, Clone)]
pub struct FailedTile {
    pub request: TileRequest,
    pub error: FetchError,
}

/// Result of assembling one pixel window.
#[derive(Debug)]
pub enum Assembled<T: Sample> {
    /// Every tile arrived.
    Complete(RasterBuffer<T>),
    /// Some tiles failed; their regions hold the no-data sentinel.
    PartialFailure {
        buffer: RasterBuffer<T>,
        failed: Vec<FailedTile>,
    },
    /// No tile arrived.
    Failure { failed: Vec<FailedTile> },
    /// Cancelled between tile batches.
    Cancelled,
}

/// Stitches tile requests into a single raster.
///
/// Tiles are fetched in batches of `concurrency` on a dedicated rayon pool.
/// After each batch joins, every tile is copied into its own disjoint region
/// of the destination, so at most one batch of tiles is held besides the
/// destination buffer.
pub struct MosaicAssembler {
    pool: ThreadPool,
    concurrency: usize,
}

impl MosaicAssembler {
    pub fn new(concurrency: usize) -> Result<Self, AcquisitionError> {
        let concurrency = concurrency.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(concurrency)
            .thread_name(|i| format!("tile-fetch-{}", i))
            .build()?;
        Ok(Self { pool, concurrency })
    }

    /// Fetches `tiles` and stitches them into a raster covering `window`.
    ///
    /// `on_tile(done, total)` is called on the calling thread after each tile
    /// has been placed or recorded as failed.
    ///
    /// # Panics
    /// Panics if a tile request lies outside `window`.
    pub fn assemble<T: Sample, S: TileSource>(
        &self,
        source: &S,
        tiles: &[TileRequest],
        window: PixelWindow,
        cancel: &CancellationToken,
        mut on_tile: impl FnMut(usize, usize),
    ) -> Assembled<T> {
        let mut buffer = RasterBuffer::<T>::filled_nodata(window);
        let mut failed = Vec::new();
        let total = tiles.len();
        let mut done = 0;

        info!(
            tiles = total,
            concurrency = self.concurrency,
            window = %window,
            "Assembling mosaic"
        );

        for batch in tiles.chunks(self.concurrency) {
            if cancel.is_cancelled() {
                info!(done, total, "Mosaic cancelled");
                return Assembled::Cancelled;
            }

            let fetched: Vec<(&TileRequest, Result<RasterBuffer<T>, FetchError>)> =
                self.pool.install(|| {
                    batch
                        .par_iter()
                        .map(|request| (request, source.fetch_tile::<T>(request)))
                        .collect()
                });

            for (request, result) in fetched {
                assert!(
                    window.contains(&request.window),
                    "tile {} lies outside mosaic window {}",
                    request.window,
                    window
                );

                match result {
                    Ok(tile) if tile.window() == &request.window => {
                        buffer.blit(&tile);
                        debug!(
                            tile_row = request.tile_row,
                            tile_col = request.tile_col,
                            "Tile placed"
                        );
                    }
                    Ok(tile) => {
                        let error = FetchError::Decode(format!(
                            "tile source returned {} for request {}",
                            tile.window(),
                            request.window
                        ));
                        warn!(tile_row = request.tile_row, tile_col = request.tile_col, error = %error, "Tile rejected");
                        failed.push(FailedTile {
                            request: *request,
                            error,
                        });
                    }
                    Err(error) => {
                        warn!(tile_row = request.tile_row, tile_col = request.tile_col, error = %error, "Tile failed");
                        failed.push(FailedTile {
                            request: *request,
                            error,
                        });
                    }
                }

                done += 1;
                on_tile(done, total);
            }
        }

        if failed.is_empty() {
            Assembled::Complete(buffer)
        } else if failed.len() == total {
            Assembled::Failure { failed }
        } else {
            Assembled::PartialFailure { buffer, failed }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::DatasetKind;
    use crate::partition::partition;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Fills each cell with its absolute grid position; fails chosen tiles.
    struct PatternSource {
        failing: HashSet<(usize, usize)>,
        calls: Mutex<Vec<(usize, usize)>>,
    }

    impl PatternSource {
        fn new(failing: &[(usize, usize)]) -> Self {
            Self {
                failing: failing.iter().copied().collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    fn cell_value(row: usize, col: usize) -> i64 {
        (row * 100 + col) as i64
    }

    impl TileSource for PatternSource {
        fn fetch_tile<T: Sample>(
            &self,
            request: &TileRequest,
        ) -> Result<RasterBuffer<T>, FetchError> {
            self.calls
                .lock()
                .unwrap()
                .push((request.tile_row, request.tile_col));

            if self.failing.contains(&(request.tile_row, request.tile_col)) {
                return Err(FetchError::Network("connection reset".into()));
            }

            let w = request.window;
            let mut data = Vec::with_capacity(w.width * w.height);
            for row in w.row_offset..w.row_end() {
                for col in w.col_offset..w.col_end() {
                    data.push(T::try_from(cell_value(row, col)).ok().unwrap());
                }
            }
            Ok(RasterBuffer::from_vec(w, data).unwrap())
        }
    }

    #[test]
    fn test_stitches_tiles_by_position() {
        let window = PixelWindow::new(3, 4, 10, 7);
        let tiles = partition(&window, DatasetKind::Gebco, 3);
        let source = PatternSource::new(&[]);
        let assembler = MosaicAssembler::new(2).unwrap();

        let mut progress = Vec::new();
        let result = assembler.assemble::<i16, _>(
            &source,
            &tiles,
            window,
            &CancellationToken::new(),
            |done, total| progress.push((done, total)),
        );

        let buffer = match result {
            Assembled::Complete(buffer) => buffer,
            other => panic!("expected complete mosaic, got {:?}", other),
        };
        for row in 0..window.height {
            for col in 0..window.width {
                let expected = cell_value(row + 4, col + 3) as i16;
                assert_eq!(buffer.get(row, col), Some(expected));
            }
        }
        assert_eq!(progress.len(), tiles.len());
        assert_eq!(progress.last(), Some(&(tiles.len(), tiles.len())));
        assert_eq!(source.calls.lock().unwrap().len(), tiles.len());
    }

    #[test]
    fn test_failed_centre_tile_is_left_as_nodata() {
        // 3x3 tile grid with the centre tile failing
        let window = PixelWindow::new(0, 0, 9, 9);
        let tiles = partition(&window, DatasetKind::Gebco, 3);
        let source = PatternSource::new(&[(1, 1)]);
        let assembler = MosaicAssembler::new(4).unwrap();

        let result =
            assembler.assemble::<i16, _>(&source, &tiles, window, &CancellationToken::new(), |_, _| {});

        let (buffer, failed) = match result {
            Assembled::PartialFailure { buffer, failed } => (buffer, failed),
            other => panic!("expected partial failure, got {:?}", other),
        };
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].request.window, PixelWindow::new(3, 3, 3, 3));

        for row in 0..9 {
            for col in 0..9 {
                let in_centre = (3..6).contains(&row) && (3..6).contains(&col);
                let value = buffer.get(row, col).unwrap();
                if in_centre {
                    assert_eq!(value, i16::NODATA);
                } else {
                    assert_eq!(value, cell_value(row, col) as i16);
                }
            }
        }
    }

    #[test]
    fn test_all_tiles_failing_is_failure() {
        let window = PixelWindow::new(0, 0, 4, 2);
        let tiles = partition(&window, DatasetKind::Tid, 2);
        let source = PatternSource::new(&[(0, 0), (0, 1)]);
        let assembler = MosaicAssembler::new(1).unwrap();

        let result =
            assembler.assemble::<i8, _>(&source, &tiles, window, &CancellationToken::new(), |_, _| {});
        match result {
            Assembled::Failure { failed } => assert_eq!(failed.len(), 2),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[test]
    fn test_cancelled_before_first_batch() {
        let window = PixelWindow::new(0, 0, 4, 4);
        let tiles = partition(&window, DatasetKind::Gebco, 2);
        let source = PatternSource::new(&[]);
        let assembler = MosaicAssembler::new(2).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = assembler.assemble::<i16, _>(&source, &tiles, window, &cancel, |_, _| {});
        assert!(matches!(result, Assembled::Cancelled));
        assert!(source.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_cancellation_lets_batch_in_flight_finish() {
        let window = PixelWindow::new(0, 0, 8, 2);
        let tiles = partition(&window, DatasetKind::Gebco, 2);
        let source = PatternSource::new(&[]);
        let assembler = MosaicAssembler::new(2).unwrap();
        let cancel = CancellationToken::new();

        let result = assembler.assemble::<i16, _>(&source, &tiles, window, &cancel, |done, _| {
            if done == 1 {
                cancel.cancel();
            }
        });

        assert!(matches!(result, Assembled::Cancelled));
        // The first batch of two completes; nothing after it starts.
        assert_eq!(source.calls.lock().unwrap().len(), 2);
    }
}
