pub mod algebra;
pub mod asset;
pub mod cog;
pub mod quality;
pub mod quicklook;
pub mod warp;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Block edge used for windowed processing and COG tiling.
pub const BLOCK_SIZE: usize = 512;

pub const COG_MIME_TYPE: &str = "image/tiff; application=geotiff; profile=cloud-optimized";

/// North-up affine transform: `x = x_min + col * res_x`, `y = y_max - row * res_y`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub res_x: f64,
    pub res_y: f64,
    pub x_min: f64,
    pub y_max: f64,
}

impl GeoTransform {
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.x_min + (col as f64 + 0.5) * self.res_x,
            self.y_max - (row as f64 + 0.5) * self.res_y,
        )
    }

    /// Fractional pixel coordinates of a world point.
    pub fn world_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (self.y_max - y) / self.res_y - 0.5,
            (x - self.x_min) / self.res_x - 0.5,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelType {
    U8,
    U16,
    I16,
}

/// One raster band held in memory with its grid placement.
#[derive(Debug, Clone)]
pub enum Buffer {
    U8(Array2<u8>),
    U16(Array2<u16>),
    I16(Array2<i16>),
}

impl Buffer {
    pub fn pixel_type(&self) -> PixelType {
        match self {
            Buffer::U8(_) => PixelType::U8,
            Buffer::U16(_) => PixelType::U16,
            Buffer::I16(_) => PixelType::I16,
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        match self {
            Buffer::U8(a) => a.dim(),
            Buffer::U16(a) => a.dim(),
            Buffer::I16(a) => a.dim(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Raster {
    pub buffer: Buffer,
    pub transform: GeoTransform,
    /// CRS identifier, e.g. `EPSG:32723`.
    pub crs: String,
    pub nodata: Option<f64>,
}

impl Raster {
    pub fn width(&self) -> usize {
        self.buffer.dim().1
    }

    pub fn height(&self) -> usize {
        self.buffer.dim().0
    }

    pub fn pixel_type(&self) -> PixelType {
        self.buffer.pixel_type()
    }

    /// Widen to signed 16-bit, saturating out-of-range unsigned values.
    pub fn to_i16(&self) -> Array2<i16> {
        match &self.buffer {
            Buffer::I16(a) => a.clone(),
            Buffer::U8(a) => a.mapv(i16::from),
            Buffer::U16(a) => a.mapv(|v| v.min(i16::MAX as u16) as i16),
        }
    }

    /// Widen to unsigned 16-bit; negative values collapse to zero.
    pub fn to_u16(&self) -> Array2<u16> {
        match &self.buffer {
            Buffer::U16(a) => a.clone(),
            Buffer::U8(a) => a.mapv(u16::from),
            Buffer::I16(a) => a.mapv(|v| v.max(0) as u16),
        }
    }
}

/// A rectangular sub-region of a raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub row_off: usize,
    pub col_off: usize,
    pub height: usize,
    pub width: usize,
}

impl Window {
    pub fn rows(&self) -> std::ops::Range<usize> {
        self.row_off..self.row_off + self.height
    }

    pub fn cols(&self) -> std::ops::Range<usize> {
        self.col_off..self.col_off + self.width
    }
}

/// Row-major block windows covering a `height` x `width` grid.
pub fn block_windows(height: usize, width: usize) -> Vec<Window> {
    let mut windows = Vec::new();
    let mut row = 0;
    while row < height {
        let h = BLOCK_SIZE.min(height - row);
        let mut col = 0;
        while col < width {
            let w = BLOCK_SIZE.min(width - col);
            windows.push(Window { row_off: row, col_off: col, height: h, width: w });
            col += BLOCK_SIZE;
        }
        row += BLOCK_SIZE;
    }
    windows
}

/// Sample types a warp can work on.
pub trait Sample: Copy + PartialEq {
    fn to_f64(self) -> f64;
    fn from_f64(v: f64) -> Self;
}

impl Sample for u8 {
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
    fn from_f64(v: f64) -> Self {
        v.round().clamp(0.0, 255.0) as u8
    }
}

impl Sample for u16 {
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
    fn from_f64(v: f64) -> Self {
        v.round().clamp(0.0, f64::from(u16::MAX)) as u16
    }
}

impl Sample for i16 {
    fn to_f64(self) -> f64 {
        f64::from(self)
    }
    fn from_f64(v: f64) -> Self {
        v.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_windows_cover_without_overlap() {
        let windows = block_windows(1100, 600);
        let area: usize = windows.iter().map(|w| w.height * w.width).sum();
        assert_eq!(area, 1100 * 600);
        // 3 row bands (512 + 512 + 76) x 2 column bands (512 + 88)
        assert_eq!(windows.len(), 6);
        assert_eq!(windows[0], Window { row_off: 0, col_off: 0, height: 512, width: 512 });
        let last = windows.last().unwrap();
        assert_eq!(last.height, 76);
        assert_eq!(last.width, 88);
    }

    #[test]
    fn transform_round_trips_pixel_centers() {
        let t = GeoTransform { res_x: 30.0, res_y: 30.0, x_min: 600_000.0, y_max: 7_300_000.0 };
        let (x, y) = t.pixel_center(10, 20);
        let (row, col) = t.world_to_pixel(x, y);
        assert!((row - 10.0).abs() < 1e-9);
        assert!((col - 20.0).abs() < 1e-9);
    }

    #[test]
    fn widening_conversions_preserve_categories() {
        let raster = Raster {
            buffer: Buffer::U8(ndarray::array![[0u8, 4], [255, 1]]),
            transform: GeoTransform { res_x: 1.0, res_y: 1.0, x_min: 0.0, y_max: 2.0 },
            crs: "EPSG:32723".to_string(),
            nodata: Some(255.0),
        };
        assert_eq!(raster.to_u16()[[1, 0]], 255);
        assert_eq!(raster.to_i16()[[0, 1]], 4);
        assert_eq!(raster.pixel_type(), PixelType::U8);
    }
}
