//! GeoTIFF encode/decode for the cloud-optimized outputs.
//!
//! Written files carry the north-up affine (ModelPixelScale + ModelTiepoint),
//! the EPSG code of the cube CRS (GeoKeyDirectory), the nodata declaration
//! (GDAL_NODATA) and reduced-resolution overviews as trailing IFDs. Reads
//! only the full-resolution image.

use std::io::Cursor;

use ndarray::Array2;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use super::{Buffer, GeoTransform, Raster, BLOCK_SIZE};

const GT_MODEL_TYPE: u16 = 1024;
const GT_RASTER_TYPE: u16 = 1025;
const PROJECTED_CS_TYPE: u16 = 3072;

pub fn encode(raster: &Raster) -> anyhow::Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut encoder = TiffEncoder::new(&mut cursor)?;

        match &raster.buffer {
            Buffer::U8(a) => write_levels::<colortype::Gray8>(&mut encoder, a, raster)?,
            Buffer::U16(a) => write_levels::<colortype::Gray16>(&mut encoder, a, raster)?,
            Buffer::I16(a) => write_levels::<colortype::GrayI16>(&mut encoder, a, raster)?,
        }
    }
    Ok(cursor.into_inner())
}

fn write_levels<C>(
    encoder: &mut TiffEncoder<&mut Cursor<Vec<u8>>>,
    full: &Array2<C::Inner>,
    raster: &Raster,
) -> anyhow::Result<()>
where
    C: colortype::ColorType,
    C::Inner: Copy + tiff::encoder::TiffValue,
    [C::Inner]: tiff::encoder::TiffValue,
{
    write_one::<C>(encoder, full, raster, true)?;

    // Reduced-resolution overviews, factor-of-two nearest decimation until
    // the level fits a single block.
    let mut level = decimate(full);
    while level.dim().0.max(level.dim().1) >= BLOCK_SIZE {
        write_one::<C>(encoder, &level, raster, false)?;
        level = decimate(&level);
    }
    Ok(())
}

fn write_one<C>(
    encoder: &mut TiffEncoder<&mut Cursor<Vec<u8>>>,
    data: &Array2<C::Inner>,
    raster: &Raster,
    with_geo: bool,
) -> anyhow::Result<()>
where
    C: colortype::ColorType,
    C::Inner: Copy + tiff::encoder::TiffValue,
    [C::Inner]: tiff::encoder::TiffValue,
{
    let (h, w) = data.dim();
    let mut image = encoder.new_image::<C>(w as u32, h as u32)?;
    image.rows_per_strip(BLOCK_SIZE as u32)?;

    if with_geo {
        let t = raster.transform;
        image
            .encoder()
            .write_tag(Tag::ModelPixelScaleTag, &[t.res_x, t.res_y, 0.0][..])?;
        image.encoder().write_tag(
            Tag::ModelTiepointTag,
            &[0.0, 0.0, 0.0, t.x_min, t.y_max, 0.0][..],
        )?;
        if let Some(epsg) = parse_epsg(&raster.crs) {
            let keys: [u16; 16] = [
                1, 1, 0, 3,
                GT_MODEL_TYPE, 0, 1, 1,
                GT_RASTER_TYPE, 0, 1, 1,
                PROJECTED_CS_TYPE, 0, 1, epsg,
            ];
            image.encoder().write_tag(Tag::GeoKeyDirectoryTag, &keys[..])?;
        }
        if let Some(nodata) = raster.nodata {
            image
                .encoder()
                .write_tag(Tag::GdalNodata, format_nodata(nodata).as_str())?;
        }
    }

    let contiguous;
    let slice = match data.as_slice() {
        Some(s) => s,
        None => {
            contiguous = data.as_standard_layout().to_owned();
            contiguous.as_slice().expect("standard layout")
        }
    };
    image.write_data(slice)?;
    Ok(())
}

fn decimate<T: Copy>(data: &Array2<T>) -> Array2<T> {
    let (h, w) = data.dim();
    let oh = h.div_ceil(2);
    let ow = w.div_ceil(2);
    Array2::from_shape_fn((oh, ow), |(r, c)| data[[(r * 2).min(h - 1), (c * 2).min(w - 1)]])
}

fn format_nodata(nodata: f64) -> String {
    if nodata.fract() == 0.0 {
        format!("{}", nodata as i64)
    } else {
        format!("{nodata}")
    }
}

fn parse_epsg(crs: &str) -> Option<u16> {
    crs.strip_prefix("EPSG:")
        .or_else(|| crs.strip_prefix("epsg:"))
        .and_then(|code| code.parse().ok())
}

pub fn decode(bytes: &[u8]) -> anyhow::Result<Raster> {
    let mut decoder = Decoder::new(Cursor::new(bytes))?;
    let (w, h) = decoder.dimensions()?;
    let dim = (h as usize, w as usize);

    let transform = read_transform(&mut decoder)?;
    let crs = read_crs(&mut decoder);
    let nodata = decoder
        .get_tag_ascii_string(Tag::GdalNodata)
        .ok()
        .and_then(|s| s.trim().trim_end_matches('\0').parse::<f64>().ok());

    let buffer = match decoder.read_image()? {
        DecodingResult::U8(v) => Buffer::U8(Array2::from_shape_vec(dim, v)?),
        DecodingResult::U16(v) => Buffer::U16(Array2::from_shape_vec(dim, v)?),
        DecodingResult::I16(v) => Buffer::I16(Array2::from_shape_vec(dim, v)?),
        _ => anyhow::bail!("unsupported raster sample format"),
    };

    Ok(Raster { buffer, transform, crs, nodata })
}

fn read_transform(decoder: &mut Decoder<Cursor<&[u8]>>) -> anyhow::Result<GeoTransform> {
    let scale = decoder
        .get_tag_f64_vec(Tag::ModelPixelScaleTag)
        .unwrap_or_else(|_| vec![1.0, 1.0, 0.0]);
    let tiepoint = decoder
        .get_tag_f64_vec(Tag::ModelTiepointTag)
        .unwrap_or_else(|_| vec![0.0; 6]);

    anyhow::ensure!(scale.len() >= 2, "model pixel scale must have two entries");
    anyhow::ensure!(tiepoint.len() >= 5, "model tiepoint must have six entries");

    Ok(GeoTransform {
        res_x: scale[0],
        res_y: scale[1],
        x_min: tiepoint[3],
        y_max: tiepoint[4],
    })
}

fn read_crs(decoder: &mut Decoder<Cursor<&[u8]>>) -> String {
    let Ok(keys) = decoder.get_tag_u16_vec(Tag::GeoKeyDirectoryTag) else {
        return String::new();
    };
    let Some(entries) = keys.get(4..) else {
        return String::new();
    };
    // Entries of four shorts follow the four-short header.
    for entry in entries.chunks_exact(4) {
        if entry[0] == PROJECTED_CS_TYPE && entry[1] == 0 {
            return format!("EPSG:{}", entry[3]);
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn transform() -> GeoTransform {
        GeoTransform { res_x: 30.0, res_y: 30.0, x_min: 600_000.0, y_max: 7_300_000.0 }
    }

    #[test]
    fn i16_round_trip_preserves_grid_and_nodata() {
        let data = Array2::from_shape_fn((70, 50), |(r, c)| (r * 50 + c) as i16 - 500);
        let raster = Raster {
            buffer: Buffer::I16(data.clone()),
            transform: transform(),
            crs: "EPSG:32723".to_string(),
            nodata: Some(-9999.0),
        };

        let bytes = encode(&raster).unwrap();
        let back = decode(&bytes).unwrap();

        assert_eq!(back.crs, "EPSG:32723");
        assert_eq!(back.nodata, Some(-9999.0));
        assert_eq!(back.transform, transform());
        match back.buffer {
            Buffer::I16(a) => assert_eq!(a, data),
            _ => panic!("expected i16 buffer"),
        }
    }

    #[test]
    fn u8_round_trip() {
        let data = Array2::from_shape_fn((16, 16), |(r, c)| ((r + c) % 5) as u8);
        let raster = Raster {
            buffer: Buffer::U8(data.clone()),
            transform: transform(),
            crs: "EPSG:32723".to_string(),
            nodata: Some(255.0),
        };

        let back = decode(&encode(&raster).unwrap()).unwrap();
        match back.buffer {
            Buffer::U8(a) => assert_eq!(a, data),
            _ => panic!("expected u8 buffer"),
        }
    }

    #[test]
    fn large_raster_gets_overviews_but_reads_full_resolution() {
        let data = Array2::from_elem((1200, 1100), 7u16);
        let raster = Raster {
            buffer: Buffer::U16(data),
            transform: transform(),
            crs: "EPSG:32723".to_string(),
            nodata: None,
        };

        let back = decode(&encode(&raster).unwrap()).unwrap();
        assert_eq!((back.height(), back.width()), (1200, 1100));
        assert_eq!(back.nodata, None);
    }

    #[test]
    fn decimation_halves_dimensions() {
        let data = Array2::from_shape_fn((5, 4), |(r, c)| (r * 4 + c) as i16);
        let half = decimate(&data);
        assert_eq!(half.dim(), (3, 2));
        assert_eq!(half[[0, 0]], 0);
        assert_eq!(half[[1, 1]], data[[2, 2]]);
    }

    #[test]
    fn epsg_parsing() {
        assert_eq!(parse_epsg("EPSG:32723"), Some(32723));
        assert_eq!(parse_epsg("epsg:4326"), Some(4326));
        assert_eq!(parse_epsg("+proj=utm +zone=23"), None);
    }
}
