//! PNG-backed [`ResourceFactory`] for hosts without a native texture loader
//! and for the tooling. Decodes to RGBA8 in memory.

use std::io::Cursor;
use std::sync::Arc;

use crate::resource::{
    FactoryError, LevelDesc, PixelFormat, RenderResource, ResourceFactory, ResourceRef,
    SourceInfo,
};

#[derive(Debug, Clone)]
pub struct DecodedTexture {
    levels: Vec<LevelDesc>,
    pixels: Vec<Vec<u8>>,
}

impl DecodedTexture {
    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn rgba(&self, level: usize) -> Option<&[u8]> {
        self.pixels.get(level).map(Vec::as_slice)
    }
}

impl RenderResource for DecodedTexture {
    fn levels(&self) -> Vec<LevelDesc> {
        self.levels.clone()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PngFactory;

impl ResourceFactory for PngFactory {
    fn describe(&self, source: &[u8]) -> Result<SourceInfo, FactoryError> {
        let decoder = png::Decoder::new(Cursor::new(source));
        let reader = decoder
            .read_info()
            .map_err(|err| FactoryError::Decode(err.to_string()))?;
        let info = reader.info();
        Ok(SourceInfo {
            width: info.width,
            height: info.height,
            depth: 1,
            mip_levels: 1,
        })
    }

    fn create(&self, source: &[u8]) -> Result<ResourceRef, FactoryError> {
        let (width, height, rgba) = decode_png(source).map_err(FactoryError::Decode)?;
        Ok(Arc::new(DecodedTexture {
            levels: vec![LevelDesc {
                width,
                height,
                format: PixelFormat::Rgba8,
            }],
            pixels: vec![rgba],
        }))
    }

    fn resample(&self, source: &[u8]) -> Result<ResourceRef, FactoryError> {
        let (width, height, rgba) = decode_png(source).map_err(FactoryError::Resample)?;
        if !width.is_power_of_two() || !height.is_power_of_two() {
            return Err(FactoryError::Resample(format!(
                "{width}x{height} is not a power of two"
            )));
        }
        Ok(Arc::new(build_mip_chain(width, height, rgba)))
    }
}

fn decode_png(bytes: &[u8]) -> Result<(u32, u32, Vec<u8>), String> {
    let decoder = png::Decoder::new(Cursor::new(bytes));
    let mut reader = decoder.read_info().map_err(|err| err.to_string())?;
    if reader.info().bit_depth != png::BitDepth::Eight {
        return Err("png bit depth must be 8".to_string());
    }
    let mut buf = vec![0; reader.output_buffer_size()];
    let output = reader.next_frame(&mut buf).map_err(|err| err.to_string())?;
    let bytes = &buf[..output.buffer_size()];
    let pixel_count = output.width as usize * output.height as usize;
    let rgba = match output.color_type {
        png::ColorType::Rgba => bytes.to_vec(),
        png::ColorType::Rgb => {
            let mut out = Vec::with_capacity(pixel_count * 4);
            for chunk in bytes.chunks_exact(3) {
                out.extend_from_slice(&[chunk[0], chunk[1], chunk[2], 255]);
            }
            out
        }
        png::ColorType::Grayscale => {
            let mut out = Vec::with_capacity(pixel_count * 4);
            for value in bytes {
                out.extend_from_slice(&[*value, *value, *value, 255]);
            }
            out
        }
        png::ColorType::GrayscaleAlpha => {
            let mut out = Vec::with_capacity(pixel_count * 4);
            for chunk in bytes.chunks_exact(2) {
                out.extend_from_slice(&[chunk[0], chunk[0], chunk[0], chunk[1]]);
            }
            out
        }
        _ => return Err("unsupported png color type".to_string()),
    };
    Ok((output.width, output.height, rgba))
}

/// 2x2 box filter down to 1x1.
fn build_mip_chain(width: u32, height: u32, rgba: Vec<u8>) -> DecodedTexture {
    let mut levels = vec![LevelDesc {
        width,
        height,
        format: PixelFormat::Rgba8,
    }];
    let mut pixels = vec![rgba];
    let (mut w, mut h) = (width as usize, height as usize);
    while w > 1 || h > 1 {
        let (nw, nh) = ((w / 2).max(1), (h / 2).max(1));
        let Some(src) = pixels.last() else {
            break;
        };
        let mut next = vec![0u8; nw * nh * 4];
        for y in 0..nh {
            for x in 0..nw {
                for c in 0..4 {
                    let mut sum = 0u32;
                    for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                        let sx = (x * 2 + dx).min(w - 1);
                        let sy = (y * 2 + dy).min(h - 1);
                        sum += u32::from(src[(sy * w + sx) * 4 + c]);
                    }
                    next[(y * nw + x) * 4 + c] = ((sum + 2) / 4) as u8;
                }
            }
        }
        levels.push(LevelDesc {
            width: nw as u32,
            height: nh as u32,
            format: PixelFormat::Rgba8,
        });
        pixels.push(next);
        w = nw;
        h = nh;
    }
    DecodedTexture { levels, pixels }
}
