use crate::command::Format;
use crate::utils::{sanitized_filename, GraphicsError, Result};
use flate2::read::ZlibDecoder;
use image::RgbaImage;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;

/// Decodes an image's on-disk cache file into an RGBA raster.
///
/// `Format::File` goes through the format-autodetecting decoder, the raw
/// formats stream RGB/RGBA bytes (optionally zlib-compressed), and
/// `Format::Auto` tries the decoder first and falls back to raw RGBA.
pub fn decode_file(
    format: Format,
    compression: bool,
    pix_width: u32,
    pix_height: u32,
    path: &Path,
    max_ram: u64,
) -> Result<RgbaImage> {
    match format {
        Format::File => decode_autodetect(path, max_ram),
        Format::Rgb | Format::Rgba => {
            decode_raw(format, compression, pix_width, pix_height, path, max_ram)
        }
        Format::Auto => decode_autodetect(path, max_ram).or_else(|_| {
            decode_raw(Format::Rgba, compression, pix_width, pix_height, path, max_ram)
        }),
    }
}

fn decode_autodetect(path: &Path, max_ram: u64) -> Result<RgbaImage> {
    let reader = image::ImageReader::open(path)?.with_guessed_format()?;
    let decoded = reader.decode().map_err(|e| {
        GraphicsError::decode(format!(
            "could not decode {}: {}",
            sanitized_filename(path),
            e
        ))
    })?;
    let raster = decoded.to_rgba8();
    check_ram_budget(raster.width(), raster.height(), max_ram)?;
    Ok(raster)
}

/// Streams raw pixel data from the file. Missing trailing bytes leave
/// transparent pixels; surplus bytes are ignored.
fn decode_raw(
    format: Format,
    compression: bool,
    pix_width: u32,
    pix_height: u32,
    path: &Path,
    max_ram: u64,
) -> Result<RgbaImage> {
    if pix_width == 0 || pix_height == 0 {
        return Err(GraphicsError::decode("image of zero size"));
    }
    check_ram_budget(pix_width, pix_height, max_ram)?;

    let file = File::open(path)?;
    let mut reader: Box<dyn Read> = if compression {
        Box::new(ZlibDecoder::new(file))
    } else {
        Box::new(file)
    };

    let pixel_size = format.pixel_size();
    let total = pix_width as usize * pix_height as usize * pixel_size;
    let mut data = vec![0u8; total];
    let mut filled = 0;
    loop {
        match reader.read(&mut data[filled..]) {
            Ok(0) => break,
            Ok(n) => {
                filled += n;
                if filled == total {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(GraphicsError::decode(format!(
                    "could not read pixel data: {}",
                    e
                )))
            }
        }
    }

    // The input is documented RGB(A) byte order; translate into the raster
    // explicitly instead of reinterpreting the buffer.
    let mut rgba = Vec::with_capacity(pix_width as usize * pix_height as usize * 4);
    for chunk in data.chunks_exact(pixel_size) {
        rgba.push(chunk[0]);
        rgba.push(chunk[1]);
        rgba.push(chunk[2]);
        rgba.push(if pixel_size == 4 { chunk[3] } else { 255 });
    }
    RgbaImage::from_raw(pix_width, pix_height, rgba)
        .ok_or_else(|| GraphicsError::decode("pixel buffer has the wrong size"))
}

fn check_ram_budget(width: u32, height: u32, max_ram: u64) -> Result<()> {
    let bytes = width as u64 * height as u64 * 4;
    if bytes > max_ram {
        return Err(GraphicsError::decode(format!(
            "image is too big to load: {} x {} x 4 > {}",
            width, height, max_ram
        )));
    }
    Ok(())
}
