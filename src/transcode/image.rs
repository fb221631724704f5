//! Image re-encoders.
//!
//! Each codec decodes the full body into a pixel buffer and re-encodes it,
//! either in the original format or as WebP when the client's `Accept`
//! header negotiates it (lossless for GIF/PNG sources, lossy for JPEG).
//! Animated GIFs collapse to their first frame.

use std::io::{Cursor, Read, Write};

use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};

use crate::error::CompyError;
use crate::proxy::response::{ResponseReader, ResponseWriter};
use crate::transcode::{accepts_webp, Transcoder};

/// Per-request quality override for lossy re-encoding, 1-100.
pub const QUALITY_HEADER: &str = "x-compy-quality";

fn requested_quality(headers: &HeaderMap, default: u8) -> u8 {
    headers
        .get(QUALITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u8>().ok())
        .filter(|q| (1..=100).contains(q))
        .unwrap_or(default)
}

fn decode(r: &mut ResponseReader, format: ImageFormat) -> Result<DynamicImage, CompyError> {
    let mut buf = Vec::new();
    r.read_to_end(&mut buf)?;
    let img = image::load_from_memory_with_format(&buf, format)?;
    // The webp encoder only takes 8-bit RGB(A) buffers.
    Ok(DynamicImage::ImageRgba8(img.to_rgba8()))
}

fn write_webp(
    w: &mut ResponseWriter,
    img: &DynamicImage,
    lossy_quality: Option<u8>,
) -> Result<(), CompyError> {
    w.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("image/webp"));
    let encoder = webp::Encoder::from_image(img).map_err(|e| CompyError::Webp(e.to_string()))?;
    let encoded = match lossy_quality {
        Some(q) => encoder.encode(f32::from(q)),
        None => encoder.encode_lossless(),
    };
    w.write_all(&encoded)?;
    Ok(())
}

/// JPEG re-encoder with a configured default quality.
pub struct Jpeg {
    quality: u8,
}

impl Jpeg {
    pub fn new(quality: u8) -> Self {
        Self { quality }
    }
}

impl Transcoder for Jpeg {
    fn transcode(
        &self,
        w: &mut ResponseWriter,
        r: &mut ResponseReader,
        headers: &HeaderMap,
    ) -> Result<(), CompyError> {
        let img = decode(r, ImageFormat::Jpeg)?;
        let quality = requested_quality(headers, self.quality);
        if accepts_webp(headers) {
            write_webp(w, &img, Some(quality))
        } else {
            let mut out = Vec::new();
            // The jpeg encoder rejects alpha channels.
            img.to_rgb8()
                .write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))?;
            w.write_all(&out)?;
            Ok(())
        }
    }
}

/// PNG re-encoder; converts to lossless WebP when negotiated.
pub struct Png;

impl Transcoder for Png {
    fn transcode(
        &self,
        w: &mut ResponseWriter,
        r: &mut ResponseReader,
        headers: &HeaderMap,
    ) -> Result<(), CompyError> {
        let img = decode(r, ImageFormat::Png)?;
        if accepts_webp(headers) {
            write_webp(w, &img, None)
        } else {
            let mut out = Cursor::new(Vec::new());
            img.write_to(&mut out, ImageFormat::Png)?;
            w.write_all(out.get_ref())?;
            Ok(())
        }
    }
}

/// GIF transcoder: static first frame, lossless WebP when negotiated.
pub struct Gif;

impl Transcoder for Gif {
    fn transcode(
        &self,
        w: &mut ResponseWriter,
        r: &mut ResponseReader,
        headers: &HeaderMap,
    ) -> Result<(), CompyError> {
        let img = decode(r, ImageFormat::Gif)?;
        if accepts_webp(headers) {
            write_webp(w, &img, None)
        } else {
            let mut out = Cursor::new(Vec::new());
            img.write_to(&mut out, ImageFormat::Gif)?;
            w.write_all(out.get_ref())?;
            Ok(())
        }
    }
}
