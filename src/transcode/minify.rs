//! Text minification for HTML, CSS and JavaScript bodies.

use std::io::{self, Read, Write};

use hyper::header::HeaderMap;
use minify_html::Cfg;
use minify_js::{Session, TopLevelMode};

use crate::error::CompyError;
use crate::proxy::response::{ResponseReader, ResponseWriter};
use crate::transcode::Transcoder;

/// Minifies markup, stylesheets and scripts based on the response
/// content type. Unrecognized types pass through untouched.
pub struct Minifier;

impl Minifier {
    fn minify_html(&self, body: &[u8]) -> Vec<u8> {
        let cfg = Cfg {
            minify_css: true,
            minify_js: true,
            ..Cfg::default()
        };
        minify_html::minify(body, &cfg)
    }

    fn minify_css(&self, body: &[u8]) -> Result<Vec<u8>, CompyError> {
        let src = std::str::from_utf8(body)
            .map_err(|e| CompyError::Minify(format!("css is not utf-8: {e}")))?;
        let out = css_minify::optimizations::Minifier::default()
            .minify(src, css_minify::optimizations::Level::One)
            .map_err(|e| CompyError::Minify(format!("{e:?}")))?;
        Ok(out.into_bytes())
    }

    fn minify_js(&self, body: &[u8]) -> Result<Vec<u8>, CompyError> {
        let session = Session::new();
        let mut out = Vec::new();
        minify_js::minify(&session, TopLevelMode::Global, body, &mut out)
            .map_err(|e| CompyError::Minify(format!("{e:?}")))?;
        Ok(out)
    }
}

impl Transcoder for Minifier {
    fn transcode(
        &self,
        w: &mut ResponseWriter,
        r: &mut ResponseReader,
        _headers: &HeaderMap,
    ) -> Result<(), CompyError> {
        let content_type = r.content_type();
        let mut body = Vec::new();
        r.read_to_end(&mut body)?;

        let out = match content_type.as_str() {
            "text/html" => self.minify_html(&body),
            "text/css" => self.minify_css(&body)?,
            "text/javascript" | "application/javascript" | "application/x-javascript" => {
                self.minify_js(&body)?
            }
            _ => {
                io::copy(&mut &body[..], w)?;
                return Ok(());
            }
        };
        w.write_all(&out)?;
        Ok(())
    }
}
