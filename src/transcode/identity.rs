use std::io;

use hyper::header::HeaderMap;

use crate::error::CompyError;
use crate::proxy::response::{ResponseReader, ResponseWriter};
use crate::transcode::Transcoder;

/// Pass-through stage: copies bytes unchanged. Used as the innermost
/// delegate of compression wrappers when no content transform applies.
pub struct Identity;

impl Transcoder for Identity {
    fn transcode(
        &self,
        w: &mut ResponseWriter,
        r: &mut ResponseReader,
        _headers: &HeaderMap,
    ) -> Result<(), CompyError> {
        io::copy(r, w)?;
        Ok(())
    }
}
