//! Page body verification.
//!
//! A 2xx response only counts as a page when it is large enough and starts
//! with the signature of a known image format.

use std::fmt;

use super::FetchError;

/// Image container formats accepted as page bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFormat {
    Jpeg,
    Png,
    Gif,
    WebP,
    Tiff,
    Bmp,
    Jpeg2000,
}

impl PageFormat {
    /// Returns the conventional file extension.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::WebP => "webp",
            Self::Tiff => "tif",
            Self::Bmp => "bmp",
            Self::Jpeg2000 => "jp2",
        }
    }

    fn from_image_format(format: image::ImageFormat) -> Option<Self> {
        match format {
            image::ImageFormat::Jpeg => Some(Self::Jpeg),
            image::ImageFormat::Png => Some(Self::Png),
            image::ImageFormat::Gif => Some(Self::Gif),
            image::ImageFormat::WebP => Some(Self::WebP),
            image::ImageFormat::Tiff => Some(Self::Tiff),
            image::ImageFormat::Bmp => Some(Self::Bmp),
            _ => None,
        }
    }
}

impl fmt::Display for PageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

const JP2_SIGNATURE_BOX: &[u8] = &[0x00, 0x00, 0x00, 0x0C, b'j', b'P', b' ', b' '];
const J2K_CODESTREAM: &[u8] = &[0xFF, 0x4F, 0xFF, 0x51];

/// Detects the image format from leading bytes.
#[must_use]
pub fn detect_format(bytes: &[u8]) -> Option<PageFormat> {
    if bytes.starts_with(JP2_SIGNATURE_BOX) || bytes.starts_with(J2K_CODESTREAM) {
        return Some(PageFormat::Jpeg2000);
    }
    image::guess_format(bytes)
        .ok()
        .and_then(PageFormat::from_image_format)
}

/// Verifies a page body: at least `minimum_bytes` long and a known image signature.
///
/// # Errors
///
/// [`FetchError::TooSmall`] when the body is short, [`FetchError::NotAnImage`]
/// when its signature is unknown.
pub fn verify_page_body(
    url: &str,
    bytes: &[u8],
    minimum_bytes: usize,
) -> Result<PageFormat, FetchError> {
    if bytes.len() < minimum_bytes {
        return Err(FetchError::too_small(url, bytes.len(), minimum_bytes));
    }
    detect_format(bytes).ok_or_else(|| FetchError::not_an_image(url, content_hint(bytes)))
}

fn content_hint(bytes: &[u8]) -> String {
    let prefix: String = String::from_utf8_lossy(&bytes[..bytes.len().min(24)])
        .chars()
        .map(|c| if c.is_control() { '.' } else { c })
        .collect();
    format!("starts with {prefix:?}")
}
