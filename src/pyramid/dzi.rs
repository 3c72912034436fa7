//! Deep Zoom Image (DZI) descriptor parsing.
//!
//! ```xml
//! <Image TileSize="256" Overlap="1" Format="jpg" xmlns="http://schemas.microsoft.com/deepzoom/2008">
//!   <Size Width="5000" Height="7000"/>
//! </Image>
//! ```

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use super::error::DescriptorError;
use super::metadata::{
    DEFAULT_OVERLAP, DEFAULT_TILE_FORMAT, DEFAULT_TILE_SIZE, PyramidMetadata, TileLayout,
};

/// Base URL that tile paths hang off: the descriptor URL minus `.dzi`/`.xml`.
#[must_use]
pub fn dzi_base_url(descriptor_url: &str) -> String {
    let lower = descriptor_url.to_ascii_lowercase();
    [".dzi", ".xml"]
        .iter()
        .find(|suffix| lower.ends_with(*suffix))
        .map_or_else(
            || descriptor_url.to_string(),
            |suffix| descriptor_url[..descriptor_url.len() - suffix.len()].to_string(),
        )
}

#[derive(Default)]
struct RawDescriptor {
    tile_size: Option<String>,
    overlap: Option<String>,
    format: Option<String>,
    width: Option<String>,
    height: Option<String>,
    saw_image: bool,
    saw_size: bool,
}

fn read_attributes(
    reader: &Reader<&[u8]>,
    element: &BytesStart<'_>,
) -> Result<Vec<(String, String)>, DescriptorError> {
    let mut attributes = Vec::new();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| DescriptorError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_ascii_lowercase();
        let value = reader
            .decoder()
            .decode(attr.value.as_ref())
            .map_err(|e| DescriptorError::Xml(e.to_string()))?;
        attributes.push((key, value.trim().to_string()));
    }
    Ok(attributes)
}

fn parse_number(field: &'static str, value: Option<String>, default: u32) -> Result<u32, DescriptorError> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| DescriptorError::InvalidValue { field, value: raw }),
    }
}

/// Parses a DZI document. Element and attribute names match case-insensitively.
///
/// # Errors
///
/// Returns [`DescriptorError`] if the XML is malformed, `<Image>` or `<Size>`
/// is missing, or a numeric attribute is invalid.
pub fn parse_dzi(xml: &str, descriptor_url: &str) -> Result<PyramidMetadata, DescriptorError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut raw = RawDescriptor::default();
    loop {
        match reader.read_event() {
            Ok(Event::Eof) => break,
            Ok(Event::Start(ref e) | Event::Empty(ref e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
                match name.as_str() {
                    "image" => {
                        raw.saw_image = true;
                        for (key, value) in read_attributes(&reader, e)? {
                            match key.as_str() {
                                "tilesize" => raw.tile_size = Some(value),
                                "overlap" => raw.overlap = Some(value),
                                "format" => raw.format = Some(value),
                                _ => {}
                            }
                        }
                    }
                    "size" if raw.saw_image => {
                        raw.saw_size = true;
                        for (key, value) in read_attributes(&reader, e)? {
                            match key.as_str() {
                                "width" => raw.width = Some(value),
                                "height" => raw.height = Some(value),
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }
            }
            Ok(_) => {}
            Err(e) => return Err(DescriptorError::Xml(e.to_string())),
        }
    }

    if !raw.saw_image {
        return Err(DescriptorError::MissingImage);
    }
    if !raw.saw_size {
        return Err(DescriptorError::MissingSize);
    }

    let width = raw
        .width
        .ok_or(DescriptorError::MissingSize)
        .and_then(|w| parse_number("Width", Some(w), 0))?;
    let height = raw
        .height
        .ok_or(DescriptorError::MissingSize)
        .and_then(|h| parse_number("Height", Some(h), 0))?;
    let tile_size = parse_number("TileSize", raw.tile_size, DEFAULT_TILE_SIZE)?;
    let overlap = parse_number("Overlap", raw.overlap, DEFAULT_OVERLAP)?;
    let format = raw
        .format
        .filter(|f| !f.is_empty())
        .unwrap_or_else(|| DEFAULT_TILE_FORMAT.to_string());

    PyramidMetadata::new(
        width,
        height,
        tile_size,
        overlap,
        format,
        TileLayout::DeepZoom {
            base_url: dzi_base_url(descriptor_url),
        },
    )
}
