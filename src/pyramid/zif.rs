//! Zoomify ZIF containers: little-endian TIFF or BigTIFF with tiled JPEGs.
//!
//! Only the first IFD (the full-resolution image) is read. Tile `i` sits at
//! column `i % cols`, row `i / cols`.

use super::error::DescriptorError;
use super::metadata::{DEFAULT_TILE_FORMAT, PyramidMetadata, TileLayout};

const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_TILE_WIDTH: u16 = 322;
const TAG_TILE_LENGTH: u16 = 323;
const TAG_TILE_OFFSETS: u16 = 324;
const TAG_TILE_BYTE_COUNTS: u16 = 325;

const TYPE_SHORT: u16 = 3;
const TYPE_LONG: u16 = 4;
const TYPE_LONG8: u16 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    Classic,
    Big,
}

impl Variant {
    fn inline_size(self) -> usize {
        match self {
            Self::Classic => 4,
            Self::Big => 8,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IfdEntry {
    tag: u16,
    field_type: u16,
    count: u64,
    /// Offset of the value field inside the container.
    value_pos: usize,
}

struct Cursor<'a> {
    bytes: &'a [u8],
}

impl Cursor<'_> {
    fn slice(&self, pos: usize, len: usize, what: &'static str) -> Result<&[u8], DescriptorError> {
        pos.checked_add(len)
            .and_then(|end| self.bytes.get(pos..end))
            .ok_or(DescriptorError::Truncated(what))
    }

    fn u16(&self, pos: usize, what: &'static str) -> Result<u16, DescriptorError> {
        let b = self.slice(pos, 2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&self, pos: usize, what: &'static str) -> Result<u32, DescriptorError> {
        let b = self.slice(pos, 4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&self, pos: usize, what: &'static str) -> Result<u64, DescriptorError> {
        let b = self.slice(pos, 8, what)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }
}

fn to_usize(value: u64, what: &'static str) -> Result<usize, DescriptorError> {
    usize::try_from(value).map_err(|_| DescriptorError::Truncated(what))
}

/// A parsed ZIF container holding its tile bytes.
#[derive(Debug, Clone)]
pub struct ZifContainer {
    metadata: PyramidMetadata,
    columns: u32,
    /// `(offset, length)` per tile, row-major.
    tiles: Vec<(usize, usize)>,
    bytes: Vec<u8>,
}

impl ZifContainer {
    /// Parses the header and first IFD of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`DescriptorError`] if the container is not little-endian
    /// TIFF/BigTIFF, a required tag is missing, tiles are not square, or the
    /// tile tables point outside the container.
    pub fn parse(bytes: Vec<u8>, source_url: &str) -> Result<Self, DescriptorError> {
        let cursor = Cursor { bytes: &bytes };
        if cursor.slice(0, 2, "byte order")? != b"II" {
            return Err(DescriptorError::NotTiff);
        }
        let (variant, ifd_offset) = match cursor.u16(2, "version")? {
            42 => (Variant::Classic, u64::from(cursor.u32(4, "IFD offset")?)),
            43 => (Variant::Big, cursor.u64(8, "IFD offset")?),
            other => return Err(DescriptorError::UnsupportedVersion(other)),
        };
        let entries = read_ifd(&cursor, variant, to_usize(ifd_offset, "IFD offset")?)?;
        let find = |tag: u16| {
            entries
                .iter()
                .find(|e| e.tag == tag)
                .copied()
                .ok_or(DescriptorError::MissingTag(tag))
        };

        let width = scalar(&cursor, variant, find(TAG_IMAGE_WIDTH)?)?;
        let height = scalar(&cursor, variant, find(TAG_IMAGE_LENGTH)?)?;
        let tile_width = scalar(&cursor, variant, find(TAG_TILE_WIDTH)?)?;
        let tile_height = scalar(&cursor, variant, find(TAG_TILE_LENGTH)?)?;
        if tile_width != tile_height {
            return Err(DescriptorError::NonSquareTiles {
                width: tile_width,
                height: tile_height,
            });
        }

        let offsets = array(&cursor, variant, find(TAG_TILE_OFFSETS)?)?;
        let counts = array(&cursor, variant, find(TAG_TILE_BYTE_COUNTS)?)?;

        let metadata = PyramidMetadata::new(
            width,
            height,
            tile_width,
            0,
            DEFAULT_TILE_FORMAT,
            TileLayout::Zif {
                source_url: source_url.to_string(),
            },
        )?;
        let (columns, rows) = metadata
            .grid(metadata.max_level)
            .map_err(|_| DescriptorError::ZeroTileSize)?;
        let expected = columns as usize * rows as usize;
        if offsets.len() < expected || counts.len() < expected {
            return Err(DescriptorError::TileCountMismatch {
                expected,
                actual: offsets.len().min(counts.len()),
            });
        }

        let mut tiles = Vec::with_capacity(expected);
        for (&offset, &length) in offsets.iter().zip(&counts).take(expected) {
            let offset = to_usize(offset, "tile offset")?;
            let length = to_usize(length, "tile length")?;
            cursor.slice(offset, length, "tile data")?;
            tiles.push((offset, length));
        }

        Ok(Self {
            metadata,
            columns,
            tiles,
            bytes,
        })
    }

    #[must_use]
    pub fn metadata(&self) -> &PyramidMetadata {
        &self.metadata
    }

    /// Number of tiles in the container.
    #[must_use]
    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Encoded bytes of the tile at `(column, row)`.
    #[must_use]
    pub fn tile(&self, column: u32, row: u32) -> Option<&[u8]> {
        if column >= self.columns {
            return None;
        }
        let index = row as usize * self.columns as usize + column as usize;
        let &(offset, length) = self.tiles.get(index)?;
        self.bytes.get(offset..offset + length)
    }
}

fn read_ifd(cursor: &Cursor<'_>, variant: Variant, offset: usize) -> Result<Vec<IfdEntry>, DescriptorError> {
    let (count, mut pos, entry_size) = match variant {
        Variant::Classic => (u64::from(cursor.u16(offset, "IFD entry count")?), offset + 2, 12),
        Variant::Big => (cursor.u64(offset, "IFD entry count")?, offset + 8, 20),
    };
    let count = to_usize(count, "IFD entry count")?;
    // Each entry must fit in the container before we trust the count.
    cursor.slice(pos, count.saturating_mul(entry_size), "IFD entries")?;

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let tag = cursor.u16(pos, "IFD entry")?;
        let field_type = cursor.u16(pos + 2, "IFD entry")?;
        let (count, value_pos) = match variant {
            Variant::Classic => (u64::from(cursor.u32(pos + 4, "IFD entry")?), pos + 8),
            Variant::Big => (cursor.u64(pos + 4, "IFD entry")?, pos + 12),
        };
        entries.push(IfdEntry {
            tag,
            field_type,
            count,
            value_pos,
        });
        pos += entry_size;
    }
    Ok(entries)
}

fn type_size(field_type: u16) -> Option<usize> {
    match field_type {
        TYPE_SHORT => Some(2),
        TYPE_LONG => Some(4),
        TYPE_LONG8 => Some(8),
        _ => None,
    }
}

fn read_value(cursor: &Cursor<'_>, field_type: u16, pos: usize) -> Result<u64, DescriptorError> {
    match field_type {
        TYPE_SHORT => cursor.u16(pos, "tag value").map(u64::from),
        TYPE_LONG => cursor.u32(pos, "tag value").map(u64::from),
        _ => cursor.u64(pos, "tag value"),
    }
}

/// Every value of an integer tag, following the offset when it does not fit inline.
fn array(cursor: &Cursor<'_>, variant: Variant, entry: IfdEntry) -> Result<Vec<u64>, DescriptorError> {
    let size = type_size(entry.field_type).ok_or(DescriptorError::InvalidValue {
        field: "TIFF field type",
        value: entry.field_type.to_string(),
    })?;
    let count = to_usize(entry.count, "tag count")?;
    let total = count.saturating_mul(size);
    let base = if total <= variant.inline_size() {
        entry.value_pos
    } else {
        let offset = match variant {
            Variant::Classic => u64::from(cursor.u32(entry.value_pos, "tag offset")?),
            Variant::Big => cursor.u64(entry.value_pos, "tag offset")?,
        };
        to_usize(offset, "tag offset")?
    };
    cursor.slice(base, total, "tag values")?;
    (0..count)
        .map(|i| read_value(cursor, entry.field_type, base + i * size))
        .collect()
}

fn scalar(cursor: &Cursor<'_>, variant: Variant, entry: IfdEntry) -> Result<u32, DescriptorError> {
    let values = array(cursor, variant, entry)?;
    let value = values.first().copied().ok_or(DescriptorError::MissingTag(entry.tag))?;
    u32::try_from(value).map_err(|_| DescriptorError::InvalidValue {
        field: "TIFF dimension",
        value: value.to_string(),
    })
}


#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::test_support::classic_zif;
    use super::*;

    #[test]
    fn test_parses_classic_container() {
        let tiles: Vec<Vec<u8>> = (0u8..6).map(|i| vec![i; 10 + usize::from(i)]).collect();
        let bytes = classic_zif(600, 300, 256, &tiles);
        let zif = ZifContainer::parse(bytes, "https://x.example/p.zif").unwrap();

        assert_eq!(zif.tile_count(), 6);
        assert_eq!(zif.metadata().full_width, 600);
        assert_eq!(zif.metadata().overlap, 0);
        assert_eq!(zif.tile(0, 0).unwrap(), &tiles[0][..]);
        assert_eq!(zif.tile(2, 0).unwrap(), &tiles[2][..]);
        assert_eq!(zif.tile(1, 1).unwrap(), &tiles[4][..]);
        assert!(zif.tile(3, 0).is_none());
        assert!(zif.tile(0, 2).is_none());
    }

    #[test]
    fn test_single_tile_inline_tables() {
        let tiles = vec![vec![7u8; 32]];
        let bytes = classic_zif(200, 100, 256, &tiles);
        let zif = ZifContainer::parse(bytes, "z").unwrap();
        assert_eq!(zif.tile(0, 0).unwrap(), &tiles[0][..]);
    }

    #[test]
    fn test_big_endian_is_rejected() {
        let mut bytes = classic_zif(10, 10, 256, &[vec![1u8; 4]]);
        bytes[0] = b'M';
        bytes[1] = b'M';
        assert!(matches!(
            ZifContainer::parse(bytes, "z"),
            Err(DescriptorError::NotTiff)
        ));
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut bytes = classic_zif(10, 10, 256, &[vec![1u8; 4]]);
        bytes[2] = 44;
        assert!(matches!(
            ZifContainer::parse(bytes, "z"),
            Err(DescriptorError::UnsupportedVersion(44))
        ));
    }

    #[test]
    fn test_truncated_container() {
        let tiles: Vec<Vec<u8>> = (0u8..2).map(|i| vec![i; 40]).collect();
        let mut bytes = classic_zif(400, 100, 256, &tiles);
        bytes.truncate(bytes.len() - 10);
        assert!(matches!(
            ZifContainer::parse(bytes, "z"),
            Err(DescriptorError::Truncated(_))
        ));
    }

    #[test]
    fn test_bigtiff_header() {
        // BigTIFF: version 43, offset size 8, IFD at 16 with four inline entries.
        let mut out = Vec::new();
        out.extend_from_slice(b"II");
        out.extend_from_slice(&43u16.to_le_bytes());
        out.extend_from_slice(&8u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&16u64.to_le_bytes());
        out.extend_from_slice(&6u64.to_le_bytes());
        let ifd_end = 16 + 8 + 6 * 20 + 8;
        let tile_data = vec![9u8; 12];
        let mut entry = |tag: u16, field_type: u16, value: u64| {
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&field_type.to_le_bytes());
            out.extend_from_slice(&1u64.to_le_bytes());
            out.extend_from_slice(&value.to_le_bytes());
        };
        entry(256, 4, 100);
        entry(257, 4, 80);
        entry(322, 3, 256);
        entry(323, 3, 256);
        entry(324, 16, ifd_end);
        entry(325, 4, 12);
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&tile_data);

        let zif = ZifContainer::parse(out, "z").unwrap();
        assert_eq!(zif.metadata().full_height, 80);
        assert_eq!(zif.tile(0, 0).unwrap(), &tile_data[..]);
    }
}
