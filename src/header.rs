//! On-disk header tables of block files
//!
//! Both generations start every data file with a header region: a fixed
//! preamble followed by one block header per `(field, position in file)`.
//! All words are big-endian `u32`.

use crate::error::{IdxError, Result};
use crate::types::Layout;
use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

fn big_endian() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
}

fn decode_records<T: DeserializeOwned>(bytes: &[u8], record_size: usize) -> Result<Vec<T>> {
    if bytes.len() % record_size != 0 {
        return Err(IdxError::InvalidFormat(format!(
            "header region of {} bytes is not a multiple of {}",
            bytes.len(),
            record_size
        )));
    }
    bytes
        .chunks_exact(record_size)
        .map(|chunk| big_endian().deserialize(chunk).map_err(IdxError::from))
        .collect()
}

fn encode_records<T: Serialize>(records: &[T], out: &mut Vec<u8>) -> Result<()> {
    for record in records {
        out.extend(big_endian().serialize(record)?);
    }
    Ok(())
}

/// Compression tag stored in the low nibble of [`BlockHeaderV6::flags`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CompressionTag {
    None = 0x00,
    Zip = 0x03,
    Jpg = 0x04,
    Png = 0x06,
    Lz4 = 0x07,
    Zfp = 0x08,
}

impl CompressionTag {
    pub const MASK: u32 = 0x0f;

    pub fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits & Self::MASK {
            0x00 => CompressionTag::None,
            0x03 => CompressionTag::Zip,
            0x04 => CompressionTag::Jpg,
            0x06 => CompressionTag::Png,
            0x07 => CompressionTag::Lz4,
            0x08 => CompressionTag::Zfp,
            _ => return None,
        })
    }

    /// Codec names match by prefix, so `zfp-precision=32` maps to `Zfp`
    pub fn from_name(name: &str) -> Result<Self> {
        let tag = if name.is_empty() || name == "raw" {
            CompressionTag::None
        } else if name.starts_with("lz4") {
            CompressionTag::Lz4
        } else if name.starts_with("zip") {
            CompressionTag::Zip
        } else if name.starts_with("jpg") {
            CompressionTag::Jpg
        } else if name.starts_with("png") {
            CompressionTag::Png
        } else if name.starts_with("zfp") {
            CompressionTag::Zfp
        } else {
            return Err(IdxError::Unsupported(format!(
                "compression '{}' has no block header tag",
                name
            )));
        };
        Ok(tag)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CompressionTag::None => "",
            CompressionTag::Zip => "zip",
            CompressionTag::Jpg => "jpg",
            CompressionTag::Png => "png",
            CompressionTag::Lz4 => "lz4",
            CompressionTag::Zfp => "zfp",
        }
    }
}

/// Current-generation block header (40 bytes)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderV6 {
    pub prefix: [u32; 2],
    pub offset_low: u32,
    pub offset_high: u32,
    pub size: u32,
    pub flags: u32,
    pub suffix: [u32; 4],
}

impl BlockHeaderV6 {
    pub const SIZE: usize = 40;
    pub const ROW_MAJOR: u32 = 0x10;

    pub fn offset(&self) -> u64 {
        ((self.offset_high as u64) << 32) | self.offset_low as u64
    }

    pub fn set_offset(&mut self, value: u64) {
        self.offset_low = (value & 0xffff_ffff) as u32;
        self.offset_high = (value >> 32) as u32;
    }

    pub fn is_stored(&self) -> bool {
        self.offset() != 0 && self.size != 0
    }

    pub fn layout(&self) -> Layout {
        if self.flags & Self::ROW_MAJOR != 0 {
            Layout::RowMajor
        } else {
            Layout::HzOrder
        }
    }

    pub fn compression(&self) -> Result<CompressionTag> {
        CompressionTag::from_bits(self.flags).ok_or_else(|| {
            IdxError::Decode(format!(
                "unknown compression tag {:#x}",
                self.flags & CompressionTag::MASK
            ))
        })
    }

    /// Replace the compression and layout bits, keeping the rest of `flags`
    pub fn set_encoding(&mut self, compression: CompressionTag, layout: Layout) {
        let mut flags = self.flags & !(CompressionTag::MASK | Self::ROW_MAJOR);
        flags |= compression as u32;
        if layout == Layout::RowMajor {
            flags |= Self::ROW_MAJOR;
        }
        self.flags = flags;
    }
}

/// Legacy block header (12 bytes); any nonzero `compressed` means zip
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeaderV5 {
    pub offset: u32,
    pub len: u32,
    pub compressed: u32,
}

impl BlockHeaderV5 {
    pub const SIZE: usize = 12;

    pub fn is_stored(&self) -> bool {
        self.offset != 0 && self.len != 0
    }

    pub fn compression(&self) -> CompressionTag {
        if self.compressed != 0 {
            CompressionTag::Zip
        } else {
            CompressionTag::None
        }
    }
}

/// Whole header region of a V6 file: 10-word preamble then block headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderTableV6 {
    pub preamble: [u32; 10],
    pub blocks: Vec<BlockHeaderV6>,
    blocksperfile: usize,
}

impl HeaderTableV6 {
    pub const PREAMBLE_SIZE: usize = 40;

    pub fn new(nfields: usize, blocksperfile: usize) -> Self {
        Self {
            preamble: [0; 10],
            blocks: vec![BlockHeaderV6::default(); nfields * blocksperfile],
            blocksperfile,
        }
    }

    pub fn byte_size(nfields: usize, blocksperfile: usize) -> usize {
        Self::PREAMBLE_SIZE + nfields * blocksperfile * BlockHeaderV6::SIZE
    }

    pub fn size_in_bytes(&self) -> usize {
        Self::PREAMBLE_SIZE + self.blocks.len() * BlockHeaderV6::SIZE
    }

    fn slot(&self, field_index: usize, position: u64) -> Result<usize> {
        let slot = field_index * self.blocksperfile + position as usize;
        if slot >= self.blocks.len() {
            return Err(IdxError::InvalidFormat(format!(
                "header slot {} out of range ({} slots)",
                slot,
                self.blocks.len()
            )));
        }
        Ok(slot)
    }

    pub fn get(&self, field_index: usize, position: u64) -> Result<&BlockHeaderV6> {
        Ok(&self.blocks[self.slot(field_index, position)?])
    }

    pub fn get_mut(&mut self, field_index: usize, position: u64) -> Result<&mut BlockHeaderV6> {
        let slot = self.slot(field_index, position)?;
        Ok(&mut self.blocks[slot])
    }

    pub fn decode(bytes: &[u8], nfields: usize, blocksperfile: usize) -> Result<Self> {
        let expected = Self::byte_size(nfields, blocksperfile);
        if bytes.len() < expected {
            return Err(IdxError::InvalidFormat(format!(
                "header region truncated: {} of {} bytes",
                bytes.len(),
                expected
            )));
        }
        let preamble: [u32; 10] = big_endian().deserialize(&bytes[..Self::PREAMBLE_SIZE])?;
        let blocks = decode_records(&bytes[Self::PREAMBLE_SIZE..expected], BlockHeaderV6::SIZE)?;
        Ok(Self {
            preamble,
            blocks,
            blocksperfile,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size_in_bytes());
        out.extend(big_endian().serialize(&self.preamble)?);
        encode_records(&self.blocks, &mut out)?;
        Ok(out)
    }
}

/// Header region of a V5 file. Version 1 has no preamble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderTableV5 {
    pub preamble: Vec<u32>,
    pub blocks: Vec<BlockHeaderV5>,
    blocksperfile: usize,
}

impl HeaderTableV5 {
    pub fn preamble_size(version: u32) -> usize {
        if version == 1 {
            0
        } else {
            16
        }
    }

    pub fn byte_size(version: u32, nfields: usize, blocksperfile: usize) -> usize {
        Self::preamble_size(version) + nfields * blocksperfile * BlockHeaderV5::SIZE
    }

    pub fn get(&self, field_index: usize, position: u64) -> Result<&BlockHeaderV5> {
        let slot = field_index * self.blocksperfile + position as usize;
        self.blocks.get(slot).ok_or_else(|| {
            IdxError::InvalidFormat(format!(
                "header slot {} out of range ({} slots)",
                slot,
                self.blocks.len()
            ))
        })
    }

    pub fn decode(bytes: &[u8], version: u32, nfields: usize, blocksperfile: usize) -> Result<Self> {
        let expected = Self::byte_size(version, nfields, blocksperfile);
        if bytes.len() < expected {
            return Err(IdxError::InvalidFormat(format!(
                "header region truncated: {} of {} bytes",
                bytes.len(),
                expected
            )));
        }
        let p = Self::preamble_size(version);
        let preamble = decode_records(&bytes[..p], 4)?;
        let blocks = decode_records(&bytes[p..expected], BlockHeaderV5::SIZE)?;
        Ok(Self {
            preamble,
            blocks,
            blocksperfile,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        encode_records(&self.preamble, &mut out)?;
        encode_records(&self.blocks, &mut out)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v6_header_layout() {
        let mut h = BlockHeaderV6::default();
        h.set_offset(0x1_0000_0010);
        h.size = 64;
        h.set_encoding(CompressionTag::Zip, Layout::RowMajor);
        h.suffix[3] = 0xdead_beef;

        let bytes = big_endian().serialize(&h).unwrap();
        assert_eq!(bytes.len(), BlockHeaderV6::SIZE);
        // offset_low then offset_high, big-endian
        assert_eq!(&bytes[8..12], &[0, 0, 0, 0x10]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, 1]);
        assert_eq!(&bytes[20..24], &[0, 0, 0, 0x13]);
        assert_eq!(&bytes[36..40], &[0xde, 0xad, 0xbe, 0xef]);

        assert_eq!(h.offset(), 0x1_0000_0010);
        assert_eq!(h.layout(), Layout::RowMajor);
        assert_eq!(h.compression().unwrap(), CompressionTag::Zip);
    }

    #[test]
    fn test_v6_table_keeps_reserved_words() {
        let mut table = HeaderTableV6::new(2, 4);
        table.preamble[9] = 7;
        let h = table.get_mut(1, 2).unwrap();
        h.prefix[0] = 42;
        h.set_offset(400);
        h.size = 10;

        let bytes = table.encode().unwrap();
        assert_eq!(bytes.len(), HeaderTableV6::byte_size(2, 4));
        let back = HeaderTableV6::decode(&bytes, 2, 4).unwrap();
        assert_eq!(back, table);
        assert_eq!(back.get(1, 2).unwrap().prefix[0], 42);
        assert!(back.get(0, 2).unwrap().offset() == 0);
        assert!(back.get(2, 0).is_err());
    }

    #[test]
    fn test_v5_table() {
        let mut bytes = vec![0u8; HeaderTableV5::byte_size(5, 1, 2)];
        // second block header: offset=100, len=8, compressed=1
        let base = 16 + 12;
        bytes[base + 3] = 100;
        bytes[base + 7] = 8;
        bytes[base + 11] = 1;
        let table = HeaderTableV5::decode(&bytes, 5, 1, 2).unwrap();
        let h = table.get(0, 1).unwrap();
        assert_eq!(h.offset, 100);
        assert_eq!(h.len, 8);
        assert_eq!(h.compression(), CompressionTag::Zip);
        assert!(!table.get(0, 0).unwrap().is_stored());
        assert_eq!(table.encode().unwrap(), bytes);

        assert_eq!(HeaderTableV5::byte_size(1, 1, 2), 24);
    }

    #[test]
    fn test_tag_names() {
        assert_eq!(CompressionTag::from_name("zfp-precision=32").unwrap(), CompressionTag::Zfp);
        assert_eq!(CompressionTag::from_name("").unwrap(), CompressionTag::None);
        assert!(CompressionTag::from_name("brotli").is_err());
        assert_eq!(CompressionTag::from_bits(0x17), Some(CompressionTag::Lz4));
        assert_eq!(CompressionTag::from_bits(0x05), None);
    }
}
