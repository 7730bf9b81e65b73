//! Sideband metadata framing for punted packets.
//!
//! A metadata block travels in front of the raw frame in the same buffer:
//!
//! ```text
//! [u32 signature][u32 total_len] ([u32 tag][u64 len][len bytes value])*
//! ```
//!
//! All integers are little-endian. `total_len` covers the header plus every
//! attribute written so far, so it doubles as the offset of the frame bytes.
//! Buffers that do not start with [`META_SIGNATURE`] carry no metadata.

use thiserror::Error;

/// Marks a buffer as carrying a metadata header.
pub const META_SIGNATURE: u32 = 0xdead_beef;

/// Size of the fixed header (signature + total length).
pub const META_HEADER_LEN: usize = 8;

/// Size of one attribute's tag and length fields.
pub const META_ATTR_HEADER_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetaError {
    #[error("buffer of {0} bytes cannot hold a metadata header")]
    BufferTooSmall(usize),

    #[error("no room for {tag:?}: need {needed} bytes, {remaining} left")]
    NoSpace {
        tag: MetaAttrType,
        needed: usize,
        remaining: usize,
    },
}

pub type Result<T> = std::result::Result<T, MetaError>;

/// Attribute tags understood by metadata consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MetaAttrType {
    RxPort = 0,
    TxPort = 1,
    SampleCount = 2,
    PktLen = 3,
    TrapId = 4,
}

impl TryFrom<u32> for MetaAttrType {
    type Error = u32;

    fn try_from(tag: u32) -> std::result::Result<Self, u32> {
        match tag {
            0 => Ok(Self::RxPort),
            1 => Ok(Self::TxPort),
            2 => Ok(Self::SampleCount),
            3 => Ok(Self::PktLen),
            4 => Ok(Self::TrapId),
            other => Err(other),
        }
    }
}

/// Writes a metadata block into a caller-provided buffer.
#[derive(Debug)]
pub struct MetaWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> MetaWriter<'a> {
    /// Writes the signature and a header-only total length.
    pub fn new(buf: &'a mut [u8]) -> Result<Self> {
        if buf.len() < META_HEADER_LEN {
            return Err(MetaError::BufferTooSmall(buf.len()));
        }
        buf[0..4].copy_from_slice(&META_SIGNATURE.to_le_bytes());
        let mut writer = Self {
            buf,
            pos: META_HEADER_LEN,
        };
        writer.sync_total_len();
        Ok(writer)
    }

    pub fn append_u32(&mut self, tag: MetaAttrType, value: u32) -> Result<()> {
        self.append(tag, &value.to_le_bytes())
    }

    pub fn append_u64(&mut self, tag: MetaAttrType, value: u64) -> Result<()> {
        self.append(tag, &value.to_le_bytes())
    }

    /// Appends one attribute, leaving the buffer untouched if it does not fit.
    pub fn append(&mut self, tag: MetaAttrType, value: &[u8]) -> Result<()> {
        let needed = META_ATTR_HEADER_LEN + value.len();
        let remaining = self.remaining();
        if needed > remaining || self.pos + needed > u32::MAX as usize {
            return Err(MetaError::NoSpace {
                tag,
                needed,
                remaining,
            });
        }

        let record = &mut self.buf[self.pos..self.pos + needed];
        record[0..4].copy_from_slice(&(tag as u32).to_le_bytes());
        record[4..12].copy_from_slice(&(value.len() as u64).to_le_bytes());
        record[12..].copy_from_slice(value);

        self.pos += needed;
        self.sync_total_len();
        Ok(())
    }

    /// Bytes still available for attributes.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Encoded length so far, header included.
    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == META_HEADER_LEN
    }

    /// The encoded block, ready to be sent ahead of the frame.
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    fn sync_total_len(&mut self) {
        self.buf[4..8].copy_from_slice(&(self.pos as u32).to_le_bytes());
    }
}

/// One decoded attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetaAttr<'a> {
    tag: u32,
    value: &'a [u8],
}

impl<'a> MetaAttr<'a> {
    /// Raw tag as found on the wire.
    pub fn tag(&self) -> u32 {
        self.tag
    }

    /// Known tag, or `None` for tags this build does not understand.
    pub fn attr_type(&self) -> Option<MetaAttrType> {
        MetaAttrType::try_from(self.tag).ok()
    }

    pub fn data(&self) -> &'a [u8] {
        self.value
    }

    /// Reads the value as an unsigned integer chosen by its encoded width.
    ///
    /// 1, 2 and 4 byte values are widened; 8 byte values keep only their low
    /// 32 bits. Consumers of the existing wire format depend on this, use
    /// [`MetaAttr::data_u64`] when the full counter is needed.
    pub fn data_uint(&self) -> u32 {
        match self.value.len() {
            8 => self.data_u64() as u32,
            4 => u32::from_le_bytes([self.value[0], self.value[1], self.value[2], self.value[3]]),
            2 => u16::from_le_bytes([self.value[0], self.value[1]]) as u32,
            1 => self.value[0] as u32,
            _ => 0,
        }
    }

    /// Full 64-bit read of an 8 byte value; narrower values are widened.
    pub fn data_u64(&self) -> u64 {
        match <[u8; 8]>::try_from(self.value) {
            Ok(bytes) => u64::from_le_bytes(bytes),
            Err(_) => self.data_uint() as u64,
        }
    }
}

/// Iterator over the attributes of a metadata block.
#[derive(Debug, Clone)]
pub struct MetaIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for MetaIter<'a> {
    type Item = MetaAttr<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.len() < META_ATTR_HEADER_LEN {
            self.rest = &[];
            return None;
        }
        let tag = read_u32(self.rest, 0);
        let len = u64::from_le_bytes(self.rest[4..12].try_into().ok()?);

        // A zero-length record or one that overruns the block ends iteration.
        let end = usize::try_from(len)
            .ok()
            .and_then(|len| len.checked_add(META_ATTR_HEADER_LEN))
            .filter(|end| len != 0 && *end <= self.rest.len());
        let Some(end) = end else {
            self.rest = &[];
            return None;
        };

        let attr = MetaAttr {
            tag,
            value: &self.rest[META_ATTR_HEADER_LEN..end],
        };
        self.rest = &self.rest[end..];
        Some(attr)
    }
}

/// Starts a metadata block at the front of `buf`.
pub fn init_writer(buf: &mut [u8]) -> Result<MetaWriter<'_>> {
    MetaWriter::new(buf)
}

/// Starts reading a metadata block, or `None` if the buffer carries none.
pub fn begin_read(buf: &[u8]) -> Option<MetaIter<'_>> {
    let total = header_total_len(buf)?;
    Some(MetaIter {
        rest: &buf[META_HEADER_LEN..total],
    })
}

/// Offset of the frame bytes: the block length, or 0 without a valid header.
pub fn data_offset(buf: &[u8]) -> usize {
    header_total_len(buf).unwrap_or(0)
}

fn header_total_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < META_HEADER_LEN || read_u32(buf, 0) != META_SIGNATURE {
        return None;
    }
    let total = read_u32(buf, 4) as usize;
    (META_HEADER_LEN..=buf.len()).contains(&total).then_some(total)
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_header_only() {
        let mut buf = [0u8; 64];
        let writer = init_writer(&mut buf).unwrap();
        assert!(writer.is_empty());
        assert_eq!(writer.len(), META_HEADER_LEN);
        assert_eq!(&buf[0..4], &META_SIGNATURE.to_le_bytes());
        assert_eq!(data_offset(&buf), META_HEADER_LEN);
        assert_eq!(begin_read(&buf).unwrap().count(), 0);
    }

    #[test]
    fn test_writer_rejects_short_buffer() {
        let mut buf = [0u8; 7];
        assert_eq!(
            MetaWriter::new(&mut buf).unwrap_err(),
            MetaError::BufferTooSmall(7)
        );
    }

    #[test]
    fn test_round_trip_preserves_order() {
        let mut buf = [0u8; 256];
        let mut writer = MetaWriter::new(&mut buf).unwrap();
        writer.append_u32(MetaAttrType::RxPort, 12).unwrap();
        writer.append_u32(MetaAttrType::TxPort, 13).unwrap();
        writer.append_u64(MetaAttrType::SampleCount, 1 << 40).unwrap();
        writer.append_u32(MetaAttrType::PktLen, 1500).unwrap();
        let len = writer.len();
        assert_eq!(len, META_HEADER_LEN + 3 * (12 + 4) + (12 + 8));

        let attrs: Vec<_> = begin_read(&buf)
            .unwrap()
            .map(|a| (a.attr_type().unwrap(), a.data_u64()))
            .collect();
        assert_eq!(
            attrs,
            vec![
                (MetaAttrType::RxPort, 12),
                (MetaAttrType::TxPort, 13),
                (MetaAttrType::SampleCount, 1 << 40),
                (MetaAttrType::PktLen, 1500),
            ]
        );
        assert_eq!(data_offset(&buf), len);
    }

    #[test]
    fn test_wire_layout() {
        let mut buf = [0u8; 32];
        let mut writer = MetaWriter::new(&mut buf).unwrap();
        writer.append_u32(MetaAttrType::TrapId, 0x0102_0304).unwrap();
        assert_eq!(
            writer.written(),
            &[
                0xef, 0xbe, 0xad, 0xde, // signature
                24, 0, 0, 0, // total_len
                4, 0, 0, 0, // tag
                4, 0, 0, 0, 0, 0, 0, 0, // len
                0x04, 0x03, 0x02, 0x01, // value
            ]
        );
    }

    #[test]
    fn test_data_uint_truncates_u64() {
        let mut buf = [0u8; 64];
        let mut writer = MetaWriter::new(&mut buf).unwrap();
        writer
            .append_u64(MetaAttrType::SampleCount, 0x0000_0001_8000_0002)
            .unwrap();
        writer.append(MetaAttrType::PktLen, &[0x34, 0x12]).unwrap();
        writer.append(MetaAttrType::TrapId, &[0x7f]).unwrap();

        let attrs: Vec<_> = begin_read(&buf).unwrap().collect();
        assert_eq!(attrs[0].data_uint(), 0x8000_0002);
        assert_eq!(attrs[0].data_u64(), 0x0000_0001_8000_0002);
        assert_eq!(attrs[1].data_uint(), 0x1234);
        assert_eq!(attrs[2].data_uint(), 0x7f);
    }

    #[test]
    fn test_odd_width_reads_zero() {
        let mut buf = [0u8; 64];
        let mut writer = MetaWriter::new(&mut buf).unwrap();
        writer.append(MetaAttrType::RxPort, &[1, 2, 3]).unwrap();
        let attr = begin_read(&buf).unwrap().next().unwrap();
        assert_eq!(attr.data_uint(), 0);
        assert_eq!(attr.data(), &[1, 2, 3]);
    }

    #[test]
    fn test_append_overflow_keeps_previous_attribute() {
        // Room for the header and exactly one u64 attribute.
        let mut buf = [0u8; META_HEADER_LEN + META_ATTR_HEADER_LEN + 8];
        let mut writer = MetaWriter::new(&mut buf).unwrap();
        writer.append_u64(MetaAttrType::SampleCount, 41).unwrap();
        let err = writer.append_u64(MetaAttrType::SampleCount, 42).unwrap_err();
        assert_eq!(
            err,
            MetaError::NoSpace {
                tag: MetaAttrType::SampleCount,
                needed: 20,
                remaining: 0,
            }
        );

        let attrs: Vec<_> = begin_read(&buf).unwrap().collect();
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].data_u64(), 41);
    }

    #[test]
    fn test_sixteen_byte_buffer_rejects_u64() {
        let mut buf = [0u8; 16];
        let mut writer = MetaWriter::new(&mut buf).unwrap();
        assert!(writer.append_u64(MetaAttrType::SampleCount, 1).is_err());
        assert!(writer.append_u64(MetaAttrType::SampleCount, 2).is_err());
        assert_eq!(data_offset(&buf), META_HEADER_LEN);
        assert_eq!(begin_read(&buf).unwrap().count(), 0);
    }

    #[test]
    fn test_no_signature_means_no_metadata() {
        let frame = [0xffu8; 64];
        assert!(begin_read(&frame).is_none());
        assert_eq!(data_offset(&frame), 0);
        assert_eq!(data_offset(&[]), 0);
    }

    #[test]
    fn test_bogus_total_len_is_rejected() {
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&META_SIGNATURE.to_le_bytes());
        buf[4..8].copy_from_slice(&100u32.to_le_bytes());
        assert!(begin_read(&buf).is_none());
        assert_eq!(data_offset(&buf), 0);

        buf[4..8].copy_from_slice(&4u32.to_le_bytes());
        assert_eq!(data_offset(&buf), 0);
    }

    #[test]
    fn test_zero_length_record_ends_iteration() {
        let mut buf = [0u8; 64];
        let mut writer = MetaWriter::new(&mut buf).unwrap();
        writer.append_u32(MetaAttrType::RxPort, 5).unwrap();
        writer.append(MetaAttrType::TxPort, &[]).unwrap();
        writer.append_u32(MetaAttrType::PktLen, 9).unwrap();

        let attrs: Vec<_> = begin_read(&buf).unwrap().collect();
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].data_uint(), 5);
    }

    #[test]
    fn test_unknown_tag_is_surfaced() {
        let mut buf = [0u8; 64];
        let mut writer = MetaWriter::new(&mut buf).unwrap();
        writer.append_u32(MetaAttrType::RxPort, 5).unwrap();
        let len = writer.len();
        // Patch the tag to something this build does not know.
        buf[META_HEADER_LEN..META_HEADER_LEN + 4].copy_from_slice(&99u32.to_le_bytes());
        let attr = begin_read(&buf[..len]).unwrap().next().unwrap();
        assert_eq!(attr.tag(), 99);
        assert_eq!(attr.attr_type(), None);
    }
}
