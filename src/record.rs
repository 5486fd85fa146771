//! Byte layout of key/value records and grouped records.
//!
//! A plain record is `klen: u32 LE | vlen: u32 LE | key bytes | value bytes`.
//! A grouped record is `klen: u32 LE | key bytes | nvalue: u32 LE |
//! nvalue x (vlen: u32 LE) | concatenated value bytes`. All offsets are byte
//! offsets inside a block; records never span blocks.

/// Size of the two length prefixes on a plain record.
pub const HEADER_BYTES: usize = 8;

/// Encoded size of a plain record.
pub const fn record_size(key_len: usize, value_len: usize) -> usize {
    HEADER_BYTES + key_len + value_len
}

/// Encoded size of a grouped record with `nvalue` values totalling
/// `value_bytes`.
pub const fn grouped_size(key_len: usize, nvalue: usize, value_bytes: usize) -> usize {
    4 + key_len + 4 + 4 * nvalue + value_bytes
}

/// Append one encoded record, returning the bytes written.
pub fn write_record(buf: &mut Vec<u8>, key: &[u8], value: &[u8]) -> usize {
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);
    record_size(key.len(), value.len())
}

/// Borrowed view of one decoded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl Record<'_> {
    pub fn encoded_size(&self) -> usize {
        record_size(self.key.len(), self.value.len())
    }
}

fn read_u32(buf: &[u8], off: usize) -> Option<u32> {
    let bytes = buf.get(off..off + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().unwrap()))
}

/// Decode the record starting at `buf[0]`. Returns the record and its
/// encoded size, or `None` if the buffer is truncated.
pub fn read_record(buf: &[u8]) -> Option<(Record<'_>, usize)> {
    let klen = read_u32(buf, 0)? as usize;
    let vlen = read_u32(buf, 4)? as usize;
    let total = record_size(klen, vlen);
    if buf.len() < total {
        return None;
    }
    Some((
        Record {
            key: &buf[HEADER_BYTES..HEADER_BYTES + klen],
            value: &buf[HEADER_BYTES + klen..total],
        },
        total,
    ))
}

/// Iterator over the records packed into a byte range.
pub struct RecordReader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> RecordReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    /// Byte offset of the next undecoded record.
    pub fn offset(&self) -> usize {
        self.off
    }
}

impl<'a> Iterator for RecordReader<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Record<'a>> {
        let (rec, size) = read_record(&self.buf[self.off..])?;
        self.off += size;
        Some(rec)
    }
}

/// Borrowed view of one grouped record: a key plus all its values.
#[derive(Debug, Clone, Copy)]
pub struct GroupedRecord<'a> {
    pub key: &'a [u8],
    nvalue: usize,
    lens: &'a [u8],
    values: &'a [u8],
}

impl<'a> GroupedRecord<'a> {
    pub fn nvalue(&self) -> usize {
        self.nvalue
    }

    /// Total bytes across all values.
    pub fn value_bytes(&self) -> usize {
        self.values.len()
    }

    pub fn values(&self) -> GroupedValues<'a> {
        GroupedValues {
            lens: self.lens,
            values: self.values,
            idx: 0,
            voff: 0,
        }
    }
}

/// Iterator over the values of one grouped record, in arrival order.
pub struct GroupedValues<'a> {
    lens: &'a [u8],
    values: &'a [u8],
    idx: usize,
    voff: usize,
}

impl<'a> Iterator for GroupedValues<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let len = read_u32(self.lens, self.idx * 4)? as usize;
        let v = &self.values[self.voff..self.voff + len];
        self.idx += 1;
        self.voff += len;
        Some(v)
    }
}

/// Decode the grouped record starting at `buf[0]`, returning it and its
/// encoded size, or `None` if the buffer is truncated.
pub fn read_grouped(buf: &[u8]) -> Option<(GroupedRecord<'_>, usize)> {
    let klen = read_u32(buf, 0)? as usize;
    let key = buf.get(4..4 + klen)?;
    let nvalue = read_u32(buf, 4 + klen)? as usize;
    let lens_at = 4 + klen + 4;
    let vals_at = lens_at + 4 * nvalue;
    let lens = buf.get(lens_at..vals_at)?;
    let mut value_bytes = 0usize;
    for i in 0..nvalue {
        value_bytes += read_u32(lens, i * 4)? as usize;
    }
    let total = vals_at + value_bytes;
    if buf.len() < total {
        return None;
    }
    Some((
        GroupedRecord {
            key,
            nvalue,
            lens,
            values: &buf[vals_at..total],
        },
        total,
    ))
}

/// Iterator over the grouped records packed into a byte range.
pub struct GroupedReader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> GroupedReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }
}

impl<'a> Iterator for GroupedReader<'a> {
    type Item = GroupedRecord<'a>;

    fn next(&mut self) -> Option<GroupedRecord<'a>> {
        let (rec, size) = read_grouped(&self.buf[self.off..])?;
        self.off += size;
        Some(rec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let mut buf = Vec::new();
        let n = write_record(&mut buf, b"apple", b"12");
        assert_eq!(n, record_size(5, 2));
        assert_eq!(buf.len(), n);
        let (rec, size) = read_record(&buf).unwrap();
        assert_eq!(rec.key, b"apple");
        assert_eq!(rec.value, b"12");
        assert_eq!(size, n);
    }

    #[test]
    fn test_empty_key_and_value() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"", b"");
        let (rec, size) = read_record(&buf).unwrap();
        assert_eq!(size, HEADER_BYTES);
        assert!(rec.key.is_empty());
        assert!(rec.value.is_empty());
    }

    #[test]
    fn test_reader_walks_packed_records() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"a", b"1");
        write_record(&mut buf, b"bb", b"22");
        write_record(&mut buf, b"ccc", b"333");
        let recs: Vec<_> = RecordReader::new(&buf).collect();
        assert_eq!(recs.len(), 3);
        assert_eq!(recs[1].key, b"bb");
        assert_eq!(recs[2].value, b"333");
    }

    #[test]
    fn test_reader_stops_on_truncation() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"key", b"value");
        buf.truncate(buf.len() - 1);
        assert_eq!(RecordReader::new(&buf).count(), 0);
    }

    #[test]
    fn test_grouped_roundtrip() {
        // klen | key | nvalue | vlens | values
        let mut buf = Vec::new();
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(b"sum");
        buf.extend_from_slice(&2u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&4u32.to_le_bytes());
        buf.extend_from_slice(b"x");
        buf.extend_from_slice(b"yyyy");
        assert_eq!(buf.len(), grouped_size(3, 2, 5));

        let (rec, size) = read_grouped(&buf).unwrap();
        assert_eq!(size, buf.len());
        assert_eq!(rec.key, b"sum");
        assert_eq!(rec.nvalue(), 2);
        assert_eq!(rec.value_bytes(), 5);
        let vals: Vec<_> = rec.values().collect();
        assert_eq!(vals, vec![b"x".as_slice(), b"yyyy".as_slice()]);
    }
}
