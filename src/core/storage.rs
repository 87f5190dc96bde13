use std::io::{self, Read, Write};

pub const MAGIC: &[u8; 8] = b"DSNGLR01";
pub const VERSION_V1: u32 = 1;
pub const VERSION_CURRENT: u32 = VERSION_V1;

/// Upper bound accepted for a single decompressed chunk. Corrupt length
/// fields must not turn into huge allocations.
pub const MAX_CHUNK_BYTES: usize = 256 << 20;

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    if expected_size > MAX_CHUNK_BYTES {
        return Err(invalid("chunk exceeds size limit"));
    }
    let out = lz4_flex::decompress(input, expected_size)
        .map_err(|_| invalid("lz4 decompression failed"))?;
    if out.len() != expected_size {
        return Err(invalid("chunk length mismatch after decompression"));
    }
    Ok(out)
}

pub fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Counts bytes without storing them.
pub struct CountingWriter {
    written: usize,
}

impl CountingWriter {
    pub fn new() -> Self {
        Self { written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl Default for CountingWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written = self.written.saturating_add(buf.len());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_all(&[v])
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_i32_le<W: Write>(w: &mut W, v: i32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u64_le<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_f32_le<W: Write>(w: &mut W, v: f32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

/// Write `usize` as u32, failing instead of truncating.
pub fn write_len<W: Write>(w: &mut W, n: usize) -> io::Result<()> {
    let n = u32::try_from(n).map_err(|_| invalid("length does not fit in u32"))?;
    write_u32_le(w, n)
}

/// Raw f32 array without a length prefix; the reader knows the length.
pub fn write_f32_slice<W: Write>(w: &mut W, values: &[f32]) -> io::Result<()> {
    for &v in values {
        write_f32_le(w, v)?;
    }
    Ok(())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    Ok(read_exact::<1, _>(r)?[0])
}

pub fn read_bool<R: Read>(r: &mut R) -> io::Result<bool> {
    match read_u8(r)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(invalid("invalid bool byte")),
    }
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_i32_le<R: Read>(r: &mut R) -> io::Result<i32> {
    Ok(i32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_u64_le<R: Read>(r: &mut R) -> io::Result<u64> {
    Ok(u64::from_le_bytes(read_exact::<8, _>(r)?))
}

pub fn read_f32_le<R: Read>(r: &mut R) -> io::Result<f32> {
    Ok(f32::from_le_bytes(read_exact::<4, _>(r)?))
}

/// Read a u32 length and reject it if it exceeds `max`.
pub fn read_len<R: Read>(r: &mut R, max: usize) -> io::Result<usize> {
    let n = read_u32_le(r)? as usize;
    if n > max {
        return Err(invalid("length field out of range"));
    }
    Ok(n)
}

pub fn read_f32_vec<R: Read>(r: &mut R, n: usize) -> io::Result<Vec<f32>> {
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        out.push(read_f32_le(r)?);
    }
    Ok(out)
}

/// Write an LZ4 chunk: payload is compressed and preceded by its uncompressed length.
///
/// Layout:
/// - tag: [u8;4]
/// - len: u32 (bytes following, including the 4-byte uncompressed length)
/// - uncompressed_len: u32
/// - compressed payload bytes
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let uncompressed_len =
        u32::try_from(payload.len()).map_err(|_| invalid("chunk too large"))?;
    let total_len = 4u32.saturating_add(
        u32::try_from(compressed.len()).map_err(|_| invalid("chunk too large"))?,
    );

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)
}

pub fn read_chunk_header<R: Read>(r: &mut R) -> io::Result<([u8; 4], u32)> {
    let tag = read_exact::<4, _>(r)?;
    let len = read_u32_le(r)?;
    Ok((tag, len))
}

/// Read the body of a chunk whose header was already consumed.
pub fn read_chunk_payload<R: Read>(r: &mut R, len: u32) -> io::Result<Vec<u8>> {
    if len < 4 {
        return Err(invalid("chunk shorter than its length prefix"));
    }
    let mut take = r.take(len as u64);
    let uncompressed_len = read_u32_le(&mut take)? as usize;
    let mut compressed = Vec::with_capacity((len as usize - 4).min(MAX_CHUNK_BYTES));
    take.read_to_end(&mut compressed)?;
    if compressed.len() != len as usize - 4 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated chunk body",
        ));
    }
    decompress_lz4(&compressed, uncompressed_len)
}
