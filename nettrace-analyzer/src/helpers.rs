use std::io::{Read, Seek, SeekFrom};

use binrw::{BinRead, BinReaderExt, BinResult, NullWideString};

// LEB128 width caps: 5 bytes carry up to 35 payload bits for a 32-bit
// result, 10 bytes up to 70 bits for a 64-bit result. A continuation bit
// past the cap is malformed, not just truncated.
const MAX_VARINT_BITS_U32: u32 = 35;
const MAX_VARINT_BITS_U64: u32 = 70;

fn parse_varint<R: BinReaderExt + Read + Seek>(reader: &mut R, max_bits: u32) -> BinResult<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte: u8 = reader.read_le()?;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= max_bits {
            return Err(binrw::Error::AssertFail {
                pos: reader.stream_position().unwrap_or(0),
                message: format!("varint continues past {max_bits} bits"),
            });
        }
    }
}

pub fn parse_varint_u64<R: BinReaderExt + Read + Seek>(reader: &mut R) -> BinResult<u64> {
    parse_varint(reader, MAX_VARINT_BITS_U64)
}

pub fn parse_varint_u32<R: BinReaderExt + Read + Seek>(reader: &mut R) -> BinResult<u32> {
    parse_varint(reader, MAX_VARINT_BITS_U32).map(|x| x as u32)
}

pub fn parse_varint_i64<R: BinReaderExt + Read + Seek>(reader: &mut R) -> BinResult<i64> {
    parse_varint_u64(reader).map(|x| x as i64)
}

/// Reads a null-terminated UTF-16LE string.
pub fn read_utf16z<R: Read + Seek>(reader: &mut R) -> BinResult<String> {
    let wide = NullWideString::read_le(reader)?;
    if wide.0.is_empty() {
        Ok(String::new())
    } else {
        Ok(wide.to_string())
    }
}

/// Advances the reader to the next 4-byte boundary of the underlying
/// stream. The whole trace is parsed through a single cursor, so stream
/// position equals file offset and this lands on the file's 4-byte grid.
pub fn align_to_4<R: Seek>(reader: &mut R) -> BinResult<()> {
    let pos = reader.stream_position()?;
    let rem = pos % 4;
    if rem != 0 {
        reader.seek(SeekFrom::Current((4 - rem) as i64))?;
    }
    Ok(())
}

/// Reads one byte without consuming it.
pub fn peek_u8<R: BinReaderExt + Read + Seek>(reader: &mut R) -> BinResult<u8> {
    let byte: u8 = reader.read_le()?;
    reader.seek(SeekFrom::Current(-1))?;
    Ok(byte)
}
