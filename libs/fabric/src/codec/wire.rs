//! Field encodings shared by both codec directions
//!
//! `string` is a u8 length followed by bytes, `blob` a big-endian u32 length
//! followed by bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub(crate) fn put_string(dst: &mut BytesMut, value: &str) -> Result<()> {
    let len = u8::try_from(value.len())
        .map_err(|_| Error::protocol(format!("string field too long: {} bytes", value.len())))?;
    dst.put_u8(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn put_blob(dst: &mut BytesMut, value: &[u8]) -> Result<()> {
    let len = u32::try_from(value.len())
        .map_err(|_| Error::protocol(format!("blob field too long: {} bytes", value.len())))?;
    dst.put_u32(len);
    dst.put_slice(value);
    Ok(())
}

pub(crate) fn string_len(value: &str) -> usize {
    1 + value.len()
}

pub(crate) fn blob_len(value: &[u8]) -> usize {
    4 + value.len()
}

fn ensure(src: &Bytes, needed: usize, field: &str) -> Result<()> {
    if src.remaining() < needed {
        return Err(Error::protocol(format!(
            "truncated frame: {} needs {} bytes, {} left",
            field,
            needed,
            src.remaining()
        )));
    }
    Ok(())
}

pub(crate) fn get_u8(src: &mut Bytes, field: &str) -> Result<u8> {
    ensure(src, 1, field)?;
    Ok(src.get_u8())
}

pub(crate) fn get_u32(src: &mut Bytes, field: &str) -> Result<u32> {
    ensure(src, 4, field)?;
    Ok(src.get_u32())
}

pub(crate) fn get_string(src: &mut Bytes, field: &str) -> Result<String> {
    let len = get_u8(src, field)? as usize;
    ensure(src, len, field)?;
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| Error::protocol(format!("{} is not valid UTF-8", field)))
}

pub(crate) fn get_blob(src: &mut Bytes, field: &str) -> Result<Bytes> {
    let len = get_u32(src, field)? as usize;
    ensure(src, len, field)?;
    Ok(src.split_to(len))
}
