//! Binary self-serialization for anything that crosses a socket or sits in a
//! claim-check drawer. Integers are big-endian; strings are an `i32` byte
//! length (`-1` for absent) followed by UTF-8 bytes.

use std::io::{self, Cursor, Read, Write};

pub trait Publishable: Send + Sync {
    /// Writes this value so that `read_from` can reconstruct it completely.
    fn write_to(&self, output: &mut dyn Write) -> io::Result<()>;

    fn read_from(input: &mut dyn Read) -> io::Result<Self>
    where
        Self: Sized;
}

pub fn to_bytes<P: Publishable + ?Sized>(value: &P) -> io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    value.write_to(&mut buffer)?;
    Ok(buffer)
}

/// Decodes a value and rejects bytes left over after it.
pub fn from_bytes<P: Publishable>(bytes: &[u8]) -> io::Result<P> {
    let mut cursor = Cursor::new(bytes);
    let value = P::read_from(&mut cursor)?;
    if cursor.position() as usize != bytes.len() {
        return Err(invalid_data(format!(
            "{} trailing bytes after decoded value",
            bytes.len() - cursor.position() as usize
        )));
    }
    Ok(value)
}

pub fn write_i64(output: &mut dyn Write, value: i64) -> io::Result<()> {
    output.write_all(&value.to_be_bytes())
}

pub fn read_i64(input: &mut dyn Read) -> io::Result<i64> {
    let mut bytes = [0_u8; 8];
    input.read_exact(&mut bytes)?;
    Ok(i64::from_be_bytes(bytes))
}

pub fn write_i32(output: &mut dyn Write, value: i32) -> io::Result<()> {
    output.write_all(&value.to_be_bytes())
}

pub fn read_i32(input: &mut dyn Read) -> io::Result<i32> {
    let mut bytes = [0_u8; 4];
    input.read_exact(&mut bytes)?;
    Ok(i32::from_be_bytes(bytes))
}

pub fn write_bool(output: &mut dyn Write, value: bool) -> io::Result<()> {
    output.write_all(&[u8::from(value)])
}

pub fn read_bool(input: &mut dyn Read) -> io::Result<bool> {
    let mut byte = [0_u8; 1];
    input.read_exact(&mut byte)?;
    match byte[0] {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(invalid_data(format!("invalid boolean byte {other}"))),
    }
}

pub fn write_bytes(output: &mut dyn Write, bytes: Option<&[u8]>) -> io::Result<()> {
    match bytes {
        None => write_i32(output, -1),
        Some(bytes) => {
            let len = i32::try_from(bytes.len())
                .map_err(|_| invalid_data(format!("blob of {} bytes is too long", bytes.len())))?;
            write_i32(output, len)?;
            output.write_all(bytes)
        }
    }
}

pub fn read_bytes(input: &mut dyn Read) -> io::Result<Option<Vec<u8>>> {
    let len = read_i32(input)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    let mut bytes = Vec::new();
    (&mut *input).take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() < len {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {len} bytes, found {}", bytes.len()),
        ));
    }
    Ok(Some(bytes))
}

pub fn write_string(output: &mut dyn Write, value: Option<&str>) -> io::Result<()> {
    write_bytes(output, value.map(str::as_bytes))
}

pub fn read_string(input: &mut dyn Read) -> io::Result<Option<String>> {
    match read_bytes(input)? {
        None => Ok(None),
        Some(bytes) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|error| invalid_data(format!("string is not UTF-8: {error}"))),
    }
}

pub(crate) fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

impl Publishable for String {
    fn write_to(&self, output: &mut dyn Write) -> io::Result<()> {
        write_string(output, Some(self))
    }

    fn read_from(input: &mut dyn Read) -> io::Result<Self> {
        read_string(input)?.ok_or_else(|| invalid_data("expected a string, found absent marker"))
    }
}

impl Publishable for Vec<u8> {
    fn write_to(&self, output: &mut dyn Write) -> io::Result<()> {
        write_bytes(output, Some(self))
    }

    fn read_from(input: &mut dyn Read) -> io::Result<Self> {
        read_bytes(input)?.ok_or_else(|| invalid_data("expected a blob, found absent marker"))
    }
}

/// MessagePack values are self-delimiting, so they are written bare.
impl Publishable for rmpv::Value {
    fn write_to(&self, mut output: &mut dyn Write) -> io::Result<()> {
        rmpv::encode::write_value(&mut output, self)
            .map_err(|error| io::Error::new(io::ErrorKind::Other, error.to_string()))
    }

    fn read_from(mut input: &mut dyn Read) -> io::Result<Self> {
        rmpv::decode::read_value(&mut input)
            .map_err(|error| invalid_data(format!("messagepack decode error: {error}")))
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, ErrorKind};

    use rmpv::Value;

    use super::{
        from_bytes, read_bool, read_bytes, read_string, to_bytes, write_bool, write_i64, write_string,
        Publishable,
    };

    #[test]
    fn absent_string_uses_negative_length_marker() {
        let mut buffer = Vec::new();
        write_string(&mut buffer, None).expect("write should succeed");
        assert_eq!(buffer, (-1_i32).to_be_bytes());

        let decoded = read_string(&mut Cursor::new(buffer)).expect("read should succeed");
        assert_eq!(decoded, None);
    }

    #[test]
    fn oversized_length_header_fails_without_payload() {
        let header = i32::MAX.to_be_bytes().to_vec();
        let error = read_bytes(&mut Cursor::new(header)).expect_err("no payload follows");
        assert_eq!(error.kind(), ErrorKind::UnexpectedEof);

        let mut short = 3_i32.to_be_bytes().to_vec();
        short.push(1);
        assert!(read_bytes(&mut Cursor::new(short)).is_err());
    }

    #[test]
    fn integers_are_big_endian() {
        let mut buffer = Vec::new();
        write_i64(&mut buffer, 258).expect("write should succeed");
        assert_eq!(buffer, vec![0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn rejects_invalid_boolean_byte() {
        let error = read_bool(&mut Cursor::new(vec![7_u8])).expect_err("7 is not a bool");
        assert_eq!(error.kind(), ErrorKind::InvalidData);

        let mut buffer = Vec::new();
        write_bool(&mut buffer, true).expect("write should succeed");
        assert!(read_bool(&mut Cursor::new(buffer)).expect("read should succeed"));
    }

    #[test]
    fn from_bytes_rejects_trailing_data() {
        let mut bytes = to_bytes(&"result".to_owned()).expect("string should encode");
        bytes.push(0);

        let error = from_bytes::<String>(&bytes).expect_err("trailing byte should fail");
        assert_eq!(error.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn messagepack_values_are_publishable() {
        let value = Value::Map(vec![(Value::from("op"), Value::from("reserve"))]);
        let bytes = to_bytes(&value).expect("value should encode");
        let decoded: Value = from_bytes(&bytes).expect("value should decode");

        assert_eq!(decoded, value);
        let truncated = Value::read_from(&mut Cursor::new(vec![0xa5_u8, b'a']));
        assert!(truncated.is_err());
    }
}
