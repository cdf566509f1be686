use anyhow::bail;
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};


pub fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let len = buf.try_get_usize_varint()?;
    if len > buf.remaining() {
        bail!("string length {} exceeds remaining buffer of {} bytes", len, buf.remaining());
    }

    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);

    let s = String::from_utf8(result)?;
    Ok(s)
}

pub fn put_optional_string(buf: &mut impl BufMut, s: Option<&str>) {
    match s {
        None => buf.put_u8(0),
        Some(s) => {
            buf.put_u8(1);
            put_string(buf, s);
        }
    }
}

pub fn try_get_optional_string(buf: &mut impl Buf) -> anyhow::Result<Option<String>> {
    match buf.try_get_u8()? {
        0 => Ok(None),
        1 => Ok(Some(try_get_string(buf)?)),
        n => bail!("invalid option discriminator: {}", n),
    }
}

pub fn put_bool(buf: &mut impl BufMut, value: bool) {
    buf.put_u8(if value { 1 } else { 0 });
}

pub fn try_get_bool(buf: &mut impl Buf) -> anyhow::Result<bool> {
    match buf.try_get_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        n => bail!("invalid boolean value: {}", n),
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::empty("")]
    #[case::ascii("peer-a")]
    #[case::multi_byte("grüße 🚀")]
    fn test_string(#[case] s: &str) {
        let mut buf = BytesMut::new();
        put_string(&mut buf, s);

        let mut b: &[u8] = &buf;
        assert_eq!(try_get_string(&mut b).unwrap(), s);
        assert!(b.is_empty());
    }

    #[rstest]
    #[case::truncated(&[5, b'a', b'b'])]
    #[case::invalid_utf8(&[2, 0xc3, 0x28])]
    #[case::no_length(&[])]
    fn test_string_malformed(#[case] raw: &[u8]) {
        let mut b = raw;
        assert!(try_get_string(&mut b).is_err());
    }

    #[rstest]
    #[case::none(&[0], Some(None))]
    #[case::some(&[1, 1, b'x'], Some(Some("x".to_string())))]
    #[case::invalid_discriminator(&[2, 1, b'x'], None)]
    fn test_optional_string(#[case] raw: &[u8], #[case] expected: Option<Option<String>>) {
        let mut b = raw;
        assert_eq!(try_get_optional_string(&mut b).ok(), expected);
    }

    #[rstest]
    #[case::f(&[0], Some(false))]
    #[case::t(&[1], Some(true))]
    #[case::invalid(&[7], None)]
    #[case::empty(&[], None)]
    fn test_bool(#[case] raw: &[u8], #[case] expected: Option<bool>) {
        let mut b = raw;
        assert_eq!(try_get_bool(&mut b).ok(), expected);
    }
}
