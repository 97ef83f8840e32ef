//! Body decoding ahead of XML parsing.
//!
//! A byte order mark wins, then the `encoding` of an ASCII-compatible XML
//! declaration, then UTF-8.

use std::borrow::Cow;

use encoding_rs::{Encoding, UTF_16BE, UTF_16LE, UTF_8};

use crate::{FaultError, FaultResult};

pub fn decode_body(body: &[u8]) -> FaultResult<Cow<'_, str>> {
    let (encoding, payload) = match Encoding::for_bom(body) {
        Some((encoding, bom_len)) => (encoding, &body[bom_len..]),
        None => (declared_encoding(body)?, body),
    };

    if encoding == UTF_8 {
        return Ok(Cow::Borrowed(std::str::from_utf8(payload)?));
    }
    encoding
        .decode_without_bom_handling_and_without_replacement(payload)
        .ok_or(FaultError::Undecodable(encoding.name()))
}

fn declared_encoding(body: &[u8]) -> FaultResult<&'static Encoding> {
    let Some(label) = declaration_label(body) else {
        return Ok(UTF_8);
    };
    let encoding = Encoding::for_label(label)
        .ok_or_else(|| FaultError::UnknownEncoding(String::from_utf8_lossy(label).into_owned()))?;

    // A declaration readable as ASCII rules out UTF-16 without a BOM.
    if encoding == UTF_16LE || encoding == UTF_16BE {
        Ok(UTF_8)
    } else {
        Ok(encoding)
    }
}

fn declaration_label(body: &[u8]) -> Option<&[u8]> {
    let rest = body.strip_prefix(b"<?xml")?;
    let end = rest.windows(2).position(|pair| pair == b"?>")?;
    let declaration = &rest[..end];

    let at = declaration
        .windows(b"encoding".len())
        .position(|window| window == b"encoding")?;
    let value = skip_whitespace(&declaration[at + b"encoding".len()..]);
    let value = skip_whitespace(value.strip_prefix(b"=")?);

    let (&quote, value) = value.split_first()?;
    if quote != b'"' && quote != b'\'' {
        return None;
    }
    let close = value.iter().position(|&byte| byte == quote)?;
    Some(&value[..close])
}

fn skip_whitespace(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}
