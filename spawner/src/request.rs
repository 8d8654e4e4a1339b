//! Framing for requests sent to a spawned application.
//!
//! A request is one scalar message: a 4-byte big-endian length followed by
//! that many bytes of body. The body is a flat list of NUL-terminated
//! strings read as alternating keys and values, and always ends with the
//! `PASSENGER_CONNECT_PASSWORD` pair.

use std::io;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

/// Environment variable and header carrying the per-process secret.
pub const CONNECT_PASSWORD_KEY: &str = "PASSENGER_CONNECT_PASSWORD";

/// Requests larger than this are refused by [`read_scalar_message`].
pub const MAX_SCALAR_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Builds the header body, appending the connect password pair last.
pub fn encode_headers(headers: &[(&str, &str)], connect_password: &str) -> io::Result<Vec<u8>> {
    let mut body = Vec::new();
    for (key, value) in headers
        .iter()
        .copied()
        .chain(std::iter::once((CONNECT_PASSWORD_KEY, connect_password)))
    {
        push_field(&mut body, key)?;
        push_field(&mut body, value)?;
    }
    Ok(body)
}

fn push_field(body: &mut Vec<u8>, field: &str) -> io::Result<()> {
    if field.as_bytes().contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("header field {field:?} contains a NUL byte"),
        ));
    }
    body.extend_from_slice(field.as_bytes());
    body.push(0);
    Ok(())
}

/// Splits a header body back into key/value pairs.
pub fn decode_headers(body: &[u8]) -> io::Result<Vec<(String, String)>> {
    let Some(body) = body.strip_suffix(&[0]) else {
        if body.is_empty() {
            return Ok(Vec::new());
        }
        return Err(invalid_data("header body is not NUL-terminated"));
    };
    let fields: Vec<&[u8]> = body.split(|byte| *byte == 0).collect();
    if fields.len() % 2 != 0 {
        return Err(invalid_data("header body has a key without a value"));
    }
    fields
        .chunks(2)
        .map(|pair| {
            let key = String::from_utf8(pair[0].to_vec())
                .map_err(|_| invalid_data("header key is not UTF-8"))?;
            let value = String::from_utf8(pair[1].to_vec())
                .map_err(|_| invalid_data("header value is not UTF-8"))?;
            Ok((key, value))
        })
        .collect()
}

pub async fn write_scalar_message<W>(writer: &mut W, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "scalar message too large"))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Returns `None` on a clean EOF before the length prefix.
pub async fn read_scalar_message<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_SCALAR_MESSAGE_LEN {
        return Err(invalid_data("scalar message exceeds the size limit"));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

fn invalid_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}
