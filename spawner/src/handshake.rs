//! Startup handshake read from the child's control channel, a socket the
//! child inherits as a dedicated descriptor separate from its stdout.
//!
//! Grammar, one line at a time:
//!
//! ```text
//! socket: <name>;<address>[;<protocol>[;<concurrency>]]   announce an endpoint
//! <empty line>                                             end of announcements -> Ready
//! !> Error                                                 explainable error follows
//! !> <anything else>                                       protocol error
//! ```
//!
//! After `!> Error`, optional `!> key: value` attribute lines may follow,
//! closed by a bare `!>` line. Everything after that (or everything after the
//! directive if no attribute block is present) up to EOF is the error page,
//! kept verbatim.
//!
//! Lines are capped at [`MAX_HANDSHAKE_LINE_LEN`] and the error page at
//! [`MAX_ERROR_PAGE_LEN`]; exceeding either is a protocol error.
//!
//! A single deadline covers the whole exchange. If it passes while a page is
//! still being read, the outcome is [`HandshakeOutcome::Timeout`], never a
//! truncated page.

use tokio::io::AsyncBufRead;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;

use crate::pool::SocketAddress;

/// Two-byte prefix announcing a directive rather than an endpoint.
pub const ERROR_MARKER: &str = "!>";
pub const ERROR_DIRECTIVE: &str = "Error";
const SOCKET_PREFIX: &str = "socket:";
const DEFAULT_PROTOCOL: &str = "session";
const DEFAULT_CONCURRENCY: u32 = 1;
pub const MAX_HANDSHAKE_LINE_LEN: usize = 64 * 1024;
pub const MAX_ERROR_PAGE_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAnnouncement {
    pub name: String,
    pub address: SocketAddress,
    pub protocol: String,
    pub concurrency: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Endpoints in announced order; index 0 is the default endpoint.
    Ready(Vec<EndpointAnnouncement>),
    ExplainableError {
        page: String,
        attributes: Vec<(String, String)>,
    },
    ProtocolError(String),
    Timeout,
}

pub async fn read_handshake<R>(reader: &mut R, deadline: Instant) -> HandshakeOutcome
where
    R: AsyncBufRead + Unpin,
{
    match tokio::time::timeout_at(deadline, classify(reader)).await {
        Ok(outcome) => outcome,
        Err(_) => HandshakeOutcome::Timeout,
    }
}

async fn classify<R>(reader: &mut R) -> HandshakeOutcome
where
    R: AsyncBufRead + Unpin,
{
    let mut endpoints = Vec::new();
    loop {
        let line = match read_line(reader).await {
            Ok(Some(line)) => line,
            Ok(None) => {
                return HandshakeOutcome::ProtocolError(
                    "the application closed its control channel before it finished starting"
                        .to_string(),
                );
            }
            Err(err) => {
                return HandshakeOutcome::ProtocolError(format!(
                    "failed to read from the application's control channel: {err}"
                ));
            }
        };
        tracing::debug!("handshake line: {line:?}");

        if let Some(directive) = line.strip_prefix(ERROR_MARKER) {
            if directive.trim() == ERROR_DIRECTIVE {
                return read_error_report(reader).await;
            }
            return HandshakeOutcome::ProtocolError(format!(
                "the application sent an unrecognized directive: {line:?}"
            ));
        }

        if line.is_empty() {
            if endpoints.is_empty() {
                return HandshakeOutcome::ProtocolError(
                    "the application finished its handshake without announcing any socket"
                        .to_string(),
                );
            }
            return HandshakeOutcome::Ready(endpoints);
        }

        match parse_endpoint(&line) {
            Ok(endpoint) => endpoints.push(endpoint),
            Err(message) => return HandshakeOutcome::ProtocolError(message),
        }
    }
}

async fn read_error_report<R>(reader: &mut R) -> HandshakeOutcome
where
    R: AsyncBufRead + Unpin,
{
    let mut attributes = Vec::new();
    let mut page = Vec::new();
    loop {
        let raw = match read_bounded_line(reader).await {
            Ok(raw) if raw.is_empty() => {
                return HandshakeOutcome::ExplainableError {
                    page: String::new(),
                    attributes,
                };
            }
            Ok(raw) => raw,
            Err(err) => {
                return HandshakeOutcome::ProtocolError(format!(
                    "failed to read the application's error report: {err}"
                ));
            }
        };
        if is_truncated(&raw) {
            // Too long for an attribute; the page has started.
            page.extend_from_slice(&raw);
            break;
        }
        let line = String::from_utf8_lossy(trim_line_ending(&raw)).into_owned();
        match line.strip_prefix(ERROR_MARKER) {
            Some(rest) if rest.trim().is_empty() => break,
            Some(rest) => {
                let (key, value) = rest.split_once(':').unwrap_or((rest, ""));
                attributes.push((key.trim().to_string(), value.trim().to_string()));
            }
            None => {
                page.extend_from_slice(&raw);
                break;
            }
        }
    }

    // One byte past the cap tells an exactly-full page from an oversized one.
    let remaining = (MAX_ERROR_PAGE_LEN + 1).saturating_sub(page.len()) as u64;
    if let Err(err) = (&mut *reader).take(remaining).read_to_end(&mut page).await {
        return HandshakeOutcome::ProtocolError(format!(
            "failed to read the application's error page: {err}"
        ));
    }
    if page.len() > MAX_ERROR_PAGE_LEN {
        return HandshakeOutcome::ProtocolError(format!(
            "the application's error page exceeds {MAX_ERROR_PAGE_LEN} bytes"
        ));
    }
    HandshakeOutcome::ExplainableError {
        page: String::from_utf8_lossy(&page).into_owned(),
        attributes,
    }
}

/// Returns `None` at EOF. Strips `\n` or `\r\n`. Fails with `InvalidData`
/// once [`MAX_HANDSHAKE_LINE_LEN`] bytes pass without a newline.
async fn read_line<R>(reader: &mut R) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let raw = read_bounded_line(reader).await?;
    if raw.is_empty() {
        return Ok(None);
    }
    if is_truncated(&raw) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("line longer than {MAX_HANDSHAKE_LINE_LEN} bytes"),
        ));
    }
    Ok(Some(
        String::from_utf8_lossy(trim_line_ending(&raw)).into_owned(),
    ))
}

/// At most [`MAX_HANDSHAKE_LINE_LEN`] bytes up to and including the next
/// newline. Empty at EOF.
async fn read_bounded_line<R>(reader: &mut R) -> std::io::Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    (&mut *reader)
        .take(MAX_HANDSHAKE_LINE_LEN as u64)
        .read_until(b'\n', &mut raw)
        .await?;
    Ok(raw)
}

fn is_truncated(raw: &[u8]) -> bool {
    raw.len() >= MAX_HANDSHAKE_LINE_LEN && raw.last() != Some(&b'\n')
}

fn trim_line_ending(raw: &[u8]) -> &[u8] {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    raw.strip_suffix(b"\r").unwrap_or(raw)
}

fn parse_endpoint(line: &str) -> Result<EndpointAnnouncement, String> {
    let Some(fields) = line.strip_prefix(SOCKET_PREFIX) else {
        return Err(format!("the application sent an unexpected line: {line:?}"));
    };
    let mut fields = fields.trim().split(';');
    let name = match fields.next() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => return Err(format!("socket announcement without a name: {line:?}")),
    };
    let address = match fields.next() {
        Some(address) => SocketAddress::parse(address)
            .map_err(|err| format!("socket announcement {line:?} has a bad address: {err}"))?,
        None => return Err(format!("socket announcement without an address: {line:?}")),
    };
    let protocol = match fields.next() {
        Some(protocol) if !protocol.is_empty() => protocol.to_string(),
        _ => DEFAULT_PROTOCOL.to_string(),
    };
    let concurrency = match fields.next() {
        Some(raw) => raw
            .parse::<u32>()
            .map_err(|_| format!("socket announcement {line:?} has a bad concurrency"))?,
        None => DEFAULT_CONCURRENCY,
    };
    if fields.next().is_some() {
        return Err(format!("socket announcement has too many fields: {line:?}"));
    }
    Ok(EndpointAnnouncement {
        name,
        address,
        protocol,
        concurrency,
    })
}
