use thiserror::Error;

/// Default bound on an accumulating header block.
pub const DEFAULT_MAX_HEADER_BLOCK: usize = 65_536;

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("header block exceeds {0} bytes")]
    HeaderBlockTooLarge(usize),
    #[error("malformed header line {0:?}")]
    MalformedHeaderLine(String),
    #[error("invalid header name {0:?}")]
    InvalidHeaderName(String),
    #[error("continuation line before any header")]
    OrphanContinuation,
}

/// Outcome of feeding bytes to the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderFeed {
    Incomplete,
    /// Header block done; `body_start` indexes into the slice just fed,
    /// everything from there on is body.
    Complete { body_start: usize },
}

/// Streaming HTTP/1.1 request-head parser.
///
/// Accumulates until the first blank line (`\r\n\r\n`, `\n\r\n` or `\n\n`),
/// then splits into the verbatim start line and the header list. Folded
/// continuation lines (starting with SP/HT) join the previous value with a
/// single space. Header names must match the RFC 9110 token grammar.
pub struct HttpHeaderParser {
    accumulator: Vec<u8>,
    max_header_block: usize,
    complete: bool,
    start_line: String,
    headers: Vec<(String, String)>,
}

impl Default for HttpHeaderParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpHeaderParser {
    pub fn new() -> Self {
        Self::with_max_header_block(DEFAULT_MAX_HEADER_BLOCK)
    }

    pub fn with_max_header_block(max_header_block: usize) -> Self {
        Self {
            accumulator: Vec::new(),
            max_header_block,
            complete: false,
            start_line: String::new(),
            headers: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Consume the next chunk of the stream. Once complete, further bytes
    /// belong to the body and are not consumed here.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<HeaderFeed, HttpError> {
        if self.complete {
            return Ok(HeaderFeed::Complete { body_start: 0 });
        }

        let previous_len = self.accumulator.len();
        self.accumulator.extend_from_slice(bytes);

        let Some((block_end, body_abs)) = find_terminator(&self.accumulator) else {
            if self.accumulator.len() > self.max_header_block {
                return Err(HttpError::HeaderBlockTooLarge(self.max_header_block));
            }
            return Ok(HeaderFeed::Incomplete);
        };

        let block = std::mem::take(&mut self.accumulator);
        self.parse_block(&block[..block_end])?;
        self.complete = true;
        Ok(HeaderFeed::Complete { body_start: body_abs - previous_len })
    }

    /// The request line, verbatim.
    pub fn start_line(&self) -> &str {
        &self.start_line
    }

    /// Parsed headers in arrival order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Case-insensitive lookup; repeated headers join with `", "`.
    /// `Set-Cookie` values must not be joined, use [`get_all`](Self::get_all).
    pub fn get(&self, name: &str) -> Option<String> {
        let mut values = self.get_all(name);
        if values.is_empty() {
            return None;
        }
        if name.eq_ignore_ascii_case("set-cookie") {
            return Some(values.remove(0).to_string());
        }
        Some(values.join(", "))
    }

    /// Every value of `name`, case-insensitive, in arrival order.
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
            .collect()
    }

    fn parse_block(&mut self, block: &[u8]) -> Result<(), HttpError> {
        let mut lines = block.split(|&b| b == b'\n').map(strip_cr);

        self.start_line = String::from_utf8_lossy(lines.next().unwrap_or_default()).into_owned();

        for line in lines {
            if line.is_empty() {
                continue;
            }
            if line[0] == b' ' || line[0] == b'\t' {
                // obs-fold: the line continues the previous value.
                let Some((_, value)) = self.headers.last_mut() else {
                    return Err(HttpError::OrphanContinuation);
                };
                let folded = String::from_utf8_lossy(trim_ows(line));
                if !folded.is_empty() {
                    if !value.is_empty() {
                        value.push(' ');
                    }
                    value.push_str(&folded);
                }
                continue;
            }

            let colon = line
                .iter()
                .position(|&b| b == b':')
                .ok_or_else(|| HttpError::MalformedHeaderLine(lossy(line)))?;
            let (name, rest) = line.split_at(colon);
            if name.is_empty() || !name.iter().all(|&b| is_token_byte(b)) {
                return Err(HttpError::InvalidHeaderName(lossy(name)));
            }
            let value = String::from_utf8_lossy(trim_ows(&rest[1..])).into_owned();
            self.headers.push((lossy(name), value));
        }
        Ok(())
    }
}

/// End of the header block: `(block_end, body_start)` absolute offsets.
/// Recognizes `\n\n` and `\n\r\n`, which covers `\r\n\r\n` and bare-LF
/// blocks as well as mixes of the two.
fn find_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    for (i, &byte) in buf.iter().enumerate() {
        if byte != b'\n' {
            continue;
        }
        let rest = &buf[i + 1..];
        if rest.first() == Some(&b'\n') {
            return Some((i, i + 2));
        }
        if rest.starts_with(b"\r\n") {
            return Some((i, i + 3));
        }
    }
    None
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn trim_ows(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != b' ' && b != b'\t').unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|&b| b != b' ' && b != b'\t').map_or(start, |p| p + 1);
    &bytes[start..end]
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

// RFC 9110 token characters.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}
