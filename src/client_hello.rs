//! Inbound TLS record observation and ClientHello capture.
//!
//! The TLS socket routes every raw byte it reads off the wire through a
//! [`RecordMonitor`] before the engine consumes it. The monitor walks the
//! record layer (5-byte headers, RFC 8446 §5), tolerating fragmentation of
//! both records across reads and handshake messages across records. It
//! serves two purposes:
//!
//! - while the handshake is running, handshake-record payload feeds the
//!   ClientHello parser (when enabled);
//! - after the handshake completes, any further handshake-class record is
//!   flagged as a renegotiation attempt for the socket to reject.

use bytes::BytesMut;

/// TLS record content type for handshake messages.
const CONTENT_TYPE_HANDSHAKE: u8 = 22;

/// TLS record header length.
const RECORD_HEADER_LEN: usize = 5;

/// Handshake message type for ClientHello.
const HANDSHAKE_TYPE_CLIENT_HELLO: u8 = 1;

/// Accumulation cap; a ClientHello larger than this abandons parsing.
const MAX_CLIENT_HELLO_BYTES: usize = 128 * 1024;

/// Fields extracted from the peer's ClientHello.
///
/// Cipher suites are kept in the client's advertised order, unfiltered by
/// server support. Extension payloads are not retained, only their types in
/// the order seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloInfo {
    /// Protocol major version from the hello body.
    pub major_version: u8,
    /// Protocol minor version from the hello body.
    pub minor_version: u8,
    /// Advertised cipher suite codes, client order.
    pub cipher_suites: Vec<u16>,
    /// Advertised compression methods.
    pub compression_methods: Vec<u8>,
    /// Extension types, in the order seen.
    pub extensions: Vec<u16>,
}

/// Walks the inbound record layer byte-by-byte as fragments arrive.
pub(crate) struct RecordMonitor {
    header: [u8; RECORD_HEADER_LEN],
    header_have: usize,
    content_type: u8,
    /// Payload bytes left in the current record; 0 means "collecting the
    /// next header".
    remaining: usize,
    established: bool,
    renegotiation_seen: bool,
    parser: Option<ClientHelloParser>,
}

impl RecordMonitor {
    pub(crate) fn new() -> Self {
        RecordMonitor {
            header: [0; RECORD_HEADER_LEN],
            header_have: 0,
            content_type: 0,
            remaining: 0,
            established: false,
            renegotiation_seen: false,
            parser: None,
        }
    }

    /// Turn on ClientHello capture. Must happen before handshake bytes
    /// arrive to see the full hello.
    pub(crate) fn enable_parsing(&mut self) {
        if self.parser.is_none() {
            self.parser = Some(ClientHelloParser::new());
        }
    }

    /// Rearm the parser for a restarted handshake.
    pub(crate) fn reset_parsing(&mut self) {
        if let Some(parser) = &mut self.parser {
            *parser = ClientHelloParser::new();
        }
    }

    /// The handshake completed; handshake records from here on are
    /// renegotiation attempts.
    pub(crate) fn set_established(&mut self) {
        self.established = true;
    }

    pub(crate) fn renegotiation_seen(&self) -> bool {
        self.renegotiation_seen
    }

    /// Successfully parsed ClientHello fields, if capture is enabled and a
    /// complete hello has been seen.
    pub(crate) fn parsed_info(&self) -> Option<&ClientHelloInfo> {
        self.parser.as_ref().and_then(|p| p.info())
    }

    /// Observe raw inbound wire bytes.
    pub(crate) fn feed(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            if self.remaining == 0 {
                let need = RECORD_HEADER_LEN - self.header_have;
                let take = need.min(data.len());
                self.header[self.header_have..self.header_have + take]
                    .copy_from_slice(&data[..take]);
                self.header_have += take;
                data = &data[take..];
                if self.header_have == RECORD_HEADER_LEN {
                    self.header_have = 0;
                    self.content_type = self.header[0];
                    self.remaining = u16::from_be_bytes([self.header[3], self.header[4]]) as usize;
                    if self.content_type == CONTENT_TYPE_HANDSHAKE && self.established {
                        self.renegotiation_seen = true;
                    }
                }
            } else {
                let take = self.remaining.min(data.len());
                if self.content_type == CONTENT_TYPE_HANDSHAKE && !self.established {
                    if let Some(parser) = &mut self.parser {
                        parser.feed(&data[..take]);
                    }
                }
                self.remaining -= take;
                data = &data[take..];
            }
        }
    }
}

enum ParseState {
    Accumulating,
    Done(ClientHelloInfo),
    /// Not a ClientHello, malformed, or oversized. Stop buffering.
    Abandoned,
}

/// Accumulates handshake payload until a full ClientHello is present, then
/// extracts its fields.
pub(crate) struct ClientHelloParser {
    buf: BytesMut,
    state: ParseState,
}

impl ClientHelloParser {
    fn new() -> Self {
        ClientHelloParser {
            buf: BytesMut::new(),
            state: ParseState::Accumulating,
        }
    }

    fn info(&self) -> Option<&ClientHelloInfo> {
        match &self.state {
            ParseState::Done(info) => Some(info),
            _ => None,
        }
    }

    fn feed(&mut self, fragment: &[u8]) {
        if !matches!(self.state, ParseState::Accumulating) {
            return;
        }
        if self.buf.len() + fragment.len() > MAX_CLIENT_HELLO_BYTES {
            self.state = ParseState::Abandoned;
            self.buf.clear();
            return;
        }
        self.buf.extend_from_slice(fragment);
        self.try_parse();
    }

    fn try_parse(&mut self) {
        // Handshake message header: type(1) + length(3).
        if self.buf.len() < 4 {
            return;
        }
        if self.buf[0] != HANDSHAKE_TYPE_CLIENT_HELLO {
            self.state = ParseState::Abandoned;
            self.buf.clear();
            return;
        }
        let body_len =
            ((self.buf[1] as usize) << 16) | ((self.buf[2] as usize) << 8) | (self.buf[3] as usize);
        if body_len > MAX_CLIENT_HELLO_BYTES {
            self.state = ParseState::Abandoned;
            self.buf.clear();
            return;
        }
        if self.buf.len() < 4 + body_len {
            return;
        }
        match parse_client_hello_body(&self.buf[4..4 + body_len]) {
            Some(info) => {
                crate::metrics::CLIENT_HELLOS_PARSED.increment();
                self.state = ParseState::Done(info);
            }
            None => self.state = ParseState::Abandoned,
        }
        self.buf.clear();
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        if self.remaining() < 2 {
            return None;
        }
        let v = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Some(v)
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        if self.remaining() < n {
            return None;
        }
        self.pos += n;
        Some(())
    }
}

fn parse_client_hello_body(body: &[u8]) -> Option<ClientHelloInfo> {
    let mut r = Reader::new(body);

    let major_version = r.u8()?;
    let minor_version = r.u8()?;
    r.skip(32)?; // random
    let session_id_len = r.u8()? as usize;
    r.skip(session_id_len)?;

    let cipher_bytes = r.u16()? as usize;
    if cipher_bytes % 2 != 0 || r.remaining() < cipher_bytes {
        return None;
    }
    let mut cipher_suites = Vec::with_capacity(cipher_bytes / 2);
    for _ in 0..cipher_bytes / 2 {
        cipher_suites.push(r.u16()?);
    }

    let compression_len = r.u8()? as usize;
    if r.remaining() < compression_len {
        return None;
    }
    let mut compression_methods = Vec::with_capacity(compression_len);
    for _ in 0..compression_len {
        compression_methods.push(r.u8()?);
    }

    // The extension block is optional in older hellos.
    let mut extensions = Vec::new();
    if r.remaining() >= 2 {
        let total = r.u16()? as usize;
        let mut consumed = 0;
        while consumed + 4 <= total && r.remaining() >= 4 {
            let ext_type = r.u16()?;
            let ext_len = r.u16()? as usize;
            r.skip(ext_len)?;
            consumed += 4 + ext_len;
            extensions.push(ext_type);
        }
    }

    Some(ClientHelloInfo {
        major_version,
        minor_version,
        cipher_suites,
        compression_methods,
        extensions,
    })
}

/// IANA name for a cipher suite code, for the suites commonly advertised.
pub(crate) fn cipher_suite_name(code: u16) -> Option<&'static str> {
    Some(match code {
        0x0005 => "TLS_RSA_WITH_RC4_128_SHA",
        0x000A => "TLS_RSA_WITH_3DES_EDE_CBC_SHA",
        0x002F => "TLS_RSA_WITH_AES_128_CBC_SHA",
        0x0035 => "TLS_RSA_WITH_AES_256_CBC_SHA",
        0x003C => "TLS_RSA_WITH_AES_128_CBC_SHA256",
        0x003D => "TLS_RSA_WITH_AES_256_CBC_SHA256",
        0x009C => "TLS_RSA_WITH_AES_128_GCM_SHA256",
        0x009D => "TLS_RSA_WITH_AES_256_GCM_SHA384",
        0xC009 => "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA",
        0xC00A => "TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA",
        0xC013 => "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
        0xC014 => "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
        0xC02B => "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
        0xC02C => "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
        0xC02F => "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
        0xC030 => "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
        0xCCA8 => "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
        0xCCA9 => "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
        0x1301 => "TLS_AES_128_GCM_SHA256",
        0x1302 => "TLS_AES_256_GCM_SHA384",
        0x1303 => "TLS_CHACHA20_POLY1305_SHA256",
        _ => return None,
    })
}

/// Render advertised suites: known ones by name, unknown ones as zero-padded
/// 4-hex-digit codes, `:`-separated.
pub(crate) fn render_cipher_suites(suites: &[u16]) -> String {
    suites
        .iter()
        .map(|&code| match cipher_suite_name(code) {
            Some(name) => name.to_string(),
            None => format!("{code:04X}"),
        })
        .collect::<Vec<_>>()
        .join(":")
}
