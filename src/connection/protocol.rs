//! Client-to-client handshake commands in both line dialects.
//!
//! ADC lines look like `CSUP ADBASE ADTIGR\n`: a type letter, a three
//! letter command and space separated parameters with `\s`, `\n` and `\\`
//! escapes. Named parameters carry a two letter prefix (`IDxxx`, `TOxxx`).
//!
//! Legacy lines look like `$MyNick alice|`. They are raw bytes rather than
//! text because `$Key` carries arbitrary byte values.

use std::fmt::Write as _;

use super::error::ConnectionError;
use super::item::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    Adc,
    Nmdc,
}

impl Dialect {
    pub fn separator(self) -> u8 {
        match self {
            Dialect::Adc => b'\n',
            Dialect::Nmdc => b'|',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// ADC feature negotiation.
    Sup { add: Vec<String>, remove: Vec<String> },
    /// ADC identity, as two letter named parameters.
    Inf(Vec<(String, String)>),
    /// ADC status; codes starting with `2` are fatal.
    Sta { code: String, description: String },
    MyNick(String),
    Lock { lock: String, pk: String },
    Supports(Vec<String>),
    Direction { direction: Direction, number: u32 },
    Key(Vec<u8>),
    Error(String),
    MaxedOut,
    /// Anything else, kept verbatim for logging.
    Unknown(String),
}

impl Command {
    pub fn inf_param(&self, name: &str) -> Option<&str> {
        match self {
            Command::Inf(params) => params
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str()),
            _ => None,
        }
    }

    /// Wire form including the dialect's terminator.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Command::Sup { add, remove } => {
                let mut line = String::from("CSUP");
                for feature in add {
                    let _ = write!(line, " AD{}", adc_escape(feature));
                }
                for feature in remove {
                    let _ = write!(line, " RM{}", adc_escape(feature));
                }
                adc_line(line)
            }
            Command::Inf(params) => {
                let mut line = String::from("CINF");
                for (key, value) in params {
                    let _ = write!(line, " {}{}", key, adc_escape(value));
                }
                adc_line(line)
            }
            Command::Sta { code, description } => {
                adc_line(format!("CSTA {} {}", code, adc_escape(description)))
            }
            Command::MyNick(nick) => nmdc_line(format!("$MyNick {nick}").into_bytes()),
            Command::Lock { lock, pk } => {
                nmdc_line(format!("$Lock {lock} Pk={pk}").into_bytes())
            }
            Command::Supports(features) => {
                nmdc_line(format!("$Supports {}", features.join(" ")).into_bytes())
            }
            Command::Direction { direction, number } => {
                let word = match direction {
                    Direction::Download => "Download",
                    Direction::Upload => "Upload",
                };
                nmdc_line(format!("$Direction {word} {number}").into_bytes())
            }
            Command::Key(key) => {
                let mut line = b"$Key ".to_vec();
                line.extend_from_slice(key);
                nmdc_line(line)
            }
            Command::Error(message) => nmdc_line(format!("$Error {message}").into_bytes()),
            Command::MaxedOut => nmdc_line(b"$MaxedOut".to_vec()),
            Command::Unknown(raw) => raw.as_bytes().to_vec(),
        }
    }

    /// Parses one line without its terminator.
    pub fn decode(dialect: Dialect, line: &[u8]) -> Result<Command, ConnectionError> {
        match dialect {
            Dialect::Adc => decode_adc(line),
            Dialect::Nmdc => decode_nmdc(line),
        }
    }
}

fn adc_line(mut line: String) -> Vec<u8> {
    line.push('\n');
    line.into_bytes()
}

fn nmdc_line(mut line: Vec<u8>) -> Vec<u8> {
    line.push(b'|');
    line
}

pub fn adc_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            ' ' => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(ch),
        }
    }
    out
}

pub fn adc_unescape(value: &str) -> Result<String, ConnectionError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            _ => return Err(ConnectionError::Protocol(format!("bad escape in {value:?}"))),
        }
    }
    Ok(out)
}

fn decode_adc(line: &[u8]) -> Result<Command, ConnectionError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ConnectionError::Protocol("invalid utf-8".into()))?;
    let mut fields = text.split(' ');
    let head = fields.next().unwrap_or_default();
    if head.len() != 4 || !head.starts_with('C') {
        return Ok(Command::Unknown(text.to_string()));
    }

    match &head[1..] {
        "SUP" => {
            let mut add = Vec::new();
            let mut remove = Vec::new();
            for field in fields.filter(|f| f.len() > 2) {
                let feature = adc_unescape(&field[2..])?;
                match &field[..2] {
                    "AD" => add.push(feature),
                    "RM" => remove.push(feature),
                    _ => {}
                }
            }
            Ok(Command::Sup { add, remove })
        }
        "INF" => {
            let mut params = Vec::new();
            for field in fields.filter(|f| f.len() >= 2) {
                if !field.is_char_boundary(2) {
                    return Err(ConnectionError::Protocol(format!("bad parameter {field:?}")));
                }
                params.push((field[..2].to_string(), adc_unescape(&field[2..])?));
            }
            Ok(Command::Inf(params))
        }
        "STA" => {
            let code = fields.next().unwrap_or_default().to_string();
            let description = adc_unescape(fields.next().unwrap_or_default())?;
            Ok(Command::Sta { code, description })
        }
        _ => Ok(Command::Unknown(text.to_string())),
    }
}

fn decode_nmdc(line: &[u8]) -> Result<Command, ConnectionError> {
    let (name, rest) = match line.iter().position(|&b| b == b' ') {
        Some(pos) => (&line[..pos], &line[pos + 1..]),
        None => (line, &[][..]),
    };
    let text = || String::from_utf8_lossy(rest).into_owned();

    match name {
        b"$MyNick" => {
            let nick = text();
            if nick.is_empty() {
                return Err(ConnectionError::Protocol("empty nick".into()));
            }
            Ok(Command::MyNick(nick))
        }
        b"$Lock" => {
            let text = text();
            let (lock, pk) = match text.split_once(" Pk=") {
                Some((lock, pk)) => (lock.to_string(), pk.to_string()),
                None => (text.clone(), String::new()),
            };
            if lock.is_empty() {
                return Err(ConnectionError::Protocol("empty lock".into()));
            }
            Ok(Command::Lock { lock, pk })
        }
        b"$Supports" => Ok(Command::Supports(
            text().split(' ').filter(|f| !f.is_empty()).map(String::from).collect(),
        )),
        b"$Direction" => {
            let text = text();
            let mut parts = text.split(' ');
            let direction = match parts.next() {
                Some("Download") => Direction::Download,
                Some("Upload") => Direction::Upload,
                other => {
                    return Err(ConnectionError::Protocol(format!(
                        "bad direction {other:?}"
                    )))
                }
            };
            let number = parts
                .next()
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| ConnectionError::Protocol("bad direction number".into()))?;
            Ok(Command::Direction { direction, number })
        }
        b"$Key" => Ok(Command::Key(rest.to_vec())),
        b"$Error" => Ok(Command::Error(text())),
        b"$MaxedOut" => Ok(Command::MaxedOut),
        _ => Ok(Command::Unknown(String::from_utf8_lossy(line).into_owned())),
    }
}

/// Derives the `$Key` answer to a `$Lock` challenge.
///
/// Each byte is xored with its predecessor (the first with the last two and
/// 5), nibble-swapped, and the bytes 0, 5, 36, 96, 124 and 126 are written
/// as `/%DCN000%/` escapes.
pub fn lock_to_key(lock: &[u8]) -> Vec<u8> {
    let len = lock.len();
    if len < 3 {
        return Vec::new();
    }

    let mut raw = Vec::with_capacity(len);
    raw.push(lock[0] ^ lock[len - 1] ^ lock[len - 2] ^ 5);
    for i in 1..len {
        raw.push(lock[i] ^ lock[i - 1]);
    }

    let mut key = Vec::with_capacity(len + 16);
    for byte in raw {
        let swapped = byte.rotate_left(4);
        match swapped {
            0 | 5 | 36 | 96 | 124 | 126 => {
                key.extend_from_slice(format!("/%DCN{swapped:03}%/").as_bytes());
            }
            _ => key.push(swapped),
        }
    }
    key
}
