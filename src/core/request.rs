// Request grammar: turns one raw frame into a verified `Request` or rejects it.
//
// Rules run in a fixed order and the first failure wins. A `Request` value
// only exists if every rule passed.
use crate::core::error::{Error, ErrorKind};
use crate::core::protocol::{LINE_DELIMITER, MAX_NAME_CHARS, PROTOCOL, TERMINATOR, Verb};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    verb: Verb,
    name: String,
    payload: Vec<String>,
    raw: Vec<u8>,
}

impl Request {
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(raw)
            .map_err(|err| malformed("request is not UTF-8").with_source(err))?;

        let Some((verb, _)) = Verb::strip_prefix(text) else {
            return Err(malformed("unknown verb"));
        };
        if text.find(TERMINATOR) != Some(text.len().saturating_sub(TERMINATOR.len())) {
            return Err(malformed("request must contain exactly one terminator, at the end"));
        }
        if text.ends_with(&format!(" {TERMINATOR}")) {
            return Err(malformed("space before terminator"));
        }

        let lines: Vec<&str> = text
            .split(LINE_DELIMITER)
            .filter(|line| !line.is_empty())
            .collect();
        if lines.iter().any(|line| line.contains(['\r', '\n'])) {
            return Err(malformed("stray line break inside a line"));
        }
        let Some((first, rest)) = lines.split_first() else {
            return Err(malformed("empty request"));
        };

        let name = parse_name(verb, first)?;
        let payload = parse_payload(rest)?;

        Ok(Self {
            verb,
            name,
            payload,
            raw: raw.to_vec(),
        })
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &[String] {
        &self.payload
    }

    /// Exact bytes received from the client, forwarded to the authority as-is.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_payload(self) -> Vec<String> {
        self.payload
    }
}

fn parse_name(verb: Verb, first: &str) -> Result<String, Error> {
    let region = first
        .strip_prefix(verb.as_str())
        .and_then(|rest| rest.strip_prefix(' '))
        .and_then(|rest| rest.strip_suffix(PROTOCOL))
        .and_then(|rest| rest.strip_suffix(' '))
        .ok_or_else(|| malformed("first line must end with the protocol version"))?;

    let name = region.trim();
    if name.is_empty() {
        return Err(malformed("name is empty"));
    }
    if name.chars().count() > MAX_NAME_CHARS {
        return Err(malformed(format!("name exceeds {MAX_NAME_CHARS} characters")));
    }
    if name.chars().any(char::is_control) {
        return Err(malformed("name contains control characters"));
    }
    Ok(name.to_string())
}

fn parse_payload(lines: &[&str]) -> Result<Vec<String>, Error> {
    lines
        .iter()
        .map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed != *line {
                Err(malformed("payload line is blank or padded with whitespace"))
            } else {
                Ok(line.to_string())
            }
        })
        .collect()
}

fn malformed(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Malformed).with_message(message)
}
