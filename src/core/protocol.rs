// RKSOK wire vocabulary: verbs, authority verdicts, response words, and response encoding.

pub const PROTOCOL: &str = "РКСОК/1.0";
pub const TERMINATOR: &str = "\r\n\r\n";
pub const LINE_DELIMITER: &str = "\r\n";
pub const MAX_NAME_CHARS: usize = 30;

/// Query token prefixed to every request forwarded to the authority.
pub const IS_ALLOWED: &str = "АМОЖНА?";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Verb {
    Store,
    Retrieve,
    Delete,
}

impl Verb {
    pub const ALL: [Verb; 3] = [Verb::Store, Verb::Retrieve, Verb::Delete];

    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Store => "ЗОПИШИ",
            Verb::Retrieve => "ОТДОВАЙ",
            Verb::Delete => "УДОЛИ",
        }
    }

    /// Matches `<VERB> ` at the start of `text`, returning the verb and the rest.
    pub fn strip_prefix(text: &str) -> Option<(Verb, &str)> {
        Verb::ALL.into_iter().find_map(|verb| {
            text.strip_prefix(verb.as_str())
                .and_then(|rest| rest.strip_prefix(' '))
                .map(|rest| (verb, rest))
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verdict {
    Allowed,
    Forbidden,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Allowed => "МОЖНА",
            Verdict::Forbidden => "НИЛЬЗЯ",
        }
    }

    /// Reads the verdict from the status line `<VERDICT> РКСОК/1.0`.
    pub fn from_status_line(text: &str) -> Option<Verdict> {
        [Verdict::Allowed, Verdict::Forbidden]
            .into_iter()
            .find(|verdict| {
                text.strip_prefix(verdict.as_str())
                    .and_then(|rest| rest.strip_prefix(' '))
                    .is_some_and(|rest| rest.starts_with(PROTOCOL))
            })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResponseWord {
    Ok,
    NotFound,
    Incorrect,
}

impl ResponseWord {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseWord::Ok => "НОРМАЛДЫКС",
            ResponseWord::NotFound => "НИНАШОЛ",
            ResponseWord::Incorrect => "НИПОНЯЛ",
        }
    }
}

/// The single message written back to a client before its connection closes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Response {
    Ok(Vec<String>),
    NotFound,
    Incorrect,
    /// Authority verdict bytes passed through unmodified.
    Relayed(Vec<u8>),
}

impl Response {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Response::Ok(lines) => {
                let mut out = status_line(ResponseWord::Ok);
                for line in lines {
                    out.push_str(LINE_DELIMITER);
                    out.push_str(line);
                }
                out.push_str(TERMINATOR);
                out.into_bytes()
            }
            Response::NotFound => terminated(ResponseWord::NotFound),
            Response::Incorrect => terminated(ResponseWord::Incorrect),
            Response::Relayed(raw) => raw.clone(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Response::Ok(_) => "ok",
            Response::NotFound => "not_found",
            Response::Incorrect => "incorrect",
            Response::Relayed(_) => "relayed",
        }
    }
}

fn status_line(word: ResponseWord) -> String {
    format!("{} {PROTOCOL}", word.as_str())
}

fn terminated(word: ResponseWord) -> Vec<u8> {
    let mut out = status_line(word);
    out.push_str(TERMINATOR);
    out.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::{Response, Verb, Verdict};

    #[test]
    fn verb_prefix_requires_trailing_space() {
        assert_eq!(
            Verb::strip_prefix("ЗОПИШИ Ivan РКСОК/1.0"),
            Some((Verb::Store, "Ivan РКСОК/1.0"))
        );
        assert_eq!(
            Verb::strip_prefix("УДОЛИ Ivan"),
            Some((Verb::Delete, "Ivan"))
        );
        assert_eq!(Verb::strip_prefix("ОТДОВАЙIvan РКСОК/1.0"), None);
        assert_eq!(Verb::strip_prefix("GET Ivan РКСОК/1.0"), None);
        assert_eq!(Verb::strip_prefix(""), None);
    }

    #[test]
    fn verdict_needs_protocol_after_token() {
        assert_eq!(
            Verdict::from_status_line("МОЖНА РКСОК/1.0\r\n\r\n"),
            Some(Verdict::Allowed)
        );
        assert_eq!(
            Verdict::from_status_line("НИЛЬЗЯ РКСОК/1.0\r\nУже едем\r\n\r\n"),
            Some(Verdict::Forbidden)
        );
        assert_eq!(Verdict::from_status_line("МОЖНА\r\n\r\n"), None);
        assert_eq!(Verdict::from_status_line("АМОЖНА? РКСОК/1.0\r\n\r\n"), None);
        assert_eq!(Verdict::from_status_line("МОЖНАБ РКСОК/1.0\r\n\r\n"), None);
    }

    #[test]
    fn responses_encode_exact_wire_text() {
        assert_eq!(
            Response::Ok(Vec::new()).encode(),
            "НОРМАЛДЫКС РКСОК/1.0\r\n\r\n".as_bytes()
        );
        assert_eq!(
            Response::Ok(vec!["+7123".to_string(), "+7456".to_string()]).encode(),
            "НОРМАЛДЫКС РКСОК/1.0\r\n+7123\r\n+7456\r\n\r\n".as_bytes()
        );
        assert_eq!(
            Response::NotFound.encode(),
            "НИНАШОЛ РКСОК/1.0\r\n\r\n".as_bytes()
        );
        assert_eq!(
            Response::Incorrect.encode(),
            "НИПОНЯЛ РКСОК/1.0\r\n\r\n".as_bytes()
        );
    }

    #[test]
    fn relayed_response_is_verbatim() {
        let raw = "НИЛЬЗЯ РКСОК/1.0\r\n\r\n".as_bytes().to_vec();
        assert_eq!(Response::Relayed(raw.clone()).encode(), raw);
    }
}
