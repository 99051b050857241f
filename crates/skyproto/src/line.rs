//! Line tokenizer and parameter scanner.
//!
//! Wire lines are space-separated words; a word containing spaces travels as a
//! double-quoted string with `\"` and `\\` escapes. `Params` walks the tokens
//! of a received line one at a time, converting as it goes, so command
//! handlers can fail with a precise error the moment a parameter is missing
//! or malformed.

use crate::error::ProtoError;

/// Split one wire line into tokens, honoring quotes and escapes.
pub fn tokenize(line: &str) -> Result<Vec<String>, ProtoError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_ascii_whitespace() {
            chars.next();
            continue;
        }
        let mut word = String::new();
        if c == '"' {
            chars.next();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '\\' => match chars.next() {
                        Some(escaped) => word.push(escaped),
                        None => return Err(ProtoError::UnterminatedQuote),
                    },
                    '"' => {
                        closed = true;
                        break;
                    }
                    other => word.push(other),
                }
            }
            if !closed {
                return Err(ProtoError::UnterminatedQuote);
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_ascii_whitespace() {
                    break;
                }
                word.push(c);
                chars.next();
            }
        }
        tokens.push(word);
    }

    Ok(tokens)
}

/// Quote a string for the wire if it needs it.
pub fn quote(s: &str) -> String {
    if !s.is_empty() && !s.contains([' ', '\t', '"', '\\']) {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Sequential scanner over the parameters of a received line.
///
/// The first token (the command name) is peeled off by the caller; `Params`
/// holds the rest. Handlers finish with `end()` so extra parameters are
/// reported rather than silently ignored.
#[derive(Debug)]
pub struct Params {
    tokens: Vec<String>,
    pos: usize,
}

impl Params {
    pub fn new(tokens: Vec<String>) -> Self {
        Self { tokens, pos: 0 }
    }

    /// Parse a full line into command name + parameter scanner.
    pub fn parse_line(line: &str) -> Result<(String, Params), ProtoError> {
        let mut tokens = tokenize(line)?;
        if tokens.is_empty() {
            return Err(ProtoError::MissingParam("command name"));
        }
        let name = tokens.remove(0);
        Ok((name, Params::new(tokens)))
    }

    pub fn next_str(&mut self, name: &'static str) -> Result<String, ProtoError> {
        match self.tokens.get(self.pos) {
            Some(tok) => {
                self.pos += 1;
                Ok(tok.clone())
            }
            None => Err(ProtoError::MissingParam(name)),
        }
    }

    pub fn next_i32(&mut self, name: &'static str) -> Result<i32, ProtoError> {
        let tok = self.next_str(name)?;
        tok.parse().map_err(|_| ProtoError::InvalidParam { name, value: tok })
    }

    pub fn next_i64(&mut self, name: &'static str) -> Result<i64, ProtoError> {
        let tok = self.next_str(name)?;
        tok.parse().map_err(|_| ProtoError::InvalidParam { name, value: tok })
    }

    pub fn next_u16(&mut self, name: &'static str) -> Result<u16, ProtoError> {
        let tok = self.next_str(name)?;
        tok.parse().map_err(|_| ProtoError::InvalidParam { name, value: tok })
    }

    pub fn next_u32(&mut self, name: &'static str) -> Result<u32, ProtoError> {
        let tok = self.next_str(name)?;
        tok.parse().map_err(|_| ProtoError::InvalidParam { name, value: tok })
    }

    pub fn next_f64(&mut self, name: &'static str) -> Result<f64, ProtoError> {
        let tok = self.next_str(name)?;
        tok.parse().map_err(|_| ProtoError::InvalidParam { name, value: tok })
    }

    /// Remaining token count.
    pub fn remaining(&self) -> usize {
        self.tokens.len() - self.pos
    }

    /// Assert every parameter was consumed.
    pub fn end(&self, command: &'static str) -> Result<(), ProtoError> {
        if self.pos == self.tokens.len() {
            Ok(())
        } else {
            Err(ProtoError::TrailingParams(command))
        }
    }
}

/// Incremental builder for an outgoing line.
#[derive(Debug, Default)]
pub struct LineBuilder {
    buf: String,
}

impl LineBuilder {
    pub fn new(command: &str) -> Self {
        Self { buf: command.to_string() }
    }

    pub fn arg(mut self, word: impl std::fmt::Display) -> Self {
        self.buf.push(' ');
        self.buf.push_str(&word.to_string());
        self
    }

    pub fn arg_quoted(mut self, s: &str) -> Self {
        self.buf.push(' ');
        self.buf.push_str(&quote(s));
        self
    }

    pub fn finish(self) -> String {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn plain_words() {
        let toks = tokenize("register CAM 2 localhost 5554").unwrap();
        assert_eq!(toks, vec!["register", "CAM", "2", "localhost", "5554"]);
    }

    #[test]
    fn quoted_with_spaces_and_escapes() {
        let toks = tokenize(r#"metainfo 259 temp "CCD \"chip\" temperature""#).unwrap();
        assert_eq!(toks.len(), 3);
        assert_eq!(toks[2], r#"CCD "chip" temperature"#);
    }

    #[test]
    fn unterminated_quote_rejected() {
        assert!(matches!(
            tokenize(r#"value name "half open"#),
            Err(ProtoError::UnterminatedQuote)
        ));
    }

    #[test]
    fn quote_roundtrip() {
        let original = r#"path "with" spaces\and slashes"#;
        let quoted = quote(original);
        let toks = tokenize(&quoted).unwrap();
        assert_eq!(toks, vec![original.to_string()]);
    }

    #[test]
    fn quote_empty_string() {
        assert_eq!(quote(""), "\"\"");
        let toks = tokenize(&quote("")).unwrap();
        assert_eq!(toks, vec![String::new()]);
    }

    #[test]
    fn params_scanner() {
        let (name, mut params) = Params::parse_line("priority 20 120").unwrap();
        assert_eq!(name, "priority");
        assert_eq!(params.next_i32("priority").unwrap(), 20);
        assert_eq!(params.next_i32("timeout").unwrap(), 120);
        assert!(params.end("priority").is_ok());
    }

    #[test]
    fn params_trailing_rejected() {
        let (_, mut params) = Params::parse_line("login observer extra").unwrap();
        params.next_str("login").unwrap();
        assert!(matches!(
            params.end("login"),
            Err(ProtoError::TrailingParams("login"))
        ));
    }

    #[test]
    fn params_type_error_names_parameter() {
        let (_, mut params) = Params::parse_line("register CAM camera localhost 5554").unwrap();
        params.next_str("name").unwrap();
        let err = params.next_u16("device type").unwrap_err();
        assert!(matches!(err, ProtoError::InvalidParam { name: "device type", .. }));
    }

    #[test]
    fn builder_quotes_only_when_needed() {
        let line = LineBuilder::new("value")
            .arg("target_name")
            .arg_quoted("M 31")
            .finish();
        assert_eq!(line, r#"value target_name "M 31""#);
    }
}
