//! Command completion lines and the numeric error taxonomy.
//!
//! Every command eventually earns exactly one completion line of the form
//! `+0000 "OK"` or `-NNNN "message"`. Positive zero is the only success code;
//! negative codes classify the failure. Peers match a completion against the
//! currently-running command only.

use crate::error::ProtoError;
use crate::line::{quote, tokenize};

/// Success.
pub const OK: i32 = 0;
/// Command name not recognized.
pub const ERR_COMMAND: i32 = -1001;
/// Wrong parameter count or type.
pub const ERR_PARAMS: i32 = -1002;
/// Internal failure while servicing the command.
pub const ERR_SYSTEM: i32 = -1003;
/// Priority request could not be honored.
pub const ERR_PRIORITY: i32 = -1004;
/// Authorization key missing or mismatched.
pub const ERR_KEY: i32 = -1005;
/// Value update for a name never declared by `metainfo`.
pub const ERR_UNKNOWN_VALUE: i32 = -1006;
/// Command refused for now; the sender may requeue it unchanged.
pub const ERR_BLOCKED: i32 = -1007;

/// A parsed completion line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub code: i32,
    pub message: String,
}

impl Completion {
    pub fn ok() -> Self {
        Self { code: OK, message: "OK".to_string() }
    }

    pub fn error(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn is_ok(&self) -> bool {
        self.code >= 0
    }

    /// Render as a wire line (no terminator).
    pub fn to_line(&self) -> String {
        let sign = if self.code < 0 { '-' } else { '+' };
        format!("{}{:04} {}", sign, self.code.abs(), quote(&self.message))
    }

    /// Recognize and parse a completion line.
    ///
    /// Returns `Ok(None)` when the line is not a completion at all, so the
    /// caller can fall through to ordinary command dispatch.
    pub fn parse(line: &str) -> Result<Option<Completion>, ProtoError> {
        let mut chars = line.chars();
        let sign = match chars.next() {
            Some('+') => 1,
            Some('-') => -1,
            _ => return Ok(None),
        };
        let digits: String = chars.clone().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            return Ok(None);
        }
        let toks = tokenize(line)?;
        let code_tok = &toks[0][1..];
        let code: i32 = code_tok
            .parse()
            .map_err(|_| ProtoError::InvalidCompletion(line.to_string()))?;
        let message = toks.get(1).cloned().unwrap_or_default();
        Ok(Some(Completion { code: sign * code, message }))
    }
}

impl std::fmt::Display for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_line())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn success_line() {
        let c = Completion::ok();
        assert_eq!(c.to_line(), "+0000 OK");
        let parsed = Completion::parse("+0000 \"OK\"").unwrap().unwrap();
        assert!(parsed.is_ok());
        assert_eq!(parsed.message, "OK");
    }

    #[test]
    fn error_roundtrip() {
        let c = Completion::error(ERR_PARAMS, "wrong parameter count");
        let line = c.to_line();
        assert_eq!(line, "-1002 \"wrong parameter count\"");
        let parsed = Completion::parse(&line).unwrap().unwrap();
        assert_eq!(parsed, c);
        assert!(!parsed.is_ok());
    }

    #[test]
    fn ordinary_command_is_not_a_completion() {
        assert_eq!(Completion::parse("status_info").unwrap(), None);
        // Negative numbers as the first value parameter are still commands.
        assert_eq!(Completion::parse("value dec -20.5").unwrap(), None);
    }

    #[test]
    fn bare_code_without_message() {
        let parsed = Completion::parse("-1003").unwrap().unwrap();
        assert_eq!(parsed.code, ERR_SYSTEM);
        assert_eq!(parsed.message, "");
    }
}
