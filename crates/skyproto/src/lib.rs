//! skyproto - wire protocol for the Skywatch observatory control bus
//!
//! Skywatch processes talk over plain TCP with newline-terminated ASCII
//! lines, switching to a framed binary sub-channel for bulk transfers
//! (images). This crate defines everything that crosses the wire and nothing
//! that lives behind it: the tokenizer and parameter scanner, the incremental
//! [`WireReader`], completion lines with the numeric error taxonomy, the
//! global state/BOP word layout, the typed value vocabulary, and device
//! capability tags.
//!
//! ## Line vocabulary
//!
//! ```text
//! register <name> <type> <host> <port>   device handshake
//! login <user> / password <pw>           client handshake
//! priority <value> [<timeout>]           priority request
//! status_info                            scatter/gather status query
//! metainfo / selmetainfo / value         value declaration and updates
//! set_value[_def] <name> <op> <args..>   peer-requested value change
//! S <state> / BOP <mask> / PRIORITY ...  arbiter broadcasts
//! M <level> <origin> "<text>"            log message fan-out
//! ready / ack                            keepalive probe and its answer
//! binary <chan> <size> <type>            open a binary sub-channel
//! data <chan> <len> + raw bytes          one chunk on an open channel
//! +NNNN "msg" / -NNNN "msg"              command completion
//! ```
//!
//! The connection engine consuming these events lives in `skycore`; the
//! central arbiter speaking them lives in the `skywatch` crate.

pub mod completion;
pub mod device;
pub mod error;
pub mod line;
pub mod state;
pub mod value;
pub mod wire;

pub use completion::{
    Completion, ERR_BLOCKED, ERR_COMMAND, ERR_KEY, ERR_PARAMS, ERR_PRIORITY, ERR_SYSTEM,
    ERR_UNKNOWN_VALUE, OK,
};
pub use device::DeviceType;
pub use error::ProtoError;
pub use line::{quote, tokenize, LineBuilder, Params};
pub use value::{SetOp, TypeWord, ValueData, ValueKind, FLAG_RECORD, FLAG_WRITABLE};
pub use wire::{WireEvent, WireReader, MAX_LINE_LEN};

/// Message severity levels carried by the `M` log fan-out line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum MessageLevel {
    Debug = 0x01,
    Info = 0x02,
    Warning = 0x04,
    Error = 0x08,
}

impl MessageLevel {
    pub fn from_mask_bit(v: u32) -> Option<Self> {
        match v {
            0x01 => Some(MessageLevel::Debug),
            0x02 => Some(MessageLevel::Info),
            0x04 => Some(MessageLevel::Warning),
            0x08 => Some(MessageLevel::Error),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Build the `M` broadcast line for one log message.
pub fn message_line(level: MessageLevel, origin: &str, text: &str) -> String {
    LineBuilder::new("M")
        .arg(level.as_u32())
        .arg(origin)
        .arg_quoted(text)
        .finish()
}
