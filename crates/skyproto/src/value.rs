//! The value protocol: typed, replicated peer state.
//!
//! A peer declares each value once with `metainfo <typeword> <name> "<desc>"`
//! (selections additionally stream one `selmetainfo <name> "<label>"` per
//! option) and afterwards updates it with `value <name> <payload...>`. The
//! typeword packs a base type tag with the WRITABLE and RECORD flag bits.
//! Writable values accept `set_value <name> <op> <operand...>` requests from
//! peers; `set_value_def` additionally asks for the new content to become the
//! value's default.

use serde::Serialize;

use crate::error::ProtoError;
use crate::line::{LineBuilder, Params};

/// Peer may change this value via `set_value`.
pub const FLAG_WRITABLE: u32 = 0x0000_0100;
/// Value is written into the persisted observation record.
pub const FLAG_RECORD: u32 = 0x0000_0200;

const KIND_MASK: u32 = 0x0000_00ff;

/// Base semantic type of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum ValueKind {
    Integer = 1,
    Double = 2,
    Text = 3,
    Time = 4,
    Boolean = 5,
    Selection = 6,
    RaDec = 7,
    AltAz = 8,
    Rect = 9,
    BoundedDouble = 10,
    Stat = 11,
}

impl ValueKind {
    pub fn from_tag(tag: u32) -> Result<Self, ProtoError> {
        match tag {
            1 => Ok(ValueKind::Integer),
            2 => Ok(ValueKind::Double),
            3 => Ok(ValueKind::Text),
            4 => Ok(ValueKind::Time),
            5 => Ok(ValueKind::Boolean),
            6 => Ok(ValueKind::Selection),
            7 => Ok(ValueKind::RaDec),
            8 => Ok(ValueKind::AltAz),
            9 => Ok(ValueKind::Rect),
            10 => Ok(ValueKind::BoundedDouble),
            11 => Ok(ValueKind::Stat),
            other => Err(ProtoError::UnknownValueType(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Integer => "integer",
            ValueKind::Double => "double",
            ValueKind::Text => "text",
            ValueKind::Time => "time",
            ValueKind::Boolean => "boolean",
            ValueKind::Selection => "selection",
            ValueKind::RaDec => "radec",
            ValueKind::AltAz => "altaz",
            ValueKind::Rect => "rect",
            ValueKind::BoundedDouble => "bounded-double",
            ValueKind::Stat => "stat",
        }
    }
}

/// The packed type word carried by `metainfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TypeWord(pub u32);

impl TypeWord {
    pub fn new(kind: ValueKind) -> Self {
        TypeWord(kind as u32)
    }

    pub fn writable(mut self) -> Self {
        self.0 |= FLAG_WRITABLE;
        self
    }

    pub fn recorded(mut self) -> Self {
        self.0 |= FLAG_RECORD;
        self
    }

    pub fn kind(self) -> Result<ValueKind, ProtoError> {
        ValueKind::from_tag(self.0 & KIND_MASK)
    }

    pub fn is_writable(self) -> bool {
        self.0 & FLAG_WRITABLE != 0
    }

    pub fn is_recorded(self) -> bool {
        self.0 & FLAG_RECORD != 0
    }
}

/// One value's current content.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ValueData {
    Integer(i64),
    Double(f64),
    Text(String),
    /// Seconds since the Unix epoch, fractional.
    Time(f64),
    Boolean(bool),
    /// Index into the selection's label list.
    Selection(u32),
    RaDec { ra: f64, dec: f64 },
    AltAz { alt: f64, az: f64 },
    Rect { x: i64, y: i64, w: i64, h: i64 },
    BoundedDouble { value: f64, min: f64, max: f64 },
    Stat { n: u64, mean: f64, min: f64, max: f64, stdev: f64 },
}

impl ValueData {
    pub fn kind(&self) -> ValueKind {
        match self {
            ValueData::Integer(_) => ValueKind::Integer,
            ValueData::Double(_) => ValueKind::Double,
            ValueData::Text(_) => ValueKind::Text,
            ValueData::Time(_) => ValueKind::Time,
            ValueData::Boolean(_) => ValueKind::Boolean,
            ValueData::Selection(_) => ValueKind::Selection,
            ValueData::RaDec { .. } => ValueKind::RaDec,
            ValueData::AltAz { .. } => ValueKind::AltAz,
            ValueData::Rect { .. } => ValueKind::Rect,
            ValueData::BoundedDouble { .. } => ValueKind::BoundedDouble,
            ValueData::Stat { .. } => ValueKind::Stat,
        }
    }

    /// A zero/empty content for a freshly declared value of `kind`.
    pub fn default_for(kind: ValueKind) -> ValueData {
        match kind {
            ValueKind::Integer => ValueData::Integer(0),
            ValueKind::Double => ValueData::Double(f64::NAN),
            ValueKind::Text => ValueData::Text(String::new()),
            ValueKind::Time => ValueData::Time(f64::NAN),
            ValueKind::Boolean => ValueData::Boolean(false),
            ValueKind::Selection => ValueData::Selection(0),
            ValueKind::RaDec => ValueData::RaDec { ra: f64::NAN, dec: f64::NAN },
            ValueKind::AltAz => ValueData::AltAz { alt: f64::NAN, az: f64::NAN },
            ValueKind::Rect => ValueData::Rect { x: 0, y: 0, w: 0, h: 0 },
            ValueKind::BoundedDouble => {
                ValueData::BoundedDouble { value: f64::NAN, min: f64::NAN, max: f64::NAN }
            }
            ValueKind::Stat => {
                ValueData::Stat { n: 0, mean: f64::NAN, min: f64::NAN, max: f64::NAN, stdev: f64::NAN }
            }
        }
    }

    /// Parse the payload tokens of a `value` line for a known kind.
    pub fn parse(kind: ValueKind, params: &mut Params) -> Result<ValueData, ProtoError> {
        let data = match kind {
            ValueKind::Integer => ValueData::Integer(params.next_i64("integer value")?),
            ValueKind::Double => ValueData::Double(params.next_f64("double value")?),
            ValueKind::Text => ValueData::Text(params.next_str("text value")?),
            ValueKind::Time => ValueData::Time(params.next_f64("time value")?),
            ValueKind::Boolean => ValueData::Boolean(params.next_i32("boolean value")? != 0),
            ValueKind::Selection => ValueData::Selection(params.next_u32("selection index")?),
            ValueKind::RaDec => ValueData::RaDec {
                ra: params.next_f64("ra")?,
                dec: params.next_f64("dec")?,
            },
            ValueKind::AltAz => ValueData::AltAz {
                alt: params.next_f64("alt")?,
                az: params.next_f64("az")?,
            },
            ValueKind::Rect => ValueData::Rect {
                x: params.next_i64("x")?,
                y: params.next_i64("y")?,
                w: params.next_i64("width")?,
                h: params.next_i64("height")?,
            },
            ValueKind::BoundedDouble => ValueData::BoundedDouble {
                value: params.next_f64("value")?,
                min: params.next_f64("min")?,
                max: params.next_f64("max")?,
            },
            ValueKind::Stat => ValueData::Stat {
                n: params.next_i64("count")?.max(0) as u64,
                mean: params.next_f64("mean")?,
                min: params.next_f64("min")?,
                max: params.next_f64("max")?,
                stdev: params.next_f64("stdev")?,
            },
        };
        Ok(data)
    }

    /// Append this content to an outgoing line.
    pub fn encode(&self, line: LineBuilder) -> LineBuilder {
        match self {
            ValueData::Integer(v) => line.arg(v),
            ValueData::Double(v) => line.arg(v),
            ValueData::Text(v) => line.arg_quoted(v),
            ValueData::Time(v) => line.arg(v),
            ValueData::Boolean(v) => line.arg(i32::from(*v)),
            ValueData::Selection(v) => line.arg(v),
            ValueData::RaDec { ra, dec } => line.arg(ra).arg(dec),
            ValueData::AltAz { alt, az } => line.arg(alt).arg(az),
            ValueData::Rect { x, y, w, h } => line.arg(x).arg(y).arg(w).arg(h),
            ValueData::BoundedDouble { value, min, max } => line.arg(value).arg(min).arg(max),
            ValueData::Stat { n, mean, min, max, stdev } => {
                line.arg(n).arg(mean).arg(min).arg(max).arg(stdev)
            }
        }
    }
}

/// Operator in a `set_value` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Assign,
    Add,
    Sub,
}

impl SetOp {
    pub fn parse(tok: &str) -> Result<Self, ProtoError> {
        match tok {
            "=" => Ok(SetOp::Assign),
            "+=" => Ok(SetOp::Add),
            "-=" => Ok(SetOp::Sub),
            other => Err(ProtoError::InvalidParam { name: "operator", value: other.to_string() }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SetOp::Assign => "=",
            SetOp::Add => "+=",
            SetOp::Sub => "-=",
        }
    }

    /// Apply this operation to `current`, producing the new content.
    ///
    /// `+=`/`-=` are defined for numeric kinds only; everything else takes
    /// plain assignment.
    pub fn apply(self, current: &ValueData, operand: ValueData) -> Result<ValueData, ProtoError> {
        match self {
            SetOp::Assign => Ok(operand),
            SetOp::Add | SetOp::Sub => {
                let sign = if self == SetOp::Add { 1.0 } else { -1.0 };
                match (current, &operand) {
                    (ValueData::Integer(a), ValueData::Integer(b)) => {
                        Ok(ValueData::Integer(a + (sign as i64) * b))
                    }
                    (ValueData::Double(a), ValueData::Double(b)) => {
                        Ok(ValueData::Double(a + sign * b))
                    }
                    (ValueData::Time(a), ValueData::Time(b)) => Ok(ValueData::Time(a + sign * b)),
                    (ValueData::BoundedDouble { value, min, max }, ValueData::Double(b)) => {
                        Ok(ValueData::BoundedDouble { value: value + sign * b, min: *min, max: *max })
                    }
                    (ValueData::RaDec { ra, dec }, ValueData::RaDec { ra: dra, dec: ddec }) => {
                        Ok(ValueData::RaDec { ra: ra + sign * dra, dec: dec + sign * ddec })
                    }
                    (ValueData::AltAz { alt, az }, ValueData::AltAz { alt: dalt, az: daz }) => {
                        Ok(ValueData::AltAz { alt: alt + sign * dalt, az: az + sign * daz })
                    }
                    (current, _) => Err(ProtoError::UnsupportedOp {
                        op: self.as_str(),
                        kind: current.kind().as_str(),
                    }),
                }
            }
        }
    }
}

/// Build a `metainfo` declaration line.
pub fn metainfo_line(type_word: TypeWord, name: &str, description: &str) -> String {
    LineBuilder::new("metainfo")
        .arg(type_word.0)
        .arg(name)
        .arg_quoted(description)
        .finish()
}

/// Build a `selmetainfo` option line.
pub fn selmetainfo_line(name: &str, label: &str) -> String {
    LineBuilder::new("selmetainfo").arg(name).arg_quoted(label).finish()
}

/// Build a `value` update line.
pub fn value_line(name: &str, data: &ValueData) -> String {
    data.encode(LineBuilder::new("value").arg(name)).finish()
}

/// Build a `set_value` request line.
pub fn set_value_line(name: &str, op: SetOp, operand: &ValueData) -> String {
    operand
        .encode(LineBuilder::new("set_value").arg(name).arg(op.as_str()))
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn reparse(kind: ValueKind, line: &str) -> ValueData {
        let (name, mut params) = Params::parse_line(line).unwrap();
        assert_eq!(name, "value");
        params.next_str("value name").unwrap();
        let data = ValueData::parse(kind, &mut params).unwrap();
        params.end("value").unwrap();
        data
    }

    #[test]
    fn typeword_flags() {
        let tw = TypeWord::new(ValueKind::Double).writable().recorded();
        assert_eq!(tw.kind().unwrap(), ValueKind::Double);
        assert!(tw.is_writable());
        assert!(tw.is_recorded());

        let ro = TypeWord::new(ValueKind::Text);
        assert!(!ro.is_writable());
    }

    #[test]
    fn radec_value_roundtrip() {
        let data = ValueData::RaDec { ra: 83.633, dec: 22.0145 };
        let line = value_line("ORI_TARGET", &data);
        assert_eq!(line, "value ORI_TARGET 83.633 22.0145");
        assert_eq!(reparse(ValueKind::RaDec, &line), data);
    }

    #[test]
    fn quoted_text_value() {
        let data = ValueData::Text("M 31 - Andromeda".to_string());
        let line = value_line("target_name", &data);
        assert_eq!(reparse(ValueKind::Text, &line), data);
    }

    #[test]
    fn rect_value_roundtrip() {
        let data = ValueData::Rect { x: 0, y: 0, w: 2048, h: 2048 };
        assert_eq!(reparse(ValueKind::Rect, &value_line("window", &data)), data);
    }

    #[test]
    fn metainfo_line_format() {
        let tw = TypeWord::new(ValueKind::Selection).writable();
        let line = metainfo_line(tw, "filter", "selected filter wheel slot");
        assert_eq!(line, format!("metainfo {} filter \"selected filter wheel slot\"", tw.0));
    }

    #[test]
    fn set_op_add_on_double() {
        let current = ValueData::Double(10.0);
        let next = SetOp::Add.apply(&current, ValueData::Double(2.5)).unwrap();
        assert_eq!(next, ValueData::Double(12.5));
    }

    #[test]
    fn set_op_offset_radec() {
        let current = ValueData::RaDec { ra: 10.0, dec: -5.0 };
        let next = SetOp::Sub
            .apply(&current, ValueData::RaDec { ra: 0.5, dec: 0.25 })
            .unwrap();
        assert_eq!(next, ValueData::RaDec { ra: 9.5, dec: -5.25 });
    }

    #[test]
    fn set_op_add_rejected_for_text() {
        let current = ValueData::Text("abc".into());
        let err = SetOp::Add.apply(&current, ValueData::Text("def".into())).unwrap_err();
        assert!(matches!(err, ProtoError::UnsupportedOp { kind: "text", .. }));
    }

    #[test]
    fn boolean_encodes_as_digit() {
        assert_eq!(value_line("tracking", &ValueData::Boolean(true)), "value tracking 1");
        assert_eq!(reparse(ValueKind::Boolean, "value tracking 0"), ValueData::Boolean(false));
    }
}
