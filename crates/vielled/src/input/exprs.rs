//! Mini-language for MIDI input maps.
//!
//! Conditions filter incoming messages, value expressions compute event
//! fields from the matched message. The grammar is deliberately tiny
//! and fully checked at load time:
//!
//! ```text
//! cond  := field "==" int | field "!=" int | field "range(" int "," int ")"
//! value := field | field "plus(" int ")" | field "minus(" int ")"
//!        | field "midi_percent"
//! field := "channel" | "arg1" | "arg2"
//! ```
//!
//! `range(a, b)` is inclusive on both ends; `midi_percent` rescales a
//! 0..=127 controller value to 0..=100.

use crate::input::midi::MidiMessage;
use crate::input::InputError;
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Channel,
    Arg1,
    Arg2,
}

impl Field {
    fn parse(token: &str) -> Result<Self, InputError> {
        Ok(match token {
            "channel" => Field::Channel,
            "arg1" => Field::Arg1,
            "arg2" => Field::Arg2,
            other => {
                return Err(InputError::InvalidMap(format!(
                    "unknown field \"{}\"",
                    other
                )))
            }
        })
    }

    fn value(&self, msg: &MidiMessage) -> i32 {
        match self {
            Field::Channel => msg.channel as i32,
            Field::Arg1 => msg.arg1 as i32,
            Field::Arg2 => msg.arg2.unwrap_or(0) as i32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cond {
    Eq(Field, i32),
    Ne(Field, i32),
    Range(Field, i32, i32),
}

impl Cond {
    pub fn parse(code: &str) -> Result<Self, InputError> {
        let tokens = tokenize(code);
        match tokens.as_slice() {
            [field, "==", value] => Ok(Cond::Eq(Field::parse(field)?, parse_int(value)?)),
            [field, "!=", value] => Ok(Cond::Ne(Field::parse(field)?, parse_int(value)?)),
            [field, "range", "(", lo, ",", hi, ")"] => Ok(Cond::Range(
                Field::parse(field)?,
                parse_int(lo)?,
                parse_int(hi)?,
            )),
            _ => Err(InputError::InvalidMap(format!(
                "unparsable condition \"{}\"",
                code
            ))),
        }
    }

    pub fn eval(&self, msg: &MidiMessage) -> bool {
        match self {
            Cond::Eq(field, value) => field.value(msg) == *value,
            Cond::Ne(field, value) => field.value(msg) != *value,
            Cond::Range(field, lo, hi) => {
                let v = field.value(msg);
                *lo <= v && v <= *hi
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueExpr {
    Field(Field),
    Plus(Field, i32),
    Minus(Field, i32),
    MidiPercent(Field),
}

impl ValueExpr {
    pub fn parse(code: &str) -> Result<Self, InputError> {
        let tokens = tokenize(code);
        match tokens.as_slice() {
            [field] => Ok(ValueExpr::Field(Field::parse(field)?)),
            [field, "plus", "(", n, ")"] => {
                Ok(ValueExpr::Plus(Field::parse(field)?, parse_int(n)?))
            }
            [field, "minus", "(", n, ")"] => {
                Ok(ValueExpr::Minus(Field::parse(field)?, parse_int(n)?))
            }
            [field, "midi_percent"] => Ok(ValueExpr::MidiPercent(Field::parse(field)?)),
            _ => Err(InputError::InvalidMap(format!(
                "unparsable expression \"{}\"",
                code
            ))),
        }
    }

    pub fn eval(&self, msg: &MidiMessage) -> i32 {
        match self {
            ValueExpr::Field(field) => field.value(msg),
            ValueExpr::Plus(field, n) => field.value(msg) + n,
            ValueExpr::Minus(field, n) => field.value(msg) - n,
            ValueExpr::MidiPercent(field) => util::midi2percent(field.value(msg)),
        }
    }
}

fn tokenize(code: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut rest = code.trim();
    while !rest.is_empty() {
        let split = rest
            .char_indices()
            .find(|(_, c)| ['(', ')', ','].contains(c) || c.is_whitespace());
        match split {
            Some((0, c)) => {
                if !c.is_whitespace() {
                    tokens.push(&rest[..c.len_utf8()]);
                }
                rest = rest[c.len_utf8()..].trim_start();
            }
            Some((idx, _)) => {
                tokens.push(&rest[..idx]);
                rest = rest[idx..].trim_start();
            }
            None => {
                tokens.push(rest);
                break;
            }
        }
    }
    tokens
}

fn parse_int(token: &str) -> Result<i32, InputError> {
    token
        .parse()
        .map_err(|_| InputError::InvalidMap(format!("invalid number \"{}\"", token)))
}
