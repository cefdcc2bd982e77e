//! Per-kernel-family rewriting of message content.
//!
//! Some kernel implementations deserialize certain numeric fields into
//! fixed-width unsigned integers and reject anything else (negative values,
//! floats, values above `u32::MAX`). [`normalize`] rewrites a deep copy of
//! the content tree so it satisfies the target kernel without changing
//! anything else.

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Kernel implementation family, used to pick normalization rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelFamily {
    #[default]
    Python,
    /// R kernels parse the fields in [`U32_FIELDS`] as `u32`.
    R,
    Other,
}

impl std::fmt::Display for KernelFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelFamily::Python => write!(f, "python"),
            KernelFamily::R => write!(f, "r"),
            KernelFamily::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bridge → kernel.
    Outgoing,
    /// Kernel → bridge.
    Incoming,
}

/// Field names clamped to `[0, u32::MAX]` for families that need it.
pub const U32_FIELDS: &[&str] = &[
    "cursor_pos",
    "detail_level",
    "execution_count",
    "cursor_start",
    "cursor_end",
    "n",
    "line",
    "column",
];

impl KernelFamily {
    fn clamps_u32(self, direction: Direction) -> bool {
        matches!((self, direction), (KernelFamily::R, Direction::Outgoing))
    }
}

/// Return a normalized copy of `content` for `family`. The input is never
/// mutated.
pub fn normalize(family: KernelFamily, direction: Direction, content: &Value) -> Value {
    let mut copy = content.clone();
    if family.clamps_u32(direction) {
        clamp_u32_fields(&mut copy);
    }
    copy
}

fn clamp_u32_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                let clamped = match field {
                    Value::Number(n) if U32_FIELDS.contains(&key.as_str()) => Some(clamp_u32(n)),
                    _ => None,
                };
                match clamped {
                    Some(n) => *field = Value::Number(n),
                    None => clamp_u32_fields(field),
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(clamp_u32_fields),
        _ => {}
    }
}

fn clamp_u32(n: &Number) -> Number {
    let max = u64::from(u32::MAX);
    let clamped = if let Some(u) = n.as_u64() {
        u.min(max)
    } else if n.as_i64().is_some() {
        // as_u64 failed, so the integer is negative
        0
    } else {
        match n.as_f64() {
            Some(f) if f.is_finite() => f.trunc().clamp(0.0, max as f64) as u64,
            _ => 0,
        }
    };
    Number::from(clamped)
}
