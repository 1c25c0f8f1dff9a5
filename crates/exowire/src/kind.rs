//! # Reply Kinds
//!
//! Every successful reply tags its value with a kind, telling the receiver
//! whether `val` is a plain value or a handle that needs wrapping.

/// The discriminant carried in a reply's `key` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    /// A callable remote reference. `val` is its FFID.
    Fn,
    /// A constructible (class-like) remote reference. `val` is its FFID.
    Class,
    /// A plain remote object. `val` is its FFID.
    Obj,
    /// An instance produced by construction. `val` is its FFID.
    Inst,
    /// Nothing was produced; `val` is meaningless.
    Void,
    /// A reference back to an object the receiver owns. `val` is its FFID.
    Py,
    /// Anything else: `val` is the value itself. Holds the tag as received.
    Value(String),
}

impl Kind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "fn" => Self::Fn,
            "class" => Self::Class,
            "obj" => Self::Obj,
            "inst" => Self::Inst,
            "void" => Self::Void,
            "py" => Self::Py,
            other => Self::Value(other.to_string()),
        }
    }

    pub fn as_tag(&self) -> &str {
        match self {
            Self::Fn => "fn",
            Self::Class => "class",
            Self::Obj => "obj",
            Self::Inst => "inst",
            Self::Void => "void",
            Self::Py => "py",
            Self::Value(tag) => tag,
        }
    }

    /// True when `val` must be an FFID rather than a value.
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Fn | Self::Class | Self::Obj | Self::Inst | Self::Py)
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_tag())
    }
}
