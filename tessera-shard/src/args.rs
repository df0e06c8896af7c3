//! Bind arguments for planned statements

use rusqlite::types::Value;

/// One bind argument supplied with a query, addressed by 1-based ordinal
/// and, optionally, by name.
///
/// Supported parameter markers: positional `?`, `?N` and `$N`; named
/// `$name` (where `name` is non-numeric). Names carry their marker prefix,
/// matching the underlying driver's convention.
#[derive(Debug, Clone)]
pub struct NamedParam {
    /// Marker name including its prefix (e.g. `$ts`), if the argument is named.
    pub name: Option<String>,
    /// 1-based position of the argument in the original statement.
    pub ordinal: usize,
    /// The bound value.
    pub value: Value,
}

impl NamedParam {
    /// A positional argument.
    pub fn positional(ordinal: usize, value: Value) -> Self {
        Self {
            name: None,
            ordinal,
            value,
        }
    }

    /// A named argument. `name` carries the marker prefix (e.g. `$ts`).
    pub fn named(name: impl Into<String>, ordinal: usize, value: Value) -> Self {
        Self {
            name: Some(name.into()),
            ordinal,
            value,
        }
    }
}

/// Find an argument by marker name or 1-based ordinal.
pub(crate) fn resolve<'a>(
    args: &'a [NamedParam],
    name: Option<&str>,
    ordinal: Option<usize>,
) -> Option<&'a NamedParam> {
    args.iter().find(|a| {
        name.is_some_and(|n| a.name.as_deref() == Some(n))
            || ordinal.is_some_and(|o| a.ordinal == o)
    })
}
