use std::fmt;

use serde::{Deserialize, Serialize};

/// Errors produced while parsing or constructing an [`Address`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address component must be non-empty")]
    Empty,
    #[error("address component `{0}` contains a non-printable character")]
    NotPrintable(String),
    #[error("address textual form `{0}` must contain at most one `.` separator")]
    TooManyParts(String),
}

/// A two-part identifier `(context, object)` naming either endpoint of a
/// [`Message`](crate::message::Message) or a handler registered with the router.
///
/// Components are non-empty, printable strings with no embedded `.`; the textual
/// form `"<context>.<object>"` is used for logging and for addressing services,
/// while `"<context>"` alone addresses the context object itself (see
/// [`Address::context_only`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    context: String,
    object: String,
}

/// Well-known object name for the context's own control-surface handler.
pub const CONTEXT_OBJECT: &str = "__context__";
/// Well-known object name for a context's signal manager.
pub const SIGNAL_MANAGER_OBJECT: &str = "__signals__";

impl Address {
    /// Builds an address from already-validated parts. Prefer [`Address::new`]
    /// unless the caller has already validated both components.
    pub fn new(context: impl Into<String>, object: impl Into<String>) -> Result<Self, AddressError> {
        let context = context.into();
        let object = object.into();
        validate_component(&context)?;
        validate_component(&object)?;
        Ok(Self { context, object })
    }

    /// Addresses the context object itself, e.g. for shutdown/enumeration RPCs.
    pub fn context_only(context: impl Into<String>) -> Result<Self, AddressError> {
        Self::new(context, CONTEXT_OBJECT)
    }

    /// Addresses a context's signal manager, the destination for all signal messages.
    pub fn signal_manager(context: impl Into<String>) -> Result<Self, AddressError> {
        Self::new(context, SIGNAL_MANAGER_OBJECT)
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    /// Parses the textual form `"<context>.<object>"` or a bare `"<context>"`
    /// (which is treated as [`Address::context_only`]).
    pub fn parse(text: &str) -> Result<Self, AddressError> {
        let mut parts = text.splitn(2, '.');
        let context = parts.next().unwrap_or_default();
        match parts.next() {
            Some(object) => {
                if object.contains('.') {
                    return Err(AddressError::TooManyParts(text.to_owned()));
                }
                Self::new(context, object)
            }
            None => Self::context_only(context),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.context, self.object)
    }
}

fn validate_component(component: &str) -> Result<(), AddressError> {
    if component.is_empty() {
        return Err(AddressError::Empty);
    }
    if component.contains('.') || !component.chars().all(|c| c.is_ascii_graphic()) {
        return Err(AddressError::NotPrintable(component.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_parse() {
        let addr = Address::new("ctx-a", "svc").unwrap();
        assert_eq!(addr.to_string(), "ctx-a.svc");
        assert_eq!(Address::parse("ctx-a.svc").unwrap(), addr);
    }

    #[test]
    fn context_only_form_parses() {
        let addr = Address::parse("ctx-a").unwrap();
        assert_eq!(addr, Address::context_only("ctx-a").unwrap());
    }

    #[test]
    fn rejects_empty_components() {
        assert_eq!(Address::new("", "svc").unwrap_err(), AddressError::Empty);
        assert_eq!(Address::new("ctx", "").unwrap_err(), AddressError::Empty);
    }

    #[test]
    fn rejects_embedded_dots_in_a_component() {
        assert!(Address::new("ctx.sub", "svc").is_err());
    }

    #[test]
    fn rejects_more_than_one_separator_in_textual_form() {
        assert!(matches!(
            Address::parse("a.b.c"),
            Err(AddressError::TooManyParts(_))
        ));
    }
}
