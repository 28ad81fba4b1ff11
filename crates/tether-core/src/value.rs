//! Host values that can be named by guest handles.
//!
//! The host side is dynamically typed: a handle may refer to a number, a
//! string, an opaque native object, a callable closure, or a captured error.
//! [`HostValue`] is the tagged union over those shapes.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::closure::HostClosure;
use crate::handles::Handle;

/// A value living on the host side of the bridge.
#[derive(Clone, Debug, Default)]
pub enum HostValue {
    /// The absent value.
    #[default]
    Undefined,
    /// The explicit empty value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A number. All host numbers are doubles.
    Number(f64),
    /// An immutable string.
    String(Arc<str>),
    /// An opaque native object (context, node, typed array...).
    Object(HostObject),
    /// A callable backed by a guest closure.
    Function(HostClosure),
    /// A captured host error.
    Error(HostException),
}

impl HostValue {
    /// Create a string value.
    pub fn string(text: impl Into<Arc<str>>) -> Self {
        Self::String(text.into())
    }

    /// Create an object value.
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Self::Object(HostObject::new(value))
    }

    /// The fixed handle for values that never need a table slot.
    pub fn sentinel_handle(&self) -> Option<Handle> {
        match self {
            Self::Undefined => Some(Handle::UNDEFINED),
            Self::Null => Some(Handle::NULL),
            Self::Bool(true) => Some(Handle::TRUE),
            Self::Bool(false) => Some(Handle::FALSE),
            _ => None,
        }
    }

    /// Short name of the value's kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Object(_) => "object",
            Self::Function(_) => "function",
            Self::Error(_) => "error",
        }
    }

    /// Whether the value is `undefined` or `null`.
    pub fn is_like_none(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    /// Whether the value is callable.
    pub fn is_function(&self) -> bool {
        matches!(self, Self::Function(_))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HostObject> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&HostClosure> {
        match self {
            Self::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&HostException> {
        match self {
            Self::Error(e) => Some(e),
            _ => None,
        }
    }

    /// Render the value for diagnostics.
    ///
    /// Strings are quoted, callables render as `Function`, objects carry
    /// their native type name and errors their message.
    pub fn debug_string(&self) -> String {
        match self {
            Self::Undefined => "undefined".to_string(),
            Self::Null => "null".to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => n.to_string(),
            Self::String(s) => format!("\"{s}\""),
            Self::Object(obj) => format!("Object({})", obj.type_name()),
            Self::Function(_) => "Function".to_string(),
            Self::Error(e) => format!("Error: {}", e.message()),
        }
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => a.same_closure(b),
            (Self::Error(a), Self::Error(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for HostValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for HostValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for HostValue {
    fn from(value: i32) -> Self {
        Self::Number(value.into())
    }
}

impl From<u32> for HostValue {
    fn from(value: u32) -> Self {
        Self::Number(value.into())
    }
}

impl From<&str> for HostValue {
    fn from(value: &str) -> Self {
        Self::String(value.into())
    }
}

impl From<String> for HostValue {
    fn from(value: String) -> Self {
        Self::String(value.into())
    }
}

impl From<HostObject> for HostValue {
    fn from(value: HostObject) -> Self {
        Self::Object(value)
    }
}

impl From<HostClosure> for HostValue {
    fn from(value: HostClosure) -> Self {
        Self::Function(value)
    }
}

impl From<HostException> for HostValue {
    fn from(value: HostException) -> Self {
        Self::Error(value)
    }
}

impl<T: Into<HostValue>> From<Option<T>> for HostValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Undefined, Into::into)
    }
}

/// An opaque, shared native object.
///
/// Equality is identity: two `HostObject`s are equal when they share the
/// same allocation.
#[derive(Clone)]
pub struct HostObject {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl HostObject {
    /// Wrap a native value.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_name: short_type_name::<T>(),
        }
    }

    /// Borrow the native value if it has type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Whether the native value has type `T`.
    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    /// Unqualified type name of the native value.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl PartialEq for HostObject {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostObject").field(&self.type_name).finish()
    }
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// A host error captured at the call boundary.
#[derive(Clone)]
pub struct HostException {
    inner: Arc<anyhow::Error>,
}

impl HostException {
    /// Capture an error.
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: Arc::new(err.into()),
        }
    }

    /// Create an exception carrying only a message.
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self::new(anyhow::Error::msg(message))
    }

    /// The top-level error message.
    pub fn message(&self) -> String {
        self.inner.to_string()
    }

    /// The underlying error.
    pub fn error(&self) -> &anyhow::Error {
        &self.inner
    }
}

impl PartialEq for HostException {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Display for HostException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.inner)
    }
}

impl fmt::Debug for HostException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HostException").field(&self.message()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CanvasContext;

    #[test]
    fn test_sentinel_handles() {
        assert_eq!(HostValue::Undefined.sentinel_handle(), Some(Handle::UNDEFINED));
        assert_eq!(HostValue::Null.sentinel_handle(), Some(Handle::NULL));
        assert_eq!(HostValue::Bool(true).sentinel_handle(), Some(Handle::TRUE));
        assert_eq!(HostValue::Bool(false).sentinel_handle(), Some(Handle::FALSE));
        assert_eq!(HostValue::from(1.5).sentinel_handle(), None);
    }

    #[test]
    fn test_object_identity() {
        let a = HostObject::new(CanvasContext);
        let b = a.clone();
        let c = HostObject::new(CanvasContext);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.is::<CanvasContext>());
        assert_eq!(a.type_name(), "CanvasContext");
    }

    #[test]
    fn test_debug_string() {
        assert_eq!(HostValue::from("hi").debug_string(), "\"hi\"");
        assert_eq!(HostValue::from(3).debug_string(), "3");
        assert_eq!(HostValue::Null.debug_string(), "null");
        assert_eq!(
            HostValue::object(CanvasContext).debug_string(),
            "Object(CanvasContext)"
        );
        assert_eq!(
            HostValue::from(HostException::msg("lost context")).debug_string(),
            "Error: lost context"
        );
    }

    #[test]
    fn test_option_conversion() {
        assert_eq!(HostValue::from(None::<&str>), HostValue::Undefined);
        assert_eq!(HostValue::from(Some("x")), HostValue::from("x"));
    }
}
