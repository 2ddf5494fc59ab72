//! Keys identifying one cacheable computation.
//!
//! A [`Key`] is derived from an ordered list of parts (arguments, IDs, ...)
//! and, in subject mode, a [`Context`] naming the type and method the value
//! belongs to. The parts and the context are serialized to canonical JSON
//! (object members sorted, no insignificant whitespace) and hashed with
//! BLAKE3, so keys have a fixed length no matter how large the parts are.
//!
//! # Examples
//!
//! ```
//! use lockcache::key::{Context, Key};
//!
//! let key = Key::new(("user", 42)).unwrap();
//! assert_eq!(key, Key::builder().part("user").part(42).build().unwrap());
//! assert!(key.lock_key().starts_with("lockcache:lock:"));
//!
//! let scoped = Key::builder()
//!     .context(Context::new("Blog", "word_count"))
//!     .part("user")
//!     .part(42)
//!     .build()
//!     .unwrap();
//! assert_ne!(key, scoped);
//! ```

use std::borrow::Cow;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

const NAMESPACE: &str = "lockcache";
const LOCK_SEGMENT: &str = "lock";

/// The type and method a cached value belongs to.
///
/// Two methods called with the same arguments never share a cached value
/// when their keys carry different contexts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Context {
    type_name: Cow<'static, str>,
    method: Cow<'static, str>,
}

impl Context {
    /// Creates a context from an explicit type name and method name.
    pub fn new(
        type_name: impl Into<Cow<'static, str>>,
        method: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            method: method.into(),
        }
    }

    /// Creates a context named after the Rust type `T`.
    ///
    /// The name comes from [`std::any::type_name`], so it includes the module
    /// path and changes if the type is moved or renamed. Use [`Context::new`]
    /// when cached values must survive such refactorings.
    ///
    /// ```
    /// use lockcache::key::Context;
    ///
    /// struct Blog;
    ///
    /// let context = Context::of::<Blog>("word_count");
    /// assert!(context.type_name().ends_with("Blog"));
    /// ```
    #[must_use]
    pub fn of<T: ?Sized>(method: impl Into<Cow<'static, str>>) -> Self {
        Self::new(std::any::type_name::<T>(), method)
    }

    /// The name of the owning type.
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// The name of the method.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.type_name, self.method)
    }
}

/// Identifies one cacheable computation instance.
///
/// Keys are immutable; the derived storage and lock keys are computed once
/// at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    storage_key: String,
    lock_key: String,
}

impl Key {
    /// Builds a standalone key from a serializable value.
    ///
    /// Tuples, arrays and vectors contribute one part per element; the unit
    /// value `()` contributes no parts; any other value is a single part.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if there are no parts, or
    /// [`Error::SerdeJson`] if the parts cannot be serialized.
    pub fn new<P: Serialize>(parts: P) -> Result<Self> {
        Self::builder().parts(parts).build()
    }

    /// Creates a new, empty [`KeyBuilder`].
    #[must_use]
    pub fn builder() -> KeyBuilder {
        KeyBuilder::default()
    }

    /// The key under which the computed value is cached.
    #[must_use]
    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// The key under which the lock record is kept.
    #[must_use]
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    fn from_canonical(canonical: &[u8]) -> Self {
        let digest = blake3::hash(canonical);
        Self {
            storage_key: format!("{NAMESPACE}:{digest}"),
            lock_key: format!("{NAMESPACE}:{LOCK_SEGMENT}:{digest}"),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key)
    }
}

#[derive(Serialize)]
struct KeyMaterial<'a> {
    context: Option<&'a Context>,
    parts: &'a [Value],
}

/// Collects key parts and an optional [`Context`] into a [`Key`].
///
/// Serialization errors are reported by [`KeyBuilder::build`], so parts can
/// be chained without intermediate error handling.
#[derive(Debug, Default)]
#[must_use]
pub struct KeyBuilder {
    context: Option<Context>,
    parts: Vec<Value>,
    error: Option<serde_json::Error>,
}

impl KeyBuilder {
    /// Namespaces the key with the given context.
    pub fn context(mut self, context: Context) -> Self {
        self.context = Some(context);
        self
    }

    /// Appends a single part.
    pub fn part<P: Serialize>(mut self, part: P) -> Self {
        match serde_json::to_value(part) {
            Ok(value) => self.parts.push(value),
            Err(error) => self.fail(error),
        }
        self
    }

    /// Appends several parts, expanding tuples, arrays and vectors.
    pub fn parts<P: Serialize>(mut self, parts: P) -> Self {
        match serde_json::to_value(parts) {
            Ok(Value::Array(values)) => self.parts.extend(values),
            Ok(Value::Null) => {}
            Ok(value) => self.parts.push(value),
            Err(error) => self.fail(error),
        }
        self
    }

    fn fail(&mut self, error: serde_json::Error) {
        self.error.get_or_insert(error);
    }

    /// Derives the key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKey`] if no parts were given, or
    /// [`Error::SerdeJson`] if a part could not be serialized.
    pub fn build(self) -> Result<Key> {
        if let Some(error) = self.error {
            return Err(error.into());
        }
        if self.parts.is_empty() {
            return Err(Error::InvalidKey);
        }

        let canonical = serde_json_canonicalizer::to_vec(&KeyMaterial {
            context: self.context.as_ref(),
            parts: &self.parts,
        })
        .map_err(<serde_json::Error as serde::ser::Error>::custom)?;
        Ok(Key::from_canonical(&canonical))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap, HashSet};

    use serde_json::json;

    use super::*;

    #[test]
    fn same_parts_give_same_key() {
        let a = Key::new(("user", 42, [1, 2, 3])).unwrap();
        let b = Key::builder()
            .part("user")
            .part(42)
            .part(vec![1, 2, 3])
            .build()
            .unwrap();

        assert_eq!(a, b);
        assert_eq!(a.storage_key(), b.storage_key());
        assert_eq!(a.lock_key(), b.lock_key());
    }

    #[test]
    fn part_order_matters() {
        assert_ne!(Key::new(("a", "b")).unwrap(), Key::new(("b", "a")).unwrap());
    }

    #[test]
    fn part_boundaries_matter() {
        assert_ne!(Key::new(("ab", "c")).unwrap(), Key::new(("a", "bc")).unwrap());
        assert_ne!(Key::new((vec![1, 2],)).unwrap(), Key::new((1, 2)).unwrap());
    }

    #[test]
    fn numbers_and_strings_differ() {
        assert_ne!(Key::new((42,)).unwrap(), Key::new(("42",)).unwrap());
    }

    #[test]
    fn map_field_order_is_irrelevant() {
        let mut first = HashMap::new();
        first.insert("b", 2);
        first.insert("a", 1);
        let second: BTreeMap<_, _> = [("a", 1), ("b", 2)].into_iter().collect();

        assert_eq!(Key::new((first,)).unwrap(), Key::new((second,)).unwrap());
        assert_eq!(
            Key::new((json!({"x": 1, "y": {"q": 1, "p": 2}}),)).unwrap(),
            Key::new((json!({"y": {"p": 2, "q": 1}, "x": 1}),)).unwrap()
        );
    }

    #[test]
    fn structs_and_equivalent_maps_agree() {
        #[derive(Serialize)]
        struct User {
            name: &'static str,
            id: u32,
        }

        assert_eq!(
            Key::new((User { name: "ada", id: 1 },)).unwrap(),
            Key::new((json!({"id": 1, "name": "ada"}),)).unwrap()
        );
    }

    #[test]
    fn context_namespaces_key() {
        let plain = Key::new(("x",)).unwrap();
        let word_count = Key::builder()
            .context(Context::new("Blog", "word_count"))
            .part("x")
            .build()
            .unwrap();
        let title = Key::builder()
            .context(Context::new("Blog", "title"))
            .part("x")
            .build()
            .unwrap();

        assert_ne!(plain, word_count);
        assert_ne!(word_count, title);
    }

    #[test]
    fn context_of_type() {
        struct Blog;

        let context = Context::of::<Blog>("word_count");
        assert!(context.type_name().ends_with("Blog"));
        assert_eq!(context.method(), "word_count");
        assert!(context.to_string().ends_with("Blog#word_count"));
    }

    #[test]
    fn empty_parts_are_rejected() {
        assert!(matches!(Key::new(()), Err(Error::InvalidKey)));
        assert!(matches!(Key::new(Vec::<u8>::new()), Err(Error::InvalidKey)));
        assert!(matches!(
            Key::builder()
                .context(Context::new("Blog", "word_count"))
                .build(),
            Err(Error::InvalidKey)
        ));
    }

    #[test]
    fn scalar_is_single_part() {
        assert_eq!(Key::new("user").unwrap(), Key::new(("user",)).unwrap());
    }

    #[test]
    fn unserializable_part_is_reported() {
        let mut bad = HashMap::new();
        bad.insert((1, 2), "tuple keys are not JSON object keys");

        assert!(matches!(
            Key::builder().part("ok").part(bad).build(),
            Err(Error::SerdeJson(_))
        ));
    }

    #[test]
    fn keys_have_bounded_length() {
        let long = "x".repeat(10_000);
        let key = Key::new((long,)).unwrap();

        assert_eq!(key.storage_key().len(), NAMESPACE.len() + 1 + 64);
        assert_eq!(
            key.lock_key(),
            format!("{NAMESPACE}:{LOCK_SEGMENT}:{}", &key.storage_key()[NAMESPACE.len() + 1..])
        );
    }

    #[test]
    fn distinct_inputs_give_distinct_keys() {
        let keys: HashSet<_> = (0..2_000)
            .map(|i| Key::new(("item", i)).unwrap().storage_key().to_owned())
            .collect();

        assert_eq!(keys.len(), 2_000);
    }
}
