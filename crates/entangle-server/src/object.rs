//! The registered object model: named members that are either data or
//! callable methods.
//!
//! Whether a key holds data or a method is decided when the member is
//! inserted and never inferred from a value later. Clients learn about
//! methods through `AssignFunction` and only ever call them by name.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use entangle_core::EntangleError;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::store::Store;

/// Failure returned by a method body. Only the message reaches the client.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct MethodError {
    message: String,
}

impl MethodError {
    /// Create an error with `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Message sent to the caller.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for MethodError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for MethodError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<EntangleError> for MethodError {
    fn from(err: EntangleError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for MethodError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// A callable member of a registered object.
///
/// The body receives the owning service's [`Store`], so writes it performs
/// are permission-checked and broadcast like any other mutation.
#[async_trait]
pub trait Method: Send + Sync {
    /// Invoke the method with positional arguments.
    async fn call(&self, store: Store, args: Vec<Value>) -> Result<Value, MethodError>;
}

impl fmt::Debug for dyn Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Method(..)")
    }
}

struct SyncFn<F>(F);

#[async_trait]
impl<F> Method for SyncFn<F>
where
    F: Fn(&Store, Vec<Value>) -> Result<Value, MethodError> + Send + Sync,
{
    async fn call(&self, store: Store, args: Vec<Value>) -> Result<Value, MethodError> {
        (self.0)(&store, args)
    }
}

struct AsyncFn<F>(F);

#[async_trait]
impl<F> Method for AsyncFn<F>
where
    F: Fn(Store, Vec<Value>) -> BoxFuture<'static, Result<Value, MethodError>> + Send + Sync,
{
    async fn call(&self, store: Store, args: Vec<Value>) -> Result<Value, MethodError> {
        (self.0)(store, args).await
    }
}

/// Wrap a synchronous closure as a [`Method`].
pub fn sync_method<F>(f: F) -> Arc<dyn Method>
where
    F: Fn(&Store, Vec<Value>) -> Result<Value, MethodError> + Send + Sync + 'static,
{
    Arc::new(SyncFn(f))
}

/// Wrap an async closure as a [`Method`].
pub fn async_method<F, Fut>(f: F) -> Arc<dyn Method>
where
    F: Fn(Store, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, MethodError>> + Send + 'static,
{
    Arc::new(AsyncFn(move |store: Store, args: Vec<Value>| -> BoxFuture<'static, _> {
        Box::pin(f(store, args))
    }))
}

/// One member of a registered object.
#[derive(Clone)]
pub enum Member {
    /// Plain data, mirrored to clients.
    Data(Value),
    /// Callable member, announced to clients by name only.
    Method(Arc<dyn Method>),
}

impl Member {
    /// Whether this member is callable.
    pub fn is_method(&self) -> bool {
        matches!(self, Self::Method(_))
    }

    /// Data value, if this member is data.
    pub fn as_data(&self) -> Option<&Value> {
        match self {
            Self::Data(v) => Some(v),
            Self::Method(_) => None,
        }
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data(v) => f.debug_tuple("Data").field(v).finish(),
            Self::Method(_) => f.write_str("Method(..)"),
        }
    }
}

impl From<Value> for Member {
    fn from(value: Value) -> Self {
        Self::Data(value)
    }
}

/// An object to be registered: an ordered map of named members.
#[derive(Clone, Debug, Default)]
pub struct Object {
    members: BTreeMap<String, Member>,
}

impl Object {
    /// Empty object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Object whose members are the entries of a JSON map.
    pub fn from_json(map: Map<String, Value>) -> Self {
        Self {
            members: map.into_iter().map(|(k, v)| (k, Member::Data(v))).collect(),
        }
    }

    /// Add a data member.
    #[must_use]
    pub fn data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let _ = self.members.insert(key.into(), Member::Data(value.into()));
        self
    }

    /// Add a method member.
    #[must_use]
    pub fn method(mut self, key: impl Into<String>, method: Arc<dyn Method>) -> Self {
        let _ = self.members.insert(key.into(), Member::Method(method));
        self
    }

    /// Add a synchronous method from a closure.
    #[must_use]
    pub fn sync_method<F>(self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Store, Vec<Value>) -> Result<Value, MethodError> + Send + Sync + 'static,
    {
        self.method(key, sync_method(f))
    }

    /// Add an async method from a closure.
    #[must_use]
    pub fn async_method<F, Fut>(self, key: impl Into<String>, f: F) -> Self
    where
        F: Fn(Store, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, MethodError>> + Send + 'static,
    {
        self.method(key, async_method(f))
    }

    /// Copy keeping only `keys`.
    #[must_use]
    pub fn pick<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Self {
        let keys: Vec<&str> = keys.into_iter().collect();
        Self {
            members: self
                .members
                .iter()
                .filter(|(k, _)| keys.contains(&k.as_str()))
                .map(|(k, m)| (k.clone(), m.clone()))
                .collect(),
        }
    }

    /// Copy without `keys`.
    #[must_use]
    pub fn omit<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Self {
        let keys: Vec<&str> = keys.into_iter().collect();
        Self {
            members: self
                .members
                .iter()
                .filter(|(k, _)| !keys.contains(&k.as_str()))
                .map(|(k, m)| (k.clone(), m.clone()))
                .collect(),
        }
    }

    /// Member names in order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    /// Member by name.
    pub fn get(&self, key: &str) -> Option<&Member> {
        self.members.get(key)
    }

    /// Whether a member named `key` exists.
    pub fn contains(&self, key: &str) -> bool {
        self.members.contains_key(key)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the object has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub(crate) fn insert(&mut self, key: String, member: Member) -> Option<Member> {
        self.members.insert(key, member)
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Member> {
        self.members.remove(key)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &Member)> {
        self.members.iter()
    }
}
