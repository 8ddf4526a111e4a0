use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::cache_key::derived_key;
use super::{CacheEntry, CacheError, FetchError};

/// The outcome of a successful [`Fetcher::fetch`].
#[derive(Debug, Clone)]
pub struct FetchResult<T> {
    /// The decoded value.
    pub value: T,
    /// The raw bytes the value was decoded from.
    ///
    /// When present, these are written to the disk tier as is instead of going through the
    /// [`Serializer`] again.
    pub bytes: Option<Bytes>,
}

impl<T> FetchResult<T> {
    pub fn new(value: T) -> Self {
        Self { value, bytes: None }
    }

    pub fn with_bytes(value: T, bytes: impl Into<Bytes>) -> Self {
        Self {
            value,
            bytes: Some(bytes.into()),
        }
    }
}

/// Produces a raw value from its source, for example by downloading it.
///
/// Concurrent lookups whose fetchers share an [`identifier`](Self::identifier) are coalesced
/// into a single call to [`fetch`](Self::fetch). Timeouts are the responsibility of the
/// implementation.
pub trait Fetcher<T>: Send + Sync + 'static {
    /// A stable identifier of the fetched object, usually its URL.
    fn identifier(&self) -> &str;

    fn fetch(&self) -> BoxFuture<'_, Result<FetchResult<T>, FetchError>>;
}

/// Derives a new value from a raw one, for example by resizing an image.
pub trait Processor<T>: Send + Sync + 'static {
    /// A stable identifier of this transformation and its parameters.
    ///
    /// This becomes part of the derived key, so two processors that produce different results
    /// must never share an identifier.
    fn identifier(&self) -> &str;

    fn process(&self, value: T) -> BoxFuture<'_, CacheEntry<T>>;
}

/// Converts values to and from the bytes stored in the disk tier.
///
/// A failure on either side is treated like a missing entry.
pub trait Serializer<T>: Send + Sync + 'static {
    fn serialize(&self, value: &T) -> CacheEntry<Vec<u8>>;

    fn deserialize(&self, bytes: &[u8]) -> CacheEntry<T>;
}

/// Stores byte buffers as they are.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, value: &Vec<u8>) -> CacheEntry<Vec<u8>> {
        Ok(value.clone())
    }

    fn deserialize(&self, bytes: &[u8]) -> CacheEntry<Vec<u8>> {
        Ok(bytes.to_vec())
    }
}

impl Serializer<Bytes> for BytesSerializer {
    fn serialize(&self, value: &Bytes) -> CacheEntry<Vec<u8>> {
        Ok(value.to_vec())
    }

    fn deserialize(&self, bytes: &[u8]) -> CacheEntry<Bytes> {
        Ok(Bytes::copy_from_slice(bytes))
    }
}

/// Stores values as JSON documents.
pub struct JsonSerializer<T>(PhantomData<fn() -> T>);

impl<T> JsonSerializer<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonSerializer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonSerializer<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonSerializer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonSerializer")
    }
}

impl<T> Serializer<T> for JsonSerializer<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn serialize(&self, value: &T) -> CacheEntry<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, bytes: &[u8]) -> CacheEntry<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Describes a single lookup.
///
/// The `key` identifies the raw value, shared by every variant derived from the same source. The
/// derived key additionally incorporates the identifiers of the processor chain and identifies the
/// final value. Without processors, both keys are the same.
pub struct Descriptor<T> {
    key: String,
    derived_key: String,
    fetcher: Option<Arc<dyn Fetcher<T>>>,
    processors: Vec<Arc<dyn Processor<T>>>,
}

impl<T: 'static> Descriptor<T> {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            derived_key: key.clone(),
            key,
            fetcher: None,
            processors: Vec::new(),
        }
    }

    /// Sets the fetcher used when neither the final nor the raw value is cached.
    pub fn with_fetcher(mut self, fetcher: impl Fetcher<T>) -> Self {
        self.fetcher = Some(Arc::new(fetcher));
        self
    }

    /// Appends a processor to the chain.
    pub fn with_processor(mut self, processor: impl Processor<T>) -> Self {
        self.processors.push(Arc::new(processor));
        self.derived_key = derived_key(
            &self.key,
            self.processors.iter().map(|processor| processor.identifier()),
        );
        self
    }

    /// The key of the raw value.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The key of the final value.
    pub fn derived_key(&self) -> &str {
        &self.derived_key
    }

    pub fn fetcher(&self) -> Option<&Arc<dyn Fetcher<T>>> {
        self.fetcher.as_ref()
    }

    pub fn processors(&self) -> &[Arc<dyn Processor<T>>] {
        &self.processors
    }

    pub fn has_processors(&self) -> bool {
        !self.processors.is_empty()
    }
}

impl<T: 'static> Clone for Descriptor<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            derived_key: self.derived_key.clone(),
            fetcher: self.fetcher.clone(),
            processors: self.processors.clone(),
        }
    }
}

impl<T: 'static> fmt::Debug for Descriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("key", &self.key)
            .field("derived_key", &self.derived_key)
            .field("fetcher", &self.fetcher.as_ref().map(|f| f.identifier()))
            .field(
                "processors",
                &self
                    .processors
                    .iter()
                    .map(|p| p.identifier())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Applies `processors` to `value` in order, stopping at the first failure.
pub(super) async fn process_chain<T: 'static>(
    processors: &[Arc<dyn Processor<T>>],
    mut value: T,
) -> CacheEntry<T> {
    for processor in processors {
        value = processor.process(value).await.map_err(|err| match err {
            CacheError::Processing(_) => err,
            other => CacheError::processing(format!("{}: {other}", processor.identifier())),
        })?;
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;
    use serde::Deserialize;

    use super::*;

    struct Append(&'static str);

    impl Processor<String> for Append {
        fn identifier(&self) -> &str {
            self.0
        }

        fn process(&self, value: String) -> BoxFuture<'_, CacheEntry<String>> {
            async move { Ok(format!("{value}+{}", self.0)) }.boxed()
        }
    }

    struct Fail;

    impl Processor<String> for Fail {
        fn identifier(&self) -> &str {
            "fail"
        }

        fn process(&self, _value: String) -> BoxFuture<'_, CacheEntry<String>> {
            async { Err(CacheError::NotFound) }.boxed()
        }
    }

    #[test]
    fn test_derived_key() {
        let descriptor = Descriptor::<String>::new("1");
        assert_eq!(descriptor.derived_key(), "1");
        assert!(!descriptor.has_processors());

        let descriptor = descriptor
            .with_processor(Append("oreo"))
            .with_processor(Append("sprinkles"));
        assert_eq!(descriptor.key(), "1");
        assert_eq!(descriptor.derived_key(), "1#oreo>sprinkles");
    }

    #[tokio::test]
    async fn test_process_chain() {
        let descriptor = Descriptor::new("1")
            .with_processor(Append("a"))
            .with_processor(Append("b"));
        let value = process_chain(descriptor.processors(), "x".to_owned()).await;
        assert_eq!(value, Ok("x+a+b".to_owned()));

        let descriptor = Descriptor::new("1")
            .with_processor(Append("a"))
            .with_processor(Fail);
        let value = process_chain(descriptor.processors(), "x".to_owned()).await;
        assert_eq!(
            value,
            Err(CacheError::Processing("fail: not found".to_owned()))
        );
    }

    #[test]
    fn test_json_serializer() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Scoop {
            flavor: String,
        }

        let serializer = JsonSerializer::<Scoop>::new();
        let bytes = serializer
            .serialize(&Scoop {
                flavor: "vanilla".into(),
            })
            .unwrap();
        assert_eq!(bytes, br#"{"flavor":"vanilla"}"#);

        let err = serializer.deserialize(b"{").unwrap_err();
        assert!(matches!(err, CacheError::Serialization(_)));
        assert!(err.is_miss());
    }
}
