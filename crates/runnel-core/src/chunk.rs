use std::collections::HashMap;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ChainError, Result, RunnelError};

/// A lazy, single-pass stream of chunks. Errors travel in-band so that a
/// failure in one step reaches the consumer of the last one.
pub type ChunkStream<'a, T> = BoxStream<'a, Result<T>>;

/// A value that can flow through a Runnable.
///
/// Streams produce partial values; `concat` folds a later chunk into an
/// earlier one so that concatenating every chunk of a stream reproduces the
/// complete value. Types that cannot be combined keep the default, which
/// fails when a second chunk arrives.
pub trait Chunk: Serialize + Clone + Send + Sync + 'static {
    fn concat(self, next: Self) -> Result<Self> {
        let _ = next;
        Err(ChainError::Concat(std::any::type_name::<Self>().to_string()).into())
    }

    /// JSON view of the value recorded on runs.
    fn to_trace(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl Chunk for String {
    fn concat(mut self, next: Self) -> Result<Self> {
        self.push_str(&next);
        Ok(self)
    }
}

impl Chunk for bool {
    fn concat(self, next: Self) -> Result<Self> {
        Ok(next)
    }
}

impl Chunk for () {
    fn concat(self, _next: Self) -> Result<Self> {
        Ok(())
    }
}

macro_rules! numeric_chunk {
    ($($t:ty),*) => {
        $(
            impl Chunk for $t {
                fn concat(self, next: Self) -> Result<Self> {
                    Ok(self + next)
                }
            }
        )*
    };
}

numeric_chunk!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize, f32, f64);

impl<T: Chunk> Chunk for Vec<T> {
    fn concat(mut self, next: Self) -> Result<Self> {
        self.extend(next);
        Ok(self)
    }
}

impl<T: Chunk> Chunk for Option<T> {
    fn concat(self, next: Self) -> Result<Self> {
        match (self, next) {
            (Some(a), Some(b)) => a.concat(b).map(Some),
            (a, None) => Ok(a),
            (None, b) => Ok(b),
        }
    }
}

impl<V: Chunk> Chunk for HashMap<String, V> {
    fn concat(mut self, next: Self) -> Result<Self> {
        for (key, value) in next {
            let merged = match self.remove(&key) {
                Some(existing) => existing.concat(value)?,
                None => value,
            };
            self.insert(key, merged);
        }
        Ok(self)
    }
}

impl Chunk for Value {
    fn concat(self, next: Self) -> Result<Self> {
        concat_values(self, next)
    }

    fn to_trace(&self) -> Value {
        self.clone()
    }
}

/// Combine two JSON chunks: strings append, numbers add, arrays extend and
/// objects merge key by key. A `null` on either side yields the other.
pub fn concat_values(first: Value, next: Value) -> Result<Value> {
    match (first, next) {
        (Value::Null, b) => Ok(b),
        (a, Value::Null) => Ok(a),
        (Value::String(mut a), Value::String(b)) => {
            a.push_str(&b);
            Ok(Value::String(a))
        }
        (Value::Number(a), Value::Number(b)) => {
            if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
                Ok(Value::from(x + y))
            } else {
                let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
                Ok(serde_json::Number::from_f64(sum)
                    .map(Value::Number)
                    .unwrap_or(Value::Null))
            }
        }
        (Value::Array(mut a), Value::Array(b)) => {
            a.extend(b);
            Ok(Value::Array(a))
        }
        (Value::Object(mut a), Value::Object(b)) => {
            for (key, value) in b {
                // Array-valued fields are replaced rather than extended.
                let merged = match a.remove(&key) {
                    Some(existing) if !existing.is_array() => concat_values(existing, value)?,
                    _ => value,
                };
                a.insert(key, merged);
            }
            Ok(Value::Object(a))
        }
        (Value::Bool(_), b @ Value::Bool(_)) => Ok(b),
        (a, b) => Err(RunnelError::Chain(ChainError::Concat(format!(
            "{} with {}",
            json_kind(&a),
            json_kind(&b)
        )))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Drain a chunk stream, folding every chunk into one value.
///
/// Returns `Ok(None)` for an empty stream and the first error otherwise.
pub async fn collect_chunks<T: Chunk>(mut stream: ChunkStream<'_, T>) -> Result<Option<T>> {
    let mut acc: Option<T> = None;
    while let Some(item) = stream.next().await {
        let chunk = item?;
        acc = Some(match acc {
            Some(prev) => prev.concat(chunk)?,
            None => chunk,
        });
    }
    Ok(acc)
}

/// A one-item stream carrying `value`.
pub fn once<'a, T: Chunk>(value: T) -> ChunkStream<'a, T> {
    Box::pin(futures::stream::once(async move { Ok(value) }))
}
