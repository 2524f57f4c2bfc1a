use crate::{StreamError, Value};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Lazy, finite sequence of output chunks.
///
/// The variant says whether the sequence can be read more than once.
#[derive(Clone)]
pub enum ValueStream {
    /// Backed by shared chunks; every `take` starts from the beginning.
    Replayable(Arc<[Value]>),
    /// A live stream that can be taken exactly once.
    OneShot(Arc<Mutex<Option<BoxStream<'static, Value>>>>),
}

impl ValueStream {
    pub fn replayable(chunks: Vec<Value>) -> Self {
        ValueStream::Replayable(chunks.into())
    }

    pub fn one_shot(stream: impl Stream<Item = Value> + Send + 'static) -> Self {
        ValueStream::OneShot(Arc::new(Mutex::new(Some(stream.boxed()))))
    }

    pub fn is_restartable(&self) -> bool {
        matches!(self, ValueStream::Replayable(_))
    }

    /// Whether a one-shot stream has already been handed out.
    pub fn is_consumed(&self) -> bool {
        match self {
            ValueStream::Replayable(_) => false,
            ValueStream::OneShot(slot) => slot.lock().unwrap_or_else(|e| e.into_inner()).is_none(),
        }
    }

    pub fn take(&self) -> Result<BoxStream<'static, Value>, StreamError> {
        match self {
            ValueStream::Replayable(chunks) => Ok(stream::iter(chunks.to_vec()).boxed()),
            ValueStream::OneShot(slot) => slot
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .ok_or(StreamError::AlreadyConsumed),
        }
    }

    /// Drain the stream into memory.
    pub async fn collect(&self) -> Result<Vec<Value>, StreamError> {
        if let ValueStream::Replayable(chunks) = self {
            return Ok(chunks.to_vec());
        }
        let stream = self.take()?;
        Ok(stream.collect().await)
    }
}

impl fmt::Debug for ValueStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueStream::Replayable(chunks) => f.debug_tuple("Replayable").field(&chunks.len()).finish(),
            ValueStream::OneShot(_) => f
                .debug_struct("OneShot")
                .field("consumed", &self.is_consumed())
                .finish(),
        }
    }
}

impl PartialEq for ValueStream {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ValueStream::Replayable(a), ValueStream::Replayable(b)) => a == b,
            (ValueStream::OneShot(a), ValueStream::OneShot(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// What a node produced: a single value or a stream of chunks.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutput {
    Value(Value),
    Stream(ValueStream),
}

impl NodeOutput {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            NodeOutput::Value(v) => Some(v),
            NodeOutput::Stream(_) => None,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, NodeOutput::Stream(_))
    }

    /// Buffer a stream into a replayable one and return the full value.
    ///
    /// One-shot streams are consumed by this call; the replacement output is
    /// returned alongside so callers can store it back.
    pub async fn materialize(&self) -> Result<(Value, NodeOutput), StreamError> {
        match self {
            NodeOutput::Value(v) => Ok((v.clone(), self.clone())),
            NodeOutput::Stream(stream) => {
                let chunks = stream.collect().await?;
                let replay = NodeOutput::Stream(ValueStream::replayable(chunks.clone()));
                Ok((Value::Array(chunks), replay))
            }
        }
    }
}

impl From<Value> for NodeOutput {
    fn from(value: Value) -> Self {
        NodeOutput::Value(value)
    }
}

impl From<ValueStream> for NodeOutput {
    fn from(stream: ValueStream) -> Self {
        NodeOutput::Stream(stream)
    }
}

#[derive(Serialize)]
#[serde(tag = "type", content = "value")]
enum OutputRepr<'a> {
    Value(&'a Value),
    Stream(&'a [Value]),
    PendingStream,
}

impl Serialize for NodeOutput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = match self {
            NodeOutput::Value(v) => OutputRepr::Value(v),
            NodeOutput::Stream(ValueStream::Replayable(chunks)) => OutputRepr::Stream(chunks),
            NodeOutput::Stream(ValueStream::OneShot(_)) => OutputRepr::PendingStream,
        };
        repr.serialize(serializer)
    }
}
