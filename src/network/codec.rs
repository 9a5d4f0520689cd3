use std::marker::PhantomData;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::AppResult;

/// Turns application messages into frame payloads and back.
///
/// The framing layer adds and strips the header; a codec only ever sees the
/// payload bytes. `handler_id` is passed through so a codec may pick a
/// representation per handler.
pub trait MessageCodec: Send + Sync + 'static {
    type Message: Send + 'static;

    fn encode(&self, handler_id: u32, message: &Self::Message) -> AppResult<Bytes>;

    fn decode(&self, handler_id: u32, payload: Bytes) -> AppResult<Self::Message>;
}

/// Passes payload bytes through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawCodec;

impl MessageCodec for RawCodec {
    type Message = Bytes;

    fn encode(&self, _handler_id: u32, message: &Bytes) -> AppResult<Bytes> {
        Ok(message.clone())
    }

    fn decode(&self, _handler_id: u32, payload: Bytes) -> AppResult<Bytes> {
        Ok(payload)
    }
}

/// JSON payloads through `serde_json`.
#[derive(Debug)]
pub struct JsonCodec<T> {
    _message: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        JsonCodec {
            _message: PhantomData,
        }
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T> MessageCodec for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    type Message = T;

    fn encode(&self, _handler_id: u32, message: &T) -> AppResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(message)?))
    }

    fn decode(&self, _handler_id: u32, payload: Bytes) -> AppResult<T> {
        Ok(serde_json::from_slice(&payload)?)
    }
}
