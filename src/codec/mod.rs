//! Wire Codec
//!
//! Deterministic binary encoding for everything that crosses the network:
//! fixed-width big-endian integers, length-prefixed byte arrays, and the
//! composite protocol messages built from them. Serialize/deserialize are
//! exact inverses for every message type; malformed input fails with a
//! [`CodecError`] instead of truncating.

pub mod message;
pub mod wire;

pub use message::{
    msg_type, ClientSetup, ClientStart, CommandRecord, Message, PlayerNum, PlayerReady, TurnRecord,
};
pub use wire::{CodecError, WireReader, WireWriter};
