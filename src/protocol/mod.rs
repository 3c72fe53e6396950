//! Synchronization protocol
//!
//! Line-oriented records over a TCP byte stream. See [`record`] for the record set
//! and [`codec`] for the alias-compressing encoder and decoder shared by both ends.

pub mod codec;
pub mod error;
pub mod login;
pub mod record;

pub use codec::{Decoder, Encoder, RecordReader, RecordWriter};
pub use error::ProtocolError;
pub use login::{make_salt, password_hash, LoginCheck, StaticUsers};
pub use record::{LoginRequest, LoginStatus, Record, Reply};

/// Default TCP port of a sharetree server
pub const DEFAULT_PORT: u16 = 2022;

/// Protocol revision reported by `VER`
pub const PROTOCOL_VERSION: &str = "1.0";

// vim: ts=4
