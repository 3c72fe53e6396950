//! Record encoding and decoding
//!
//! The codec is symmetric: client and server run the same [`Encoder`] for their
//! outbound direction and the same [`Decoder`] for their inbound one. Each side
//! assigns aliases for the paths it sends, so the two alias tables of a connection
//! are independent.

use serde_json::{json, Map, Value as Json};
use std::collections::HashMap;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use super::error::ProtocolError;
use super::record::{kind_from_tag, kind_tag, LoginRequest, LoginStatus, Record, Reply};
use crate::error::ErrorCode;
use crate::types::{Allow, DataType, ModeFlags, SyncMode, Value};
use crate::validation::validate_tree_path;

/// Outbound half: assigns path aliases
#[derive(Debug, Default)]
pub struct Encoder {
	aliases: HashMap<String, u64>,
	next_alias: u64,
}

impl Encoder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Encode one record as a single line without the terminating newline
	pub fn encode(&mut self, record: &Record) -> String {
		let mut obj = Map::new();
		obj.insert("cmd".into(), json!(record.cmd()));
		match record {
			Record::Value { path, value, seq, overwrite_key } => {
				self.put_alias(&mut obj, path);
				put_value(&mut obj, value);
				obj.insert("seq".into(), json!(seq));
				if let Some(key) = overwrite_key {
					obj.insert("ovr".into(), json!(key));
				}
			}
			Record::CreateNode { path, kind } => {
				self.put_alias(&mut obj, path);
				obj.insert("knd".into(), json!(kind_tag(*kind)));
			}
			Record::ModeChange { path, mode } => {
				self.put_alias(&mut obj, path);
				obj.insert("mod".into(), json!(mode.to_mode_string()));
			}
			Record::Retire { path } | Record::Unsubscribe { path } => {
				self.put_alias(&mut obj, path);
			}
			Record::Subscribe { path, sync_mode, initial } => {
				self.put_alias(&mut obj, path);
				obj.insert("smd".into(), json!(sync_mode.to_mode_string()));
				if let Some(value) = initial {
					put_value(&mut obj, value);
				}
			}
			Record::RefChange { path, refs } => {
				self.put_alias(&mut obj, path);
				obj.insert("ref".into(), json!(refs));
			}
			Record::Heartbeat | Record::Exit => {}
			Record::Login(LoginRequest::Hello) => {
				obj.insert("stg".into(), json!(0));
			}
			Record::Login(LoginRequest::Credentials { user, salt, hash }) => {
				obj.insert("stg".into(), json!(1));
				obj.insert("usr".into(), json!(user));
				obj.insert("slt".into(), json!(salt));
				obj.insert("hsh".into(), json!(hash));
			}
			Record::LoginReply { status, salt, allow } => {
				obj.insert("stat".into(), json!(status.as_str()));
				if let Some(salt) = salt {
					obj.insert("slt".into(), json!(salt));
				}
				obj.insert("alw".into(), json!(allow.bits()));
			}
			Record::Get { rid, path } | Record::Ls { rid, path } => {
				obj.insert("rid".into(), json!(rid));
				obj.insert("pth".into(), json!(path));
			}
			Record::Set { rid, path, value } => {
				obj.insert("rid".into(), json!(rid));
				obj.insert("pth".into(), json!(path));
				put_value(&mut obj, value);
			}
			Record::Version { rid } => {
				obj.insert("rid".into(), json!(rid));
			}
			Record::Reply { rid, reply } => {
				obj.insert("rid".into(), json!(rid));
				obj.insert("stat".into(), json!(reply.code.as_u8()));
				if let Some(value) = &reply.value {
					put_value(&mut obj, value);
				}
				if !reply.items.is_empty() {
					obj.insert("ls".into(), json!(reply.items));
				}
				if let Some(version) = &reply.version {
					obj.insert("ver".into(), json!(version));
				}
				if let Some(message) = &reply.message {
					obj.insert("msg".into(), json!(message));
				}
			}
			Record::Error { code, path, message } => {
				obj.insert("stat".into(), json!(code.as_u8()));
				if let Some(path) = path {
					obj.insert("pth".into(), json!(path));
				}
				obj.insert("msg".into(), json!(message));
			}
		}
		Json::Object(obj).to_string()
	}

	fn put_alias(&mut self, obj: &mut Map<String, Json>, path: &str) {
		if let Some(alias) = self.aliases.get(path) {
			obj.insert("a".into(), json!(alias));
			return;
		}
		self.next_alias += 1;
		let alias = self.next_alias;
		self.aliases.insert(path.to_string(), alias);
		obj.insert("a".into(), json!(alias));
		obj.insert("pth".into(), json!(path));
	}
}

fn put_value(obj: &mut Map<String, Json>, value: &Value) {
	obj.insert("typ".into(), json!(value.data_type().tag()));
	obj.insert("val".into(), value.to_json());
}

/// Inbound half: learns the peer's path aliases
#[derive(Debug, Default)]
pub struct Decoder {
	aliases: HashMap<u64, String>,
}

impl Decoder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Decode one line
	pub fn decode(&mut self, line: &str) -> Result<Record, ProtocolError> {
		let json = json5::from_str::<Json>(line)?;
		let obj = json
			.as_object()
			.ok_or_else(|| ProtocolError::Json5("record is not an object".to_string()))?;
		let cmd = obj
			.get("cmd")
			.and_then(|v| v.as_str())
			.ok_or(ProtocolError::BadField { cmd: String::new(), field: "cmd" })?;
		let f = Fields { cmd, obj };

		let record = match cmd {
			"VAL" => Record::Value {
				path: self.take_alias(&f)?,
				value: f.value()?.ok_or_else(|| f.bad("typ"))?,
				seq: f.u64_or("seq", 0),
				overwrite_key: f.opt_str("ovr"),
			},
			"NEW" => Record::CreateNode {
				path: self.take_alias(&f)?,
				kind: kind_from_tag(f.str("knd")?).ok_or_else(|| f.bad("knd"))?,
			},
			"MOD" => Record::ModeChange {
				path: self.take_alias(&f)?,
				mode: ModeFlags::from_mode_string(f.str("mod")?),
			},
			"RET" => Record::Retire { path: self.take_alias(&f)? },
			"SUB" => Record::Subscribe {
				path: self.take_alias(&f)?,
				sync_mode: SyncMode::from_mode_string(f.opt_str("smd").as_deref().unwrap_or("")),
				initial: f.value()?,
			},
			"UNS" => Record::Unsubscribe { path: self.take_alias(&f)? },
			"REF" => Record::RefChange { path: self.take_alias(&f)?, refs: f.u64("ref")? },
			"HB" => Record::Heartbeat,
			"LOGIN" => match f.u64_or("stg", 0) {
				0 => Record::Login(LoginRequest::Hello),
				_ => Record::Login(LoginRequest::Credentials {
					user: f.str("usr")?.to_string(),
					salt: f.str("slt")?.to_string(),
					hash: f.str("hsh")?.to_string(),
				}),
			},
			"LREP" => Record::LoginReply {
				status: LoginStatus::parse(f.str("stat")?).ok_or_else(|| f.bad("stat"))?,
				salt: f.opt_str("slt"),
				allow: Allow::from_bits_truncate(f.u64_or("alw", 0) as u8),
			},
			"GET" => Record::Get { rid: f.u64("rid")?, path: f.path("pth")? },
			"SET" => Record::Set {
				rid: f.u64("rid")?,
				path: f.path("pth")?,
				value: f.value()?.ok_or_else(|| f.bad("typ"))?,
			},
			"LS" => Record::Ls { rid: f.u64("rid")?, path: f.path("pth")? },
			"VER" => Record::Version { rid: f.u64("rid")? },
			"EXIT" => Record::Exit,
			"RPL" => Record::Reply {
				rid: f.u64("rid")?,
				reply: Reply {
					code: ErrorCode::from_u8(f.u64_or("stat", 0) as u8),
					value: f.value()?,
					items: obj
						.get("ls")
						.and_then(|v| v.as_array())
						.map(|a| a.iter().filter_map(|i| i.as_str().map(str::to_string)).collect())
						.unwrap_or_default(),
					version: f.opt_str("ver"),
					message: f.opt_str("msg"),
				},
			},
			"ERR" => Record::Error {
				code: ErrorCode::from_u8(f.u64_or("stat", ErrorCode::Undef.as_u8() as u64) as u8),
				path: f.opt_str("pth"),
				message: f.opt_str("msg").unwrap_or_default(),
			},
			other => return Err(ProtocolError::UnknownRecord(other.to_string())),
		};
		Ok(record)
	}

	fn take_alias(&mut self, f: &Fields<'_>) -> Result<String, ProtocolError> {
		let alias = f.u64("a")?;
		match f.opt_str("pth") {
			Some(path) => {
				validate_tree_path(&path).map_err(|_| f.bad("pth"))?;
				self.aliases.insert(alias, path.clone());
				Ok(path)
			}
			None => self.aliases.get(&alias).cloned().ok_or(ProtocolError::UnknownAlias(alias)),
		}
	}
}

/// Typed field access on a decoded record object
struct Fields<'a> {
	cmd: &'a str,
	obj: &'a Map<String, Json>,
}

impl<'a> Fields<'a> {
	fn bad(&self, field: &'static str) -> ProtocolError {
		ProtocolError::BadField { cmd: self.cmd.to_string(), field }
	}

	fn str(&self, field: &'static str) -> Result<&'a str, ProtocolError> {
		self.obj.get(field).and_then(|v| v.as_str()).ok_or_else(|| self.bad(field))
	}

	fn opt_str(&self, field: &str) -> Option<String> {
		self.obj.get(field).and_then(|v| v.as_str()).map(str::to_string)
	}

	fn u64(&self, field: &'static str) -> Result<u64, ProtocolError> {
		self.obj.get(field).and_then(|v| v.as_u64()).ok_or_else(|| self.bad(field))
	}

	fn u64_or(&self, field: &str, default: u64) -> u64 {
		self.obj.get(field).and_then(|v| v.as_u64()).unwrap_or(default)
	}

	fn path(&self, field: &'static str) -> Result<String, ProtocolError> {
		let path = self.str(field)?;
		validate_tree_path(path).map_err(|_| self.bad(field))?;
		Ok(path.to_string())
	}

	/// Typed value, `None` when the record carries no type tag
	fn value(&self) -> Result<Option<Value>, ProtocolError> {
		let Some(tag) = self.obj.get("typ").and_then(|v| v.as_str()) else {
			return Ok(None);
		};
		let data_type = DataType::from_tag(tag).ok_or_else(|| self.bad("typ"))?;
		let payload = self.obj.get("val").unwrap_or(&Json::Null);
		Value::from_json(data_type, payload).map(Some).ok_or_else(|| self.bad("val"))
	}
}

// ===========================================================================
// Line transport
// ===========================================================================

/// Reads records from a byte stream, one per line
pub struct RecordReader<R> {
	lines: Lines<BufReader<R>>,
	decoder: Decoder,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
	pub fn new(inner: R) -> Self {
		RecordReader { lines: BufReader::new(inner).lines(), decoder: Decoder::new() }
	}

	/// Next record, `None` at end of stream
	///
	/// Cancel safe: a partially received line stays buffered for the next call.
	pub async fn next(&mut self) -> Result<Option<Record>, ProtocolError> {
		loop {
			let Some(line) = self.lines.next_line().await? else {
				return Ok(None);
			};
			let trimmed = line.trim();
			if trimmed.is_empty() {
				continue;
			}
			return self.decoder.decode(trimmed).map(Some);
		}
	}
}

/// Writes records to a byte stream, one per line
pub struct RecordWriter<W> {
	inner: W,
	encoder: Encoder,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
	pub fn new(inner: W) -> Self {
		RecordWriter { inner, encoder: Encoder::new() }
	}

	pub async fn send(&mut self, record: &Record) -> Result<(), ProtocolError> {
		let mut line = self.encoder.encode(record);
		line.push('\n');
		self.inner.write_all(line.as_bytes()).await?;
		Ok(())
	}

	pub async fn flush(&mut self) -> Result<(), ProtocolError> {
		self.inner.flush().await?;
		Ok(())
	}

	pub async fn shutdown(&mut self) -> Result<(), ProtocolError> {
		self.inner.shutdown().await?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::NodeKind;

	fn pass(encoder: &mut Encoder, decoder: &mut Decoder, record: &Record) -> Record {
		decoder.decode(&encoder.encode(record)).unwrap()
	}

	#[test]
	fn test_alias_sent_once() {
		let mut enc = Encoder::new();
		let rec = Record::Value {
			path: "/A/B/value".into(),
			value: Value::Int(5),
			seq: 1,
			overwrite_key: None,
		};
		let first = enc.encode(&rec);
		let second = enc.encode(&rec);
		assert!(first.contains("\"pth\":\"/A/B/value\""));
		assert!(!second.contains("pth"));
		assert!(second.contains("\"a\":1"));

		let mut dec = Decoder::new();
		assert_eq!(dec.decode(&first).unwrap(), rec);
		assert_eq!(dec.decode(&second).unwrap(), rec);
	}

	#[test]
	fn test_unknown_alias_is_error() {
		let mut dec = Decoder::new();
		let err = dec.decode(r#"{"cmd":"VAL","a":9,"typ":"i","val":1}"#).unwrap_err();
		assert!(matches!(err, ProtocolError::UnknownAlias(9)));
		assert_eq!(err.code(), ErrorCode::RecUnknown);
	}

	#[test]
	fn test_unparseable_and_unknown() {
		let mut dec = Decoder::new();
		assert!(matches!(dec.decode("{not json"), Err(ProtocolError::Json5(_))));
		assert!(matches!(dec.decode(r#"{"cmd":"FLY"}"#), Err(ProtocolError::UnknownRecord(_))));
		assert!(matches!(dec.decode(r#"{"x":1}"#), Err(ProtocolError::BadField { field: "cmd", .. })));
		let bad_path = r#"{"cmd":"RET","a":1,"pth":"relative"}"#;
		assert!(matches!(dec.decode(bad_path), Err(ProtocolError::BadField { field: "pth", .. })));
	}

	#[test]
	fn test_json5_input_accepted() {
		let mut dec = Decoder::new();
		let rec = dec.decode("{cmd: 'SUB', a: 3, pth: '/x', smd: 'N'}").unwrap();
		assert_eq!(
			rec,
			Record::Subscribe { path: "/x".into(), sync_mode: SyncMode::MONITOR, initial: None }
		);
	}

	#[test]
	fn test_structural_records() {
		let mut enc = Encoder::new();
		let mut dec = Decoder::new();
		let records = vec![
			Record::CreateNode { path: "/m/".into(), kind: NodeKind::Folder },
			Record::ModeChange { path: "/m/p".into(), mode: ModeFlags::PIPE | ModeFlags::BI_DIR },
			Record::Subscribe {
				path: "/m/p".into(),
				sync_mode: SyncMode::MASTER | SyncMode::AUTO_DESTROY,
				initial: Some(Value::Bytes(vec![0, 1, 2])),
			},
			Record::RefChange { path: "/m/p".into(), refs: 2 },
			Record::Unsubscribe { path: "/m/p".into() },
			Record::Retire { path: "/m/".into() },
		];
		for rec in &records {
			assert_eq!(&pass(&mut enc, &mut dec, rec), rec);
		}
	}

	#[test]
	fn test_login_and_reply_records() {
		let mut enc = Encoder::new();
		let mut dec = Decoder::new();
		let creds = Record::Login(LoginRequest::Credentials {
			user: "op".into(),
			salt: "ab".into(),
			hash: "cd".into(),
		});
		assert_eq!(pass(&mut enc, &mut dec, &creds), creds);
		let reply = Record::LoginReply { status: LoginStatus::Ok, salt: None, allow: Allow::READ };
		assert_eq!(pass(&mut enc, &mut dec, &reply), reply);

		let ls = Record::Reply {
			rid: 4,
			reply: Reply { items: vec!["a".into(), "b/".into()], ..Reply::ok() },
		};
		assert_eq!(pass(&mut enc, &mut dec, &ls), ls);
		let err = Record::Reply { rid: 5, reply: Reply::error(ErrorCode::NotFound, "/nope") };
		assert_eq!(pass(&mut enc, &mut dec, &err), err);
	}

	#[tokio::test]
	async fn test_line_transport() {
		let (client, server) = tokio::io::duplex(1024);
		let mut writer = RecordWriter::new(client);
		let mut reader = RecordReader::new(server);
		writer.send(&Record::Heartbeat).await.unwrap();
		writer.send(&Record::Get { rid: 1, path: "/a".into() }).await.unwrap();
		writer.shutdown().await.unwrap();
		assert_eq!(reader.next().await.unwrap(), Some(Record::Heartbeat));
		assert_eq!(reader.next().await.unwrap(), Some(Record::Get { rid: 1, path: "/a".into() }));
		assert_eq!(reader.next().await.unwrap(), None);
	}
}

// vim: ts=4
