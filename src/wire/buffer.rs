//! Elementary streaming ser/des, re-expressing the reference `MessageBuffer`
//! as a pair of growable-writer / cursor-reader types plus an `Encode`/
//! `Decode` trait pair. Integers are little-endian, native width; floats are
//! bit-exact; strings and byte vectors use a `u32` length prefix; generic
//! vectors and maps use a `u32` count prefix.

use std::collections::HashMap;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::CodecError;

use super::protocol_version::ProtocolVersion;

/// An append-only little-endian byte writer.
#[derive(Debug, Default)]
pub struct WireWriter {
  storage: Vec<u8>,
  protocol_version: ProtocolVersion,
}

impl WireWriter {
  pub fn new(protocol_version: ProtocolVersion) -> Self {
    WireWriter { storage: Vec::new(), protocol_version }
  }

  pub fn protocol_version(&self) -> ProtocolVersion {
    self.protocol_version
  }

  pub fn into_bytes(self) -> Vec<u8> {
    self.storage
  }

  pub fn len(&self) -> usize {
    self.storage.len()
  }

  pub fn is_empty(&self) -> bool {
    self.storage.is_empty()
  }

  pub fn write_u8(&mut self, v: u8) {
    self.storage.push(v);
  }

  pub fn write_bool(&mut self, v: bool) {
    self.write_u8(v as u8);
  }

  pub fn write_u16(&mut self, v: u16) {
    let mut b = [0u8; 2];
    LittleEndian::write_u16(&mut b, v);
    self.storage.extend_from_slice(&b);
  }

  pub fn write_i32(&mut self, v: i32) {
    let mut b = [0u8; 4];
    LittleEndian::write_i32(&mut b, v);
    self.storage.extend_from_slice(&b);
  }

  pub fn write_u32(&mut self, v: u32) {
    let mut b = [0u8; 4];
    LittleEndian::write_u32(&mut b, v);
    self.storage.extend_from_slice(&b);
  }

  pub fn write_u64(&mut self, v: u64) {
    let mut b = [0u8; 8];
    LittleEndian::write_u64(&mut b, v);
    self.storage.extend_from_slice(&b);
  }

  pub fn write_i64(&mut self, v: i64) {
    let mut b = [0u8; 8];
    LittleEndian::write_i64(&mut b, v);
    self.storage.extend_from_slice(&b);
  }

  pub fn write_u128(&mut self, v: u128) {
    let mut b = [0u8; 16];
    LittleEndian::write_u128(&mut b, v);
    self.storage.extend_from_slice(&b);
  }

  pub fn write_f64(&mut self, v: f64) {
    let mut b = [0u8; 8];
    LittleEndian::write_f64(&mut b, v);
    self.storage.extend_from_slice(&b);
  }

  pub fn write_bytes(&mut self, data: &[u8]) {
    self.write_u32(data.len() as u32);
    self.storage.extend_from_slice(data);
  }

  pub fn write_str(&mut self, s: &str) {
    self.write_bytes(s.as_bytes());
  }

  pub fn write_duration(&mut self, d: Duration) {
    self.write_i64(d.as_nanos() as i64);
  }

  /// Nanoseconds since the Unix epoch, microsecond precision as specified.
  pub fn write_timestamp_nanos(&mut self, nanos_since_epoch: i64) {
    let truncated = (nanos_since_epoch / 1000) * 1000;
    self.write_i64(truncated);
  }

  pub fn write_vec<T>(&mut self, items: &[T], mut write_one: impl FnMut(&mut Self, &T)) {
    self.write_u32(items.len() as u32);
    for item in items {
      write_one(self, item);
    }
  }

  pub fn write_string_map(&mut self, map: &HashMap<String, String>) {
    self.write_u32(map.len() as u32);
    // Sort for determinism: two semantically-equal maps must serialize identically.
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    for (k, v) in entries {
      self.write_str(k);
      self.write_str(v);
    }
  }
}

/// A cursor-style reader over an owned byte buffer.
pub struct WireReader<'a> {
  data: &'a [u8],
  r_pos: usize,
  protocol_version: ProtocolVersion,
}

impl<'a> WireReader<'a> {
  pub fn new(data: &'a [u8], protocol_version: ProtocolVersion) -> Self {
    WireReader { data, r_pos: 0, protocol_version }
  }

  pub fn protocol_version(&self) -> ProtocolVersion {
    self.protocol_version
  }

  pub fn read_pos(&self) -> usize {
    self.r_pos
  }

  pub fn set_read_pos(&mut self, pos: usize) {
    self.r_pos = pos;
  }

  pub fn remaining(&self) -> usize {
    self.data.len() - self.r_pos
  }

  /// Snapshot the read position; restoring it when the guard drops, so a
  /// caller can inspect a header non-destructively.
  pub fn peeker(&mut self) -> ReadCursorGuard<'_, 'a> {
    let saved = self.r_pos;
    ReadCursorGuard { reader: self, saved }
  }

  fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
    if self.r_pos + n > self.data.len() {
      return Err(CodecError::EndOfBuffer);
    }
    let slice = &self.data[self.r_pos..self.r_pos + n];
    self.r_pos += n;
    Ok(slice)
  }

  pub fn read_u8(&mut self) -> Result<u8, CodecError> {
    Ok(self.take(1)?[0])
  }

  pub fn read_bool(&mut self) -> Result<bool, CodecError> {
    Ok(self.read_u8()? != 0)
  }

  pub fn read_u16(&mut self) -> Result<u16, CodecError> {
    Ok(LittleEndian::read_u16(self.take(2)?))
  }

  pub fn read_i32(&mut self) -> Result<i32, CodecError> {
    Ok(LittleEndian::read_i32(self.take(4)?))
  }

  pub fn read_u32(&mut self) -> Result<u32, CodecError> {
    Ok(LittleEndian::read_u32(self.take(4)?))
  }

  pub fn read_u64(&mut self) -> Result<u64, CodecError> {
    Ok(LittleEndian::read_u64(self.take(8)?))
  }

  pub fn read_i64(&mut self) -> Result<i64, CodecError> {
    Ok(LittleEndian::read_i64(self.take(8)?))
  }

  pub fn read_u128(&mut self) -> Result<u128, CodecError> {
    Ok(LittleEndian::read_u128(self.take(16)?))
  }

  pub fn read_f64(&mut self) -> Result<f64, CodecError> {
    Ok(LittleEndian::read_f64(self.take(8)?))
  }

  pub fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
    let len = self.read_u32()? as usize;
    Ok(self.take(len)?.to_vec())
  }

  pub fn read_str(&mut self) -> Result<String, CodecError> {
    let bytes = self.read_bytes()?;
    String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
  }

  pub fn read_duration(&mut self) -> Result<Duration, CodecError> {
    let nanos = self.read_i64()?;
    Ok(Duration::from_nanos(nanos.max(0) as u64))
  }

  pub fn read_timestamp_nanos(&mut self) -> Result<i64, CodecError> {
    self.read_i64()
  }

  pub fn read_vec<T>(&mut self, mut read_one: impl FnMut(&mut Self) -> Result<T, CodecError>) -> Result<Vec<T>, CodecError> {
    let count = self.read_u32()? as usize;
    let mut out = Vec::with_capacity(count.min(1 << 20));
    for _ in 0..count {
      out.push(read_one(self)?);
    }
    Ok(out)
  }

  pub fn read_string_map(&mut self) -> Result<HashMap<String, String>, CodecError> {
    let count = self.read_u32()? as usize;
    let mut out = HashMap::with_capacity(count);
    for _ in 0..count {
      let k = self.read_str()?;
      let v = self.read_str()?;
      out.insert(k, v);
    }
    Ok(out)
  }
}

pub struct ReadCursorGuard<'r, 'a> {
  reader: &'r mut WireReader<'a>,
  saved: usize,
}

impl<'r, 'a> std::ops::Deref for ReadCursorGuard<'r, 'a> {
  type Target = WireReader<'a>;
  fn deref(&self) -> &Self::Target {
    self.reader
  }
}

impl<'r, 'a> std::ops::DerefMut for ReadCursorGuard<'r, 'a> {
  fn deref_mut(&mut self) -> &mut Self::Target {
    self.reader
  }
}

impl<'r, 'a> Drop for ReadCursorGuard<'r, 'a> {
  fn drop(&mut self) {
    self.reader.r_pos = self.saved;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn integers_and_floats_round_trip() {
    let mut w = WireWriter::new(ProtocolVersion::CURRENT);
    w.write_u32(0xDEAD_BEEF);
    w.write_i64(-1234567890123);
    w.write_f64(std::f64::consts::PI);
    w.write_bool(true);
    let bytes = w.into_bytes();

    let mut r = WireReader::new(&bytes, ProtocolVersion::CURRENT);
    assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
    assert_eq!(r.read_i64().unwrap(), -1234567890123);
    assert_eq!(r.read_f64().unwrap(), std::f64::consts::PI);
    assert!(r.read_bool().unwrap());
  }

  #[test]
  fn string_and_bytes_round_trip() {
    let mut w = WireWriter::new(ProtocolVersion::CURRENT);
    w.write_str("hello");
    w.write_bytes(&[1, 2, 3]);
    let bytes = w.into_bytes();

    let mut r = WireReader::new(&bytes, ProtocolVersion::CURRENT);
    assert_eq!(r.read_str().unwrap(), "hello");
    assert_eq!(r.read_bytes().unwrap(), vec![1, 2, 3]);
  }

  #[test]
  fn under_read_is_end_of_buffer() {
    let mut r = WireReader::new(&[0x01], ProtocolVersion::CURRENT);
    assert!(matches!(r.read_u32(), Err(CodecError::EndOfBuffer)));
  }

  #[test]
  fn peeker_restores_position_on_drop() {
    let mut w = WireWriter::new(ProtocolVersion::CURRENT);
    w.write_u32(7);
    w.write_u32(9);
    let bytes = w.into_bytes();
    let mut r = WireReader::new(&bytes, ProtocolVersion::CURRENT);
    {
      let mut peek = r.peeker();
      assert_eq!(peek.read_u32().unwrap(), 7);
    }
    assert_eq!(r.read_pos(), 0);
    assert_eq!(r.read_u32().unwrap(), 7);
    assert_eq!(r.read_u32().unwrap(), 9);
  }

  #[test]
  fn string_map_round_trips_regardless_of_insertion_order() {
    let mut map = HashMap::new();
    map.insert("b".to_string(), "2".to_string());
    map.insert("a".to_string(), "1".to_string());
    let mut w = WireWriter::new(ProtocolVersion::CURRENT);
    w.write_string_map(&map);
    let bytes = w.into_bytes();
    let mut r = WireReader::new(&bytes, ProtocolVersion::CURRENT);
    assert_eq!(r.read_string_map().unwrap(), map);
  }
}
