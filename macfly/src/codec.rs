//! The canonical binary codec: a deterministic, tag-free encoding built directly on
//! `buffertk`'s `Packable`/`Unpackable`/`v64` primitives.
//!
//! Structs pack their fields positionally, in declaration order — no field tags, unlike
//! `prototk`'s framework. Integers use `v64` (compact, variable-length) rather than the
//! fixed-width encoding `buffertk` gives plain `u64`/`u32`. Byte strings and UTF-8 strings are
//! length-prefixed via `buffertk`'s existing `Packable`/`Unpackable` impl for `&[u8]`. Sequences
//! (caveat lists, map entries) are a `v64` count followed by that many entries. Maps additionally
//! sort their entries by encoded key bytes before emitting them, so that two semantically equal
//! maps always produce byte-identical output regardless of iteration order.

use buffertk::{stack_pack, v64, Packable, Unpackable, Unpacker};

use crate::error::Error;

/////////////////////////////////////////////// pack ////////////////////////////////////////////////

pub fn pack_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    stack_pack(bytes).append_to_vec(out);
}

pub fn pack_str(out: &mut Vec<u8>, s: &str) {
    pack_bytes(out, s.as_bytes());
}

pub fn pack_u64(out: &mut Vec<u8>, x: u64) {
    let v: v64 = x.into();
    stack_pack(v).append_to_vec(out);
}

pub fn pack_bool(out: &mut Vec<u8>, b: bool) {
    out.push(if b { 1 } else { 0 });
}

pub fn pack_fixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes);
}

/// Big integers pack as length-prefixed big-endian byte arrays; callers are responsible for
/// supplying a minimal (no leading zero byte, except the single byte `[0]` for zero itself)
/// big-endian representation.
pub fn pack_bigint_be(out: &mut Vec<u8>, digits: &[u8]) {
    pack_bytes(out, digits);
}

/// A sequence of already-encoded `(key_bytes, value_bytes)` pairs, sorted by key bytes and
/// length-prefix-framed. Used for both maps (pairs are key/value) and for plain sequences of
/// values (pass an empty key and rely on stable sort to preserve input order).
pub fn pack_sorted_map(out: &mut Vec<u8>, mut entries: Vec<(Vec<u8>, Vec<u8>)>) {
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    pack_u64(out, entries.len() as u64);
    for (k, v) in entries {
        pack_bytes(out, &k);
        pack_bytes(out, &v);
    }
}

/// A sequence of already-encoded values, emitted in input order (order is meaningful, e.g. a
/// `CaveatSet`'s caveat list).
pub fn pack_sequence(out: &mut Vec<u8>, items: &[Vec<u8>]) {
    pack_u64(out, items.len() as u64);
    for item in items {
        pack_bytes(out, item);
    }
}

////////////////////////////////////////////// unpack ///////////////////////////////////////////////

pub fn unpack_bytes<'a>(buf: &'a [u8]) -> Result<(&'a [u8], &'a [u8]), Error> {
    let mut up = Unpacker::new(buf);
    let bytes: &[u8] = up.unpack()?;
    Ok((bytes, up.remain()))
}

pub fn unpack_str(buf: &[u8]) -> Result<(String, &[u8]), Error> {
    let (bytes, rest) = unpack_bytes(buf)?;
    Ok((String::from_utf8(bytes.to_vec())?, rest))
}

pub fn unpack_u64(buf: &[u8]) -> Result<(u64, &[u8]), Error> {
    let (v, rest): (v64, &[u8]) = Unpackable::unpack(buf)?;
    Ok((v.into(), rest))
}

pub fn unpack_bool(buf: &[u8]) -> Result<(bool, &[u8]), Error> {
    if buf.is_empty() {
        return Err(Error::bad_token("expected a bool byte, found end of buffer"));
    }
    Ok((buf[0] != 0, &buf[1..]))
}

pub fn unpack_fixed<'a>(buf: &'a [u8], n: usize) -> Result<(&'a [u8], &'a [u8]), Error> {
    if buf.len() < n {
        return Err(Error::bad_token(format!(
            "expected {n} fixed bytes, found {}",
            buf.len()
        )));
    }
    Ok(buf.split_at(n))
}

pub fn unpack_bigint_be(buf: &[u8]) -> Result<(Vec<u8>, &[u8]), Error> {
    let (bytes, rest) = unpack_bytes(buf)?;
    Ok((bytes.to_vec(), rest))
}

pub fn unpack_sorted_map(buf: &[u8]) -> Result<(Vec<(Vec<u8>, Vec<u8>)>, &[u8]), Error> {
    let (count, mut rest) = unpack_u64(buf)?;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (k, r) = unpack_bytes(rest)?;
        let (v, r) = unpack_bytes(r)?;
        entries.push((k.to_vec(), v.to_vec()));
        rest = r;
    }
    Ok((entries, rest))
}

pub fn unpack_sequence(buf: &[u8]) -> Result<(Vec<Vec<u8>>, &[u8]), Error> {
    let (count, mut rest) = unpack_u64(buf)?;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (item, r) = unpack_bytes(rest)?;
        items.push(item.to_vec());
        rest = r;
    }
    Ok((items, rest))
}

/////////////////////////////////////////////// tests //////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip() {
        let mut buf = Vec::new();
        pack_bytes(&mut buf, b"hello");
        let (got, rest) = unpack_bytes(&buf).unwrap();
        assert_eq!(b"hello".as_slice(), got);
        assert!(rest.is_empty());
    }

    #[test]
    fn sorted_map_is_order_independent() {
        let mut a = Vec::new();
        pack_sorted_map(
            &mut a,
            vec![(b"b".to_vec(), b"2".to_vec()), (b"a".to_vec(), b"1".to_vec())],
        );
        let mut b = Vec::new();
        pack_sorted_map(
            &mut b,
            vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())],
        );
        assert_eq!(a, b);
    }

    #[test]
    fn u64_is_compact() {
        let mut buf = Vec::new();
        pack_u64(&mut buf, 1);
        assert_eq!(1, buf.len());
    }

    #[test]
    fn sequence_round_trip() {
        let mut buf = Vec::new();
        pack_sequence(&mut buf, &[b"a".to_vec(), b"bb".to_vec()]);
        let (items, rest) = unpack_sequence(&buf).unwrap();
        assert_eq!(vec![b"a".to_vec(), b"bb".to_vec()], items);
        assert!(rest.is_empty());
    }
}
