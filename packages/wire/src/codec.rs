//! DIS primitive codec.
//!
//! Numbers travel as ASCII base-10 digit runs prefixed by a recursive
//! count chain: a run of digits gives the length of the following run,
//! down to a single leading digit, and a sign byte terminates the chain
//! before the value digits. `12345` is written `5+12345`; a twelve digit
//! magnitude is written `2` `12` `+` then the digits. Readers accept the
//! full recursion regardless of how many count stages a writer emitted.
//!
//! Counted strings are an unsigned length followed by that many raw
//! bytes. Floats are a signed mantissa and a signed decimal exponent.
//!
//! Every `take_*` function parses from the front of a byte slice and
//! returns the value together with the number of bytes consumed, or
//! [`DisError::Eod`] when the slice ends mid-token so a buffered caller
//! can refill and retry.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Longest digit run we will parse as a single magnitude. Anything wider
/// cannot fit an i64/u64 and is rejected before allocation.
const MAX_DIGIT_RUN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DisError {
    #[error("protocol violation in DIS stream")]
    Protocol,
    #[error("end of data mid-token")]
    Eod,
    #[error("out of memory decoding DIS value")]
    Nomem,
    #[error("bad or missing sign byte")]
    BadSign,
    #[error("leading whitespace before DIS token")]
    LeadingWhite,
    #[error("non-digit where digit expected")]
    NonDigit,
    #[error("value overflows target type")]
    Overflow,
}

fn parse_digits(run: &[u8]) -> Result<u64, DisError> {
    let mut v: u64 = 0;
    for &b in run {
        if !b.is_ascii_digit() {
            return Err(DisError::NonDigit);
        }
        v = v
            .checked_mul(10)
            .and_then(|v| v.checked_add(u64::from(b - b'0')))
            .ok_or(DisError::Overflow)?;
    }
    Ok(v)
}

/// Scan one number token: count chain, sign, digits.
/// Returns (negative, magnitude, consumed).
fn scan_number(buf: &[u8]) -> Result<(bool, u64, usize), DisError> {
    let first = *buf.first().ok_or(DisError::Eod)?;
    if first.is_ascii_whitespace() {
        return Err(DisError::LeadingWhite);
    }
    let mut pos = 0usize;
    let mut run_len = 1usize;
    loop {
        let b = *buf.get(pos).ok_or(DisError::Eod)?;
        if b == b'+' || b == b'-' {
            pos += 1;
            let end = pos.checked_add(run_len).ok_or(DisError::Overflow)?;
            let run = buf.get(pos..end).ok_or(DisError::Eod)?;
            let mag = parse_digits(run)?;
            return Ok((b == b'-', mag, end));
        }
        // another count run: its digits give the next run's length
        let end = pos.checked_add(run_len).ok_or(DisError::Overflow)?;
        let run = buf.get(pos..end).ok_or(DisError::Eod)?;
        let next = parse_digits(run)?;
        if next == 0 {
            return Err(DisError::Protocol);
        }
        if next as usize > MAX_DIGIT_RUN {
            return Err(DisError::Overflow);
        }
        pos = end;
        run_len = next as usize;
    }
}

/// Parse an unsigned integer. A negative sign on a nonzero magnitude is
/// `BadSign`; `-0` is rejected the same way.
pub fn take_uint(buf: &[u8]) -> Result<(u64, usize), DisError> {
    let (neg, mag, used) = scan_number(buf)?;
    if neg {
        return Err(DisError::BadSign);
    }
    Ok((mag, used))
}

pub fn take_int(buf: &[u8]) -> Result<(i64, usize), DisError> {
    let (neg, mag, used) = scan_number(buf)?;
    if neg {
        if mag > i64::MAX as u64 + 1 {
            return Err(DisError::Overflow);
        }
        Ok(((mag as i128).wrapping_neg() as i64, used))
    } else {
        if mag > i64::MAX as u64 {
            return Err(DisError::Overflow);
        }
        Ok((mag as i64, used))
    }
}

/// Counted byte string: unsigned length, then that many raw bytes.
pub fn take_bytes(buf: &[u8]) -> Result<(Vec<u8>, usize), DisError> {
    let (len, used) = take_uint(buf)?;
    let len = usize::try_from(len).map_err(|_| DisError::Overflow)?;
    let end = used.checked_add(len).ok_or(DisError::Overflow)?;
    let body = buf.get(used..end).ok_or(DisError::Eod)?;
    Ok((body.to_vec(), end))
}

pub fn take_string(buf: &[u8]) -> Result<(String, usize), DisError> {
    let (body, used) = take_bytes(buf)?;
    let s = String::from_utf8(body).map_err(|_| DisError::Protocol)?;
    Ok((s, used))
}

/// Float: signed mantissa then signed decimal exponent.
pub fn take_float(buf: &[u8]) -> Result<(f64, usize), DisError> {
    let (mant, used_m) = take_int(buf)?;
    let (exp, used_e) = take_int(&buf[used_m..])?;
    let exp = i32::try_from(exp).map_err(|_| DisError::Overflow)?;
    Ok(((mant as f64) * 10f64.powi(exp), used_m + used_e))
}

fn put_number(buf: &mut BytesMut, sign: u8, digits: &str) {
    // minimal count chain: lengths prepended until the head run is one digit
    let mut counts: Vec<String> = vec![digits.len().to_string()];
    while counts[0].len() > 1 {
        let head = counts[0].len().to_string();
        counts.insert(0, head);
    }
    for c in &counts {
        buf.put_slice(c.as_bytes());
    }
    buf.put_u8(sign);
    buf.put_slice(digits.as_bytes());
}

pub fn put_uint(buf: &mut BytesMut, v: u64) {
    put_number(buf, b'+', &v.to_string());
}

pub fn put_int(buf: &mut BytesMut, v: i64) {
    if v < 0 {
        put_number(buf, b'-', &v.unsigned_abs().to_string());
    } else {
        put_number(buf, b'+', &v.to_string());
    }
}

pub fn put_bytes(buf: &mut BytesMut, body: &[u8]) {
    put_uint(buf, body.len() as u64);
    buf.put_slice(body);
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Decompose into (mantissa, exponent) with trailing zeros stripped so
/// the canonical form round-trips.
pub fn put_float(buf: &mut BytesMut, v: f64) {
    if v == 0.0 {
        put_int(buf, 0);
        put_int(buf, 0);
        return;
    }
    let formatted = format!("{:e}", v.abs()); // "d.ddddde±x"
    let (mant_str, exp_str) = formatted.split_once('e').expect("exponent form");
    let exp10: i64 = exp_str.parse().expect("decimal exponent");
    let mut digits: String = mant_str.chars().filter(|c| *c != '.').collect();
    let frac_len = mant_str.split_once('.').map_or(0, |(_, f)| f.len()) as i64;
    let mut exp = exp10 - frac_len;
    while digits.len() > 1 && digits.ends_with('0') {
        digits.pop();
        exp += 1;
    }
    let mant: i64 = digits.parse().expect("mantissa digits");
    put_int(buf, if v < 0.0 { -mant } else { mant });
    put_int(buf, exp);
}

/// Sequential reader over a fully-buffered DIS record.
pub struct DisCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> DisCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn advance<T>(&mut self, r: Result<(T, usize), DisError>) -> Result<T, DisError> {
        let (v, used) = r?;
        self.pos += used;
        Ok(v)
    }

    pub fn uint(&mut self) -> Result<u64, DisError> {
        let r = take_uint(&self.buf[self.pos..]);
        self.advance(r)
    }

    pub fn int(&mut self) -> Result<i64, DisError> {
        let r = take_int(&self.buf[self.pos..]);
        self.advance(r)
    }

    pub fn string(&mut self) -> Result<String, DisError> {
        let r = take_string(&self.buf[self.pos..]);
        self.advance(r)
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>, DisError> {
        let r = take_bytes(&self.buf[self.pos..]);
        self.advance(r)
    }

    pub fn float(&mut self) -> Result<f64, DisError> {
        let r = take_float(&self.buf[self.pos..]);
        self.advance(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc_uint(v: u64) -> BytesMut {
        let mut b = BytesMut::new();
        put_uint(&mut b, v);
        b
    }

    #[test]
    fn uint_small_value_has_count_and_sign() {
        assert_eq!(&enc_uint(5)[..], b"1+5");
    }

    #[test]
    fn uint_five_digit_value_matches_grammar() {
        assert_eq!(&enc_uint(12345)[..], b"5+12345");
    }

    #[test]
    fn uint_twelve_digit_value_recurses() {
        assert_eq!(&enc_uint(123_456_789_012)[..], b"212+123456789012");
    }

    #[test]
    fn uint_round_trips() {
        for v in [0u64, 1, 9, 10, 99, 12345, u64::MAX] {
            let b = enc_uint(v);
            let (got, used) = take_uint(&b).unwrap();
            assert_eq!(got, v);
            assert_eq!(used, b.len());
        }
    }

    #[test]
    fn reader_accepts_deeper_recursion_than_writer_emits() {
        // "1" says the next run is one digit, "5" says five digits follow
        let (v, used) = take_uint(b"15+12345").unwrap();
        assert_eq!(v, 12345);
        assert_eq!(used, 8);
    }

    #[test]
    fn int_round_trips_negative() {
        let mut b = BytesMut::new();
        put_int(&mut b, -987654);
        let (v, _) = take_int(&b).unwrap();
        assert_eq!(v, -987654);
    }

    #[test]
    fn int_min_round_trips() {
        let mut b = BytesMut::new();
        put_int(&mut b, i64::MIN);
        let (v, _) = take_int(&b).unwrap();
        assert_eq!(v, i64::MIN);
    }

    #[test]
    fn uint_rejects_negative_with_badsign() {
        assert_eq!(take_uint(b"1-5"), Err(DisError::BadSign));
    }

    #[test]
    fn leading_whitespace_is_typed_error() {
        assert_eq!(take_uint(b" 1+5"), Err(DisError::LeadingWhite));
    }

    #[test]
    fn non_digit_in_run_is_typed_error() {
        assert_eq!(take_uint(b"1+x"), Err(DisError::NonDigit));
    }

    #[test]
    fn truncated_token_reports_eod() {
        assert_eq!(take_uint(b"5+123"), Err(DisError::Eod));
        assert_eq!(take_uint(b""), Err(DisError::Eod));
    }

    #[test]
    fn zero_length_count_run_is_protocol_error() {
        assert_eq!(take_uint(b"05+12345"), Err(DisError::Protocol));
    }

    #[test]
    fn oversized_run_is_overflow() {
        // 21-digit magnitude cannot fit a u64
        assert_eq!(take_uint(b"221+123456789012345678901"), Err(DisError::Overflow));
    }

    #[test]
    fn string_round_trips_including_empty() {
        for s in ["", "workq", "#!/bin/sh\necho hi\n"] {
            let mut b = BytesMut::new();
            put_string(&mut b, s);
            let (got, used) = take_string(&b).unwrap();
            assert_eq!(got, s);
            assert_eq!(used, b.len());
        }
    }

    #[test]
    fn string_truncated_body_reports_eod() {
        let mut b = BytesMut::new();
        put_string(&mut b, "hello");
        assert_eq!(take_string(&b[..b.len() - 1]), Err(DisError::Eod));
    }

    #[test]
    fn float_round_trips() {
        for v in [0.0f64, 2.5, -0.125, 1234.0, -3.25e10] {
            let mut b = BytesMut::new();
            put_float(&mut b, v);
            let (got, _) = take_float(&b).unwrap();
            assert!((got - v).abs() <= v.abs() * 1e-12, "{v} -> {got}");
        }
    }

    #[test]
    fn cursor_reads_records_in_sequence() {
        let mut b = BytesMut::new();
        put_uint(&mut b, 2);
        put_string(&mut b, "workq");
        put_int(&mut b, -1);
        let mut c = DisCursor::new(&b);
        assert_eq!(c.uint().unwrap(), 2);
        assert_eq!(c.string().unwrap(), "workq");
        assert_eq!(c.int().unwrap(), -1);
        assert_eq!(c.remaining(), 0);
    }
}
