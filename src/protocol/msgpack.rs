//! Thin helpers on top of `rmp` for the value shapes used by the service protocol. Messages are
//!  MessagePack arrays; readers track how many array elements are left so that trailing fields
//!  added by newer protocol revisions can be treated as optional.

use anyhow::{anyhow, bail};
use bytes::Bytes;
use rmp::Marker;

use crate::protocol::messages::{Headers, Payloads};


pub struct MsgPackWriter {
    buf: Vec<u8>,
}

impl MsgPackWriter {
    pub fn new() -> MsgPackWriter {
        MsgPackWriter {
            buf: Vec::with_capacity(128),
        }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn array_len(&mut self, len: usize) -> anyhow::Result<()> {
        rmp::encode::write_array_len(&mut self.buf, len.try_into()?)?;
        Ok(())
    }

    pub fn map_len(&mut self, len: usize) -> anyhow::Result<()> {
        rmp::encode::write_map_len(&mut self.buf, len.try_into()?)?;
        Ok(())
    }

    pub fn int(&mut self, value: i64) -> anyhow::Result<()> {
        rmp::encode::write_sint(&mut self.buf, value)?;
        Ok(())
    }

    pub fn uint(&mut self, value: u64) -> anyhow::Result<()> {
        rmp::encode::write_uint(&mut self.buf, value)?;
        Ok(())
    }

    pub fn nil(&mut self) -> anyhow::Result<()> {
        rmp::encode::write_nil(&mut self.buf)?;
        Ok(())
    }

    pub fn opt_int(&mut self, value: Option<i64>) -> anyhow::Result<()> {
        match value {
            Some(v) => self.int(v),
            None => self.nil(),
        }
    }

    pub fn opt_uint(&mut self, value: Option<u64>) -> anyhow::Result<()> {
        match value {
            Some(v) => self.uint(v),
            None => self.nil(),
        }
    }

    pub fn string(&mut self, s: &str) -> anyhow::Result<()> {
        rmp::encode::write_str(&mut self.buf, s)?;
        Ok(())
    }

    pub fn opt_string(&mut self, s: Option<&str>) -> anyhow::Result<()> {
        match s {
            Some(s) => self.string(s),
            None => self.nil(),
        }
    }

    pub fn bin(&mut self, data: &[u8]) -> anyhow::Result<()> {
        rmp::encode::write_bin(&mut self.buf, data)?;
        Ok(())
    }

    pub fn string_list(&mut self, items: &[String]) -> anyhow::Result<()> {
        self.array_len(items.len())?;
        for item in items {
            self.string(item)?;
        }
        Ok(())
    }

    /// `{ protocol name: payload bytes }`
    pub fn payloads(&mut self, payloads: &Payloads) -> anyhow::Result<()> {
        self.map_len(payloads.len())?;
        for (protocol, payload) in payloads {
            self.string(protocol)?;
            self.bin(payload)?;
        }
        Ok(())
    }

    /// `[[type, value], ...]` - claim types can repeat, so this is not a map
    pub fn claims(&mut self, claims: &[(String, String)]) -> anyhow::Result<()> {
        self.array_len(claims.len())?;
        for (claim_type, value) in claims {
            self.array_len(2)?;
            self.string(claim_type)?;
            self.string(value)?;
        }
        Ok(())
    }

    /// `{ name: [value, ...] }`
    pub fn headers(&mut self, headers: &Headers) -> anyhow::Result<()> {
        self.map_len(headers.len())?;
        for (name, values) in headers {
            self.string(name)?;
            self.string_list(values)?;
        }
        Ok(())
    }
}


/// Reads the elements of a single MessagePack array that spans a complete frame
pub struct MsgPackArrayReader<'a> {
    frame: &'a Bytes,
    rd: &'a [u8],
    remaining: u32,
}

impl<'a> MsgPackArrayReader<'a> {
    pub fn new(frame: &'a Bytes) -> anyhow::Result<MsgPackArrayReader<'a>> {
        let mut rd: &'a [u8] = frame.as_ref();
        let remaining = rmp::decode::read_array_len(&mut rd)?;
        Ok(MsgPackArrayReader {
            frame,
            rd,
            remaining,
        })
    }

    /// number of array elements that were not read yet
    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    /// Reads a field that older producers may not send, falling back to the default value
    pub fn trailing<T: Default>(&mut self, read: impl FnOnce(&mut Self) -> anyhow::Result<T>) -> anyhow::Result<T> {
        if self.remaining == 0 {
            return Ok(T::default());
        }
        read(self)
    }

    fn next_field(&mut self, name: &str) -> anyhow::Result<()> {
        if self.remaining == 0 {
            bail!("missing field '{}'", name);
        }
        self.remaining -= 1;
        Ok(())
    }

    fn is_nil_next(&self) -> bool {
        match self.rd.first() {
            Some(&b) => Marker::from_u8(b) == Marker::Null,
            None => false,
        }
    }

    fn skip_nil(&mut self) -> anyhow::Result<bool> {
        if self.is_nil_next() {
            rmp::decode::read_nil(&mut self.rd)?;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn i64(&mut self, name: &str) -> anyhow::Result<i64> {
        self.next_field(name)?;
        Ok(rmp::decode::read_int::<i64, _>(&mut self.rd)?)
    }

    pub fn i32(&mut self, name: &str) -> anyhow::Result<i32> {
        let value = self.i64(name)?;
        i32::try_from(value)
            .map_err(|_| anyhow!("field '{}' out of range: {}", name, value))
    }

    pub fn opt_i32(&mut self, name: &str) -> anyhow::Result<Option<i32>> {
        self.next_field(name)?;
        if self.skip_nil()? {
            return Ok(None);
        }
        let value = rmp::decode::read_int::<i64, _>(&mut self.rd)?;
        let value = i32::try_from(value)
            .map_err(|_| anyhow!("field '{}' out of range: {}", name, value))?;
        Ok(Some(value))
    }

    pub fn opt_u64(&mut self, name: &str) -> anyhow::Result<Option<u64>> {
        self.next_field(name)?;
        if self.skip_nil()? {
            return Ok(None);
        }
        Ok(Some(rmp::decode::read_int::<u64, _>(&mut self.rd)?))
    }

    /// NB: nil is read as an empty string, some producers write nil for empty messages
    pub fn string(&mut self, name: &str) -> anyhow::Result<String> {
        self.next_field(name)?;
        self.read_str()
    }

    pub fn opt_string(&mut self, name: &str) -> anyhow::Result<Option<String>> {
        self.next_field(name)?;
        if self.skip_nil()? {
            return Ok(None);
        }
        Ok(Some(self.read_str()?))
    }

    pub fn bin(&mut self, name: &str) -> anyhow::Result<Bytes> {
        self.next_field(name)?;
        self.read_bin()
    }

    pub fn string_list(&mut self, name: &str) -> anyhow::Result<Vec<String>> {
        self.next_field(name)?;
        self.read_string_list()
    }

    pub fn payloads(&mut self, name: &str) -> anyhow::Result<Payloads> {
        self.next_field(name)?;
        if self.skip_nil()? {
            return Ok(Vec::new());
        }
        let len = rmp::decode::read_map_len(&mut self.rd)? as usize;
        let mut result = Vec::with_capacity(len.min(64));
        for _ in 0..len {
            let protocol = self.read_str()?;
            let payload = self.read_bin()?;
            result.push((protocol, payload));
        }
        Ok(result)
    }

    pub fn claims(&mut self, name: &str) -> anyhow::Result<Vec<(String, String)>> {
        self.next_field(name)?;
        if self.skip_nil()? {
            return Ok(Vec::new());
        }
        let len = rmp::decode::read_array_len(&mut self.rd)? as usize;
        let mut result = Vec::with_capacity(len.min(64));
        for _ in 0..len {
            let pair_len = rmp::decode::read_array_len(&mut self.rd)?;
            if pair_len != 2 {
                bail!("claim must be a [type, value] pair, has {} elements", pair_len);
            }
            let claim_type = self.read_str()?;
            let value = self.read_str()?;
            result.push((claim_type, value));
        }
        Ok(result)
    }

    pub fn headers(&mut self, name: &str) -> anyhow::Result<Headers> {
        self.next_field(name)?;
        if self.skip_nil()? {
            return Ok(Vec::new());
        }
        let len = rmp::decode::read_map_len(&mut self.rd)? as usize;
        let mut result = Vec::with_capacity(len.min(64));
        for _ in 0..len {
            let header = self.read_str()?;
            let values = self.read_string_list()?;
            result.push((header, values));
        }
        Ok(result)
    }

    fn read_str(&mut self) -> anyhow::Result<String> {
        if self.skip_nil()? {
            return Ok(String::new());
        }
        let len = rmp::decode::read_str_len(&mut self.rd)? as usize;
        if self.rd.len() < len {
            bail!("buffer underflow reading a string of length {}", len);
        }
        let (s, rest) = self.rd.split_at(len);
        let s = std::str::from_utf8(s)?.to_string();
        self.rd = rest;
        Ok(s)
    }

    fn read_bin(&mut self) -> anyhow::Result<Bytes> {
        if self.skip_nil()? {
            return Ok(Bytes::new());
        }
        let len = rmp::decode::read_bin_len(&mut self.rd)? as usize;
        if self.rd.len() < len {
            bail!("buffer underflow reading binary data of length {}", len);
        }
        let offset = self.frame.len() - self.rd.len();
        let result = self.frame.slice(offset..offset + len);
        self.rd = &self.rd[len..];
        Ok(result)
    }

    fn read_string_list(&mut self) -> anyhow::Result<Vec<String>> {
        if self.skip_nil()? {
            return Ok(Vec::new());
        }
        let len = rmp::decode::read_array_len(&mut self.rd)? as usize;
        let mut result = Vec::with_capacity(len.min(64));
        for _ in 0..len {
            result.push(self.read_str()?);
        }
        Ok(result)
    }
}
