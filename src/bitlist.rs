use std::fmt;

use anyhow::{bail, Context, Result};

/// Variable-length bitset with a trailing length-delimiter bit, as carried in
/// attestation `aggregation_bits`.
///
/// The highest set bit of the final byte marks the end of the list and is not
/// itself a member bit. Bits are numbered LSB-first within each byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitlist(Vec<u8>);

impl Bitlist {
    /// Wraps raw bitlist bytes, validating the length delimiter.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        match bytes.last() {
            None => bail!("bitlist is empty"),
            Some(0) => bail!("bitlist missing length delimiter"),
            Some(_) => Ok(Self(bytes)),
        }
    }

    /// Parses a `0x`-prefixed hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw).with_context(|| format!("decoding bitlist {s:?}"))?;
        Self::from_bytes(bytes)
    }

    /// Number of bits in the list, excluding the delimiter.
    pub fn len(&self) -> usize {
        match self.0.last() {
            Some(&last) if last != 0 => {
                (self.0.len() - 1) * 8 + (7 - last.leading_zeros() as usize)
            }
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of set member bits, excluding the delimiter.
    pub fn count(&self) -> usize {
        let ones: u32 = self.0.iter().map(|b| b.count_ones()).sum();
        ones as usize - 1
    }

    /// Element-wise OR with another bitlist of the same bit length.
    ///
    /// Equal lengths mean the delimiter bits coincide, so the merged bytes
    /// remain a well-formed bitlist.
    pub fn union(&self, other: &Bitlist) -> Result<Bitlist> {
        if self.len() != other.len() {
            bail!(
                "bitlists are different lengths ({} != {})",
                self.len(),
                other.len()
            );
        }

        let merged = self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a | b)
            .collect();

        Ok(Bitlist(merged))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Bitlist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0))
    }
}
