// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use aal::{
    AsicError, AsicResult, DecodedWord, EntryCodec, EntryWord, IndirectPtrs,
    MatchKey, ResourcePtr,
};

// Layout flags
const FLAG_DIGEST: u8 = 0x01;

// Pointer presence bits, one per indirect class
const PTR_ACTION_DATA: u8 = 0x01;
const PTR_COUNTER: u8 = 0x02;
const PTR_METER: u8 = 0x04;
const PTR_STATEFUL: u8 = 0x08;

/// A byte-oriented codec for the chaos device.  The word is:
///
///   flags:u8 | key-or-digest | action_id:u32 | data_len:u8 | data |
///   ptr_mask:u8 | ptrs:u32...
///
/// where the key is length-prefixed and a digest is a raw u64.  All integers
/// are big-endian.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

fn short(what: &str) -> AsicError {
    AsicError::InvalidArg(format!("truncated match word reading {what}"))
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &str) -> AsicResult<&'a [u8]> {
        if self.buf.len() < n {
            return Err(short(what));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self, what: &str) -> AsicResult<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u32(&mut self, what: &str) -> AsicResult<u32> {
        let b = self.take(4, what)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self, what: &str) -> AsicResult<u64> {
        let b = self.take(8, what)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_be_bytes(raw))
    }
}

impl EntryCodec for RawCodec {
    fn pack(&self, entry: &EntryWord<'_>) -> AsicResult<Vec<u8>> {
        let key = entry.key.as_bytes();
        if key.len() > u8::MAX as usize {
            return Err(AsicError::InvalidArg(format!(
                "key of {} bytes is too wide",
                key.len()
            )));
        }
        if entry.action.data.len() > u8::MAX as usize {
            return Err(AsicError::InvalidArg(format!(
                "{} bytes of immediate data is too wide",
                entry.action.data.len()
            )));
        }

        let mut word = Vec::with_capacity(16 + key.len());
        match entry.digest {
            Some(digest) => {
                word.push(FLAG_DIGEST);
                word.extend_from_slice(&digest.to_be_bytes());
            }
            None => {
                word.push(0);
                word.push(key.len() as u8);
                word.extend_from_slice(key);
            }
        }
        word.extend_from_slice(&entry.action.action_id.to_be_bytes());
        word.push(entry.action.data.len() as u8);
        word.extend_from_slice(&entry.action.data);

        let ptrs = [
            (PTR_ACTION_DATA, entry.ptrs.action_data),
            (PTR_COUNTER, entry.ptrs.counter),
            (PTR_METER, entry.ptrs.meter),
            (PTR_STATEFUL, entry.ptrs.stateful),
        ];
        let mask = ptrs
            .iter()
            .filter(|(_, p)| p.is_some())
            .fold(0u8, |m, (bit, _)| m | bit);
        word.push(mask);
        for ptr in ptrs.iter().filter_map(|(_, p)| *p) {
            word.extend_from_slice(&ptr.0.to_be_bytes());
        }
        Ok(word)
    }

    fn unpack(&self, word: &[u8]) -> AsicResult<DecodedWord> {
        let mut r = Reader { buf: word };
        let flags = r.u8("flags")?;
        let (key, digest) = if flags & FLAG_DIGEST != 0 {
            (None, Some(r.u64("digest")?))
        } else {
            let len = r.u8("key length")? as usize;
            (Some(MatchKey::new(r.take(len, "key")?)), None)
        };
        let action_id = r.u32("action id")?;
        let len = r.u8("data length")? as usize;
        let data = r.take(len, "action data")?.to_vec();

        let mask = r.u8("pointer mask")?;
        let mut ptrs = IndirectPtrs::default();
        if mask & PTR_ACTION_DATA != 0 {
            ptrs.action_data = Some(ResourcePtr(r.u32("action pointer")?));
        }
        if mask & PTR_COUNTER != 0 {
            ptrs.counter = Some(ResourcePtr(r.u32("counter pointer")?));
        }
        if mask & PTR_METER != 0 {
            ptrs.meter = Some(ResourcePtr(r.u32("meter pointer")?));
        }
        if mask & PTR_STATEFUL != 0 {
            ptrs.stateful = Some(ResourcePtr(r.u32("stateful pointer")?));
        }
        if !r.buf.is_empty() {
            return Err(AsicError::InvalidArg(format!(
                "{} trailing bytes in match word",
                r.buf.len()
            )));
        }

        Ok(DecodedWord {
            key,
            digest,
            action_id,
            data,
            ptrs,
        })
    }

    fn immediate_bits(&self, action: &aal::ActionSpec) -> AsicResult<u32> {
        Ok(action.data.len() as u32 * 8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aal::ActionSpec;

    #[test]
    fn test_pack_with_digest_and_ptrs() -> anyhow::Result<()> {
        let key = MatchKey::from(5u64);
        let action = ActionSpec::new(3, vec![0xaa, 0xbb]);
        let ptrs = IndirectPtrs {
            counter: Some(ResourcePtr(17)),
            stateful: Some(ResourcePtr(2)),
            ..Default::default()
        };
        let word = RawCodec.pack(&EntryWord {
            key: &key,
            digest: Some(0xdead_beef),
            action: &action,
            ptrs: &ptrs,
        })?;
        let decoded = RawCodec.unpack(&word)?;
        assert_eq!(decoded.key, None);
        assert_eq!(decoded.digest, Some(0xdead_beef));
        assert_eq!(decoded.action_id, 3);
        assert_eq!(decoded.data, vec![0xaa, 0xbb]);
        assert_eq!(decoded.ptrs, ptrs);
        Ok(())
    }

    #[test]
    fn test_truncated_word() {
        assert!(RawCodec.unpack(&[0, 4, 1]).is_err());
        assert!(RawCodec.unpack(&[]).is_err());
    }
}
