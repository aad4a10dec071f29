//! Items stored in slotted pages.

use crate::error::{CoreError, CoreResult};
use crate::types::PageNo;

/// Per-item prefix: len (2) + type (1).
pub const ITEM_HEADER_SIZE: usize = 3;

const ITEM_DATA: u8 = 1;
const ITEM_OVERFLOW: u8 = 2;

/// An entry in a slotted page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// Bytes stored inline.
    Data(Vec<u8>),
    /// A value stored in an overflow chain starting at `pgno`.
    Overflow {
        /// Head of the chain.
        pgno: PageNo,
        /// Total length of the value.
        tlen: u32,
    },
}

impl Item {
    /// Length of the item's encoded form on the page.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        ITEM_HEADER_SIZE
            + match self {
                Self::Data(data) => data.len(),
                Self::Overflow { .. } => 8,
            }
    }

    /// Encodes the item as `len u16 | type u8 | data`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if inline data exceeds 64 KiB.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let (kind, payload) = match self {
            Self::Data(data) => (ITEM_DATA, data.clone()),
            Self::Overflow { pgno, tlen } => {
                let mut payload = Vec::with_capacity(8);
                payload.extend_from_slice(&pgno.to_le_bytes());
                payload.extend_from_slice(&tlen.to_le_bytes());
                (ITEM_OVERFLOW, payload)
            }
        };
        let len = u16::try_from(payload.len())
            .map_err(|_| CoreError::invalid_operation("inline item larger than 64 KiB"))?;
        let mut out = Vec::with_capacity(ITEM_HEADER_SIZE + payload.len());
        out.extend_from_slice(&len.to_le_bytes());
        out.push(kind);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decodes an item from the start of `bytes`, ignoring anything after it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedRecord`] on a short buffer or unknown type.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let len = Self::stored_len(bytes)? - ITEM_HEADER_SIZE;
        let payload = &bytes[ITEM_HEADER_SIZE..ITEM_HEADER_SIZE + len];
        match bytes[2] {
            ITEM_DATA => Ok(Self::Data(payload.to_vec())),
            ITEM_OVERFLOW if len == 8 => Ok(Self::Overflow {
                pgno: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
                tlen: u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]),
            }),
            other => Err(CoreError::malformed(format!(
                "item type {other} with {len} byte payload"
            ))),
        }
    }

    /// Total stored length (prefix included) of the item at the start of
    /// `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MalformedRecord`] if the buffer is shorter than
    /// the item claims.
    pub fn stored_len(bytes: &[u8]) -> CoreResult<usize> {
        if bytes.len() < ITEM_HEADER_SIZE {
            return Err(CoreError::malformed("item prefix truncated"));
        }
        let total = ITEM_HEADER_SIZE + usize::from(u16::from_le_bytes([bytes[0], bytes[1]]));
        if bytes.len() < total {
            return Err(CoreError::malformed(format!(
                "item claims {total} bytes, {} available",
                bytes.len()
            )));
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_item_layout() {
        let encoded = Item::Data(b"xy".to_vec()).encode().unwrap();
        assert_eq!(encoded, vec![2, 0, ITEM_DATA, b'x', b'y']);
        assert_eq!(Item::decode(&encoded).unwrap(), Item::Data(b"xy".to_vec()));
    }

    #[test]
    fn overflow_reference_decodes_with_trailing_page_bytes() {
        let item = Item::Overflow { pgno: 9, tlen: 70_000 };
        let mut encoded = item.encode().unwrap();
        assert_eq!(encoded.len(), item.encoded_len());
        encoded.extend_from_slice(&[0xAA; 5]);
        assert_eq!(Item::decode(&encoded).unwrap(), item);
    }

    #[test]
    fn unknown_type_is_malformed() {
        assert!(Item::decode(&[0, 0, 9]).is_err());
        assert!(Item::decode(&[5, 0, ITEM_DATA, 1]).is_err());
    }
}
