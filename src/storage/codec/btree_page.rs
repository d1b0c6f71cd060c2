use crate::buffer::PAGE_SIZE;
use crate::error::{VellumDBError, VellumDBResult};
use crate::storage::codec::common::CommonCodec;
use crate::storage::page::btree_page::{
    BPlusTreeInternalPage, BPlusTreeInternalPageHeader, BPlusTreeLeafPage,
    BPlusTreeLeafPageHeader, BPlusTreePage,
};
use crate::storage::page::RecordId;

const PAGE_TYPE_LEAF: u8 = 1;
const PAGE_TYPE_INTERNAL: u8 = 2;

/// Dispatches on the type tag at offset 0.
pub struct BPlusTreePageCodec;

impl BPlusTreePageCodec {
    pub fn encode(page: &BPlusTreePage, key_size: usize) -> Vec<u8> {
        match page {
            BPlusTreePage::Leaf(leaf) => BPlusTreeLeafPageCodec::encode(leaf, key_size),
            BPlusTreePage::Internal(internal) => {
                BPlusTreeInternalPageCodec::encode(internal, key_size)
            }
        }
    }

    pub fn decode(bytes: &[u8], key_size: usize) -> VellumDBResult<BPlusTreePage> {
        let (page_type, _) = CommonCodec::decode_u8(bytes)?;
        match page_type {
            PAGE_TYPE_LEAF => Ok(BPlusTreePage::Leaf(BPlusTreeLeafPageCodec::decode(
                bytes, key_size,
            )?)),
            PAGE_TYPE_INTERNAL => Ok(BPlusTreePage::Internal(
                BPlusTreeInternalPageCodec::decode(bytes, key_size)?,
            )),
            other => Err(VellumDBError::Storage(format!(
                "unknown b+tree page type {}",
                other
            ))),
        }
    }
}

/// Layout: type u8 | page_id u32 | parent u32 | size u32 | max_size u32 |
/// next_page_id u32 | entries (key_size + 8 bytes each), zero-padded to the
/// page size.
pub struct BPlusTreeLeafPageCodec;

impl BPlusTreeLeafPageCodec {
    pub fn encode(page: &BPlusTreeLeafPage, key_size: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PAGE_SIZE);
        CommonCodec::encode_u8(PAGE_TYPE_LEAF, &mut buf);
        CommonCodec::encode_u32(page.header.page_id, &mut buf);
        CommonCodec::encode_u32(page.header.parent_page_id, &mut buf);
        CommonCodec::encode_u32(page.header.current_size, &mut buf);
        CommonCodec::encode_u32(page.header.max_size, &mut buf);
        CommonCodec::encode_u32(page.header.next_page_id, &mut buf);
        for (key, rid) in page.array.iter() {
            debug_assert_eq!(key.len(), key_size);
            CommonCodec::encode_bytes(key, &mut buf);
            CommonCodec::encode_u32(rid.page_id, &mut buf);
            CommonCodec::encode_u32(rid.slot, &mut buf);
        }
        debug_assert!(buf.len() <= PAGE_SIZE);
        buf.resize(PAGE_SIZE, 0);
        buf
    }

    pub fn decode(bytes: &[u8], key_size: usize) -> VellumDBResult<BPlusTreeLeafPage> {
        let mut offset = 0;
        let (page_type, n) = CommonCodec::decode_u8(&bytes[offset..])?;
        offset += n;
        if page_type != PAGE_TYPE_LEAF {
            return Err(VellumDBError::Storage(format!(
                "expected leaf page, found type {}",
                page_type
            )));
        }
        let (page_id, n) = CommonCodec::decode_u32(&bytes[offset..])?;
        offset += n;
        let (parent_page_id, n) = CommonCodec::decode_u32(&bytes[offset..])?;
        offset += n;
        let (current_size, n) = CommonCodec::decode_u32(&bytes[offset..])?;
        offset += n;
        let (max_size, n) = CommonCodec::decode_u32(&bytes[offset..])?;
        offset += n;
        let (next_page_id, n) = CommonCodec::decode_u32(&bytes[offset..])?;
        offset += n;

        let mut array = Vec::with_capacity(current_size as usize);
        for _ in 0..current_size {
            let (key, n) = CommonCodec::decode_bytes(&bytes[offset..], key_size)?;
            offset += n;
            let (rid_page_id, n) = CommonCodec::decode_u32(&bytes[offset..])?;
            offset += n;
            let (rid_slot, n) = CommonCodec::decode_u32(&bytes[offset..])?;
            offset += n;
            array.push((key, RecordId::new(rid_page_id, rid_slot)));
        }

        Ok(BPlusTreeLeafPage {
            header: BPlusTreeLeafPageHeader {
                page_id,
                parent_page_id,
                current_size,
                max_size,
                next_page_id,
            },
            array,
        })
    }
}

/// Layout mirrors the leaf, minus the next pointer; slot 0's key is
/// zero-filled on disk and decoded back to the empty sentinel.
pub struct BPlusTreeInternalPageCodec;

impl BPlusTreeInternalPageCodec {
    pub fn encode(page: &BPlusTreeInternalPage, key_size: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PAGE_SIZE);
        CommonCodec::encode_u8(PAGE_TYPE_INTERNAL, &mut buf);
        CommonCodec::encode_u32(page.header.page_id, &mut buf);
        CommonCodec::encode_u32(page.header.parent_page_id, &mut buf);
        CommonCodec::encode_u32(page.header.current_size, &mut buf);
        CommonCodec::encode_u32(page.header.max_size, &mut buf);
        for (index, (key, child)) in page.array.iter().enumerate() {
            if index == 0 {
                CommonCodec::encode_bytes(&vec![0; key_size], &mut buf);
            } else {
                debug_assert_eq!(key.len(), key_size);
                CommonCodec::encode_bytes(key, &mut buf);
            }
            CommonCodec::encode_u32(*child, &mut buf);
        }
        debug_assert!(buf.len() <= PAGE_SIZE);
        buf.resize(PAGE_SIZE, 0);
        buf
    }

    pub fn decode(bytes: &[u8], key_size: usize) -> VellumDBResult<BPlusTreeInternalPage> {
        let mut offset = 0;
        let (page_type, n) = CommonCodec::decode_u8(&bytes[offset..])?;
        offset += n;
        if page_type != PAGE_TYPE_INTERNAL {
            return Err(VellumDBError::Storage(format!(
                "expected internal page, found type {}",
                page_type
            )));
        }
        let (page_id, n) = CommonCodec::decode_u32(&bytes[offset..])?;
        offset += n;
        let (parent_page_id, n) = CommonCodec::decode_u32(&bytes[offset..])?;
        offset += n;
        let (current_size, n) = CommonCodec::decode_u32(&bytes[offset..])?;
        offset += n;
        let (max_size, n) = CommonCodec::decode_u32(&bytes[offset..])?;
        offset += n;

        let mut array = Vec::with_capacity(current_size as usize);
        for index in 0..current_size {
            let (key, n) = CommonCodec::decode_bytes(&bytes[offset..], key_size)?;
            offset += n;
            let (child, n) = CommonCodec::decode_u32(&bytes[offset..])?;
            offset += n;
            if index == 0 {
                array.push((Vec::new(), child));
            } else {
                array.push((key, child));
            }
        }

        Ok(BPlusTreeInternalPage {
            header: BPlusTreeInternalPageHeader {
                page_id,
                parent_page_id,
                current_size,
                max_size,
            },
            array,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::INVALID_PAGE_ID;

    #[test]
    fn leaf_page_round_trip() {
        let mut leaf = BPlusTreeLeafPage::new(5, INVALID_PAGE_ID, 8);
        leaf.header.next_page_id = 9;
        for i in 1..=3u8 {
            leaf.array.push((vec![i; 4], RecordId::new(i as u32, 0)));
            leaf.header.current_size += 1;
        }
        let encoded = BPlusTreeLeafPageCodec::encode(&leaf, 4);
        assert_eq!(encoded.len(), PAGE_SIZE);
        let decoded = BPlusTreeLeafPageCodec::decode(&encoded, 4).unwrap();
        assert_eq!(decoded, leaf);
    }

    #[test]
    fn internal_page_round_trip() {
        let mut internal = BPlusTreeInternalPage::new(3, INVALID_PAGE_ID, 8);
        internal.insert_first(11);
        internal.array.push((vec![5; 4], 12));
        internal.array.push((vec![9; 4], 13));
        internal.header.current_size = 3;
        let encoded = BPlusTreeInternalPageCodec::encode(&internal, 4);
        let decoded = BPlusTreeInternalPageCodec::decode(&encoded, 4).unwrap();
        assert_eq!(decoded, internal);
    }

    #[test]
    fn dispatching_codec_reads_type_tag() {
        let leaf = BPlusTreeLeafPage::new(5, INVALID_PAGE_ID, 8);
        let encoded = BPlusTreePageCodec::encode(&BPlusTreePage::Leaf(leaf.clone()), 4);
        match BPlusTreePageCodec::decode(&encoded, 4).unwrap() {
            BPlusTreePage::Leaf(decoded) => assert_eq!(decoded, leaf),
            BPlusTreePage::Internal(_) => panic!("wrong page type"),
        }
    }

    #[test]
    fn zeroed_page_is_rejected() {
        let zeroed = vec![0u8; PAGE_SIZE];
        assert!(BPlusTreePageCodec::decode(&zeroed, 4).is_err());
    }
}
