use crate::buffer::PAGE_SIZE;
use crate::error::{VellumDBError, VellumDBResult};
use crate::storage::codec::common::CommonCodec;
use crate::storage::page::hash_page::{HashBucketPage, HashDirectoryPage, DIRECTORY_ARRAY_SIZE};
use crate::storage::page::RecordId;

/// Layout: page_id u32 | global_depth u32 | local_depths (512 bytes) |
/// bucket_page_ids (512 * 4 bytes).
pub struct HashDirectoryPageCodec;

impl HashDirectoryPageCodec {
    pub fn encode(page: &HashDirectoryPage) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PAGE_SIZE);
        CommonCodec::encode_u32(page.page_id, &mut buf);
        CommonCodec::encode_u32(page.global_depth, &mut buf);
        CommonCodec::encode_bytes(&page.local_depths, &mut buf);
        for bucket_page_id in page.bucket_page_ids.iter() {
            CommonCodec::encode_u32(*bucket_page_id, &mut buf);
        }
        debug_assert!(buf.len() <= PAGE_SIZE);
        buf.resize(PAGE_SIZE, 0);
        buf
    }

    pub fn decode(bytes: &[u8]) -> VellumDBResult<HashDirectoryPage> {
        let mut offset = 0;
        let (page_id, n) = CommonCodec::decode_u32(&bytes[offset..])?;
        offset += n;
        let (global_depth, n) = CommonCodec::decode_u32(&bytes[offset..])?;
        offset += n;
        let (raw_depths, n) = CommonCodec::decode_bytes(&bytes[offset..], DIRECTORY_ARRAY_SIZE)?;
        offset += n;
        let mut local_depths = [0u8; DIRECTORY_ARRAY_SIZE];
        local_depths.copy_from_slice(&raw_depths);
        let mut bucket_page_ids = [0u32; DIRECTORY_ARRAY_SIZE];
        for slot in bucket_page_ids.iter_mut() {
            let (page_id, n) = CommonCodec::decode_u32(&bytes[offset..])?;
            offset += n;
            *slot = page_id;
        }
        Ok(HashDirectoryPage {
            page_id,
            global_depth,
            local_depths,
            bucket_page_ids,
        })
    }
}

/// Layout: max_size u32 | occupied bitmap | readable bitmap | slots
/// (key_size + 8 bytes each, including dead slots so bit indices stay
/// aligned).
pub struct HashBucketPageCodec;

impl HashBucketPageCodec {
    pub fn encode(page: &HashBucketPage, key_size: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PAGE_SIZE);
        CommonCodec::encode_u32(page.max_size, &mut buf);
        CommonCodec::encode_bytes(&page.occupied, &mut buf);
        CommonCodec::encode_bytes(&page.readable, &mut buf);
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

    pub fn decode(bytes: &[u8], key_size: usize) -> VellumDBResult<HashBucketPage> {
        let mut offset = 0;
        let (max_size, n) = CommonCodec::decode_u32(&bytes[offset..])?;
        offset += n;
        if max_size == 0 {
            return Err(VellumDBError::Storage(
                "hash bucket page with zero capacity".to_string(),
            ));
        }
        let bitmap_len = (max_size as usize).div_ceil(8);
        let (occupied, n) = CommonCodec::decode_bytes(&bytes[offset..], bitmap_len)?;
        offset += n;
        let (readable, n) = CommonCodec::decode_bytes(&bytes[offset..], bitmap_len)?;
        offset += n;
        let mut array = Vec::with_capacity(max_size as usize);
        for _ in 0..max_size {
            let (key, n) = CommonCodec::decode_bytes(&bytes[offset..], key_size)?;
            offset += n;
            let (rid_page_id, n) = CommonCodec::decode_u32(&bytes[offset..])?;
            offset += n;
            let (rid_slot, n) = CommonCodec::decode_u32(&bytes[offset..])?;
            offset += n;
            array.push((key, RecordId::new(rid_page_id, rid_slot)));
        }
        Ok(HashBucketPage {
            max_size,
            occupied,
            readable,
            array,
        })
    }
}
