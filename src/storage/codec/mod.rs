pub mod btree_page;
pub mod common;
pub mod hash_page;

pub use btree_page::{BPlusTreeInternalPageCodec, BPlusTreeLeafPageCodec, BPlusTreePageCodec};
pub use hash_page::{HashBucketPageCodec, HashDirectoryPageCodec};
