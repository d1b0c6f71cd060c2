pub mod cache;
pub mod extendible_hash;
