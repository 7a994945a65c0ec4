//! kiln Storage - Record Codec and Disk Store
//!
//! Encodes cache records as `metadata-json \n blob` and stores one file per
//! key under the cache directory with atomic temp-file-and-rename writes.

pub mod codec;
pub mod disk;

pub use codec::{decode, encode, PayloadSpan, METADATA_DELIMITER, RESERVED_FIELDS};
pub use disk::{
    file_name_for_key, is_storable_key, key_for_file_name, DiskStore, RecordStore,
    SEPARATOR_SUBSTITUTE, TEMP_PREFIX,
};
