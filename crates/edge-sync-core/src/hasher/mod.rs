pub mod checksum;

pub use checksum::{file_checksum, hash_data, parse_checksum_output, HashAlgorithm};
