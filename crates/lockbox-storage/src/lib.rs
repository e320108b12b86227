//! lockbox-storage: the on-device secure root and everything written into it

pub mod accountant;
pub mod metadata;
pub mod secure_dir;

pub use accountant::{file_size, FixedSpaceProbe, FsSpaceProbe, SpaceProbe, StorageAccountant};
pub use metadata::{read_sequence, remove_sequence, write_sequence};
pub use secure_dir::{is_valid_extension, protect_file, SecureRoot};
