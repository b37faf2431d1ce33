//! Filesystem primitives shared across features.

pub mod atomic;
pub mod copy;
pub mod lock;
pub mod tree_hash;

pub use atomic::{read_json, write_atomic, write_json_atomic};
pub use copy::{copy_tree, remove_path_if_exists};
pub use lock::{LockFile, LockHolder};
pub use tree_hash::{TreeDigest, digest_tree};
