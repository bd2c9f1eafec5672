pub mod normalize;

pub use normalize::{join_repo_path, normalize_prefix, PathError};
