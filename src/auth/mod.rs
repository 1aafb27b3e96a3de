pub mod api_key;
pub mod middleware;

pub use api_key::{generate_api_key, hash_api_key, hash_password, verify_password};
pub use middleware::{require_api_key, CurrentUser};
