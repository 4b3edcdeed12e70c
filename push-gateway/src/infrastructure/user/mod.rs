pub mod user;
pub mod user_mgr;

pub use user::User;
pub use user_mgr::{BIND_MAX_ATTEMPTS, UserMgr};
