pub mod acceptor;
pub mod acceptor_mgr;

pub use acceptor::{Acceptor, AcceptorOptions, AcceptorRegistration, AdminResponse};
pub use acceptor_mgr::AcceptorMgr;
