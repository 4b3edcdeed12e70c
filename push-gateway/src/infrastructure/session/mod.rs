pub mod client;
pub mod rate_limit;
pub mod session;
pub mod session_mgr;

pub use client::{Client, ConnMeta};
pub use rate_limit::CommandLimiter;
pub use session::{
    FrameHandler, ProtocolVersion, Session, SessionListener, SessionOptions, WriteClass,
};
pub use session_mgr::{AdmissionPolicy, SessionMgr};
