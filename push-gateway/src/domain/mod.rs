pub mod model;
pub mod repository;
pub mod service;

pub use model::{
    Action, ActionKind, MessageKind, PublicMessage, PushMode, SessionBrief, TopicConf,
    TopicScope, TopicSet, UserSnapshot,
};
pub use repository::{Authenticator, FrameReader, FrameWriter, Identity};
pub use service::{AcceptorFilter, GrayList, SyncEntry};
