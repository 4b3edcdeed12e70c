pub mod action;
pub mod public_message;
pub mod topic_set;
pub mod user_state;

pub use action::{Action, ActionKind};
pub use public_message::{MessageKind, PublicMessage, PushMode, TopicConf, TopicScope};
pub use topic_set::{TopicSet, sorted_intersects};
pub use user_state::{SessionBrief, UserSnapshot};
