//! 应用层：交换器、对账任务、客户端命令与运维查询

pub mod commands;
pub mod event;
pub mod exchange;
pub mod queries;
pub mod ticker;

pub use commands::{ClientCommandService, CommandReply, MAX_TOPIC_LEN};
pub use event::{Event, SyncUsers};
pub use exchange::Exchange;
pub use queries::{AdminQueryService, ResyncTarget};
pub use ticker::{ReconcileReport, TickerMgr};
