pub mod connection;
pub mod handler;

pub use connection::{WebSocketServer, WsReader, WsWriter, conn_meta, parse_query};
pub use handler::{JsonFrameHandler, encode_reply};
