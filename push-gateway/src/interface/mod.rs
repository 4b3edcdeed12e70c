//! 接口层：后端业务流、WebSocket 接入与内存连接

pub mod backend;
pub mod memory;
pub mod websocket;

pub use backend::{BackendListener, BackendProbe, BackendStreamDriver};
pub use memory::{MemoryPeer, MemoryReader, MemoryWriter, memory_pair};
pub use websocket::{JsonFrameHandler, WebSocketServer};
