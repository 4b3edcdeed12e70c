pub mod listener;
pub mod probe;
pub mod stream;

pub use listener::BackendListener;
pub use probe::BackendProbe;
pub use stream::{BackendStreamDriver, backend_codec, decode_frame, encode_frame};
