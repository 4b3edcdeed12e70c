pub mod delta_worker;
pub mod full_worker;
pub mod public_mgr;
pub mod worker;

pub use delta_worker::{DeltaState, DeltaWorker};
pub use full_worker::FullWorker;
pub use public_mgr::PublicMgr;
pub use worker::{PublicWorker, PublicWorkerStats};
