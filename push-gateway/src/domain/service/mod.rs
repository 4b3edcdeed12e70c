pub mod shard;
pub mod sync_builder;

pub use shard::{GrayList, check_user_shard, validate_registration};
pub use sync_builder::{AcceptorFilter, SyncEntry, SyncSource, filter_entry, split_batches};
