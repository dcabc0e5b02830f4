//! Device Pool Manager: turns a raw block device into a persistent
//! LVM volume group, then hands out ephemeral per-session logical
//! volumes against it.
//!
//! A pool holds no LVs of its own between sessions — only its VG
//! metadata is persisted. LVs are created on demand by
//! [`pool::allocate_volumes`] and torn down by
//! [`pool::release_volumes`]; [`state_store`] is the cross-process
//! ledger that makes orphan sweeping possible when a caller dies
//! mid-session.

pub mod catalog;
pub mod pool;
pub mod state_store;

pub use catalog::PoolCatalog;
pub use pool::LvmPoolManager;
pub use state_store::VolumeStateStore;
