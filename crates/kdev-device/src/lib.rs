//! Null-blk driver, loop/tmpfs backing, and the VM Device Manager that
//! sits on top of both to resolve a VM session's device list.

pub mod loopback;
pub mod null_blk;
pub mod vm_device_manager;

pub use loopback::{LoopDevice, LoopDeviceSet, LoopSetupSpec};
pub use null_blk::{NullBlkOptions, NullBlkSupport};
pub use vm_device_manager::DeviceManager;
