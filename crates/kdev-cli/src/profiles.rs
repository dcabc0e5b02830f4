//! The `fstests_default` device-pool volume profile: when a caller
//! names a `device_pool_name` but omits an explicit volume list, this
//! is what gets allocated in its place.

use kdev_core::model::VolumeSpec;

const DEFAULT_VOLUME_SIZE: &str = "10G";
const POOL_VOLUME_COUNT: u32 = 5;

/// Seven 10 GiB volumes: `test`, `scratch`, `pool1..pool5`, each
/// carrying the environment variable name the fstests harness (or a
/// test case that asks for an LVM-backed scratch pool) expects it
/// under.
pub fn fstests_default_profile() -> Vec<VolumeSpec> {
    let mut specs = vec![
        VolumeSpec {
            name: "test".to_string(),
            size: DEFAULT_VOLUME_SIZE.to_string(),
            order: 0,
            env_var: Some("TEST_DEV".to_string()),
        },
        VolumeSpec {
            name: "scratch".to_string(),
            size: DEFAULT_VOLUME_SIZE.to_string(),
            order: 1,
            env_var: Some("SCRATCH_DEV".to_string()),
        },
    ];
    for i in 1..=POOL_VOLUME_COUNT {
        specs.push(VolumeSpec {
            name: format!("pool{i}"),
            size: DEFAULT_VOLUME_SIZE.to_string(),
            order: 1 + i,
            env_var: Some(format!("POOL_DEV{i}")),
        });
    }
    specs
}
