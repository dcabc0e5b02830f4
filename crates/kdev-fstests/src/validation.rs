//! Validation of the raw fstests test-selection arguments (`-g quick`,
//! `generic/001`, `-x btrfs/050`, ...) before they reach the guest.
//!
//! `-g` selects a *group*, never an individual test; passing something
//! shaped like `{suite}/{number}` after `-g` is a common typo (the
//! harness itself accepts it silently and then runs zero tests, since
//! no group by that name exists) and is rejected here instead.

/// `true` for anything shaped like `suite/number`, e.g. `btrfs/010`.
fn looks_like_individual_test(arg: &str) -> bool {
    arg.contains('/')
}

/// Filesystems `setup_script::generate_device_setup_script` knows a
/// built-in `mkfs.{fstype}` invocation for.
const KNOWN_FSTYPES: &[&str] = &["ext4", "xfs", "btrfs", "f2fs"];

/// Reject an `fstype` this crate has no built-in `mkfs` invocation for
/// unless the caller also supplied `custom_mkfs_command`. Checked
/// before any device is allocated, matching every other pre-flight
/// check in this module.
pub fn validate_fstype(fstype: &str, custom_mkfs_command: Option<&str>) -> Result<(), String> {
    if KNOWN_FSTYPES.contains(&fstype) || custom_mkfs_command.is_some() {
        return Ok(());
    }
    Err(format!(
        "unknown fstype '{fstype}' has no built-in mkfs invocation; \
         pass 'custom_mkfs_command' to format it"
    ))
}

/// Validate a flat argv of fstests test-selection arguments.
///
/// Returns `Err` with a human-readable explanation the moment `-g` is
/// found with no following argument, or with an individual test name
/// instead of a group name.
pub fn validate_test_args(args: &[String]) -> Result<(), String> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == "-g" {
            let Some(next) = args.get(i + 1) else {
                return Err("'-g' requires a group name argument (e.g. '-g quick')".to_string());
            };
            if looks_like_individual_test(next) {
                return Err(format!(
                    "'-g' selects test groups, not individual tests: got '{next}'. \
                     To run individual tests, pass them without '-g', e.g. [{next:?}]"
                ));
            }
            i += 2;
        } else {
            i += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn empty_list_is_valid() {
        assert!(validate_test_args(&[]).is_ok());
    }

    #[test]
    fn group_selection_is_valid() {
        assert!(validate_test_args(&args(&["-g", "quick"])).is_ok());
        assert!(validate_test_args(&args(&["-g", "auto"])).is_ok());
        assert!(validate_test_args(&args(&["-g", "quick", "-g", "auto"])).is_ok());
    }

    #[test]
    fn individual_test_names_are_valid_without_g() {
        assert!(validate_test_args(&args(&["btrfs/010"])).is_ok());
        assert!(validate_test_args(&args(&["btrfs/010", "generic/001", "xfs/100"])).is_ok());
    }

    #[test]
    fn mixed_group_and_excluded_test_is_valid() {
        assert!(validate_test_args(&args(&["-g", "quick", "-x", "btrfs/050"])).is_ok());
    }

    #[test]
    fn group_flag_followed_by_individual_test_is_rejected() {
        for suite_test in ["btrfs/010", "generic/001", "xfs/100", "ext4/001"] {
            let err = validate_test_args(&args(&["-g", suite_test])).unwrap_err();
            assert!(err.contains(suite_test));
            assert!(err.contains("-g"));
            assert!(err.to_lowercase().contains("group"));
        }
    }

    #[test]
    fn group_flag_with_no_argument_is_rejected() {
        let err = validate_test_args(&args(&["-g"])).unwrap_err();
        assert!(err.to_lowercase().contains("requires"));
    }

    #[test]
    fn second_group_flag_in_a_mixed_list_is_still_checked() {
        let err = validate_test_args(&args(&["-g", "quick", "-g", "btrfs/010"])).unwrap_err();
        assert!(err.contains("btrfs/010"));
    }

    #[test]
    fn error_message_suggests_dropping_the_flag() {
        let err = validate_test_args(&args(&["-g", "btrfs/010"])).unwrap_err();
        assert!(err.contains("without '-g'"));
    }

    #[test]
    fn known_fstypes_are_valid_without_custom_mkfs() {
        for fstype in ["ext4", "xfs", "btrfs", "f2fs"] {
            assert!(validate_fstype(fstype, None).is_ok());
        }
    }

    #[test]
    fn unknown_fstype_without_custom_mkfs_is_rejected() {
        let err = validate_fstype("nilfs2", None).unwrap_err();
        assert!(err.contains("nilfs2"));
        assert!(err.contains("custom_mkfs_command"));
    }

    #[test]
    fn unknown_fstype_with_custom_mkfs_is_accepted() {
        assert!(validate_fstype("nilfs2", Some("mkfs.nilfs2 -L x")).is_ok());
    }
}
