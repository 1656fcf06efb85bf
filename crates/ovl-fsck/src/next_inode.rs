//! Next-inode-number consistency check.

use crate::finding::Finding;
use ovl_error::{FsckError, Result};
use ovl_store::NextInodeNumberState;
use ovl_types::InodeNumber;

/// Compare the stored counter against the largest inode seen in the scan.
///
/// A stored value above `max_inode` is accepted as is; allocation skipping a
/// few numbers is harmless.
///
/// Fails with [`FsckError::Format`] when `max_inode` is the last representable
/// number, since no counter value can then be correct.
pub fn validate(state: &NextInodeNumberState, max_inode: InodeNumber) -> Result<Option<Finding>> {
    let correct_value = max_inode.successor().ok_or_else(|| {
        FsckError::Format(format!("inode {max_inode} leaves no number to allocate next"))
    })?;
    Ok(match state {
        NextInodeNumberState::Missing => Some(Finding::MissingNextInodeNumber { correct_value }),
        NextInodeNumberState::Corrupt { .. } => {
            Some(Finding::CorruptNextInodeNumber { correct_value })
        }
        NextInodeNumberState::Present(read_value) if *read_value <= max_inode => {
            Some(Finding::BadNextInodeNumber {
                read_value: *read_value,
                correct_value,
            })
        }
        NextInodeNumberState::Present(_) => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: InodeNumber = InodeNumber(64);

    #[test]
    fn distinguishes_the_three_failure_kinds() {
        let correct_value = InodeNumber(65);
        assert_eq!(
            validate(&NextInodeNumberState::Missing, MAX).unwrap(),
            Some(Finding::MissingNextInodeNumber { correct_value })
        );
        assert_eq!(
            validate(
                &NextInodeNumberState::Corrupt {
                    raw: b"abc".to_vec()
                },
                MAX
            )
            .unwrap(),
            Some(Finding::CorruptNextInodeNumber { correct_value })
        );
        assert_eq!(
            validate(&NextInodeNumberState::Present(InodeNumber(64)), MAX).unwrap(),
            Some(Finding::BadNextInodeNumber {
                read_value: InodeNumber(64),
                correct_value,
            })
        );
    }

    #[test]
    fn equal_or_larger_successor_is_fine() {
        assert_eq!(validate(&NextInodeNumberState::Present(InodeNumber(65)), MAX).unwrap(), None);
        assert_eq!(validate(&NextInodeNumberState::Present(InodeNumber(9000)), MAX).unwrap(), None);
    }

    #[test]
    fn last_representable_inode_is_a_format_error() {
        let max = InodeNumber(u64::MAX);
        assert!(matches!(
            validate(&NextInodeNumberState::Present(max), max),
            Err(FsckError::Format(_))
        ));
        assert!(matches!(
            validate(&NextInodeNumberState::Missing, max),
            Err(FsckError::Format(_))
        ));
    }
}
