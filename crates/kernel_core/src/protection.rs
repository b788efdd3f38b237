use hal::Errno;

use crate::config::VA_BITS;

/// First address past the range translated through TTBR0.
pub const USER_VA_END: u64 = 1 << VA_BITS;

/// Returns true if the given virtual address is in user space.
pub fn is_user_address(addr: u64) -> bool {
    addr < USER_VA_END
}

/// Validates that a user buffer lies entirely below [`USER_VA_END`].
pub fn validate_user_buffer(addr: u64, len: u64) -> Result<(), Errno> {
    if len == 0 {
        return Err(Errno::InvalidArg);
    }
    let end = addr.checked_add(len - 1).ok_or(Errno::InvalidArg)?;
    if is_user_address(addr) && is_user_address(end) {
        Ok(())
    } else {
        Err(Errno::Fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_OFFSET;

    #[test]
    fn user_address_check() {
        assert!(is_user_address(0x1000));
        assert!(is_user_address(USER_VA_END - 1));
        assert!(!is_user_address(USER_VA_END));
        assert!(!is_user_address(PAGE_OFFSET));
    }

    #[test]
    fn user_buffer_validation() {
        assert_eq!(validate_user_buffer(0x1000, 4), Ok(()));
        assert_eq!(validate_user_buffer(0x0, 0), Err(Errno::InvalidArg));
        assert_eq!(validate_user_buffer(USER_VA_END - 2, 4), Err(Errno::Fault));
    }

    #[test]
    fn user_buffer_overflow_is_invalid() {
        let result = validate_user_buffer(u64::MAX - 1, 4);
        assert_eq!(result, Err(Errno::InvalidArg));
    }
}
