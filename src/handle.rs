/// This file contains the encoding of kcov remote handles. A handle is an
/// opaque registration key: the subsystem id lives in the top byte and the
/// instance id in the low 32 bits. The kernel never dereferences it

pub const SUBSYSTEM_COMMON: u64 = 0x00 << 56;
pub const SUBSYSTEM_USB: u64 = 0x01 << 56;

const SUBSYSTEM_MASK: u64 = 0xff << 56;
const INSTANCE_MASK: u64 = 0xffff_ffff;

// Shift between a subsystem number and its position in the handle
const SUBSYSTEM_SHIFT: u32 = 56;

/// Combine an already shifted subsystem (`SUBSYSTEM_*`) with an instance id.
/// Any stray bits yield 0, which is also "common, instance 0", so callers
/// must never rely on 0/0 meaning anything
#[inline]
pub fn remote_handle(subsystem: u64, instance: u64) -> u64 {
    if subsystem & !SUBSYSTEM_MASK != 0 || instance & !INSTANCE_MASK != 0 {
        return 0;
    }

    subsystem | instance
}

/// Same as `remote_handle` but takes the subsystem as a plain number
#[inline]
pub fn encode(subsystem: u64, instance: u64) -> u64 {
    if subsystem > 0xff {
        return 0;
    }

    remote_handle(subsystem << SUBSYSTEM_SHIFT, instance)
}

/// Split a handle into (subsystem number, instance id)
#[inline]
pub fn decode(handle: u64) -> (u64, u64) {
    (
        (handle & SUBSYSTEM_MASK) >> SUBSYSTEM_SHIFT,
        handle & INSTANCE_MASK,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn usb_max_instance() {
        assert_eq!(encode(1, 0xFFFF_FFFF), (1 << 56) | 0xFFFF_FFFF);
        assert_eq!(
            remote_handle(SUBSYSTEM_USB, 0xFFFF_FFFF),
            (1 << 56) | 0xFFFF_FFFF
        );
    }

    #[test]
    fn oversized_subsystem_is_rejected() {
        assert_eq!(encode(256, 0), 0);
    }

    #[test]
    fn unshifted_subsystem_is_rejected() {
        // Subsystem bits below the top byte are illegal
        assert_eq!(remote_handle(1, 5), 0);
    }

    #[test]
    fn common_subsystem_keeps_instance() {
        assert_eq!(remote_handle(SUBSYSTEM_COMMON, 7), 7);
    }

    proptest! {
        #[test]
        fn valid_pairs_round_trip(subsystem in 0u64..256, instance in 0u64..=0xFFFF_FFFF) {
            prop_assert_eq!(decode(encode(subsystem, instance)), (subsystem, instance));
        }

        #[test]
        fn wide_instances_encode_to_zero(subsystem in 0u64..256, instance in 0x1_0000_0000u64..) {
            prop_assert_eq!(encode(subsystem, instance), 0);
        }

        #[test]
        fn wide_subsystems_encode_to_zero(subsystem in 256u64.., instance in 0u64..=0xFFFF_FFFF) {
            prop_assert_eq!(encode(subsystem, instance), 0);
        }
    }
}
