//! Auto-hibernate idle timer (AHIT) register encoding.
//!
//! The timer field holds bits 9:0 and the scale bits 12:10. Each scale step multiplies by ten,
//! starting at 1 µs.

pub const AHIT_TIMER_MASK: u32 = 0x3FF;
pub const AHIT_SCALE_SHIFT: u32 = 10;
pub const AHIT_SCALE_MASK: u32 = 0x7 << AHIT_SCALE_SHIFT;
const AHIT_SCALE_FACTOR: u32 = 10;
const AHIT_MAX_SCALE: u32 = 5;

/// Encode an idle time in microseconds. Zero disables auto-hibernate.
///
/// Values that need more than the largest scale saturate at the maximum representable timer.
pub fn ahit_from_micros(micros: u32) -> u32 {
    let mut timer = micros;
    let mut scale = 0;
    while timer > AHIT_TIMER_MASK {
        if scale == AHIT_MAX_SCALE {
            timer = AHIT_TIMER_MASK;
            break;
        }
        timer /= AHIT_SCALE_FACTOR;
        scale += 1;
    }
    (timer & AHIT_TIMER_MASK) | (scale << AHIT_SCALE_SHIFT)
}

/// Decode a register value back to microseconds.
pub fn ahit_to_micros(ahit: u32) -> u64 {
    let timer = (ahit & AHIT_TIMER_MASK) as u64;
    let scale = (ahit & AHIT_SCALE_MASK) >> AHIT_SCALE_SHIFT;
    timer * (AHIT_SCALE_FACTOR as u64).pow(scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_values_use_unit_scale() {
        assert_eq!(ahit_from_micros(0), 0);
        assert_eq!(ahit_from_micros(1023), 1023);
        assert_eq!(ahit_to_micros(1023), 1023);
    }

    #[test]
    fn milliseconds_scale_up() {
        // 150ms -> 150 * 10^3 µs
        let ahit = ahit_from_micros(150_000);
        assert_eq!(ahit & AHIT_TIMER_MASK, 150);
        assert_eq!((ahit & AHIT_SCALE_MASK) >> AHIT_SCALE_SHIFT, 3);
        assert_eq!(ahit_to_micros(ahit), 150_000);
    }

    #[test]
    fn huge_values_saturate() {
        let ahit = ahit_from_micros(u32::MAX);
        assert_eq!(ahit & AHIT_TIMER_MASK, AHIT_TIMER_MASK);
        assert_eq!((ahit & AHIT_SCALE_MASK) >> AHIT_SCALE_SHIFT, AHIT_MAX_SCALE);
    }
}
