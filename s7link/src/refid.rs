use std::sync::atomic::{AtomicU32, Ordering};

/// Monotone PDU reference generator.
///
/// Yields values in `(0, 0xFFFF]`; zero stays reserved for unsolicited
/// indications. Wrap-around is serialised through the compare-and-set loop
/// so no two concurrent callers observe the same value.
#[derive(Debug, Default)]
pub struct PduRefGenerator {
    counter: AtomicU32,
}

impl PduRefGenerator {
    pub const fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
        }
    }

    pub fn next(&self) -> u16 {
        loop {
            let current = self.counter.load(Ordering::Relaxed);
            let next = if current >= u16::MAX as u32 {
                1
            } else {
                current + 1
            };
            if self
                .counter
                .compare_exchange(current, next, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return next as u16;
            }
        }
    }
}
