// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::hint;

/// Exponential backoff for waiting on another CPU in a spin loop.
///
/// Every call to [`Backoff::spin`] issues `2^exp` spin loop hints and doubles the count for the
/// next call, up to `2^max`.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Backoff {
    exp: u8,
    max: u8,
}

impl Backoff {
    pub(crate) const MAX_EXPONENT: u8 = 8;

    pub(crate) const fn new() -> Self {
        Self {
            exp: 0,
            max: Self::MAX_EXPONENT,
        }
    }

    #[inline]
    pub(crate) fn spin(&mut self) {
        for _ in 0..1_u32 << self.exp {
            // hosted tests wait on other threads, give them the core
            #[cfg(test)]
            std::thread::yield_now();

            hint::spin_loop();
        }

        if self.exp < self.max {
            self.exp += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_the_maximum() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.exp, 0);

        backoff.spin();
        backoff.spin();
        assert_eq!(backoff.exp, 2);

        for _ in 0..16 {
            backoff.spin();
        }
        assert_eq!(backoff.exp, Backoff::MAX_EXPONENT);
    }
}
