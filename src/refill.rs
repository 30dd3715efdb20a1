/// Converts the elapsed time reported by replenishment ticks into whole tokens.
///
/// Ticks rarely fire after exactly one token's worth of time, so the fraction
/// that did not make up a whole token is kept in `leftovers` and carried into
/// the next tick. Without it the bucket would drift below its configured rate.
#[derive(Debug, Clone)]
pub(crate) struct Refill {
    seconds_per_token: f64,
    // invariant: 0 <= leftovers < seconds_per_token
    leftovers: f64,
}

impl Refill {
    pub fn new(seconds_per_token: f64) -> Self {
        debug_assert!(seconds_per_token > 0.0);
        Self {
            seconds_per_token,
            leftovers: 0.0,
        }
    }

    /// Whole tokens earned by a tick that fired `elapsed` seconds after it was
    /// armed.
    ///
    /// At most one extra token is carried per tick; the bucket does not try to
    /// make up for stalls beyond that.
    pub fn credit(&mut self, elapsed: f64) -> u64 {
        let elapsed = elapsed.max(0.0);
        let mut whole = (elapsed / self.seconds_per_token).floor();
        self.leftovers += elapsed - whole * self.seconds_per_token;
        if self.leftovers >= self.seconds_per_token {
            self.leftovers -= self.seconds_per_token;
            whole += 1.0;
        }
        // float error in the subtraction above must not break the invariant
        self.leftovers = self.leftovers.clamp(0.0, self.seconds_per_token);
        whole as u64
    }

    pub fn leftovers(&self) -> f64 {
        self.leftovers
    }

    pub fn reset(&mut self) {
        self.leftovers = 0.0;
    }
}
