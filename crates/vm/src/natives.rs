//! Native functions bootstrapped into the globals at VM startup.

use lox_core::value::Value;
use std::sync::OnceLock;
use std::time::Instant;

static START: OnceLock<Instant> = OnceLock::new();

/// Pin the clock's epoch to VM construction time.
pub(crate) fn init_clock() {
    START.get_or_init(Instant::now);
}

/// `clock()`: seconds since process start, as a number.
pub(crate) fn clock(_args: &[Value]) -> Value {
    Value::Number(START.get_or_init(Instant::now).elapsed().as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        init_clock();
        let a = clock(&[]);
        let b = clock(&[]);
        match (a, b) {
            (Value::Number(a), Value::Number(b)) => assert!(b >= a && a >= 0.0),
            _ => panic!("clock must return numbers"),
        }
    }
}
