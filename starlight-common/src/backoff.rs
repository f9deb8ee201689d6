use std::cmp::min;
use std::time::Duration;

const INITIAL_WAIT_MS: u64 = 100;
const MAXIMUM_WAIT_MS: u64 = 32_000;
const EXP_BASE: u64 = 2;

/// An iterator of [`Duration`]s for exponential backoff, used by the task
/// basket runner (base 100ms, capped) and by the indefinite faucet-funding
/// retry in `ConfigInit`.
///
/// ```
/// # use starlight_common::backoff;
/// let mut it = backoff::get_backoff_iter();
/// assert_eq!(it.next().unwrap().as_millis(), 100);
/// assert_eq!(it.next().unwrap().as_millis(), 200);
/// ```
pub fn get_backoff_iter() -> impl Iterator<Item = Duration> {
    (0u32..).map(|index| {
        let factor = EXP_BASE.saturating_pow(index);
        let wait_ms = INITIAL_WAIT_MS.saturating_mul(factor);
        Duration::from_millis(min(wait_ms, MAXIMUM_WAIT_MS))
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn no_integer_overflow() {
        let mut it = get_backoff_iter();
        for _ in 0..200 {
            it.next();
        }
    }

    #[test]
    fn caps_at_maximum() {
        let mut it = get_backoff_iter();
        let last = it.by_ref().take(50).last().unwrap();
        assert_eq!(last.as_millis() as u64, MAXIMUM_WAIT_MS);
    }
}
