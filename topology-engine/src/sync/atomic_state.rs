use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};

/// Explicit mapping between a state enum and the byte stored in an
/// [`AtomicState`]. `from_raw` must accept every value `to_raw` produces.
pub trait StateRepr: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    fn to_raw(self) -> u8;
    fn from_raw(raw: u8) -> Option<Self>;
}

/// Lock-free cell holding one value of a closed enumeration.
pub struct AtomicState<S: StateRepr> {
    raw: AtomicU8,
    _marker: PhantomData<S>,
}

impl<S: StateRepr> AtomicState<S> {
    pub fn new(initial: S) -> Self {
        Self {
            raw: AtomicU8::new(initial.to_raw()),
            _marker: PhantomData,
        }
    }

    pub fn load(&self) -> S {
        Self::decode(self.raw.load(Ordering::Acquire))
    }

    pub fn store(&self, state: S) {
        self.raw.store(state.to_raw(), Ordering::Release);
    }

    pub fn swap(&self, state: S) -> S {
        Self::decode(self.raw.swap(state.to_raw(), Ordering::AcqRel))
    }

    /// Moves `current -> new`. On failure returns the state actually held.
    pub fn compare_exchange(&self, current: S, new: S) -> Result<S, S> {
        self.raw
            .compare_exchange(current.to_raw(), new.to_raw(), Ordering::AcqRel, Ordering::Acquire)
            .map(Self::decode)
            .map_err(Self::decode)
    }

    /// Moves to `new` from any state accepted by `allowed`, retrying on races.
    /// Returns the previous state, or the rejected one.
    pub fn transition<F>(&self, new: S, allowed: F) -> Result<S, S>
    where
        F: Fn(S) -> bool,
    {
        let mut current = self.load();
        loop {
            if !allowed(current) {
                return Err(current);
            }
            match self.compare_exchange(current, new) {
                Ok(prev) => return Ok(prev),
                Err(actual) => current = actual,
            }
        }
    }

    fn decode(raw: u8) -> S {
        match S::from_raw(raw) {
            Some(state) => state,
            None => unreachable!("AtomicState holds unmapped value {}", raw),
        }
    }
}

impl<S: StateRepr> fmt::Debug for AtomicState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("AtomicState").field(&self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Light {
        Red,
        Yellow,
        Green,
    }

    impl StateRepr for Light {
        fn to_raw(self) -> u8 {
            match self {
                Light::Red => 0,
                Light::Yellow => 1,
                Light::Green => 2,
            }
        }

        fn from_raw(raw: u8) -> Option<Self> {
            match raw {
                0 => Some(Light::Red),
                1 => Some(Light::Yellow),
                2 => Some(Light::Green),
                _ => None,
            }
        }
    }

    #[test]
    fn test_compare_exchange() {
        let cell = AtomicState::new(Light::Red);
        assert_eq!(cell.compare_exchange(Light::Red, Light::Green), Ok(Light::Red));
        assert_eq!(cell.compare_exchange(Light::Red, Light::Yellow), Err(Light::Green));
        assert_eq!(cell.load(), Light::Green);
        assert_eq!(cell.swap(Light::Yellow), Light::Green);
    }

    #[test]
    fn test_transition_guard() {
        let cell = AtomicState::new(Light::Yellow);
        assert_eq!(cell.transition(Light::Red, |s| s != Light::Green), Ok(Light::Yellow));
        assert_eq!(cell.transition(Light::Green, |s| s == Light::Yellow), Err(Light::Red));
        assert_eq!(cell.load(), Light::Red);
    }

    #[test]
    fn test_single_winner_under_contention() {
        let cell = Arc::new(AtomicState::new(Light::Red));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                std::thread::spawn(move || cell.compare_exchange(Light::Red, Light::Green).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
