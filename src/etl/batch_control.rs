//! Adaptive batch count.

/// Number of range pipelines launched per iteration, kept in `[1, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchControl {
    current: usize,
    max: usize,
}

impl BatchControl {
    pub fn new(initial: usize, max: usize) -> Self {
        let max = max.max(1);
        Self {
            current: initial.clamp(1, max),
            max,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// `min(ceil(current * 1.1), max)`
    pub fn increase(&mut self) -> usize {
        self.current = (self.current.saturating_mul(11).saturating_add(9) / 10).min(self.max);
        self.current
    }

    /// `max(floor(current * 0.9), 1)`
    pub fn decrease(&mut self) -> usize {
        self.current = (self.current.saturating_mul(9) / 10).max(1);
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increase_rounds_up() {
        let mut control = BatchControl::new(1, 100);
        assert_eq!(control.increase(), 2);
        let mut control = BatchControl::new(10, 100);
        assert_eq!(control.increase(), 11);
        let mut control = BatchControl::new(5, 100);
        assert_eq!(control.increase(), 6);
    }

    #[test]
    fn test_decrease_rounds_down() {
        let mut control = BatchControl::new(10, 100);
        assert_eq!(control.decrease(), 9);
        let mut control = BatchControl::new(5, 100);
        assert_eq!(control.decrease(), 4);
        let mut control = BatchControl::new(1, 100);
        assert_eq!(control.decrease(), 1);
    }

    #[test]
    fn test_bounds_hold_for_any_sequence() {
        let mut control = BatchControl::new(0, 7);
        assert_eq!(control.current(), 1);
        for step in 0..200u32 {
            if step.count_ones() % 2 == 0 {
                control.increase();
            } else {
                control.decrease();
            }
            assert!((1..=7).contains(&control.current()));
        }
        for _ in 0..50 {
            control.increase();
        }
        assert_eq!(control.current(), 7);
    }
}
