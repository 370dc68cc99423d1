use std::time::Duration;

/// Level-sampling debouncer for a push button. Fed raw samples from the main
/// loop together with a monotonic time-since-boot; reports a press once the
/// pressed level has held stable through the debounce interval, exactly once
/// per physical press.
#[derive(Debug)]
pub struct DebouncedButton {
    debounce: Duration,
    stable_pressed: bool,
    candidate_pressed: bool,
    candidate_since: Duration,
}

impl DebouncedButton {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            stable_pressed: false,
            candidate_pressed: false,
            candidate_since: Duration::ZERO,
        }
    }

    /// Feed one sample taken `at` time since boot. Returns `true` on the
    /// debounced press edge; releases and bounce never report.
    pub fn update(&mut self, pressed: bool, at: Duration) -> bool {
        if pressed != self.candidate_pressed {
            self.candidate_pressed = pressed;
            self.candidate_since = at;
        }

        if self.candidate_pressed != self.stable_pressed
            && at.saturating_sub(self.candidate_since) >= self.debounce
        {
            self.stable_pressed = self.candidate_pressed;
            return self.stable_pressed;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn button() -> DebouncedButton {
        DebouncedButton::new(ms(50))
    }

    #[test]
    fn stable_press_reports_exactly_once() {
        let mut button = button();
        assert_eq!(button.update(true, ms(0)), false);
        assert_eq!(button.update(true, ms(30)), false);
        assert_eq!(button.update(true, ms(60)), true);
        // Held down: no repeat.
        assert_eq!(button.update(true, ms(200)), false);
        assert_eq!(button.update(true, ms(2_000)), false);
    }

    #[test]
    fn short_glitch_never_reports() {
        let mut button = button();
        assert_eq!(button.update(true, ms(0)), false);
        assert_eq!(button.update(false, ms(20)), false);
        assert_eq!(button.update(false, ms(100)), false);
    }

    #[test]
    fn bounce_during_press_collapses_to_one_report() {
        let mut button = button();
        button.update(true, ms(0));
        button.update(false, ms(5));
        button.update(true, ms(12));
        button.update(false, ms(18));
        assert_eq!(button.update(true, ms(25)), false);
        assert_eq!(button.update(true, ms(80)), true);
        assert_eq!(button.update(true, ms(120)), false);
    }

    #[test]
    fn release_then_press_reports_again() {
        let mut button = button();
        button.update(true, ms(0));
        assert_eq!(button.update(true, ms(60)), true);
        button.update(false, ms(100));
        assert_eq!(button.update(false, ms(160)), false);
        button.update(true, ms(200));
        assert_eq!(button.update(true, ms(260)), true);
    }
}
