use crate::model::*;

/// Candidate start times over a set of open windows.
///
/// Within each window the starts are `w.start, w.start + step, ...` while
/// `t + occupied <= w.end`; stepping restarts at the next window. Clone the
/// iterator to replay it.
#[derive(Debug, Clone)]
pub struct SlotCandidates<'a> {
    windows: &'a [Span],
    step: Ms,
    occupied: Ms,
    window: usize,
    next: Option<Ms>,
}

impl<'a> SlotCandidates<'a> {
    pub fn new(windows: &'a [Span], step: Ms, occupied: Ms) -> Self {
        debug_assert!(step > 0, "slot step must be positive");
        Self {
            windows,
            step,
            occupied,
            window: 0,
            next: windows.first().map(|w| w.start),
        }
    }
}

impl Iterator for SlotCandidates<'_> {
    type Item = Ms;

    fn next(&mut self) -> Option<Ms> {
        loop {
            let w = self.windows.get(self.window)?;
            if let Some(t) = self.next
                && t + self.occupied <= w.end
            {
                self.next = Some(t + self.step);
                return Some(t);
            }
            self.window += 1;
            self.next = self.windows.get(self.window).map(|w| w.start);
        }
    }
}

/// True if `t` is one of the starts `SlotCandidates` would yield.
pub fn is_candidate(windows: &[Span], step: Ms, occupied: Ms, t: Ms) -> bool {
    windows
        .iter()
        .any(|w| t >= w.start && t + occupied <= w.end && (t - w.start) % step == 0)
}
