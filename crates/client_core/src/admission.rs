use shared::domain::AdmissionStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advanced {
        from: AdmissionStatus,
        to: AdmissionStatus,
    },
    Unchanged,
}

/// Monotonic admission state for one identity.
///
/// Poll results and push notifications both feed [`AdmissionTracker::advance`];
/// whichever arrives first moves the state and every later signal for the
/// same or an earlier status is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionTracker {
    status: AdmissionStatus,
}

impl AdmissionTracker {
    pub fn new(initial: AdmissionStatus) -> Self {
        Self { status: initial }
    }

    pub fn status(&self) -> AdmissionStatus {
        self.status
    }

    pub fn is_admitted(&self) -> bool {
        self.status == AdmissionStatus::Admitted
    }

    pub fn advance(&mut self, observed: AdmissionStatus) -> Transition {
        if observed <= self.status {
            return Transition::Unchanged;
        }
        let from = self.status;
        self.status = observed;
        Transition::Advanced { from, to: observed }
    }
}
