use super::models::{JourneyProgress, JourneyStep};

impl JourneyProgress {
    /// Summarize recorded steps. Duplicates and ordering of the input do not
    /// matter; `next_step` is the first step in canonical order not yet done.
    pub fn from_steps(steps: &[JourneyStep]) -> Self {
        let completed: Vec<JourneyStep> = JourneyStep::ALL
            .into_iter()
            .filter(|s| steps.contains(s))
            .collect();
        let next_step = JourneyStep::ALL
            .into_iter()
            .find(|s| !completed.contains(s));
        let percent_complete = (completed.len() * 100 / JourneyStep::ALL.len()) as u8;

        Self {
            completed,
            next_step,
            percent_complete,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.next_step.is_none()
    }
}
