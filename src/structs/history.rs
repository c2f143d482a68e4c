use serde::{Deserialize, Serialize};

use crate::refinable::Refinable;
use crate::structs::bounds::Solution;

/// Status of a refinement, as reported to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefineStatus {
    /// History created, nothing evaluated yet
    Created,
    /// A method is running
    Running,
    /// The run was cancelled by the user
    Stopped,
    /// The run aborted with an error
    Error,
    /// The method ran to completion
    Finished,
}

impl std::fmt::Display for RefineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefineStatus::Created => write!(f, "created"),
            RefineStatus::Running => write!(f, "running"),
            RefineStatus::Stopped => write!(f, "stopped"),
            RefineStatus::Error => write!(f, "error"),
            RefineStatus::Finished => write!(f, "finished"),
        }
    }
}

/// One row of the iteration log
///
/// Holds the iteration number and an ordered list of named values, e.g. the best residual
/// and population spread of a generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    iteration: usize,
    fields: Vec<(String, f64)>,
}

impl Record {
    pub fn new(iteration: usize) -> Self {
        Record {
            iteration,
            fields: Vec::new(),
        }
    }

    /// Append a named value
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.fields.push((name.into(), value));
        self
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn fields(&self) -> &[(String, f64)] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| *value)
    }
}

/// Tracks the initial, last and best state of a refinement
///
/// The best state is a running minimum over every [RefinementHistory::update]: after the first
/// update `best_residual <= last_residual` always holds, and the best solution is the one that
/// produced the best residual.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementHistory {
    initial: Option<(Solution, f64)>,
    last: Option<(Solution, f64)>,
    best: Option<(Solution, f64)>,
    status: RefineStatus,
    message: String,
    records: Vec<Record>,
    updates: usize,
}

impl Default for RefinementHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl RefinementHistory {
    pub fn new() -> Self {
        RefinementHistory {
            initial: None,
            last: None,
            best: None,
            status: RefineStatus::Created,
            message: String::new(),
            records: Vec::new(),
            updates: 0,
        }
    }

    /// Set the state the refinement starts from
    ///
    /// The initial state also seeds `last` and `best`, so a run that never improves still
    /// reports the starting point as its best.
    pub fn set_initial(&mut self, solution: Solution, residual: f64) {
        self.initial = Some((solution.clone(), residual));
        self.last = Some((solution.clone(), residual));
        self.best = Some((solution, residual));
    }

    /// Record `solution` and its `residual` as the last state, and as the best if it improves
    pub fn update(&mut self, solution: &Solution, residual: f64, record: Option<Record>) {
        if self.initial.is_none() {
            self.initial = Some((solution.clone(), residual));
        }
        let improved = match &self.best {
            Some((_, best)) => residual < *best,
            None => true,
        };
        if improved {
            self.best = Some((solution.clone(), residual));
        }
        self.last = Some((solution.clone(), residual));
        if let Some(record) = record {
            self.records.push(record);
        }
        self.updates += 1;
    }

    /// Make the initial state the last state again, leaving the best state untouched
    pub fn reset_last_to_initial(&mut self) {
        self.last = self.initial.clone();
    }

    pub fn initial_solution(&self) -> Option<&Solution> {
        self.initial.as_ref().map(|(solution, _)| solution)
    }

    pub fn initial_residual(&self) -> Option<f64> {
        self.initial.as_ref().map(|(_, residual)| *residual)
    }

    pub fn last_solution(&self) -> Option<&Solution> {
        self.last.as_ref().map(|(solution, _)| solution)
    }

    pub fn last_residual(&self) -> Option<f64> {
        self.last.as_ref().map(|(_, residual)| *residual)
    }

    pub fn best_solution(&self) -> Option<&Solution> {
        self.best.as_ref().map(|(solution, _)| solution)
    }

    pub fn best_residual(&self) -> Option<f64> {
        self.best.as_ref().map(|(_, residual)| *residual)
    }

    pub fn status(&self) -> RefineStatus {
        self.status
    }

    pub fn set_status(&mut self, status: RefineStatus) {
        self.status = status;
    }

    /// The status line shown to the user
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = message.into();
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Number of updates received
    pub fn updates(&self) -> usize {
        self.updates
    }

    /// The values of record field `name`, in iteration order
    ///
    /// Records lacking the field are skipped.
    pub fn residual_trace(&self, name: &str) -> Vec<f64> {
        self.records
            .iter()
            .filter_map(|record| record.get(name))
            .collect()
    }

    /// Write the best solution onto the live model
    ///
    /// Returns `false` if nothing was recorded yet.
    pub fn apply_best<R: Refinable + ?Sized>(&self, target: &mut R) -> bool {
        Self::apply(&self.best, target)
    }

    /// Write the last solution onto the live model
    pub fn apply_last<R: Refinable + ?Sized>(&self, target: &mut R) -> bool {
        Self::apply(&self.last, target)
    }

    /// Write the initial solution onto the live model
    pub fn apply_initial<R: Refinable + ?Sized>(&self, target: &mut R) -> bool {
        Self::apply(&self.initial, target)
    }

    fn apply<R: Refinable + ?Sized>(state: &Option<(Solution, f64)>, target: &mut R) -> bool {
        match state {
            Some((solution, _)) => {
                target.apply_solution(solution);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refinable::FnRefinable;
    use ndarray::array;
    use rand::prelude::*;

    #[test]
    fn test_best_is_running_minimum() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut history = RefinementHistory::new();
        let mut minimum = f64::INFINITY;
        let mut previous_best = f64::INFINITY;
        for i in 0..500 {
            let residual: f64 = rng.gen_range(0.0..100.0);
            history.update(&array![i as f64], residual, None);
            minimum = minimum.min(residual);

            let best = history.best_residual().unwrap();
            assert_eq!(best, minimum);
            assert!(best <= previous_best);
            assert!(best <= history.last_residual().unwrap());
            previous_best = best;
        }
    }

    #[test]
    fn test_best_solution_matches_best_residual() {
        let mut history = RefinementHistory::new();
        history.update(&array![1.0], 5.0, None);
        history.update(&array![2.0], 3.0, None);
        history.update(&array![3.0], 4.0, None);
        assert_eq!(history.best_solution().unwrap(), &array![2.0]);
        assert_eq!(history.best_residual(), Some(3.0));
        assert_eq!(history.last_solution().unwrap(), &array![3.0]);
        assert_eq!(history.initial_solution().unwrap(), &array![1.0]);
    }

    #[test]
    fn test_records_are_appended() {
        let mut history = RefinementHistory::new();
        history.update(&array![1.0], 5.0, Some(Record::new(0).with("best", 5.0)));
        history.update(&array![1.0], 4.0, None);
        history.update(&array![1.0], 3.0, Some(Record::new(1).with("best", 3.0)));
        assert_eq!(history.records().len(), 2);
        assert_eq!(history.records()[1].get("best"), Some(3.0));
        assert_eq!(history.updates(), 3);
        assert_eq!(history.residual_trace("best"), vec![5.0, 3.0]);
        assert!(history.residual_trace("sigma").is_empty());
    }

    #[test]
    fn test_reset_last_to_initial_keeps_best() {
        let mut history = RefinementHistory::new();
        history.set_initial(array![0.0], 10.0);
        history.update(&array![1.0], 1.0, None);
        history.reset_last_to_initial();
        assert_eq!(history.last_solution().unwrap(), &array![0.0]);
        assert_eq!(history.best_solution().unwrap(), &array![1.0]);
    }

    #[test]
    fn test_apply_delegates_to_model() {
        let mut model = FnRefinable::new(vec![(0.0, 10.0)], array![5.0], |x: &Solution| x[0]);
        let mut history = RefinementHistory::new();
        assert!(!history.apply_best(&mut model));

        history.set_initial(array![5.0], 5.0);
        history.update(&array![2.0], 2.0, None);
        history.update(&array![7.0], 7.0, None);

        assert!(history.apply_best(&mut model));
        assert_eq!(model.solution(), &array![2.0]);
        assert!(history.apply_last(&mut model));
        assert_eq!(model.solution(), &array![7.0]);
        assert!(history.apply_initial(&mut model));
        assert_eq!(model.solution(), &array![5.0]);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(RefineStatus::Stopped.to_string(), "stopped");
        assert_eq!(RefineStatus::Finished.to_string(), "finished");
    }
}
