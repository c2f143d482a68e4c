use std::fs::{create_dir_all, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use csv::WriterBuilder;
use eyre::{Result, WrapErr};
use serde::Serialize;

use crate::algorithms::{Outcome, Status};
use crate::error::RefineError;
use crate::routines::parameter_space::ParameterSpace;
use crate::routines::settings::{write_settings_to_file, Settings};
use crate::structs::history::{RefineStatus, RefinementHistory};

pub mod records;

/// Defines the result of a refinement run
///
/// A [RefineResult] holds everything needed to report on a finished run: the history, how
/// the method ended, and the optional parameter-space grid.
#[derive(Debug, Serialize)]
pub struct RefineResult {
    method_index: usize,
    method: String,
    outcome: Outcome,
    status: RefineStatus,
    evaluations: usize,
    #[serde(serialize_with = "as_seconds")]
    elapsed: Duration,
    par_names: Vec<String>,
    history: RefinementHistory,
    error: Option<String>,
    #[serde(skip)]
    failure: Option<RefineError>,
    #[serde(skip)]
    space: Option<ParameterSpace>,
    #[serde(skip)]
    settings: Settings,
}

fn as_seconds<S: serde::Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64())
}

#[allow(clippy::too_many_arguments)]
impl RefineResult {
    /// Create a new RefineResult object
    pub fn new(
        method_index: usize,
        method: &str,
        outcome: Outcome,
        evaluations: usize,
        elapsed: Duration,
        par_names: Vec<String>,
        history: RefinementHistory,
        space: Option<ParameterSpace>,
        settings: Settings,
    ) -> Self {
        Self {
            method_index,
            method: method.to_string(),
            status: history.status(),
            outcome,
            evaluations,
            elapsed,
            par_names,
            history,
            error: None,
            failure: None,
            space,
            settings,
        }
    }

    /// Attach the error that ended the run
    pub fn with_error(mut self, error: RefineError) -> Self {
        self.error = Some(error.to_string());
        self.failure = Some(error);
        self
    }

    /// Text of the error that ended the run, if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// The error that ended the run, as it was raised
    pub fn failure(&self) -> Option<&RefineError> {
        self.failure.as_ref()
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn method_index(&self) -> usize {
        self.method_index
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    /// The status reported to the host
    pub fn status(&self) -> RefineStatus {
        self.status
    }

    pub fn converged(&self) -> bool {
        matches!(self.outcome.status, Status::Converged | Status::Stagnated)
    }

    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn history(&self) -> &RefinementHistory {
        &self.history
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.par_names
    }

    /// The parameter-space grid, when sampling was enabled
    pub fn space(&self) -> Option<&ParameterSpace> {
        self.space.as_ref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn write_outputs(&self) -> Result<()> {
        if self.settings.output.write {
            tracing::debug!("Writing outputs to {:?}", self.settings.output.path);
            write_settings_to_file(&self.settings)?;
            records::write_records(&self.history, &self.settings.output.path)
                .wrap_err("Failed to write records")?;
            self.write_solutions()
                .wrap_err("Failed to write solutions")?;
            self.write_summary().wrap_err("Failed to write summary")?;
            if let Some(space) = &self.space {
                write_parameter_space(space, &self.par_names, &self.settings.output.path)
                    .wrap_err("Failed to write the parameter space")?;
            }
        }
        Ok(())
    }

    /// Writes the initial, last and best solutions with their residuals
    pub fn write_solutions(&self) -> Result<()> {
        tracing::debug!("Writing solutions...");
        let outputfile = OutputFile::new(&self.settings.output.path, "solutions.csv")?;
        let mut writer = WriterBuilder::new()
            .has_headers(true)
            .from_writer(outputfile.file());

        let mut header = vec!["state".to_string(), "residual".to_string()];
        header.extend(self.par_names.iter().cloned());
        writer.write_record(&header)?;

        let states = [
            ("initial", self.history.initial_solution(), self.history.initial_residual()),
            ("last", self.history.last_solution(), self.history.last_residual()),
            ("best", self.history.best_solution(), self.history.best_residual()),
        ];
        for (state, solution, residual) in states {
            if let (Some(solution), Some(residual)) = (solution, residual) {
                let mut row = vec![state.to_string(), residual.to_string()];
                row.extend(solution.iter().map(|v| v.to_string()));
                writer.write_record(&row)?;
            }
        }
        writer.flush()?;
        tracing::debug!("Solutions written to {:?}", outputfile.relative_path());
        Ok(())
    }

    /// Writes a JSON summary of the run
    pub fn write_summary(&self) -> Result<()> {
        #[derive(Serialize)]
        struct Summary<'a> {
            method: &'a str,
            method_index: usize,
            status: RefineStatus,
            outcome: String,
            iterations: usize,
            evaluations: usize,
            elapsed_seconds: f64,
            parameters: &'a [String],
            initial_residual: Option<f64>,
            best_residual: Option<f64>,
            best_solution: Option<Vec<f64>>,
            error: Option<&'a str>,
        }

        let summary = Summary {
            method: &self.method,
            method_index: self.method_index,
            status: self.status,
            outcome: self.outcome.status.to_string(),
            iterations: self.outcome.iterations,
            evaluations: self.evaluations,
            elapsed_seconds: self.elapsed.as_secs_f64(),
            parameters: &self.par_names,
            initial_residual: self.history.initial_residual(),
            best_residual: self.history.best_residual(),
            best_solution: self.history.best_solution().map(|s| s.to_vec()),
            error: self.error.as_deref(),
        };

        let outputfile = OutputFile::new(&self.settings.output.path, "summary.json")?;
        serde_json::to_writer_pretty(outputfile.file(), &summary)?;
        tracing::debug!("Summary written to {:?}", outputfile.relative_path());
        Ok(())
    }
}

/// Writes every filled cell of the parameter-space grid
///
/// One row per cell, with the two parameters spanning its cross section (only `x` for a single
/// parameter) and the values at the cell center.
pub fn write_parameter_space(space: &ParameterSpace, par_names: &[String], folder: &str) -> Result<()> {
    #[derive(Debug, Serialize)]
    struct Row<'a> {
        x_param: &'a str,
        y_param: &'a str,
        row: usize,
        col: usize,
        x: f64,
        y: Option<f64>,
        residual: f64,
        distance: f64,
    }

    let name = |i: usize| par_names.get(i).map_or("", |s| s.as_str());
    let outputfile = OutputFile::new(folder, "parameter_space.csv")?;
    let mut writer = WriterBuilder::new()
        .has_headers(true)
        .from_writer(outputfile.file());

    let density = space.density();
    if space.pairs().is_empty() {
        for index in 0..density {
            if let Some(cell) = space.cell_1d(index) {
                writer.serialize(Row {
                    x_param: name(0),
                    y_param: "",
                    row: index,
                    col: 0,
                    x: space.axis_value(0, index),
                    y: None,
                    residual: cell.residual,
                    distance: cell.distance,
                })?;
            }
        }
    } else {
        for (pair, &(i, j)) in space.pairs().iter().enumerate() {
            for row in 0..density {
                for col in 0..density {
                    if let Some(cell) = space.cell(pair, row, col) {
                        writer.serialize(Row {
                            x_param: name(i),
                            y_param: name(j),
                            row,
                            col,
                            x: space.axis_value(i, row),
                            y: Some(space.axis_value(j, col)),
                            residual: cell.residual,
                            distance: cell.distance,
                        })?;
                    }
                }
            }
        }
    }
    writer.flush()?;
    tracing::debug!(
        "{} parameter space cell(s) written to {:?}",
        space.filled(),
        outputfile.relative_path()
    );
    Ok(())
}

/// Contains all the necessary information of an output file
#[derive(Debug)]
pub struct OutputFile {
    file: File,
    relative_path: PathBuf,
}

impl OutputFile {
    pub fn new(folder: &str, file_name: &str) -> Result<Self> {
        let relative_path = Path::new(&folder).join(file_name);

        if let Some(parent) = relative_path.parent() {
            create_dir_all(parent)
                .wrap_err_with(|| format!("Failed to create directories for {:?}", parent))?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&relative_path)
            .wrap_err_with(|| format!("Failed to open file: {:?}", relative_path))?;

        Ok(OutputFile {
            file,
            relative_path,
        })
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn file_owned(self) -> File {
        self.file
    }

    pub fn relative_path(&self) -> &Path {
        &self.relative_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::bounds::Bounds;
    use crate::structs::history::Record;
    use ndarray::array;

    fn result(folder: &str, space: Option<ParameterSpace>) -> RefineResult {
        let mut history = RefinementHistory::new();
        history.set_initial(array![1.0, 2.0], 5.0);
        history.update(&array![0.5, 1.0], 1.25, Some(Record::new(0).with("best", 1.25)));
        let mut settings = Settings::new();
        settings.output.path = folder.to_string();
        RefineResult::new(
            3,
            "CMA-ES",
            Outcome::new(Status::Stagnated, 7),
            42,
            Duration::from_millis(1500),
            vec!["scale".into(), "shift".into()],
            history,
            space,
            settings,
        )
    }

    #[test]
    fn test_output_file_creates_folders() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("nested/run");
        let outputfile = OutputFile::new(folder.to_str().unwrap(), "x.csv").unwrap();
        assert!(outputfile.relative_path().exists());
    }

    #[test]
    fn test_write_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().to_str().unwrap().to_string();
        let bounds = Bounds::new(vec![(0.0, 2.0), (0.0, 4.0)]).unwrap();
        let mut space = ParameterSpace::new(&bounds, 5, usize::MAX);
        space.record(&array![1.0, 2.0], 0.5);

        let result = result(&folder, Some(space));
        assert!(result.converged());
        result.write_outputs().unwrap();

        let solutions = std::fs::read_to_string(dir.path().join("solutions.csv")).unwrap();
        let lines: Vec<&str> = solutions.lines().collect();
        assert_eq!(lines[0], "state,residual,scale,shift");
        assert_eq!(lines[1], "initial,5,1,2");
        assert_eq!(lines[3], "best,1.25,0.5,1");

        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("summary.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(summary["method"], "CMA-ES");
        assert_eq!(summary["iterations"], 7);
        assert_eq!(summary["evaluations"], 42);
        assert_eq!(summary["best_residual"], 1.25);

        assert!(dir.path().join("settings.json").exists());
        assert!(dir.path().join("records.csv").exists());
        let space = std::fs::read_to_string(dir.path().join("parameter_space.csv")).unwrap();
        assert_eq!(space.lines().count(), 2);
    }

    #[test]
    fn test_nothing_written_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("out");
        let mut result = result(folder.to_str().unwrap(), None);
        result.settings.output.write = false;
        result.write_outputs().unwrap();
        assert!(!folder.exists());
    }
}
