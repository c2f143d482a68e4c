use std::collections::HashMap;

use config::Config as eConfig;
use eyre::{bail, Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::routines::evaluator::BackendKind;
use crate::routines::output::OutputFile;
use crate::structs::options::OptionValue;

/// Contains all settings for a refinement
#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(deny_unknown_fields, default)]
pub struct Settings {
    /// General configuration settings
    pub config: Config,
    /// Where and how residuals are evaluated
    pub evaluator: EvaluatorSettings,
    /// Configuration for logging
    pub log: Log,
    /// Configuration for the output files
    pub output: Output,
    /// Configuration for the parameter-space sampler
    pub sampling: Sampling,
    /// Option overrides per method, keyed by the method index
    ///
    /// Only options declared by the method are applied; unknown keys are ignored.
    pub methods: HashMap<String, HashMap<String, OptionValue>>,
}

impl Settings {
    pub fn new() -> Self {
        Settings::default()
    }

    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        self.evaluator.validate()?;
        self.sampling.validate()?;
        for key in self.methods.keys() {
            if key.parse::<usize>().is_err() {
                bail!(
                    "Method overrides must be keyed by method index, found '{}'",
                    key
                );
            }
        }
        Ok(())
    }

    /// The persisted option overrides of the method with `index`
    pub fn method_options(&self, index: usize) -> HashMap<String, OptionValue> {
        self.methods
            .get(&index.to_string())
            .cloned()
            .unwrap_or_default()
    }

    /// Store an option override for the method with `index`
    pub fn set_method_option(&mut self, index: usize, name: impl Into<String>, value: OptionValue) {
        self.methods
            .entry(index.to_string())
            .or_default()
            .insert(name.into(), value);
    }

    pub fn set_method(&mut self, index: usize) {
        self.config.method = index;
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.config.seed = seed;
    }
}

/// General configuration settings
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Index of the refinement method to run
    pub method: usize,
    /// Seed for the random number generators of stochastic methods
    pub seed: u64,
    /// If set, creating this file stops a running refinement
    pub stop_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            method: 3,
            seed: 22,
            stop_file: Some(String::from("stop")),
        }
    }
}

/// Configuration of the residual evaluator
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct EvaluatorSettings {
    /// The backend: `auto`, `inline`, `pool` or `futures`
    pub backend: BackendKind,
    /// With `auto`, try the futures runtime before the thread pool
    pub prefer_futures: bool,
    /// Number of workers; `0` uses all available cores
    pub threads: usize,
    /// Length of a single wait for a result, in milliseconds; `0` waits forever
    pub timeout_ms: u64,
    /// Number of waits before an evaluation is declared stalled
    pub retries: usize,
    /// Numerical tolerance handed to every worker
    pub tolerance: f64,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        EvaluatorSettings {
            backend: BackendKind::Auto,
            prefer_futures: false,
            threads: 0,
            timeout_ms: 2000,
            retries: 50,
            tolerance: 1e-12,
        }
    }
}

impl EvaluatorSettings {
    pub fn validate(&self) -> Result<()> {
        if self.retries == 0 {
            bail!("The evaluator needs at least one retry");
        }
        if self.tolerance.is_nan() || self.tolerance < 0.0 {
            bail!("The worker tolerance must be non-negative, got {}", self.tolerance);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Log {
    /// The maximum log level to display
    ///
    /// The log level is defined as a string, and can be one of the following:
    /// - `trace`
    /// - `debug`
    /// - `info`
    /// - `warn`
    /// - `error`
    pub level: String,
    /// The file to write the log to
    pub file: String,
    /// Whether to write logs
    ///
    /// If set to `false`, a global subscriber will not be set.
    /// This can be useful when the host installs its own subscriber, or for benchmarks.
    pub write: bool,
}

impl Default for Log {
    fn default() -> Self {
        Log {
            level: String::from("info"),
            file: String::from("log.txt"),
            write: true,
        }
    }
}

/// Configuration for the output files
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Output {
    /// Whether to write the output files
    pub write: bool,
    /// The (relative) path to write the output files to
    pub path: String,
}

impl Default for Output {
    fn default() -> Self {
        Output {
            write: true,
            path: String::from("outputs/"),
        }
    }
}

impl Output {
    /// Parses the output folder location
    ///
    /// If a `#` symbol is found, it will automatically increment the number by one.
    pub fn parse_output_folder(&mut self) -> Result<()> {
        if self.path.is_empty() {
            self.path = Output::default().path;
        }

        let folder = &self.path;

        // Check for the `#` symbol to replace with an incremented number
        match folder.matches('#').count() {
            0 => Ok(()),
            1 => {
                let mut num = 1;
                while std::path::Path::new(&folder.replace('#', &num.to_string())).exists() {
                    num += 1;
                }
                self.path = folder.replace('#', &num.to_string());
                Ok(())
            }
            _ => {
                bail!("Only one `#` symbol is allowed in the output folder path")
            }
        }
    }
}

/// Configuration for the parameter-space sampler
#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Sampling {
    /// Whether evaluated solutions are recorded into a parameter-space grid
    pub enabled: bool,
    /// Requested number of grid cells per axis
    pub density: usize,
    /// Upper bound on the memory used by the grid, in bytes
    pub memory_budget: usize,
}

impl Default for Sampling {
    fn default() -> Self {
        Sampling {
            enabled: false,
            density: 50,
            memory_budget: 64 * 1024 * 1024,
        }
    }
}

impl Sampling {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.density < 3 {
            bail!(
                "The sampling density must be at least 3 cells per axis, got {}",
                self.density
            );
        }
        Ok(())
    }
}

/// Parses the settings from a TOML configuration file
///
/// The settings are validated, and a copy of the settings is written to the output folder.
///
/// Entries in the TOML file may be overridden by environment variables. The environment variables must be prefixed with `DIFFREFINE_`, and the TOML entry must be in uppercase. For example, the evaluator backend may be forced by setting `DIFFREFINE_EVALUATOR__BACKEND=inline`. A double underscore, `__`, separates nested entries, so field names may contain single underscores, as in `DIFFREFINE_EVALUATOR__TIMEOUT_MS=500`.
pub fn read(path: impl Into<String>) -> Result<Settings> {
    let settings_path = path.into();

    let parsed = eConfig::builder()
        .add_source(config::File::with_name(&settings_path).format(config::FileFormat::Toml))
        .add_source(
            config::Environment::with_prefix("DIFFREFINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .wrap_err_with(|| format!("Unable to read settings from '{}'", settings_path))?;

    // Deserialize settings to the Settings struct
    let mut settings: Settings = parsed.try_deserialize()?;

    // Validate entries
    settings.validate()?;

    // Parse the output folder
    settings.output.parse_output_folder()?;

    // Write a copy of the settings to file if output is enabled
    if settings.output.write {
        write_settings_to_file(&settings).wrap_err("Could not write settings to file")?;
    }

    Ok(settings)
}

/// Writes a copy of the parsed settings to `settings.json` in the output folder
pub fn write_settings_to_file(settings: &Settings) -> Result<()> {
    let serialized = serde_json::to_string_pretty(settings)?;

    let outputfile = OutputFile::new(settings.output.path.as_str(), "settings.json")?;
    let mut file = outputfile.file_owned();
    std::io::Write::write_all(&mut file, serialized.as_bytes())?;
    Ok(())
}
