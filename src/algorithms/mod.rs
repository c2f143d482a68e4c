use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{RefineError, Result};
use crate::routines::context::RefineContext;
use crate::structs::options::{MethodOptions, OptionValue, RefineMethodOption};

pub mod basinhopping;
pub mod brute;
pub mod cmaes;
pub mod lbfgsb;
pub mod mpso;
pub mod neldermead;
pub(crate) mod objective;
pub mod pso_cmaes;

/// Common contract of every refinement method
///
/// A method reads its options once, when it is built from its [MethodEntry], and then runs
/// against a [RefineContext]. It must poll [RefineContext::is_cancelled] at least once per
/// outer iteration and return [Status::Cancelled] within one iteration of a request, with every
/// fully evaluated batch already folded into the history.
pub trait RefineMethod: Send {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// The validated options this instance runs with
    fn options(&self) -> &MethodOptions;
    fn run(&mut self, context: &mut RefineContext<'_>) -> Result<Outcome>;
    /// Whether the driver writes the best solution back onto the model after the run
    fn applies_best(&self) -> bool {
        true
    }
}

/// Represents how a method run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// The method met its own convergence criterion
    Converged,
    /// Progress flattened out over the stagnation window
    Stagnated,
    /// The generation or iteration budget ran out
    MaxGenerations,
    /// Every planned evaluation was performed
    Exhausted,
    /// The run was cancelled by the user
    Cancelled,
    /// Other status with custom message
    Other(String),
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Converged => write!(f, "Converged"),
            Status::Stagnated => write!(f, "Stagnated"),
            Status::MaxGenerations => write!(f, "Maximum generations reached"),
            Status::Exhausted => write!(f, "All samples evaluated"),
            Status::Cancelled => write!(f, "Manual stop requested"),
            Status::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// The result of [RefineMethod::run]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome {
    pub status: Status,
    /// Outer iterations or generations completed
    pub iterations: usize,
}

impl Outcome {
    pub fn new(status: Status, iterations: usize) -> Self {
        Outcome { status, iterations }
    }

    pub fn cancelled(&self) -> bool {
        self.status == Status::Cancelled
    }
}

type Constructor = fn(MethodOptions) -> Box<dyn RefineMethod>;

/// One row of the method table
pub struct MethodEntry {
    /// Stable identifier, persisted in saved configurations
    pub index: usize,
    pub name: &'static str,
    pub description: &'static str,
    /// Experimental methods are kept out of [registry]
    pub disabled: bool,
    pub options: &'static [RefineMethodOption],
    constructor: Constructor,
}

impl MethodEntry {
    /// Build an instance with the declared defaults and the given overrides
    pub fn build(&self, overrides: &HashMap<String, OptionValue>) -> Result<Box<dyn RefineMethod>> {
        let options = MethodOptions::new(self.options, overrides)?;
        Ok((self.constructor)(options))
    }
}

impl std::fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodEntry")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("disabled", &self.disabled)
            .finish()
    }
}

static METHODS: &[MethodEntry] = &[
    MethodEntry {
        index: 0,
        name: lbfgsb::NAME,
        description: lbfgsb::DESCRIPTION,
        disabled: false,
        options: lbfgsb::OPTIONS,
        constructor: lbfgsb::LBFGSB::boxed,
    },
    MethodEntry {
        index: 1,
        name: brute::NAME,
        description: brute::DESCRIPTION,
        disabled: false,
        options: brute::OPTIONS,
        constructor: brute::BruteForce::boxed,
    },
    MethodEntry {
        index: 2,
        name: basinhopping::NAME,
        description: basinhopping::DESCRIPTION,
        disabled: false,
        options: basinhopping::OPTIONS,
        constructor: basinhopping::BasinHopping::boxed,
    },
    MethodEntry {
        index: 3,
        name: cmaes::NAME,
        description: cmaes::DESCRIPTION,
        disabled: false,
        options: cmaes::OPTIONS,
        constructor: cmaes::CMAES::boxed,
    },
    MethodEntry {
        index: 4,
        name: mpso::NAME,
        description: mpso::DESCRIPTION,
        disabled: false,
        options: mpso::OPTIONS,
        constructor: mpso::MPSO::boxed,
    },
    MethodEntry {
        index: 5,
        name: pso_cmaes::NAME,
        description: pso_cmaes::DESCRIPTION,
        disabled: false,
        options: pso_cmaes::OPTIONS,
        constructor: pso_cmaes::PSOCMAES::boxed,
    },
    MethodEntry {
        index: 6,
        name: neldermead::NAME,
        description: neldermead::DESCRIPTION,
        disabled: true,
        options: neldermead::OPTIONS,
        constructor: neldermead::NelderMeadMethod::boxed,
    },
];

lazy_static::lazy_static! {
    static ref REGISTRY: std::result::Result<Vec<&'static MethodEntry>, &'static MethodEntry> =
        match first_duplicate(METHODS) {
            Some(entry) => {
                tracing::error!("{}", duplicate_index(entry));
                Err(entry)
            }
            None => Ok(METHODS.iter().filter(|entry| !entry.disabled).collect()),
        };
}

fn first_duplicate(entries: &[MethodEntry]) -> Option<&MethodEntry> {
    let mut seen = HashSet::new();
    entries
        .iter()
        .filter(|entry| !entry.disabled)
        .find(|entry| !seen.insert(entry.index))
}

fn duplicate_index(entry: &MethodEntry) -> RefineError {
    RefineError::DuplicateIndex {
        index: entry.index,
        name: entry.name,
    }
}

/// Check that no two enabled entries share an index
pub fn validate_indices(entries: &[MethodEntry]) -> Result<()> {
    match first_duplicate(entries) {
        Some(entry) => Err(duplicate_index(entry)),
        None => Ok(()),
    }
}

/// The enabled entries of `entries`, provided their indices are unique
pub fn enabled(entries: &[MethodEntry]) -> Result<Vec<&MethodEntry>> {
    validate_indices(entries)?;
    Ok(entries.iter().filter(|entry| !entry.disabled).collect())
}

/// The enabled methods, by index
///
/// Fails with [RefineError::DuplicateIndex] when the method table reuses an index, so no
/// method can be dispatched from an ambiguous table.
pub fn registry() -> Result<&'static [&'static MethodEntry]> {
    match &*REGISTRY {
        Ok(entries) => Ok(entries.as_slice()),
        Err(entry) => Err(duplicate_index(entry)),
    }
}

/// Every known method, including disabled ones
pub fn all_methods() -> &'static [MethodEntry] {
    METHODS
}

/// Look up an enabled method
pub fn lookup(index: usize) -> Result<&'static MethodEntry> {
    registry()?
        .iter()
        .find(|entry| entry.index == index)
        .copied()
        .ok_or(RefineError::UnknownMethod(index))
}

/// Build the enabled method with `index`
pub fn dispatch_method(
    index: usize,
    overrides: &HashMap<String, OptionValue>,
) -> Result<Box<dyn RefineMethod>> {
    lookup(index)?.build(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_indices_are_unique() {
        assert!(validate_indices(all_methods()).is_ok());
        let entries = registry().unwrap();
        let indices: HashSet<usize> = entries.iter().map(|entry| entry.index).collect();
        assert_eq!(indices.len(), entries.len());
    }

    #[test]
    fn test_disabled_methods_are_hidden() {
        assert_eq!(all_methods().len(), 7);
        assert_eq!(registry().unwrap().len(), 6);
        assert!(matches!(lookup(6), Err(RefineError::UnknownMethod(6))));
        assert!(matches!(lookup(99), Err(RefineError::UnknownMethod(99))));
    }

    #[test]
    fn test_indices_are_stable() {
        let names: Vec<(usize, &str)> = all_methods().iter().map(|e| (e.index, e.name)).collect();
        assert_eq!(
            names,
            vec![
                (0, "L-BFGS-B"),
                (1, "Brute force"),
                (2, "Basin hopping"),
                (3, "CMA-ES"),
                (4, "MPSO"),
                (5, "PSO-CMA-ES"),
                (6, "Nelder-Mead"),
            ]
        );
    }

    #[test]
    fn test_built_methods_describe_themselves() {
        for entry in all_methods() {
            let method = entry.build(&HashMap::new()).unwrap();
            assert_eq!(method.name(), entry.name);
            assert_eq!(method.description(), entry.description);
            assert_eq!(method.options().iter().count(), entry.options.len());
        }
    }

    #[test]
    fn test_bad_option_value_is_a_config_error() {
        let mut overrides = HashMap::new();
        overrides.insert("ngen".to_string(), OptionValue::Text("many".into()));
        let err = dispatch_method(3, &overrides).err().unwrap();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_duplicate_indices_are_detected() {
        fn build(options: MethodOptions) -> Box<dyn RefineMethod> {
            brute::BruteForce::boxed(options)
        }
        let entries = [
            MethodEntry {
                index: 1,
                name: "a",
                description: "",
                disabled: false,
                options: &[],
                constructor: build,
            },
            MethodEntry {
                index: 1,
                name: "b",
                description: "",
                disabled: false,
                options: &[],
                constructor: build,
            },
        ];
        let err = enabled(&entries).unwrap_err();
        assert!(err.is_config_error());
        assert!(matches!(err, RefineError::DuplicateIndex { index: 1, name: "b" }));

        // Disabling the second entry makes the table usable again
        let entries = [
            MethodEntry {
                index: 1,
                name: "a",
                description: "",
                disabled: false,
                options: &[],
                constructor: build,
            },
            MethodEntry {
                index: 1,
                name: "b",
                description: "",
                disabled: true,
                options: &[],
                constructor: build,
            },
        ];
        let usable = enabled(&entries).unwrap();
        assert_eq!(usable.len(), 1);
        assert_eq!(usable[0].name, "a");
    }
}
