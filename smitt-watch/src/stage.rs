//! Pipeline stage descriptors
//!
//! A stage is the unit the polling engine drives:
//! - a [`Source`] that lists candidate units from the filesystem
//! - a [`Grouping`] policy deciding how many units share one tool invocation
//! - an [`Invocation`] building the external command for a group
//! - a success predicate over the tool's exit code
//! - an optional [`FollowUp`] chained after a successful run
//!
//! Stages are connected only through directory conventions: the output tree
//! of one stage is the watch root of the next.

use crate::error::Result;
use crate::runner::{exit_zero, CommandSpec, SuccessPredicate};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;

// ============================================================================
// Units of work
// ============================================================================

/// One discoverable unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    /// Known-set key; unique per stage
    pub key: String,
    /// Batch subfolder the unit was found in
    pub subfolder: String,
    /// Identifies the unit within its subfolder
    pub label: String,
    /// Primary file
    pub path: PathBuf,
    /// Secondary file processed together with `path` (metadata of a pair)
    pub companion: Option<PathBuf>,
}

/// Units of one subfolder handed to a single invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkGroup {
    pub subfolder: String,
    pub units: Vec<WorkUnit>,
}

impl WorkGroup {
    pub fn keys(&self) -> Vec<String> {
        self.units.iter().map(|u| u.key.clone()).collect()
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.units.iter().map(|u| u.path.clone()).collect()
    }

    /// Label of the first unit; the whole group for single-unit groups
    pub fn first_label(&self) -> &str {
        self.units.first().map(|u| u.label.as_str()).unwrap_or("")
    }
}

/// How new units are batched into invocations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grouping {
    /// One invocation per subfolder with all its new units
    BySubfolder,
    /// One invocation per unit
    PerUnit,
}

/// Split units into groups, preserving discovery order
///
/// Groups come out in subfolder order; units keep their relative order.
pub fn group_units(units: Vec<WorkUnit>, grouping: Grouping) -> Vec<WorkGroup> {
    match grouping {
        Grouping::PerUnit => units
            .into_iter()
            .map(|u| WorkGroup {
                subfolder: u.subfolder.clone(),
                units: vec![u],
            })
            .collect(),
        Grouping::BySubfolder => {
            let mut by_sub: BTreeMap<String, Vec<WorkUnit>> = BTreeMap::new();
            for unit in units {
                by_sub.entry(unit.subfolder.clone()).or_default().push(unit);
            }
            by_sub
                .into_iter()
                .map(|(subfolder, units)| WorkGroup { subfolder, units })
                .collect()
        }
    }
}

// ============================================================================
// Stage seams
// ============================================================================

/// Lists candidate units in deterministic order
pub trait Source: Send + Sync {
    fn discover(&self) -> Vec<WorkUnit>;
}

/// Builds the external command for one group
///
/// Returning [`crate::Error::NotReady`] defers the group to the next poll
/// without marking anything.
pub trait Invocation: Send + Sync {
    fn prepare(&self, group: &WorkGroup) -> Result<CommandSpec>;
}

/// Work chained after a successful invocation
///
/// A follow-up that cannot finish yet (a shared resource is busy) keeps the
/// work itself and reports it through [`FollowUp::has_pending`]; the engine
/// then calls [`FollowUp::retry_pending`] on later polls.
#[async_trait]
pub trait FollowUp: Send + Sync {
    async fn on_success(&self, group: &WorkGroup, spec: &CommandSpec);

    fn has_pending(&self) -> bool {
        false
    }

    async fn retry_pending(&self) {}
}

/// One pipeline stage
pub struct Stage {
    pub name: String,
    pub source: Box<dyn Source>,
    pub grouping: Grouping,
    pub invocation: Box<dyn Invocation>,
    pub success: SuccessPredicate,
    pub follow_up: Option<Box<dyn FollowUp>>,
}

impl Stage {
    /// Stage with exit-zero success and no follow-up
    pub fn new(
        name: impl Into<String>,
        source: Box<dyn Source>,
        grouping: Grouping,
        invocation: Box<dyn Invocation>,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            grouping,
            invocation,
            success: exit_zero,
            follow_up: None,
        }
    }

    pub fn with_success(mut self, success: SuccessPredicate) -> Self {
        self.success = success;
        self
    }

    pub fn with_follow_up(mut self, follow_up: Box<dyn FollowUp>) -> Self {
        self.follow_up = Some(follow_up);
        self
    }
}
