//! Taint conflict detection.
//!
//! A taint is an id a module declares for a process-wide resource it cannot
//! share (a non-reentrant C library, a signal, an X connection...). Two
//! modules declaring the same id in one process is reported before anything
//! starts running.

use std::fmt;

use crate::bar::LoadedBar;
use crate::log::Logger;
use crate::log_at;
use crate::widget::Slot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaintOwner {
    Barlib,
    Plugin { plugin: String, widget: String },
}

impl fmt::Display for TaintOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaintOwner::Barlib => f.write_str("the barlib"),
            TaintOwner::Plugin { plugin, widget } => {
                write!(f, "plugin '{}' requested by widget '{}'", plugin, widget)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Taint {
    pub id: String,
    pub owner: TaintOwner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub id: String,
    pub owners: Vec<TaintOwner>,
}

/// Taints of the barlib followed by those of every non-dummy widget, in
/// slot order.
pub fn collect(bar: &LoadedBar, slots: &[Slot]) -> Vec<Taint> {
    let mut taints: Vec<Taint> = bar
        .taints()
        .into_iter()
        .map(|id| Taint {
            id,
            owner: TaintOwner::Barlib,
        })
        .collect();
    for slot in slots {
        let (Some(plugin), Some(path)) = (slot.plugin(), slot.path()) else {
            continue;
        };
        taints.extend(plugin.taints().into_iter().map(|id| Taint {
            id,
            owner: TaintOwner::Plugin {
                plugin: plugin.name().to_string(),
                widget: path.display().to_string(),
            },
        }));
    }
    taints
}

/// Group taints by id; every id with two or more owners is a conflict.
/// Owners keep their collection order.
pub fn find_conflicts(mut taints: Vec<Taint>) -> Vec<Conflict> {
    taints.sort_by(|a, b| a.id.cmp(&b.id));
    taints
        .chunk_by(|a, b| a.id == b.id)
        .filter(|run| run.len() > 1)
        .map(|run| Conflict {
            id: run[0].id.clone(),
            owners: run.iter().map(|t| t.owner.clone()).collect(),
        })
        .collect()
}

/// Log every conflict; true if there are none.
pub fn check(bar: &LoadedBar, slots: &[Slot], logger: &Logger) -> bool {
    report(&find_conflicts(collect(bar, slots)), logger)
}

fn report(conflicts: &[Conflict], logger: &Logger) -> bool {
    for conflict in conflicts {
        log_at!(logger, Info, "the following entities share taint '{}':", conflict.id);
        for owner in &conflict.owners {
            log_at!(logger, Info, "  * {}", owner);
        }
    }
    conflicts.is_empty()
}
