//! Output policy and layout bookkeeping
//!
//! Tracks the outputs the backend has announced in an owned arena with
//! stable ids (iteration order equals insertion order) and resolves the
//! two-valued multi-output policy: EXTEND places every output side by side
//! so the usable area is their union, LAST-ONLY keeps only the most
//! recently arrived output live.

#![allow(dead_code)]

use std::fmt;

use crate::compositor::OutputHandle;

/// How newly appearing outputs join the session layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputPolicy {
    /// Extend the layout across all connected outputs (default).
    #[default]
    Extend,
    /// Use only the most recently connected output.
    LastOnly,
}

impl OutputPolicy {
    /// Parse the user-facing mode name used by `-m` and the config file.
    pub fn from_name(name: &str) -> Option<OutputPolicy> {
        match name {
            "extend" => Some(OutputPolicy::Extend),
            "last" => Some(OutputPolicy::LastOnly),
            _ => None,
        }
    }

    /// Layer the CLI flag over the config directive over the default.
    pub fn resolve(cli_flag: Option<OutputPolicy>, config_value: Option<OutputPolicy>) -> Self {
        cli_flag.or(config_value).unwrap_or_default()
    }
}

impl fmt::Display for OutputPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputPolicy::Extend => write!(f, "extend"),
            OutputPolicy::LastOnly => write!(f, "last-only"),
        }
    }
}

/// Stable id of an output slot; never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputId(usize);

#[derive(Debug)]
pub struct OutputEntry {
    pub handle: OutputHandle,
    pub name: String,
    pub width: i32,
    pub height: i32,
    /// Whether the output is currently part of the rendered layout.
    pub enabled: bool,
    /// Monotonic arrival stamp; higher means newer.
    pub arrival: u64,
}

/// Owned collection of announced outputs.
#[derive(Debug, Default)]
pub struct OutputSet {
    slots: Vec<Option<OutputEntry>>,
    next_arrival: u64,
}

impl OutputSet {
    pub fn new() -> Self {
        OutputSet::default()
    }

    pub fn insert(&mut self, handle: OutputHandle, name: String, width: i32, height: i32) -> OutputId {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.slots.push(Some(OutputEntry {
            handle,
            name,
            width,
            height,
            enabled: false,
            arrival,
        }));
        OutputId(self.slots.len() - 1)
    }

    pub fn remove(&mut self, id: OutputId) -> Option<OutputEntry> {
        self.slots.get_mut(id.0).and_then(Option::take)
    }

    pub fn get(&self, id: OutputId) -> Option<&OutputEntry> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: OutputId) -> Option<&mut OutputEntry> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    /// Present outputs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (OutputId, &OutputEntry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|entry| (OutputId(index), entry)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (OutputId, &mut OutputEntry)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_mut().map(|entry| (OutputId(index), entry)))
    }

    pub fn find(&self, handle: OutputHandle) -> Option<OutputId> {
        self.iter()
            .find(|(_, entry)| entry.handle == handle)
            .map(|(id, _)| id)
    }

    /// Most recently arrived output still present.
    pub fn newest(&self) -> Option<OutputId> {
        self.iter()
            .max_by_key(|(_, entry)| entry.arrival)
            .map(|(id, _)| id)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// Left-to-right positions for every present output under EXTEND, in
/// arrival (insertion) order.
pub fn extend_positions(outputs: &OutputSet) -> Vec<(OutputId, i32)> {
    let mut x = 0;
    let mut positions = Vec::with_capacity(outputs.len());
    for (id, entry) in outputs.iter() {
        positions.push((id, x));
        x += entry.width;
    }
    positions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_with(widths: &[i32]) -> OutputSet {
        let mut set = OutputSet::new();
        for (index, &width) in widths.iter().enumerate() {
            set.insert(
                OutputHandle(index as u32),
                format!("OUT-{index}"),
                width,
                720,
            );
        }
        set
    }

    #[test]
    fn cli_flag_overrides_config() {
        let policy = OutputPolicy::resolve(
            Some(OutputPolicy::LastOnly),
            Some(OutputPolicy::Extend),
        );
        assert_eq!(policy, OutputPolicy::LastOnly);
    }

    #[test]
    fn config_overrides_default() {
        let policy = OutputPolicy::resolve(None, Some(OutputPolicy::LastOnly));
        assert_eq!(policy, OutputPolicy::LastOnly);
    }

    #[test]
    fn default_is_extend() {
        assert_eq!(OutputPolicy::resolve(None, None), OutputPolicy::Extend);
    }

    #[test]
    fn mode_names_parse() {
        assert_eq!(OutputPolicy::from_name("extend"), Some(OutputPolicy::Extend));
        assert_eq!(OutputPolicy::from_name("last"), Some(OutputPolicy::LastOnly));
        assert_eq!(OutputPolicy::from_name("mirror"), None);
    }

    #[test]
    fn iteration_follows_insertion_order() {
        let set = set_with(&[1024, 1920, 1280]);
        let names: Vec<&str> = set.iter().map(|(_, e)| e.name.as_str()).collect();
        assert_eq!(names, ["OUT-0", "OUT-1", "OUT-2"]);
    }

    #[test]
    fn extend_places_outputs_left_to_right() {
        let set = set_with(&[1024, 1920, 1280]);
        let xs: Vec<i32> = extend_positions(&set).iter().map(|&(_, x)| x).collect();
        assert_eq!(xs, [0, 1024, 2944]);
    }

    #[test]
    fn removal_keeps_ids_stable_and_repacks_union() {
        let mut set = set_with(&[1024, 1920, 1280]);
        let middle = set.iter().nth(1).map(|(id, _)| id).unwrap();
        set.remove(middle);
        let xs: Vec<i32> = extend_positions(&set).iter().map(|&(_, x)| x).collect();
        assert_eq!(xs, [0, 1024]);
        assert!(set.get(middle).is_none());
    }

    #[test]
    fn newest_tracks_arrival_order() {
        let mut set = set_with(&[800, 800]);
        let newest = set.newest().unwrap();
        assert_eq!(set.get(newest).unwrap().name, "OUT-1");
        set.remove(newest);
        let newest = set.newest().unwrap();
        assert_eq!(set.get(newest).unwrap().name, "OUT-0");
    }
}
