//! Collaborator interfaces and in-memory implementations
//!
//! The engine never stores data itself. Period arithmetic, hierarchy
//! walking, and metadata lookup are supplied by the caller through the three
//! traits here. The bundled implementations cover the common case: ISO
//! calendar periods, an in-memory organisation-unit tree, and a static
//! metadata table, all loadable from JSON.

use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::ast::DimensionItem;
use crate::context::{OrgUnit, Period};

/// Period arithmetic used by PERIOD() fan-out
pub trait PeriodEngine: Send + Sync {
    /// Shift by whole periods of the same granularity; `None` if the period
    /// cannot be interpreted
    fn shift_period(&self, period: &Period, offset: i32) -> Option<Period>;

    /// Shift by whole years keeping the position within the year
    fn shift_year(&self, period: &Period, offset: i32) -> Option<Period>;
}

/// Hierarchy walking and membership lookup used by the OU_* functions
pub trait OrgUnitLocator: Send + Sync {
    /// Parent of a unit; `None` for a root or an unknown unit
    fn parent(&self, unit: &OrgUnit) -> Option<OrgUnit>;

    /// Units exactly `depth` links below the given unit
    fn descendants_at_depth(&self, unit: &OrgUnit, depth: u32) -> Vec<OrgUnit>;

    /// All units at an absolute hierarchy level, the root being level 1
    fn units_at_level(&self, level: u32) -> Vec<OrgUnit>;

    /// Units sharing the ancestor `distance` links up, the unit itself
    /// included
    fn peers(&self, unit: &OrgUnit, distance: u32) -> Vec<OrgUnit>;

    /// Members of an organisation-unit group
    fn group_members(&self, group_uid: &str) -> Vec<OrgUnit>;

    /// Units reporting to a data set
    fn data_set_members(&self, data_set_uid: &str) -> Vec<OrgUnit>;
}

/// A resolved group or data set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub uid: String,
    #[serde(default)]
    pub code: Option<String>,
    pub name: String,
}

/// Name lookup for references and for description rendering
pub trait MetadataResolver: Send + Sync {
    /// Display name of a data item, if known
    fn data_item_name(&self, item: &DimensionItem) -> Option<String>;

    /// Display name of a constant, if known
    fn constant_name(&self, uid: &str) -> Option<String>;

    /// Resolve a group key, trying uid, then code, then display name
    fn find_org_unit_group(&self, key: &str) -> Option<MetadataEntry>;

    /// Resolve a data-set key, trying uid, then code, then display name
    fn find_data_set(&self, key: &str) -> Option<MetadataEntry>;
}

/// ISO calendar periods: daily `YYYYMMDD`, monthly `YYYYMM`, quarterly
/// `YYYYQn`, yearly `YYYY`
#[derive(Debug, Clone, Copy, Default)]
pub struct CalendarPeriods;

enum Granularity {
    Daily(NaiveDate),
    Monthly { year: i32, month: u32 },
    Quarterly { year: i32, quarter: u32 },
    Yearly(i32),
}

fn classify(iso: &str) -> Option<Granularity> {
    let bytes = iso.as_bytes();
    match bytes.len() {
        4 if iso.chars().all(|c| c.is_ascii_digit()) => {
            Some(Granularity::Yearly(iso.parse().ok()?))
        }
        6 if iso.chars().all(|c| c.is_ascii_digit()) => {
            let year = iso[..4].parse().ok()?;
            let month: u32 = iso[4..].parse().ok()?;
            (1..=12).contains(&month).then_some(Granularity::Monthly { year, month })
        }
        6 if bytes[4] == b'Q' => {
            let year = iso[..4].parse().ok()?;
            let quarter: u32 = iso[5..].parse().ok()?;
            (1..=4).contains(&quarter).then_some(Granularity::Quarterly { year, quarter })
        }
        8 if iso.chars().all(|c| c.is_ascii_digit()) => {
            let year = iso[..4].parse().ok()?;
            let month = iso[4..6].parse().ok()?;
            let day = iso[6..].parse().ok()?;
            NaiveDate::from_ymd_opt(year, month, day).map(Granularity::Daily)
        }
        _ => None,
    }
}

fn format_monthly(year: i32, month: u32) -> Period {
    Period::new(format!("{:04}{:02}", year, month))
}

impl PeriodEngine for CalendarPeriods {
    fn shift_period(&self, period: &Period, offset: i32) -> Option<Period> {
        match classify(period.as_str())? {
            Granularity::Daily(date) => {
                let shifted = date.checked_add_signed(chrono::Duration::days(offset as i64))?;
                Some(Period::new(shifted.format("%Y%m%d").to_string()))
            }
            Granularity::Monthly { year, month } => {
                let total = year * 12 + (month as i32 - 1) + offset;
                Some(format_monthly(total.div_euclid(12), total.rem_euclid(12) as u32 + 1))
            }
            Granularity::Quarterly { year, quarter } => {
                let total = year * 4 + (quarter as i32 - 1) + offset;
                Some(Period::new(format!(
                    "{:04}Q{}",
                    total.div_euclid(4),
                    total.rem_euclid(4) + 1
                )))
            }
            Granularity::Yearly(year) => Some(Period::new(format!("{:04}", year + offset))),
        }
    }

    fn shift_year(&self, period: &Period, offset: i32) -> Option<Period> {
        match classify(period.as_str())? {
            Granularity::Daily(date) => {
                let year = date.year() + offset;
                // Feb 29 clamps to Feb 28 in a non-leap target year
                let shifted = date
                    .with_year(year)
                    .or_else(|| NaiveDate::from_ymd_opt(year, date.month(), 28))?;
                Some(Period::new(shifted.format("%Y%m%d").to_string()))
            }
            Granularity::Monthly { year, month } => Some(format_monthly(year + offset, month)),
            Granularity::Quarterly { year, quarter } => {
                Some(Period::new(format!("{:04}Q{}", year + offset, quarter)))
            }
            Granularity::Yearly(year) => Some(Period::new(format!("{:04}", year + offset))),
        }
    }
}

/// In-memory organisation-unit hierarchy with group and data-set membership
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrgUnitTree {
    /// Every known unit in insertion order, roots included
    #[serde(default)]
    units: Vec<String>,
    /// Child uid -> parent uid; roots have no entry
    #[serde(default)]
    parents: HashMap<String, String>,
    /// Group uid -> member uids
    #[serde(default)]
    groups: HashMap<String, Vec<String>>,
    /// Data-set uid -> reporting unit uids
    #[serde(default)]
    data_sets: HashMap<String, Vec<String>>,
}

impl OrgUnitTree {
    pub fn new() -> Self {
        OrgUnitTree::default()
    }

    pub fn add_root(&mut self, uid: impl Into<String>) -> &mut Self {
        self.units.push(uid.into());
        self
    }

    pub fn add_child(&mut self, uid: impl Into<String>, parent: impl Into<String>) -> &mut Self {
        let uid = uid.into();
        self.parents.insert(uid.clone(), parent.into());
        self.units.push(uid);
        self
    }

    pub fn add_group(&mut self, uid: impl Into<String>, members: Vec<String>) -> &mut Self {
        self.groups.insert(uid.into(), members);
        self
    }

    pub fn add_data_set(&mut self, uid: impl Into<String>, members: Vec<String>) -> &mut Self {
        self.data_sets.insert(uid.into(), members);
        self
    }

    /// Absolute level of a unit, the root being level 1
    pub fn level_of(&self, unit: &OrgUnit) -> Option<u32> {
        if !self.units.iter().any(|u| u == unit.as_str()) {
            return None;
        }
        let mut level = 1;
        let mut current = unit.as_str();
        while let Some(parent) = self.parents.get(current) {
            level += 1;
            current = parent;
        }
        Some(level)
    }

    fn children(&self, unit: &OrgUnit) -> Vec<OrgUnit> {
        self.units
            .iter()
            .filter(|candidate| {
                self.parents.get(*candidate).map(String::as_str) == Some(unit.as_str())
            })
            .map(OrgUnit::new)
            .collect()
    }
}

impl OrgUnitLocator for OrgUnitTree {
    fn parent(&self, unit: &OrgUnit) -> Option<OrgUnit> {
        self.parents.get(unit.as_str()).map(OrgUnit::new)
    }

    fn descendants_at_depth(&self, unit: &OrgUnit, depth: u32) -> Vec<OrgUnit> {
        let mut frontier = vec![unit.clone()];
        for _ in 0..depth {
            frontier = frontier
                .iter()
                .flat_map(|parent| self.children(parent))
                .collect();
        }
        frontier
    }

    fn units_at_level(&self, level: u32) -> Vec<OrgUnit> {
        self.units
            .iter()
            .map(OrgUnit::new)
            .filter(|unit| self.level_of(unit) == Some(level))
            .collect()
    }

    fn peers(&self, unit: &OrgUnit, distance: u32) -> Vec<OrgUnit> {
        let mut ancestor = unit.clone();
        let mut climbed = 0;
        while climbed < distance {
            match self.parent(&ancestor) {
                Some(parent) => {
                    ancestor = parent;
                    climbed += 1;
                }
                None => break,
            }
        }
        self.descendants_at_depth(&ancestor, climbed)
    }

    fn group_members(&self, group_uid: &str) -> Vec<OrgUnit> {
        self.groups
            .get(group_uid)
            .map(|members| members.iter().map(OrgUnit::new).collect())
            .unwrap_or_default()
    }

    fn data_set_members(&self, data_set_uid: &str) -> Vec<OrgUnit> {
        self.data_sets
            .get(data_set_uid)
            .map(|members| members.iter().map(OrgUnit::new).collect())
            .unwrap_or_default()
    }
}

/// Static metadata tables for name lookup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticMetadata {
    /// Reference text (e.g. `#{fbfJHSPpUQD}`) -> display name
    #[serde(default)]
    data_items: HashMap<String, String>,
    /// Constant uid -> display name
    #[serde(default)]
    constants: HashMap<String, String>,
    #[serde(default)]
    org_unit_groups: Vec<MetadataEntry>,
    #[serde(default)]
    data_sets: Vec<MetadataEntry>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        StaticMetadata::default()
    }

    pub fn add_data_item(&mut self, reference: impl Into<String>, name: impl Into<String>) -> &mut Self {
        self.data_items.insert(reference.into(), name.into());
        self
    }

    pub fn add_constant(&mut self, uid: impl Into<String>, name: impl Into<String>) -> &mut Self {
        self.constants.insert(uid.into(), name.into());
        self
    }

    pub fn add_org_unit_group(&mut self, entry: MetadataEntry) -> &mut Self {
        self.org_unit_groups.push(entry);
        self
    }

    pub fn add_data_set(&mut self, entry: MetadataEntry) -> &mut Self {
        self.data_sets.push(entry);
        self
    }
}

fn find_entry<'a>(entries: &'a [MetadataEntry], key: &str) -> Option<&'a MetadataEntry> {
    entries
        .iter()
        .find(|e| e.uid == key)
        .or_else(|| entries.iter().find(|e| e.code.as_deref() == Some(key)))
        .or_else(|| entries.iter().find(|e| e.name == key))
}

impl MetadataResolver for StaticMetadata {
    fn data_item_name(&self, item: &DimensionItem) -> Option<String> {
        self.data_items.get(&item.to_string()).cloned()
    }

    fn constant_name(&self, uid: &str) -> Option<String> {
        self.constants.get(uid).cloned()
    }

    fn find_org_unit_group(&self, key: &str) -> Option<MetadataEntry> {
        find_entry(&self.org_unit_groups, key).cloned()
    }

    fn find_data_set(&self, key: &str) -> Option<MetadataEntry> {
        find_entry(&self.data_sets, key).cloned()
    }
}
