//! Location descriptors and their resolution to source lines.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use rustc_hash::{FxHashMap, FxHashSet};
use smol_str::SmolStr;

use crate::action::{CallbackId, Signature};
use crate::cache::{AdaptiveCache, CacheStats};
use crate::config::CacheConfig;
use crate::error::TriggerError;
use crate::unit::{ProgramUnit, UnitId};

const START_SENTINEL: &str = "<start>";
const RETURN_SENTINEL: &str = "<return>";

/// Where inside a target a trigger should fire.
#[derive(Debug, Clone)]
pub enum LocationDescriptor {
    /// An absolute line number.
    Line(u32),
    /// Lines whose stripped text starts with this prefix.
    Prefix(SmolStr),
    /// Lines whose stripped text matches this regex at its start.
    Pattern(Regex),
    /// The target's entry.
    Start,
    /// The target's return.
    Return,
}

impl LocationDescriptor {
    /// Parse a textual descriptor: the sentinels `<start>` and `<return>`,
    /// otherwise a line prefix.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        match text {
            START_SENTINEL => Self::Start,
            RETURN_SENTINEL => Self::Return,
            _ => Self::Prefix(text.into()),
        }
    }

    /// Compile a regex descriptor.
    pub fn pattern(pattern: &str) -> Result<Self, TriggerError> {
        Regex::new(pattern)
            .map(Self::Pattern)
            .map_err(|err| TriggerError::InvalidPattern {
                pattern: pattern.into(),
                message: err.to_string().into(),
            })
    }

    /// Convert a dynamically typed configuration value.
    ///
    /// Integers are line numbers, strings go through [`Self::parse`] and
    /// `{ regex = "..." }` tables are patterns. Anything else is rejected.
    pub fn from_toml(value: &toml::Value) -> Result<Self, TriggerError> {
        match value {
            toml::Value::Integer(line) => u32::try_from(*line)
                .ok()
                .filter(|line| *line > 0)
                .map(Self::Line)
                .ok_or_else(|| {
                    TriggerError::InvalidDescriptor(format!("line number {line} out of range").into())
                }),
            toml::Value::String(text) => Ok(Self::parse(text)),
            toml::Value::Table(table) => match (table.len(), table.get("regex")) {
                (1, Some(toml::Value::String(pattern))) => Self::pattern(pattern),
                _ => Err(TriggerError::InvalidDescriptor(
                    format!("unsupported descriptor table {value}").into(),
                )),
            },
            other => Err(TriggerError::InvalidDescriptor(
                format!("unsupported descriptor type '{}'", other.type_str()).into(),
            )),
        }
    }

    /// Whether this is `<start>` or `<return>`.
    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        matches!(self, Self::Start | Self::Return)
    }

    fn key(&self) -> Result<DescriptorKey, TriggerError> {
        match self {
            Self::Line(line) => Ok(DescriptorKey::Line(*line)),
            Self::Prefix(prefix) => Ok(DescriptorKey::Prefix(prefix.clone())),
            Self::Pattern(regex) => Ok(DescriptorKey::Pattern(regex.as_str().into())),
            Self::Start | Self::Return => Err(TriggerError::InvalidDescriptor(
                format!("'{self}' does not name a line").into(),
            )),
        }
    }
}

impl fmt::Display for LocationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Line(line) => write!(f, "{line}"),
            Self::Prefix(prefix) => write!(f, "{prefix:?}"),
            Self::Pattern(regex) => write!(f, "/{}/", regex.as_str()),
            Self::Start => f.write_str(START_SENTINEL),
            Self::Return => f.write_str(RETURN_SENTINEL),
        }
    }
}

impl From<u32> for LocationDescriptor {
    fn from(line: u32) -> Self {
        Self::Line(line)
    }
}

impl From<&str> for LocationDescriptor {
    fn from(text: &str) -> Self {
        Self::parse(text)
    }
}

impl From<Regex> for LocationDescriptor {
    fn from(regex: Regex) -> Self {
        Self::Pattern(regex)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DescriptorKey {
    Line(u32),
    Prefix(SmolStr),
    Pattern(SmolStr),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LinesKey {
    unit: UnitId,
    descriptors: Vec<DescriptorKey>,
}

/// Lines of one (sub-)unit matched by a descriptor list.
#[derive(Debug, Clone)]
pub struct UnitLines {
    /// The most specific unit owning the lines.
    pub unit: Arc<ProgramUnit>,
    /// Matched lines, ascending.
    pub lines: Vec<u32>,
}

/// Counters of the three resolver caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverStats {
    /// Line resolution cache.
    pub lines: CacheStats,
    /// Unit tree cache.
    pub descendants: CacheStats,
    /// Callback parameter cache.
    pub parameters: CacheStats,
}

static SHARED: Lazy<RwLock<Arc<LocationResolver>>> =
    Lazy::new(|| RwLock::new(Arc::new(LocationResolver::default())));

/// Resolves location descriptors against program units.
///
/// All inputs are immutable, so the memoized results never go stale.
#[derive(Debug)]
pub struct LocationResolver {
    lines: AdaptiveCache<LinesKey, Arc<[UnitLines]>>,
    descendants: AdaptiveCache<UnitId, Arc<[Arc<ProgramUnit>]>>,
    parameters: AdaptiveCache<CallbackId, Arc<[SmolStr]>>,
}

impl Default for LocationResolver {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

impl LocationResolver {
    /// Empty resolver whose caches follow `config`.
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            lines: AdaptiveCache::new("lines", config.lines),
            descendants: AdaptiveCache::new("descendants", config.descendants),
            parameters: AdaptiveCache::new("parameters", config.parameters),
        }
    }

    /// Process-wide resolver used when none is injected.
    #[must_use]
    pub fn shared() -> Arc<LocationResolver> {
        SHARED.read().clone()
    }

    /// Replace the process-wide resolver with an empty one tuned by `config`.
    ///
    /// Triggers built earlier keep the resolver they were built with.
    pub fn configure(config: &CacheConfig) {
        *SHARED.write() = Arc::new(Self::new(config));
    }

    /// Every unit in the tree rooted at `unit`, root first.
    pub fn descendants(&self, unit: &Arc<ProgramUnit>) -> Arc<[Arc<ProgramUnit>]> {
        self.descendants
            .get_or_insert_with(unit.id(), || collect_descendants(unit))
    }

    /// Parameter names a callback expects to receive.
    pub fn parameters(&self, callback: &dyn Signature) -> Arc<[SmolStr]> {
        self.parameters.get_or_insert_with(callback.callback_id(), || {
            let params = callback.declared_params();
            if callback.is_bound() && !params.is_empty() {
                Arc::from(&params[1..])
            } else {
                Arc::from(params)
            }
        })
    }

    /// Resolve line descriptors (combined with AND) against `unit`.
    ///
    /// Returns an empty slice when nothing matches. Sentinels are rejected.
    pub fn resolve(
        &self,
        unit: &Arc<ProgramUnit>,
        descriptors: &[LocationDescriptor],
    ) -> Result<Arc<[UnitLines]>, TriggerError> {
        let key = LinesKey {
            unit: unit.id(),
            descriptors: descriptors
                .iter()
                .map(LocationDescriptor::key)
                .collect::<Result<_, _>>()?,
        };
        self.lines
            .try_get_or_insert_with(key, || Ok(self.resolve_uncached(unit, descriptors)))
    }

    /// Drop every memoized result and reset cache counters.
    pub fn clear(&self) {
        self.lines.clear();
        self.descendants.clear();
        self.parameters.clear();
    }

    /// Counters of each cache.
    #[must_use]
    pub fn stats(&self) -> ResolverStats {
        ResolverStats {
            lines: self.lines.stats(),
            descendants: self.descendants.stats(),
            parameters: self.parameters.stats(),
        }
    }

    fn resolve_uncached(
        &self,
        unit: &Arc<ProgramUnit>,
        descriptors: &[LocationDescriptor],
    ) -> Arc<[UnitLines]> {
        let (lines, start_line) = real_source_lines(unit);

        let mut agreed: Option<FxHashSet<u32>> = None;
        for descriptor in descriptors {
            let candidates = candidate_lines(descriptor, &lines, start_line);
            if candidates.is_empty() {
                return Arc::from(Vec::new());
            }
            agreed = Some(match agreed {
                None => candidates,
                Some(previous) => previous.intersection(&candidates).copied().collect(),
            });
        }
        let Some(agreed) = agreed else {
            return Arc::from(Vec::new());
        };

        let units = self.descendants(unit);
        let owners = line_owners(&units);

        let mut grouped: FxHashMap<usize, Vec<u32>> = FxHashMap::default();
        for line in agreed {
            if let Some(owner) = owners.get(&line) {
                grouped.entry(*owner).or_default().push(line);
            }
        }
        let mut order: Vec<usize> = grouped.keys().copied().collect();
        order.sort_unstable();
        order
            .into_iter()
            .filter_map(|idx| {
                let mut lines = grouped.remove(&idx)?;
                lines.sort_unstable();
                Some(UnitLines {
                    unit: units[idx].clone(),
                    lines,
                })
            })
            .collect()
    }
}

/// Source lines of the unit body with leading decorators skipped, and the
/// line number of the first returned line.
pub(crate) fn real_source_lines(unit: &ProgramUnit) -> (Vec<&str>, u32) {
    let mut start_line = unit.first_line();
    let Some(source) = unit.source() else {
        return (Vec::new(), start_line);
    };
    let mut lines: Vec<&str> = source.lines().collect();
    let decorators = lines
        .iter()
        .take_while(|line| line.trim_start().starts_with('@'))
        .count();
    lines.drain(..decorators);
    start_line += u32::try_from(decorators).unwrap_or(0);
    (lines, start_line)
}

fn candidate_lines(descriptor: &LocationDescriptor, lines: &[&str], start_line: u32) -> FxHashSet<u32> {
    let matches = |text: &str| match descriptor {
        LocationDescriptor::Prefix(prefix) => text.starts_with(prefix.as_str()),
        LocationDescriptor::Pattern(regex) => regex.find(text).is_some_and(|m| m.start() == 0),
        _ => false,
    };
    match descriptor {
        LocationDescriptor::Line(line) => std::iter::once(*line).collect(),
        _ => lines
            .iter()
            .zip(start_line..)
            .filter(|(text, _)| matches(text.trim()))
            .map(|(_, line)| line)
            .collect(),
    }
}

/// Map each physical line to the index of the smallest unit claiming it.
fn line_owners(units: &[Arc<ProgramUnit>]) -> FxHashMap<u32, usize> {
    let mut owners: FxHashMap<u32, usize> = FxHashMap::default();
    for (idx, unit) in units.iter().enumerate() {
        for line in unit.lines() {
            match owners.get(&line) {
                Some(existing) if units[*existing].span() <= unit.span() => {}
                _ => {
                    owners.insert(line, idx);
                }
            }
        }
    }
    owners
}

fn collect_descendants(root: &Arc<ProgramUnit>) -> Arc<[Arc<ProgramUnit>]> {
    let mut all = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(unit) = stack.pop() {
        stack.extend(unit.children().iter().rev().cloned());
        all.push(unit);
    }
    Arc::from(all)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::UnitKind;

    fn function_with_lambda() -> Arc<ProgramUnit> {
        let lambda = ProgramUnit::builder("<lambda>", UnitKind::Lambda)
            .first_line(2)
            .source("    return apply(lambda y: y + 1, x)\n")
            .lines([2])
            .build();
        ProgramUnit::builder("outer", UnitKind::Function)
            .first_line(1)
            .source("def outer(x):\n    return apply(lambda y: y + 1, x)\n")
            .lines([1, 2])
            .child(lambda)
            .build()
    }

    #[test]
    fn shared_line_goes_to_smallest_unit() {
        let resolver = LocationResolver::default();
        let outer = function_with_lambda();
        let resolved = resolver
            .resolve(&outer, &[LocationDescriptor::parse("return apply")])
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].unit.name(), "<lambda>");
        assert_eq!(resolved[0].lines, vec![2]);
    }

    #[test]
    fn decorators_are_skipped() {
        let unit = ProgramUnit::builder("f", UnitKind::Function)
            .first_line(5)
            .source("@cached\n@traced\ndef f():\n    pass\n")
            .lines([7, 8])
            .build();
        let (lines, start) = real_source_lines(&unit);
        assert_eq!(start, 7);
        assert_eq!(lines[0], "def f():");
    }

    #[test]
    fn pattern_matches_only_at_line_start() {
        let unit = ProgramUnit::builder("f", UnitKind::Function)
            .source("def f(x):\n    y = x + 1\n    return y\n")
            .lines([1, 2, 3])
            .build();
        let resolver = LocationResolver::default();
        let anchored = resolver
            .resolve(&unit, &[LocationDescriptor::pattern(r"y\s*=").unwrap()])
            .unwrap();
        assert_eq!(anchored[0].lines, vec![2]);
        let unanchored = resolver
            .resolve(&unit, &[LocationDescriptor::pattern(r"x \+").unwrap()])
            .unwrap();
        assert!(unanchored.is_empty());
    }

    #[test]
    fn sentinels_cannot_be_resolved_to_lines() {
        let unit = function_with_lambda();
        let err = LocationResolver::default()
            .resolve(&unit, &[LocationDescriptor::Start])
            .unwrap_err();
        assert!(matches!(err, TriggerError::InvalidDescriptor(_)));
    }

    #[test]
    fn toml_descriptors_reject_unknown_shapes() {
        let line = toml::Value::Integer(12);
        assert!(matches!(
            LocationDescriptor::from_toml(&line),
            Ok(LocationDescriptor::Line(12))
        ));
        let start = toml::Value::String("<start>".into());
        assert!(matches!(
            LocationDescriptor::from_toml(&start),
            Ok(LocationDescriptor::Start)
        ));
        let float = toml::Value::Float(1.5);
        assert!(matches!(
            LocationDescriptor::from_toml(&float),
            Err(TriggerError::InvalidDescriptor(_))
        ));
        let negative = toml::Value::Integer(-1);
        assert!(LocationDescriptor::from_toml(&negative).is_err());
    }

    #[test]
    fn descendants_are_cached_per_unit() {
        let resolver = LocationResolver::default();
        let outer = function_with_lambda();
        let first = resolver.descendants(&outer);
        let second = resolver.descendants(&outer);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.len(), 2);
        assert_eq!(resolver.stats().descendants.hits, 1);
    }
}
