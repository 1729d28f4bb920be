//! Triggers: resolved program points plus an optional guard.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashSet;
use sha2::{Digest, Sha256};
use smol_str::SmolStr;
use tracing::debug;

use crate::action::Predicate;
use crate::error::{ActionError, TriggerError};
use crate::event::{EventKind, ExecutionContext, Scope};
use crate::resolve::{LocationDescriptor, LocationResolver};
use crate::unit::{Entity, ProgramUnit};
use crate::value::Value;

/// Line part of a registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LineSelector {
    /// One specific line.
    At(u32),
    /// Every line (and the only selector used by start and return points).
    Any,
}

impl fmt::Display for LineSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LineSelector::At(line) => write!(f, "{line}"),
            LineSelector::Any => f.write_str("*"),
        }
    }
}

/// Where a handler is registered: `(unit or global, kind, line)`.
#[derive(Debug, Clone)]
pub struct ProgramPoint {
    /// `None` for the global scope.
    pub unit: Option<Arc<ProgramUnit>>,
    /// Event kind observed at the point.
    pub kind: EventKind,
    /// Line part; `Any` for start and return points.
    pub line: LineSelector,
}

impl ProgramPoint {
    /// Registry scope of the point.
    #[must_use]
    pub fn scope(&self) -> Scope {
        self.unit
            .as_ref()
            .map_or(Scope::Global, |unit| Scope::Unit(unit.id()))
    }
}

impl fmt::Display for ProgramPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unit = self.unit.as_ref().map_or("<any>", |unit| unit.name().as_str());
        match self.kind {
            EventKind::Line => write!(f, "{unit}:line@{}", self.line),
            kind => write!(f, "{unit}:{kind}"),
        }
    }
}

/// Guard evaluated before a handler's actions.
#[derive(Debug, Clone)]
pub enum Condition {
    /// Host-language expression, truthy-tested.
    Expr(SmolStr),
    /// Native predicate with name-bound parameters.
    Predicate(Predicate),
}

impl Condition {
    pub(crate) fn holds(
        &self,
        resolver: &LocationResolver,
        ctx: &mut dyn ExecutionContext,
        retval: Option<&Value>,
    ) -> Result<bool, ActionError> {
        match self {
            Condition::Expr(expr) => Ok(ctx.evaluate(expr)?.is_truthy()),
            Condition::Predicate(predicate) => predicate.test(resolver, &*ctx, retval),
        }
    }
}

impl From<&str> for Condition {
    fn from(expr: &str) -> Self {
        Condition::Expr(expr.into())
    }
}

impl From<Predicate> for Condition {
    fn from(predicate: Predicate) -> Self {
        Condition::Predicate(predicate)
    }
}

/// A target, the program points resolved from it, and an optional condition.
///
/// Points are resolved once at construction and never change afterwards.
#[derive(Debug, Clone)]
pub struct Trigger {
    target: Entity,
    points: Vec<ProgramPoint>,
    condition: Option<Condition>,
    resolver: Arc<LocationResolver>,
}

impl Trigger {
    /// Build against the process-wide resolver.
    pub fn build(
        entity: impl Into<Entity>,
        descriptors: &[LocationDescriptor],
        condition: Option<Condition>,
        source_hash: Option<&str>,
    ) -> Result<Self, TriggerError> {
        Self::build_with(
            LocationResolver::shared(),
            entity,
            descriptors,
            condition,
            source_hash,
        )
    }

    /// Build against an injected resolver.
    pub fn build_with(
        resolver: Arc<LocationResolver>,
        entity: impl Into<Entity>,
        descriptors: &[LocationDescriptor],
        condition: Option<Condition>,
        source_hash: Option<&str>,
    ) -> Result<Self, TriggerError> {
        let target = entity.into();

        if let Some(expected) = source_hash {
            let actual = fingerprint(&target)?;
            if actual != expected {
                return Err(TriggerError::SourceDrifted {
                    expected: expected.into(),
                    actual,
                });
            }
        }

        let unit = target.unit().cloned();
        let mut points = Vec::new();
        let mut line_descriptors = Vec::new();
        for descriptor in descriptors {
            match descriptor {
                LocationDescriptor::Start => points.push(ProgramPoint {
                    unit: unit.clone(),
                    kind: EventKind::Start,
                    line: LineSelector::Any,
                }),
                LocationDescriptor::Return => points.push(ProgramPoint {
                    unit: unit.clone(),
                    kind: EventKind::Return,
                    line: LineSelector::Any,
                }),
                other => line_descriptors.push(other.clone()),
            }
        }

        if descriptors.is_empty() {
            points.push(ProgramPoint {
                unit: unit.clone(),
                kind: EventKind::Line,
                line: LineSelector::Any,
            });
        } else if !line_descriptors.is_empty() {
            match &unit {
                Some(unit) => {
                    for group in resolver.resolve(unit, &line_descriptors)?.iter() {
                        points.extend(group.lines.iter().map(|line| ProgramPoint {
                            unit: Some(group.unit.clone()),
                            kind: EventKind::Line,
                            line: LineSelector::At(*line),
                        }));
                    }
                }
                None => points.extend(global_lines(&line_descriptors)?.into_iter().map(
                    |line| ProgramPoint {
                        unit: None,
                        kind: EventKind::Line,
                        line: LineSelector::At(line),
                    },
                )),
            }
        }

        debug!(
            target = %target.describe(),
            points = points.len(),
            "trigger built"
        );
        Ok(Self {
            target,
            points,
            condition,
            resolver,
        })
    }

    /// Entity the trigger was built for.
    #[must_use]
    pub fn target(&self) -> &Entity {
        &self.target
    }

    /// Resolved points, sentinels first.
    #[must_use]
    pub fn points(&self) -> &[ProgramPoint] {
        &self.points
    }

    /// Guard, if any.
    #[must_use]
    pub fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    /// Resolver used for goto targets and callback parameters.
    #[must_use]
    pub fn resolver(&self) -> &Arc<LocationResolver> {
        &self.resolver
    }

    /// Whether resolution produced no point at all.
    #[must_use]
    pub fn matches_nothing(&self) -> bool {
        self.points.is_empty()
    }

    /// Evaluate the condition; a trigger without one always holds.
    pub(crate) fn holds(
        &self,
        ctx: &mut dyn ExecutionContext,
        retval: Option<&Value>,
    ) -> Result<bool, ActionError> {
        match &self.condition {
            Some(condition) => condition.holds(&self.resolver, ctx, retval),
            None => Ok(true),
        }
    }
}

/// Explicit lines for a trigger without a target unit, intersected.
fn global_lines(descriptors: &[LocationDescriptor]) -> Result<Vec<u32>, TriggerError> {
    let mut agreed: Option<FxHashSet<u32>> = None;
    for descriptor in descriptors {
        let LocationDescriptor::Line(line) = descriptor else {
            return Err(TriggerError::InvalidDescriptor(
                format!("{descriptor} needs a target with source text").into(),
            ));
        };
        agreed = Some(match agreed {
            None => std::iter::once(*line).collect(),
            Some(previous) => previous.into_iter().filter(|seen| seen == line).collect(),
        });
    }
    let mut lines: Vec<u32> = agreed.unwrap_or_default().into_iter().collect();
    lines.sort_unstable();
    Ok(lines)
}

/// Short fingerprint of an entity's full source text: the last eight hex
/// digits of its SHA-256.
pub fn fingerprint(entity: &Entity) -> Result<SmolStr, TriggerError> {
    let source = entity
        .unit()
        .and_then(|unit| unit.source())
        .ok_or_else(|| TriggerError::SourceUnavailable(entity.describe()))?;
    Ok(fingerprint_text(source))
}

pub(crate) fn fingerprint_text(source: &str) -> SmolStr {
    let digest = Sha256::digest(source.as_bytes());
    let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    SmolStr::new(&hex[hex.len() - 8..])
}
