//! Program units and instrumentation targets.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use smol_str::SmolStr;

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a program unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u64);

/// Kind of compiled block a unit represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitKind {
    /// Module body.
    Module,
    /// Function or method body.
    Function,
    /// Class body.
    Class,
    /// Anonymous function body.
    Lambda,
    /// Comprehension body.
    Comprehension,
}

/// One entry of a unit's line table: instruction offsets `start..end`
/// attributed to `line` (`None` for synthetic instructions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    /// First instruction offset.
    pub start: u32,
    /// One past the last instruction offset.
    pub end: u32,
    /// Source line, if any.
    pub line: Option<u32>,
}

/// An immutable compiled block of code.
///
/// Units form a tree: a module contains functions and classes, a function
/// contains nested functions, lambdas and comprehensions. The identity of a
/// unit is its [`UnitId`]; two units built from the same text are distinct.
#[derive(Debug)]
pub struct ProgramUnit {
    id: UnitId,
    name: SmolStr,
    kind: UnitKind,
    first_line: u32,
    source: Option<Arc<str>>,
    params: Vec<SmolStr>,
    line_table: Vec<LineRange>,
    children: Vec<Arc<ProgramUnit>>,
}

impl ProgramUnit {
    /// Start building a unit.
    #[must_use]
    pub fn builder(name: impl Into<SmolStr>, kind: UnitKind) -> UnitBuilder {
        UnitBuilder {
            name: name.into(),
            kind,
            first_line: 1,
            source: None,
            params: Vec::new(),
            line_table: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Module unit over a whole text, with every non-blank line instrumentable.
    #[must_use]
    pub fn flat_module(name: impl Into<SmolStr>, source: &str) -> Arc<Self> {
        let lines = source
            .lines()
            .enumerate()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(idx, _)| u32::try_from(idx + 1).unwrap_or(u32::MAX));
        Self::builder(name, UnitKind::Module)
            .source(source)
            .lines(lines)
            .build()
    }

    /// Process-unique identity.
    #[must_use]
    pub fn id(&self) -> UnitId {
        self.id
    }

    /// Qualified name as reported in diagnostics.
    #[must_use]
    pub fn name(&self) -> &SmolStr {
        &self.name
    }

    /// Kind of block.
    #[must_use]
    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    /// Line of the first source line, decorators included.
    #[must_use]
    pub fn first_line(&self) -> u32 {
        self.first_line
    }

    /// Source text of this unit, if retrievable.
    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Formal parameter names.
    #[must_use]
    pub fn params(&self) -> &[SmolStr] {
        &self.params
    }

    /// Raw line table, in instruction order.
    #[must_use]
    pub fn line_table(&self) -> &[LineRange] {
        &self.line_table
    }

    /// Directly nested units.
    #[must_use]
    pub fn children(&self) -> &[Arc<ProgramUnit>] {
        &self.children
    }

    /// Distinct source lines with instructions in this unit, in table order.
    pub fn lines(&self) -> impl Iterator<Item = u32> + '_ {
        let mut seen = rustc_hash::FxHashSet::default();
        self.line_table
            .iter()
            .filter_map(|entry| entry.line)
            .filter(move |line| seen.insert(*line))
    }

    /// Whether `line` appears in this unit's own line table.
    #[must_use]
    pub fn has_line(&self, line: u32) -> bool {
        self.line_table.iter().any(|entry| entry.line == Some(line))
    }

    /// Size of the unit in source lines.
    ///
    /// Falls back to the extent of the line table when no source is attached.
    #[must_use]
    pub fn span(&self) -> usize {
        if let Some(source) = &self.source {
            return source.lines().count();
        }
        let mut lines = self.line_table.iter().filter_map(|entry| entry.line);
        let Some(first) = lines.next() else {
            return 0;
        };
        let (min, max) = lines.fold((first, first), |(min, max), line| {
            (min.min(line), max.max(line))
        });
        (max - min) as usize + 1
    }
}

/// Builder for [`ProgramUnit`].
#[derive(Debug)]
pub struct UnitBuilder {
    name: SmolStr,
    kind: UnitKind,
    first_line: u32,
    source: Option<Arc<str>>,
    params: Vec<SmolStr>,
    line_table: Vec<LineRange>,
    children: Vec<Arc<ProgramUnit>>,
}

impl UnitBuilder {
    /// Line of the first source line, decorators included.
    #[must_use]
    pub fn first_line(mut self, line: u32) -> Self {
        self.first_line = line;
        self
    }

    /// Attach the unit's source text.
    #[must_use]
    pub fn source(mut self, text: &str) -> Self {
        self.source = Some(Arc::from(text));
        self
    }

    /// Formal parameter names, receiver first for methods.
    #[must_use]
    pub fn params<I, S>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SmolStr>,
    {
        self.params = params.into_iter().map(Into::into).collect();
        self
    }

    /// Append one line-table entry per line, two instruction slots each.
    #[must_use]
    pub fn lines(mut self, lines: impl IntoIterator<Item = u32>) -> Self {
        for line in lines {
            let start = self.line_table.last().map_or(0, |entry| entry.end);
            self.line_table.push(LineRange {
                start,
                end: start + 2,
                line: Some(line),
            });
        }
        self
    }

    /// Append a raw line-table entry.
    #[must_use]
    pub fn line_range(mut self, start: u32, end: u32, line: Option<u32>) -> Self {
        self.line_table.push(LineRange { start, end, line });
        self
    }

    /// Nest `child` inside this unit.
    #[must_use]
    pub fn child(mut self, child: Arc<ProgramUnit>) -> Self {
        self.children.push(child);
        self
    }

    /// Finish the unit with a fresh [`UnitId`].
    #[must_use]
    pub fn build(self) -> Arc<ProgramUnit> {
        Arc::new(ProgramUnit {
            id: UnitId(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed)),
            name: self.name,
            kind: self.kind,
            first_line: self.first_line,
            source: self.source,
            params: self.params,
            line_table: self.line_table,
            children: self.children,
        })
    }
}

/// A function, or a method bound to a receiver.
#[derive(Debug, Clone)]
pub struct Callable {
    unit: Arc<ProgramUnit>,
    bound: bool,
}

impl Callable {
    /// A plain function.
    #[must_use]
    pub fn function(unit: Arc<ProgramUnit>) -> Self {
        Self { unit, bound: false }
    }

    /// A method bound to its receiver; the first parameter is already supplied.
    #[must_use]
    pub fn method(unit: Arc<ProgramUnit>) -> Self {
        Self { unit, bound: true }
    }

    /// Code unit of the callable.
    #[must_use]
    pub fn unit(&self) -> &Arc<ProgramUnit> {
        &self.unit
    }

    /// Whether a receiver is already supplied.
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Parameters a caller supplies.
    #[must_use]
    pub fn params(&self) -> &[SmolStr] {
        let params = self.unit.params();
        if self.bound && !params.is_empty() {
            &params[1..]
        } else {
            params
        }
    }
}

/// Target of a trigger.
#[derive(Debug, Clone)]
pub enum Entity {
    /// Every unit (global scope).
    Any,
    /// A function, class or module body.
    Unit(Arc<ProgramUnit>),
    /// A function or bound method.
    Callable(Callable),
}

impl Entity {
    /// Unit the entity resolves to; `None` for [`Entity::Any`].
    #[must_use]
    pub fn unit(&self) -> Option<&Arc<ProgramUnit>> {
        match self {
            Entity::Any => None,
            Entity::Unit(unit) => Some(unit),
            Entity::Callable(callable) => Some(callable.unit()),
        }
    }

    /// Name for logs and errors.
    #[must_use]
    pub fn describe(&self) -> SmolStr {
        match self.unit() {
            Some(unit) => unit.name().clone(),
            None => SmolStr::new_inline("<any>"),
        }
    }
}

impl From<Arc<ProgramUnit>> for Entity {
    fn from(unit: Arc<ProgramUnit>) -> Self {
        Entity::Unit(unit)
    }
}

impl From<&Arc<ProgramUnit>> for Entity {
    fn from(unit: &Arc<ProgramUnit>) -> Self {
        Entity::Unit(unit.clone())
    }
}

impl From<Callable> for Entity {
    fn from(callable: Callable) -> Self {
        Entity::Callable(callable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_prefers_source_line_count() {
        let unit = ProgramUnit::builder("f", UnitKind::Function)
            .first_line(10)
            .source("def f(x):\n    y = x\n    return y\n")
            .lines([10, 11, 12])
            .build();
        assert_eq!(unit.span(), 3);

        let synthetic = ProgramUnit::builder("g", UnitKind::Function)
            .lines([4, 9, 6])
            .build();
        assert_eq!(synthetic.span(), 6);
    }

    #[test]
    fn lines_are_distinct_and_skip_synthetic_entries() {
        let unit = ProgramUnit::builder("f", UnitKind::Function)
            .line_range(0, 2, None)
            .line_range(2, 4, Some(3))
            .line_range(4, 6, Some(4))
            .line_range(6, 8, Some(3))
            .build();
        assert_eq!(unit.lines().collect::<Vec<_>>(), vec![3, 4]);
        assert!(unit.has_line(4));
        assert!(!unit.has_line(5));
    }

    #[test]
    fn bound_methods_hide_receiver() {
        let unit = ProgramUnit::builder("m", UnitKind::Function)
            .params(["self", "x"])
            .build();
        assert_eq!(Callable::method(unit.clone()).params(), &["x"]);
        assert_eq!(Callable::function(unit).params().len(), 2);
    }

    #[test]
    fn unit_ids_are_unique() {
        let a = ProgramUnit::builder("a", UnitKind::Module).build();
        let b = ProgramUnit::builder("a", UnitKind::Module).build();
        assert_ne!(a.id(), b.id());
    }
}
