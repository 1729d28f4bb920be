#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use smol_str::SmolStr;

use tripwire_runtime::{
    DispatchSignal, EventKind, EventSet, EventSource, ExecutionContext, HostError, Instrumenter,
    InstrumenterConfig, ProgramUnit, Scope, UnitId, UnitKind, Value,
};

pub type Locals = FxHashMap<SmolStr, Value>;

type Step = Box<dyn Fn(&mut Locals)>;
type ResultFn = Box<dyn Fn(&Locals) -> Value>;

/// Event delivered by the host to the instrumenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub unit: SmolStr,
    pub kind: EventKind,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Site {
    unit: UnitId,
    kind: EventKind,
    line: Option<u32>,
}

#[derive(Debug, Default)]
struct HostState {
    tools: FxHashMap<u8, SmolStr>,
    masks: FxHashMap<Scope, EventSet>,
    silenced: FxHashSet<Site>,
    restarts: usize,
    mask_updates: usize,
    deliveries: Vec<Delivery>,
    breakpoints: usize,
}

/// Simulated runtime: runs scripted units and reports events the way a
/// native event source would, honouring subscription masks and sites
/// silenced by `Disable` until the next restart.
#[derive(Debug, Default)]
pub struct SimHost {
    state: Mutex<HostState>,
}

impl SimHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state.lock().deliveries.clone()
    }

    pub fn restarts(&self) -> usize {
        self.state.lock().restarts
    }

    pub fn mask_updates(&self) -> usize {
        self.state.lock().mask_updates
    }

    pub fn breakpoints(&self) -> usize {
        self.state.lock().breakpoints
    }

    pub fn mask(&self, scope: Scope) -> EventSet {
        self.state.lock().masks.get(&scope).copied().unwrap_or_default()
    }

    fn wants(&self, site: Site) -> bool {
        let state = self.state.lock();
        let mask = state.masks.get(&Scope::Global).copied().unwrap_or_default()
            | state.masks.get(&Scope::Unit(site.unit)).copied().unwrap_or_default();
        mask.contains(site.kind.as_set()) && !state.silenced.contains(&site)
    }

    /// Deliver one event if subscribed; `None` when the host skipped it.
    fn deliver(
        &self,
        instrumenter: &Instrumenter,
        frame: &mut SimFrame<'_>,
        kind: EventKind,
        retval: Option<&Value>,
    ) -> Option<DispatchSignal> {
        let line = match kind {
            EventKind::Line => Some(frame.line),
            EventKind::Start | EventKind::Return => None,
        };
        let site = Site {
            unit: frame.unit.id(),
            kind,
            line,
        };
        if !self.wants(site) {
            return None;
        }
        self.state.lock().deliveries.push(Delivery {
            unit: frame.unit.name().clone(),
            kind,
            line,
        });
        let signal = match (kind, retval) {
            (EventKind::Line, _) => instrumenter.on_line(frame),
            (EventKind::Start, _) => instrumenter.on_start(frame),
            (EventKind::Return, Some(retval)) => instrumenter.on_return(frame, retval),
            (EventKind::Return, None) => instrumenter.on_return(frame, &Value::Null),
        };
        if signal.is_disable() {
            self.state.lock().silenced.insert(site);
        }
        Some(signal)
    }

    /// Run `script` with the given arguments and return its result.
    pub fn call(&self, instrumenter: &Instrumenter, script: &Script, args: &[(&str, Value)]) -> Value {
        let mut frame = SimFrame::new(self, script.unit.clone());
        for (name, value) in args {
            frame.locals.insert((*name).into(), value.clone());
        }
        frame.line = script.unit.first_line();
        self.deliver(instrumenter, &mut frame, EventKind::Start, None);

        let mut pc = 0;
        while let Some((line, step)) = script.steps.get(pc) {
            frame.line = *line;
            self.deliver(instrumenter, &mut frame, EventKind::Line, None);
            if let Some(target) = frame.jump_to.take() {
                if let Some(idx) = script.steps.iter().position(|(line, _)| *line == target) {
                    pc = idx;
                    continue;
                }
            }
            step(&mut frame.locals);
            pc += 1;
        }

        let result = (script.result)(&frame.locals);
        self.deliver(instrumenter, &mut frame, EventKind::Return, Some(&result));
        result
    }

    /// Deliver a single line event for `unit` with the given locals.
    pub fn line_event(
        &self,
        instrumenter: &Instrumenter,
        unit: &Arc<ProgramUnit>,
        line: u32,
        locals: &[(&str, Value)],
    ) -> Option<DispatchSignal> {
        let mut frame = SimFrame::new(self, unit.clone());
        frame.line = line;
        for (name, value) in locals {
            frame.locals.insert((*name).into(), value.clone());
        }
        self.deliver(instrumenter, &mut frame, EventKind::Line, None)
    }
}

impl EventSource for SimHost {
    fn use_tool(&self, id: u8, name: &str) -> Result<(), HostError> {
        let mut state = self.state.lock();
        match state.tools.get(&id) {
            Some(existing) if existing != name => Err(HostError::new(format!(
                "tool {id} already claimed by '{existing}'"
            ))),
            _ => {
                state.tools.insert(id, name.into());
                Ok(())
            }
        }
    }

    fn set_events(&self, scope: Scope, events: EventSet) {
        let mut state = self.state.lock();
        state.masks.insert(scope, events);
        state.mask_updates += 1;
    }

    fn events(&self, scope: Scope) -> EventSet {
        self.mask(scope)
    }

    fn restart_events(&self) {
        let mut state = self.state.lock();
        state.silenced.clear();
        state.restarts += 1;
    }
}

/// Executing frame of a scripted unit.
pub struct SimFrame<'a> {
    host: &'a SimHost,
    unit: Arc<ProgramUnit>,
    line: u32,
    pub locals: Locals,
    jump_to: Option<u32>,
}

impl<'a> SimFrame<'a> {
    fn new(host: &'a SimHost, unit: Arc<ProgramUnit>) -> Self {
        Self {
            host,
            unit,
            line: 0,
            locals: Locals::default(),
            jump_to: None,
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, HostError> {
        self.locals
            .get(name)
            .cloned()
            .ok_or_else(|| HostError::new(format!("NameError: name '{name}' is not defined")))
    }

    fn operand(&self, text: &str) -> Result<Value, HostError> {
        match text.parse::<i64>() {
            Ok(value) => Ok(Value::Int(value)),
            Err(_) => self.lookup(text),
        }
    }
}

impl ExecutionContext for SimFrame<'_> {
    fn unit(&self) -> &Arc<ProgramUnit> {
        &self.unit
    }

    fn line(&self) -> u32 {
        self.line
    }

    fn local(&self, name: &str) -> Option<Value> {
        self.locals.get(name).cloned()
    }

    fn set_local(&mut self, name: &str, value: Value) -> Result<(), HostError> {
        self.locals.insert(name.into(), value);
        Ok(())
    }

    /// Supports `name` and `lhs <op> rhs` with integer comparisons.
    fn evaluate(&mut self, expr: &str) -> Result<Value, HostError> {
        let tokens: Vec<&str> = expr.split_whitespace().collect();
        match tokens.as_slice() {
            [name] => self.operand(name),
            [lhs, op, rhs] => {
                let lhs = self.operand(lhs)?.as_int();
                let rhs = self.operand(rhs)?.as_int();
                let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
                    return Err(HostError::new("TypeError: unsupported operands"));
                };
                let result = match *op {
                    "==" => lhs == rhs,
                    "!=" => lhs != rhs,
                    ">" => lhs > rhs,
                    "<" => lhs < rhs,
                    ">=" => lhs >= rhs,
                    "<=" => lhs <= rhs,
                    other => return Err(HostError::new(format!("SyntaxError: '{other}'"))),
                };
                Ok(Value::Bool(result))
            }
            _ => Err(HostError::new(format!("SyntaxError: '{expr}'"))),
        }
    }

    /// Supports `name = <operand>` and `name += <operand>`.
    fn execute(&mut self, code: &str) -> Result<(), HostError> {
        let tokens: Vec<&str> = code.split_whitespace().collect();
        match tokens.as_slice() {
            [name, "=", rhs] => {
                let value = self.operand(rhs)?;
                self.locals.insert((*name).into(), value);
                Ok(())
            }
            [name, "+=", rhs] => {
                let current = self.lookup(name)?.as_int().unwrap_or_default();
                let delta = self.operand(rhs)?.as_int().unwrap_or_default();
                self.locals.insert((*name).into(), Value::Int(current + delta));
                Ok(())
            }
            _ => Err(HostError::new(format!("SyntaxError: '{code}'"))),
        }
    }

    fn pause(&mut self) -> DispatchSignal {
        self.host.state.lock().breakpoints += 1;
        DispatchSignal::Continue
    }

    fn jump(&mut self, line: u32) -> Result<(), HostError> {
        self.jump_to = Some(line);
        Ok(())
    }
}

/// A unit plus the behaviour of each of its lines.
pub struct Script {
    pub unit: Arc<ProgramUnit>,
    steps: Vec<(u32, Step)>,
    result: ResultFn,
}

impl Script {
    pub fn new(unit: Arc<ProgramUnit>) -> Self {
        Self {
            unit,
            steps: Vec::new(),
            result: Box::new(|_| Value::Null),
        }
    }

    pub fn step(mut self, line: u32, step: impl Fn(&mut Locals) + 'static) -> Self {
        self.steps.push((line, Box::new(step)));
        self
    }

    pub fn returns(mut self, result: impl Fn(&Locals) -> Value + 'static) -> Self {
        self.result = Box::new(result);
        self
    }
}

/// Function unit whose source starts at `first_line`; every body line
/// (everything after the `def` line) is instrumentable.
pub fn function(name: &str, first_line: u32, params: &[&str], source: &str) -> Arc<ProgramUnit> {
    let body = source
        .lines()
        .enumerate()
        .skip_while(|(_, text)| text.trim_start().starts_with('@'))
        .skip(1)
        .filter(|(_, text)| !text.trim().is_empty())
        .map(|(idx, _)| first_line + idx as u32);
    ProgramUnit::builder(name, UnitKind::Function)
        .first_line(first_line)
        .source(source)
        .params(params.iter().copied())
        .lines(body)
        .build()
}

/// Instrumenter without a background sweep, bound to a fresh host.
pub fn instrumenter() -> (Arc<SimHost>, Instrumenter) {
    let host = SimHost::new();
    let config = InstrumenterConfig {
        sweep_interval: None,
        ..InstrumenterConfig::default()
    };
    let instrumenter = Instrumenter::new(host.clone(), &config).expect("instrumenter");
    (host, instrumenter)
}

pub fn int(value: &Locals, name: &str) -> i64 {
    value.get(name).and_then(Value::as_int).unwrap_or_default()
}
