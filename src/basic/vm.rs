use crate::basic::error::{BasicError, MAX_CAPTURED_VARS, RuntimeError};
use crate::basic::funcs::call_builtin;
use crate::basic::opcode::{Instruction, OPCODE_COUNT, Opcode, TARGET_LABEL};
use crate::basic::program::Bytecode;
use crate::basic::value::Value;
use crate::models::message::Message;
use once_cell::sync::Lazy;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

pub const MAX_STACK: usize = 1000;
pub const MAX_CALL_STACK: usize = 100;
pub const MAX_FOR_STACK: usize = 50;
/// Cooperative yield cadence, in executed instructions.
pub const YIELD_INTERVAL: u64 = 100;
/// Bound on the memoised handler cache.
pub const INSTR_CACHE_CAP: usize = 1000;
/// Bound on total DIM'd elements per array.
pub const MAX_ARRAY_ELEMS: usize = 65_536;

#[derive(Debug, Clone)]
pub struct ForFrame {
    pub variable: String,
    pub current: f64,
    pub end: f64,
    pub step: f64,
    /// First instruction of the loop body.
    pub start_pc: usize,
    /// Instruction just past the matching FOR_NEXT.
    pub next_pc: usize,
    pub estimated_count: u64,
}

#[derive(Debug, Clone)]
pub struct PendingInput {
    pub resume_pc: usize,
    pub var: String,
}

#[derive(Debug, PartialEq)]
pub enum RunOutcome {
    Done,
    /// Suspended on INPUT; resume with [`Vm::resume`] and re-run.
    AwaitingInput { prompt: String },
    Cancelled,
}

enum Flow {
    Continue,
    Jump(usize),
    Halt,
    Await(String),
}

type Handler = fn(&mut Vm, Instruction) -> Result<Flow, String>;

#[derive(Debug)]
struct ArrayMeta {
    dims: Vec<usize>,
}

struct CacheEntry {
    handler: Option<Handler>,
    last_used: u64,
}

/// A reentrant bytecode interpreter. Execution happens in [`Vm::run`];
/// `INPUT` suspends by recording a resume pc and the target variable, and
/// the VM is re-entered after [`Vm::resume`].
pub struct Vm {
    program: Arc<Bytecode>,
    pc: usize,
    stack: Vec<Value>,
    call_stack: Vec<usize>,
    for_stack: Vec<ForFrame>,
    vars: HashMap<String, Value>,
    arrays: HashMap<String, ArrayMeta>,
    running: bool,
    pending_input: Option<PendingInput>,
    executed: u64,
    print_buf: String,
    data_ptr: usize,
    rng: StdRng,
    cache: HashMap<(u8, i32), CacheEntry>,
    pending_emit: Option<Message>,
    /// Test hook: skip the handler table and take the legacy switch.
    pub force_legacy: bool,
}

impl Vm {
    pub fn new(program: Arc<Bytecode>) -> Self {
        Self {
            program,
            pc: 0,
            stack: Vec::new(),
            call_stack: Vec::new(),
            for_stack: Vec::new(),
            vars: HashMap::new(),
            arrays: HashMap::new(),
            running: false,
            pending_input: None,
            executed: 0,
            print_buf: String::new(),
            data_ptr: 0,
            rng: StdRng::from_os_rng(),
            cache: HashMap::new(),
            pending_emit: None,
            force_legacy: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn pending_input(&self) -> Option<&PendingInput> {
        self.pending_input.as_ref()
    }

    pub fn var(&self, name: &str) -> Option<&Value> {
        self.vars.get(&name.to_uppercase())
    }

    pub fn for_depth(&self) -> usize {
        self.for_stack.len()
    }

    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    /// Reset execution state and drop the instruction cache; used on
    /// program reload.
    pub fn reset(&mut self, program: Arc<Bytecode>) {
        *self = Self {
            force_legacy: self.force_legacy,
            ..Self::new(program)
        };
    }

    /// Store the awaited input value and arm the VM to continue at the
    /// recorded resume pc.
    pub fn resume(&mut self, input: &str) -> Result<(), String> {
        let pending = self.pending_input.take().ok_or("not awaiting input")?;
        let value = Value::Str(input.trim().to_string()).conform_to(&pending.var);
        self.vars.insert(pending.var, value);
        self.pc = pending.resume_pc;
        Ok(())
    }

    /// Drive the program until it halts, suspends on INPUT, fails, or is
    /// cancelled. Output messages stream through `out`.
    pub async fn run(
        &mut self,
        out: &mpsc::Sender<Message>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<RunOutcome, BasicError> {
        self.running = true;
        loop {
            if *cancel.borrow() {
                self.running = false;
                return Ok(RunOutcome::Cancelled);
            }
            if self.pc >= self.program.instructions.len() {
                self.running = false;
                return Ok(RunOutcome::Done);
            }
            let at = self.pc;
            let ins = self.program.instructions[at];
            self.pc += 1;
            self.executed += 1;
            if self.executed % YIELD_INTERVAL == 0 {
                tokio::task::yield_now().await;
            }

            let flow = self
                .dispatch(ins)
                .map_err(|message| self.runtime_error(at, message))?;

            if let Some(msg) = self.pending_emit.take() {
                if out.send(msg).await.is_err() {
                    // Receiver gone; nobody can see output anymore
                    self.running = false;
                    return Ok(RunOutcome::Cancelled);
                }
            }

            match flow {
                Flow::Continue => {}
                Flow::Jump(target) => self.pc = target,
                Flow::Halt => {
                    self.running = false;
                    return Ok(RunOutcome::Done);
                }
                Flow::Await(prompt) => {
                    self.running = false;
                    return Ok(RunOutcome::AwaitingInput { prompt });
                }
            }
        }
    }

    /// Primary dispatch: memoised handler-table lookup with the legacy
    /// switch as fallback for unregistered opcodes.
    fn dispatch(&mut self, ins: Instruction) -> Result<Flow, String> {
        if self.force_legacy {
            return step_legacy(self, ins);
        }
        let key = (ins.op as u8, ins.a);
        let cached = match self.cache.get_mut(&key) {
            Some(entry) => {
                entry.last_used = self.executed;
                Some(entry.handler)
            }
            None => None,
        };
        let handler = match cached {
            Some(h) => h,
            None => {
                let h = HANDLERS[ins.op as usize];
                if self.cache.len() >= INSTR_CACHE_CAP {
                    self.evict_oldest_cache_entry();
                }
                self.cache.insert(key, CacheEntry { handler: h, last_used: self.executed });
                h
            }
        };
        match handler {
            Some(h) => h(self, ins),
            None => step_legacy(self, ins),
        }
    }

    fn evict_oldest_cache_entry(&mut self) {
        if let Some(key) = self
            .cache
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| *k)
        {
            self.cache.remove(&key);
        }
    }

    fn runtime_error(&self, pc: usize, message: String) -> BasicError {
        let line = self.program.instructions.get(pc).map(|i| i.line).unwrap_or(0);
        let mut variables: Vec<(String, String)> = self
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect();
        variables.sort();
        variables.truncate(MAX_CAPTURED_VARS);
        BasicError::Runtime(Box::new(RuntimeError {
            message,
            line,
            pc,
            instruction: self.program.disassemble(pc),
            stack_size: self.stack.len(),
            source: self.program.source.get(&line).cloned(),
            variables,
        }))
    }

    // ── stack helpers ───────────────────────────────────────────────────

    fn push(&mut self, v: Value) -> Result<(), String> {
        if self.stack.len() >= MAX_STACK {
            return Err(format!("stack overflow (limit {MAX_STACK})"));
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, String> {
        self.stack.pop().ok_or_else(|| "stack underflow".to_string())
    }

    fn pop_num(&mut self, what: &str) -> Result<f64, String> {
        self.pop()?
            .as_num()
            .ok_or_else(|| format!("type mismatch: {what} must be numeric"))
    }

    fn pop_args(&mut self, argc: i32) -> Result<Vec<Value>, String> {
        let mut args = Vec::with_capacity(argc.max(0) as usize);
        for _ in 0..argc.max(0) {
            args.push(self.pop()?);
        }
        args.reverse();
        Ok(args)
    }

    fn name_of(&self, idx: i32) -> Result<String, String> {
        self.program
            .name(idx)
            .map(|s| s.to_string())
            .ok_or_else(|| format!("bad name index {idx}"))
    }

    fn jump_target(&self, ins: Instruction) -> Result<usize, String> {
        if ins.b == TARGET_LABEL {
            self.program
                .labels
                .get(&(ins.a as u32))
                .copied()
                .ok_or_else(|| format!("jump to undefined line {}", ins.a))
        } else {
            let t = ins.a as usize;
            if ins.a < 0 || t > self.program.instructions.len() {
                return Err(format!("jump out of range {}", ins.a));
            }
            Ok(t)
        }
    }

    fn load_var(&mut self, name: &str) -> Value {
        self.vars
            .get(name)
            .cloned()
            .unwrap_or_else(|| Value::default_for(name))
            .conform_to(name)
    }

    fn elem_key(name: &str, idxs: &[usize]) -> String {
        match idxs {
            [i] => format!("{name}({i})"),
            [i, j] => format!("{name}({i},{j})"),
            _ => format!("{name}{idxs:?}"),
        }
    }

    fn pop_indices(&mut self, ndims: i32) -> Result<Vec<usize>, String> {
        let vals = self.pop_args(ndims)?;
        vals.iter()
            .map(|v| {
                v.as_num()
                    .filter(|n| *n >= 0.0)
                    .map(|n| n as usize)
                    .ok_or_else(|| "array subscript must be a non-negative number".to_string())
            })
            .collect()
    }

    fn check_bounds(&self, name: &str, idxs: &[usize]) -> Result<(), String> {
        let meta = self
            .arrays
            .get(name)
            .ok_or_else(|| format!("undimensioned array {name}"))?;
        if meta.dims.len() != idxs.len() {
            return Err(format!(
                "array {name} has {} dimension(s), got {}",
                meta.dims.len(),
                idxs.len()
            ));
        }
        for (i, (&idx, &dim)) in idxs.iter().zip(&meta.dims).enumerate() {
            if idx >= dim {
                return Err(format!(
                    "subscript out of range: {name} dimension {} is 0..{}, got {idx}",
                    i + 1,
                    dim - 1
                ));
            }
        }
        Ok(())
    }
}

// ── handlers ────────────────────────────────────────────────────────────

fn op_add(vm: &mut Vm, _ins: Instruction) -> Result<Flow, String> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    let v = match (&a, &b) {
        (Value::Num(x), Value::Num(y)) => {
            // x+0 fast path falls out naturally
            if *y == 0.0 { Value::Num(*x) } else { Value::Num(x + y) }
        }
        _ => Value::Str(format!("{a}{b}")),
    };
    vm.push(v)?;
    Ok(Flow::Continue)
}

fn op_sub(vm: &mut Vm, _ins: Instruction) -> Result<Flow, String> {
    let b = vm.pop_num("SUB operand")?;
    let a = vm.pop_num("SUB operand")?;
    vm.push(Value::Num(a - b))?;
    Ok(Flow::Continue)
}

fn op_mul(vm: &mut Vm, _ins: Instruction) -> Result<Flow, String> {
    let b = vm.pop_num("MUL operand")?;
    let a = vm.pop_num("MUL operand")?;
    // Peephole fast paths for the common constant multipliers
    let v = if b == 0.0 {
        0.0
    } else if b == 1.0 {
        a
    } else if b == 2.0 {
        a + a
    } else {
        a * b
    };
    vm.push(Value::Num(v))?;
    Ok(Flow::Continue)
}

fn op_div(vm: &mut Vm, _ins: Instruction) -> Result<Flow, String> {
    let b = vm.pop_num("DIV operand")?;
    let a = vm.pop_num("DIV operand")?;
    if b == 0.0 {
        return Err("division by zero".into());
    }
    vm.push(Value::Num(a / b))?;
    Ok(Flow::Continue)
}

fn op_mod(vm: &mut Vm, _ins: Instruction) -> Result<Flow, String> {
    let b = vm.pop_num("MOD operand")?;
    let a = vm.pop_num("MOD operand")?;
    if b == 0.0 {
        return Err("division by zero in MOD".into());
    }
    vm.push(Value::Num(a % b))?;
    Ok(Flow::Continue)
}

fn op_pow(vm: &mut Vm, _ins: Instruction) -> Result<Flow, String> {
    let b = vm.pop_num("POW operand")?;
    let a = vm.pop_num("POW operand")?;
    let v = if b == 2.0 {
        a * a
    } else if b == 0.5 {
        if a < 0.0 {
            return Err("square root of negative value".into());
        }
        a.sqrt()
    } else {
        a.powf(b)
    };
    vm.push(Value::Num(v))?;
    Ok(Flow::Continue)
}

fn op_neg(vm: &mut Vm, _ins: Instruction) -> Result<Flow, String> {
    let a = vm.pop_num("NEG operand")?;
    vm.push(Value::Num(-a))?;
    Ok(Flow::Continue)
}

fn compare(vm: &mut Vm, op: Opcode) -> Result<Flow, String> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    let ord = match (&a, &b) {
        (Value::Num(x), Value::Num(y)) => x.partial_cmp(y),
        _ => Some(a.coerce_str().cmp(&b.coerce_str())),
    };
    let res = match ord {
        Some(ord) => match op {
            Opcode::Eq => ord.is_eq(),
            Opcode::Ne => ord.is_ne(),
            Opcode::Lt => ord.is_lt(),
            Opcode::Le => ord.is_le(),
            Opcode::Gt => ord.is_gt(),
            Opcode::Ge => ord.is_ge(),
            _ => unreachable!(),
        },
        // NaN compares false for everything except <>
        None => op == Opcode::Ne,
    };
    vm.push(Value::bool(res))?;
    Ok(Flow::Continue)
}

fn op_eq(vm: &mut Vm, _i: Instruction) -> Result<Flow, String> {
    compare(vm, Opcode::Eq)
}
fn op_ne(vm: &mut Vm, _i: Instruction) -> Result<Flow, String> {
    compare(vm, Opcode::Ne)
}
fn op_lt(vm: &mut Vm, _i: Instruction) -> Result<Flow, String> {
    compare(vm, Opcode::Lt)
}
fn op_le(vm: &mut Vm, _i: Instruction) -> Result<Flow, String> {
    compare(vm, Opcode::Le)
}
fn op_gt(vm: &mut Vm, _i: Instruction) -> Result<Flow, String> {
    compare(vm, Opcode::Gt)
}
fn op_ge(vm: &mut Vm, _i: Instruction) -> Result<Flow, String> {
    compare(vm, Opcode::Ge)
}

fn op_and(vm: &mut Vm, _i: Instruction) -> Result<Flow, String> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    vm.push(Value::bool(a.is_truthy() && b.is_truthy()))?;
    Ok(Flow::Continue)
}

fn op_or(vm: &mut Vm, _i: Instruction) -> Result<Flow, String> {
    let b = vm.pop()?;
    let a = vm.pop()?;
    vm.push(Value::bool(a.is_truthy() || b.is_truthy()))?;
    Ok(Flow::Continue)
}

fn op_not(vm: &mut Vm, _i: Instruction) -> Result<Flow, String> {
    let a = vm.pop()?;
    vm.push(Value::bool(!a.is_truthy()))?;
    Ok(Flow::Continue)
}

fn op_push_num(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    let n = vm.program.num(ins.a).ok_or("bad number constant index")?;
    vm.push(Value::Num(n))?;
    Ok(Flow::Continue)
}

fn op_push_str(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    let s = vm
        .program
        .str_const(ins.a)
        .ok_or("bad string constant index")?
        .to_string();
    vm.push(Value::Str(s))?;
    Ok(Flow::Continue)
}

fn op_load_var(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    let name = vm.name_of(ins.a)?;
    let v = vm.load_var(&name);
    vm.push(v)?;
    Ok(Flow::Continue)
}

fn op_store_var(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    let name = vm.name_of(ins.a)?;
    let v = vm.pop()?.conform_to(&name);
    vm.vars.insert(name, v);
    Ok(Flow::Continue)
}

fn op_pop(vm: &mut Vm, _i: Instruction) -> Result<Flow, String> {
    vm.pop()?;
    Ok(Flow::Continue)
}

fn op_jump(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    Ok(Flow::Jump(vm.jump_target(ins)?))
}

fn op_jump_if(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    let v = vm.pop()?;
    if v.is_truthy() {
        Ok(Flow::Jump(vm.jump_target(ins)?))
    } else {
        Ok(Flow::Continue)
    }
}

fn op_jump_unless(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    let v = vm.pop()?;
    if v.is_truthy() {
        Ok(Flow::Continue)
    } else {
        Ok(Flow::Jump(vm.jump_target(ins)?))
    }
}

fn op_call(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    if vm.call_stack.len() >= MAX_CALL_STACK {
        return Err(format!("GOSUB nesting too deep (limit {MAX_CALL_STACK})"));
    }
    let target = vm.jump_target(ins)?;
    vm.call_stack.push(vm.pc);
    Ok(Flow::Jump(target))
}

fn op_return(vm: &mut Vm, _i: Instruction) -> Result<Flow, String> {
    let pc = vm.call_stack.pop().ok_or("RETURN without GOSUB")?;
    Ok(Flow::Jump(pc))
}

fn op_for_init(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    let name = vm.name_of(ins.a)?;
    let step = vm.pop_num("FOR step")?;
    let end = vm.pop_num("FOR limit")?;
    if step == 0.0 {
        return Err("FOR step must not be zero".into());
    }
    let current = vm
        .load_var(&name)
        .as_num()
        .ok_or("FOR variable must be numeric")?;
    let iterates = if step > 0.0 { current <= end } else { current >= end };
    if !iterates {
        // Zero-iteration loop: no frame, skip past NEXT
        return Ok(Flow::Jump(ins.b as usize));
    }
    if vm.for_stack.len() >= MAX_FOR_STACK {
        return Err(format!("FOR nesting too deep (limit {MAX_FOR_STACK})"));
    }
    let estimated_count = (((end - current) / step).floor() as i64 + 1).max(1) as u64;
    vm.for_stack.push(ForFrame {
        variable: name,
        current,
        end,
        step,
        start_pc: vm.pc,
        next_pc: ins.b as usize,
        estimated_count,
    });
    Ok(Flow::Continue)
}

fn op_for_check(vm: &mut Vm, _i: Instruction) -> Result<Flow, String> {
    let frame = vm.for_stack.last().ok_or("FOR_CHECK without FOR")?;
    let done = if frame.step > 0.0 {
        frame.current > frame.end
    } else {
        frame.current < frame.end
    };
    if done {
        let next_pc = frame.next_pc;
        vm.for_stack.pop();
        Ok(Flow::Jump(next_pc))
    } else {
        Ok(Flow::Continue)
    }
}

fn op_for_next(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    let name = vm.name_of(ins.a)?;
    // A GOTO may have left inner frames behind; unwind to the named loop
    let pos = vm
        .for_stack
        .iter()
        .rposition(|f| f.variable == name)
        .ok_or_else(|| format!("NEXT {name} without FOR"))?;
    vm.for_stack.truncate(pos + 1);

    let current = vm.load_var(&name).coerce_num();
    let frame = vm.for_stack.last_mut().ok_or("NEXT without FOR")?;
    let next = current + frame.step;
    frame.current = next;
    let (step, end, start_pc) = (frame.step, frame.end, frame.start_pc);
    vm.vars.insert(name, Value::Num(next));
    let continues = if step > 0.0 { next <= end } else { next >= end };
    if continues {
        Ok(Flow::Jump(start_pc))
    } else {
        vm.for_stack.pop();
        Ok(Flow::Continue)
    }
}

fn op_print(vm: &mut Vm, _i: Instruction) -> Result<Flow, String> {
    let v = vm.pop()?;
    vm.print_buf.push_str(&v.to_string());
    Ok(Flow::Continue)
}

fn op_print_nl(vm: &mut Vm, _i: Instruction) -> Result<Flow, String> {
    let line = std::mem::take(&mut vm.print_buf);
    vm.pending_emit = Some(Message::text(line));
    Ok(Flow::Continue)
}

fn op_input(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    let var = vm.name_of(ins.a)?;
    let mut prompt = std::mem::take(&mut vm.print_buf);
    if prompt.is_empty() {
        prompt = "? ".into();
    }
    vm.pending_input = Some(PendingInput { resume_pc: vm.pc, var });
    vm.pending_emit = Some(Message::prompt(prompt.clone()));
    Ok(Flow::Await(prompt))
}

fn op_halt(vm: &mut Vm, _i: Instruction) -> Result<Flow, String> {
    if !vm.print_buf.is_empty() {
        let line = std::mem::take(&mut vm.print_buf);
        vm.pending_emit = Some(Message::text(line));
    }
    Ok(Flow::Halt)
}

fn op_call_func(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    let name = vm.name_of(ins.a)?;
    let args = vm.pop_args(ins.b)?;
    let result = call_builtin(&name, &args, &mut vm.rng)?;
    vm.push(result)?;
    Ok(Flow::Continue)
}

fn op_read(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    let name = vm.name_of(ins.a)?;
    let value = vm
        .program
        .data
        .get(vm.data_ptr)
        .cloned()
        .ok_or("READ past the end of DATA")?;
    vm.data_ptr += 1;
    vm.vars.insert(name.clone(), value.conform_to(&name));
    Ok(Flow::Continue)
}

fn op_dim(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    let name = vm.name_of(ins.a)?;
    let sizes = vm.pop_args(ins.b)?;
    let mut dims = Vec::with_capacity(sizes.len());
    for s in &sizes {
        let n = s.as_num().ok_or("DIM size must be numeric")?;
        if n < 0.0 {
            return Err("DIM size must not be negative".into());
        }
        // DIM A(10) makes indices 0..=10
        dims.push(n.floor() as usize + 1);
    }
    if dims.len() > 2 {
        return Err("arrays have at most 2 dimensions".into());
    }
    let total: usize = dims.iter().product();
    if total > MAX_ARRAY_ELEMS {
        return Err(format!("array too large ({total} elements)"));
    }
    match dims.as_slice() {
        [n] => {
            for i in 0..*n {
                vm.vars
                    .insert(Vm::elem_key(&name, &[i]), Value::default_for(&name));
            }
        }
        [n, m] => {
            for i in 0..*n {
                for j in 0..*m {
                    vm.vars
                        .insert(Vm::elem_key(&name, &[i, j]), Value::default_for(&name));
                }
            }
        }
        _ => {}
    }
    vm.arrays.insert(name, ArrayMeta { dims });
    Ok(Flow::Continue)
}

fn op_load_elem(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    let name = vm.name_of(ins.a)?;
    let idxs = vm.pop_indices(ins.b)?;
    vm.check_bounds(&name, &idxs)?;
    // The synthetic key has no `$` suffix; conform to the array's name
    let v = vm
        .vars
        .get(&Vm::elem_key(&name, &idxs))
        .cloned()
        .unwrap_or_else(|| Value::default_for(&name))
        .conform_to(&name);
    vm.push(v)?;
    Ok(Flow::Continue)
}

fn op_store_elem(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    let value = vm.pop()?;
    let name = vm.name_of(ins.a)?;
    let idxs = vm.pop_indices(ins.b)?;
    vm.check_bounds(&name, &idxs)?;
    vm.vars
        .insert(Vm::elem_key(&name, &idxs), value.conform_to(&name));
    Ok(Flow::Continue)
}

fn op_randomize(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    if ins.a == 1 {
        let seed = vm.pop()?.coerce_num();
        vm.rng = StdRng::seed_from_u64(seed.to_bits());
    } else {
        vm.rng = StdRng::from_os_rng();
    }
    Ok(Flow::Continue)
}

/// Media and graphics opcodes: pop the argument values, format them, and
/// emit the corresponding transport message.
fn op_media(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    let (argc, sub) = if ins.op == Opcode::Physics {
        (ins.b, Some(vm.name_of(ins.a)?))
    } else {
        (ins.a, None)
    };
    let args = vm.pop_args(argc)?;
    let rendered: Vec<String> = args.iter().map(|v| v.to_string()).collect();
    let arg_str = rendered.join(",");
    let content = match &sub {
        Some(sub) if arg_str.is_empty() => sub.clone(),
        Some(sub) => format!("{sub} {arg_str}"),
        None if arg_str.is_empty() => ins.op.to_string(),
        None => format!("{} {arg_str}", ins.op),
    };
    let msg = match ins.op {
        Opcode::Sound | Opcode::Noise | Opcode::Beep | Opcode::Music | Opcode::Speak | Opcode::Say => {
            Message::sound(content)
        }
        Opcode::Physics => Message::physics(content),
        _ => Message::graphics(content),
    };
    vm.pending_emit = Some(msg);
    Ok(Flow::Continue)
}

/// The retained legacy implementation. Covers every opcode; the handler
/// table is the primary path and both must agree.
fn step_legacy(vm: &mut Vm, ins: Instruction) -> Result<Flow, String> {
    match ins.op {
        Opcode::Add => op_add(vm, ins),
        Opcode::Sub => op_sub(vm, ins),
        Opcode::Mul => op_mul(vm, ins),
        Opcode::Div => op_div(vm, ins),
        Opcode::Mod => op_mod(vm, ins),
        Opcode::Pow => op_pow(vm, ins),
        Opcode::Neg => op_neg(vm, ins),
        Opcode::Eq | Opcode::Ne | Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => {
            compare(vm, ins.op)
        }
        Opcode::And => op_and(vm, ins),
        Opcode::Or => op_or(vm, ins),
        Opcode::Not => op_not(vm, ins),
        Opcode::PushNum => op_push_num(vm, ins),
        Opcode::PushStr => op_push_str(vm, ins),
        Opcode::LoadVar => op_load_var(vm, ins),
        Opcode::StoreVar => op_store_var(vm, ins),
        Opcode::Pop => op_pop(vm, ins),
        Opcode::LoadElem => op_load_elem(vm, ins),
        Opcode::StoreElem => op_store_elem(vm, ins),
        Opcode::Jump => op_jump(vm, ins),
        Opcode::JumpIf => op_jump_if(vm, ins),
        Opcode::JumpUnless => op_jump_unless(vm, ins),
        Opcode::Call => op_call(vm, ins),
        Opcode::Return => op_return(vm, ins),
        Opcode::ForInit => op_for_init(vm, ins),
        Opcode::ForCheck => op_for_check(vm, ins),
        Opcode::ForNext => op_for_next(vm, ins),
        Opcode::Print => op_print(vm, ins),
        Opcode::PrintNl => op_print_nl(vm, ins),
        Opcode::Input => op_input(vm, ins),
        Opcode::Halt => op_halt(vm, ins),
        Opcode::CallFunc => op_call_func(vm, ins),
        Opcode::Read => op_read(vm, ins),
        Opcode::Dim => op_dim(vm, ins),
        Opcode::Randomize => op_randomize(vm, ins),
        Opcode::Data | Opcode::Nop => Ok(Flow::Continue),
        Opcode::Debug => {
            if ins.a == 1 {
                let v = vm.pop()?;
                tracing::debug!(value = %v, "DEBUG");
            }
            Ok(Flow::Continue)
        }
        Opcode::Sound
        | Opcode::Wait
        | Opcode::Noise
        | Opcode::Beep
        | Opcode::Cls
        | Opcode::Music
        | Opcode::Speak
        | Opcode::Say
        | Opcode::Plot
        | Opcode::Line
        | Opcode::Rect
        | Opcode::Circle
        | Opcode::Sprite
        | Opcode::Vector
        | Opcode::Locate
        | Opcode::Color
        | Opcode::Key
        | Opcode::Textgfx
        | Opcode::Cleargraphics
        | Opcode::Inverse
        | Opcode::Physics => op_media(vm, ins),
    }
}

/// Dense dispatch table indexed by opcode. `Data`, `Nop`, `Debug` and
/// `ForCheck` are deliberately left to the legacy switch.
static HANDLERS: Lazy<[Option<Handler>; OPCODE_COUNT]> = Lazy::new(|| {
    let mut t: [Option<Handler>; OPCODE_COUNT] = [None; OPCODE_COUNT];
    t[Opcode::Add as usize] = Some(op_add);
    t[Opcode::Sub as usize] = Some(op_sub);
    t[Opcode::Mul as usize] = Some(op_mul);
    t[Opcode::Div as usize] = Some(op_div);
    t[Opcode::Mod as usize] = Some(op_mod);
    t[Opcode::Pow as usize] = Some(op_pow);
    t[Opcode::Neg as usize] = Some(op_neg);
    t[Opcode::Eq as usize] = Some(op_eq);
    t[Opcode::Ne as usize] = Some(op_ne);
    t[Opcode::Lt as usize] = Some(op_lt);
    t[Opcode::Le as usize] = Some(op_le);
    t[Opcode::Gt as usize] = Some(op_gt);
    t[Opcode::Ge as usize] = Some(op_ge);
    t[Opcode::And as usize] = Some(op_and);
    t[Opcode::Or as usize] = Some(op_or);
    t[Opcode::Not as usize] = Some(op_not);
    t[Opcode::PushNum as usize] = Some(op_push_num);
    t[Opcode::PushStr as usize] = Some(op_push_str);
    t[Opcode::LoadVar as usize] = Some(op_load_var);
    t[Opcode::StoreVar as usize] = Some(op_store_var);
    t[Opcode::Pop as usize] = Some(op_pop);
    t[Opcode::LoadElem as usize] = Some(op_load_elem);
    t[Opcode::StoreElem as usize] = Some(op_store_elem);
    t[Opcode::Jump as usize] = Some(op_jump);
    t[Opcode::JumpIf as usize] = Some(op_jump_if);
    t[Opcode::JumpUnless as usize] = Some(op_jump_unless);
    t[Opcode::Call as usize] = Some(op_call);
    t[Opcode::Return as usize] = Some(op_return);
    t[Opcode::ForInit as usize] = Some(op_for_init);
    t[Opcode::ForNext as usize] = Some(op_for_next);
    t[Opcode::Print as usize] = Some(op_print);
    t[Opcode::PrintNl as usize] = Some(op_print_nl);
    t[Opcode::Input as usize] = Some(op_input);
    t[Opcode::Halt as usize] = Some(op_halt);
    t[Opcode::CallFunc as usize] = Some(op_call_func);
    t[Opcode::Read as usize] = Some(op_read);
    t[Opcode::Dim as usize] = Some(op_dim);
    t[Opcode::Randomize as usize] = Some(op_randomize);
    for op in [
        Opcode::Sound,
        Opcode::Wait,
        Opcode::Noise,
        Opcode::Beep,
        Opcode::Cls,
        Opcode::Music,
        Opcode::Speak,
        Opcode::Say,
        Opcode::Plot,
        Opcode::Line,
        Opcode::Rect,
        Opcode::Circle,
        Opcode::Sprite,
        Opcode::Vector,
        Opcode::Locate,
        Opcode::Color,
        Opcode::Key,
        Opcode::Textgfx,
        Opcode::Cleargraphics,
        Opcode::Inverse,
        Opcode::Physics,
    ] {
        t[op as usize] = Some(op_media);
    }
    t
});

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::compiler::compile;
    use crate::basic::program::SourceProgram;
    use crate::models::message::MessageKind;

    fn program(lines: &[(u32, &str)]) -> Arc<Bytecode> {
        let mut p = SourceProgram::new();
        for (n, s) in lines {
            p.upsert(*n, *s);
        }
        Arc::new(compile(&p).unwrap())
    }

    async fn run_collect(vm: &mut Vm) -> (RunOutcome, Vec<Message>) {
        let (tx, mut rx) = mpsc::channel(256);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let outcome = vm.run(&tx, &cancel_rx).await.unwrap();
        drop(tx);
        let mut msgs = Vec::new();
        while let Ok(m) = rx.try_recv() {
            msgs.push(m);
        }
        (outcome, msgs)
    }

    fn texts(msgs: &[Message]) -> Vec<String> {
        msgs.iter()
            .filter(|m| m.kind == MessageKind::Text)
            .map(|m| m.content.clone())
            .collect()
    }

    #[tokio::test]
    async fn arithmetic_prints() {
        let bc = program(&[(10, "PRINT 2+3"), (20, "PRINT (2+3)*4"), (30, "END")]);
        let mut vm = Vm::new(bc);
        let (outcome, msgs) = run_collect(&mut vm).await;
        assert_eq!(outcome, RunOutcome::Done);
        assert_eq!(texts(&msgs), vec!["5", "20"]);
        assert!(vm.pending_input().is_none());
        assert_eq!(vm.stack_size(), 0);
    }

    #[tokio::test]
    async fn for_loop_counts_and_leaves_var_past_end() {
        let bc = program(&[
            (10, "FOR I=1 TO 3"),
            (20, "PRINT I"),
            (30, "NEXT I"),
            (40, "END"),
        ]);
        let mut vm = Vm::new(bc);
        let (outcome, msgs) = run_collect(&mut vm).await;
        assert_eq!(outcome, RunOutcome::Done);
        assert_eq!(texts(&msgs), vec!["1", "2", "3"]);
        assert_eq!(vm.for_depth(), 0);
        assert_eq!(vm.var("I"), Some(&Value::Num(4.0)));
    }

    #[tokio::test]
    async fn for_loop_zero_iterations_pushes_no_frame() {
        let bc = program(&[
            (10, "FOR I=5 TO 1"),
            (20, "PRINT I"),
            (30, "NEXT I"),
            (40, "PRINT \"done\""),
        ]);
        let mut vm = Vm::new(bc);
        let (_, msgs) = run_collect(&mut vm).await;
        assert_eq!(texts(&msgs), vec!["done"]);
        assert_eq!(vm.for_depth(), 0);

        let bc = program(&[(10, "FOR I=1 TO 5 STEP -1"), (20, "NEXT I"), (30, "PRINT \"ok\"")]);
        let mut vm = Vm::new(bc);
        let (_, msgs) = run_collect(&mut vm).await;
        assert_eq!(texts(&msgs), vec!["ok"]);
    }

    #[tokio::test]
    async fn negative_step_counts_down() {
        let bc = program(&[(10, "FOR I=3 TO 1 STEP -1"), (20, "PRINT I"), (30, "NEXT I")]);
        let mut vm = Vm::new(bc);
        let (_, msgs) = run_collect(&mut vm).await;
        assert_eq!(texts(&msgs), vec!["3", "2", "1"]);
    }

    #[tokio::test]
    async fn string_concat_on_add_with_non_numeric() {
        let bc = program(&[(10, "PRINT \"A=\" + 5")]);
        let mut vm = Vm::new(bc);
        let (_, msgs) = run_collect(&mut vm).await;
        assert_eq!(texts(&msgs), vec!["A=5"]);
    }

    #[tokio::test]
    async fn division_by_zero_carries_line_context() {
        let bc = program(&[(10, "PRINT 1"), (30, "PRINT 1/0")]);
        let mut vm = Vm::new(bc);
        let (tx, _rx) = mpsc::channel(256);
        let (_c, cancel_rx) = watch::channel(false);
        let err = vm.run(&tx, &cancel_rx).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("line 30"), "{text}");
        assert!(text.contains("division by zero"), "{text}");
        assert!(text.contains("DIV"), "{text}");
    }

    #[tokio::test]
    async fn gosub_and_return() {
        let bc = program(&[
            (10, "GOSUB 100"),
            (20, "PRINT \"back\""),
            (30, "END"),
            (100, "PRINT \"sub\""),
            (110, "RETURN"),
        ]);
        let mut vm = Vm::new(bc);
        let (_, msgs) = run_collect(&mut vm).await;
        assert_eq!(texts(&msgs), vec!["sub", "back"]);
    }

    #[tokio::test]
    async fn return_without_gosub_fails() {
        let bc = program(&[(10, "RETURN")]);
        let mut vm = Vm::new(bc);
        let (tx, _rx) = mpsc::channel(16);
        let (_c, cancel_rx) = watch::channel(false);
        assert!(vm.run(&tx, &cancel_rx).await.is_err());
    }

    #[tokio::test]
    async fn input_suspends_and_resumes() {
        let bc = program(&[
            (10, "INPUT \"name\"; N$"),
            (20, "PRINT \"hi \" + N$"),
        ]);
        let mut vm = Vm::new(bc);
        let (outcome, msgs) = run_collect(&mut vm).await;
        assert!(matches!(outcome, RunOutcome::AwaitingInput { .. }));
        assert!(msgs.iter().any(|m| m.kind == MessageKind::Prompt));
        assert!(!vm.is_running());
        let pending = vm.pending_input().unwrap();
        assert_eq!(pending.var, "N$");

        vm.resume("ada").unwrap();
        let (outcome, msgs) = run_collect(&mut vm).await;
        assert_eq!(outcome, RunOutcome::Done);
        assert_eq!(texts(&msgs), vec!["hi ada"]);
    }

    #[tokio::test]
    async fn input_into_numeric_var_coerces() {
        let bc = program(&[(10, "INPUT X"), (20, "PRINT X*2")]);
        let mut vm = Vm::new(bc);
        let _ = run_collect(&mut vm).await;
        vm.resume("21").unwrap();
        let (_, msgs) = run_collect(&mut vm).await;
        assert_eq!(texts(&msgs), vec!["42"]);
    }

    #[tokio::test]
    async fn cancellation_stops_an_infinite_loop() {
        let bc = program(&[(10, "GOTO 10")]);
        let mut vm = Vm::new(bc);
        let (tx, _rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        cancel_tx.send(true).unwrap();
        let outcome = vm.run(&tx, &cancel_rx).await.unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert!(!vm.is_running());
    }

    #[tokio::test]
    async fn dim_and_array_elements() {
        let bc = program(&[
            (10, "DIM A(3)"),
            (20, "A(2) = 7"),
            (30, "PRINT A(2) + A(1)"),
        ]);
        let mut vm = Vm::new(bc);
        let (_, msgs) = run_collect(&mut vm).await;
        assert_eq!(texts(&msgs), vec!["7"]);
    }

    #[tokio::test]
    async fn array_subscript_out_of_range() {
        let bc = program(&[(10, "DIM A(2)"), (20, "A(5) = 1")]);
        let mut vm = Vm::new(bc);
        let (tx, _rx) = mpsc::channel(16);
        let (_c, cancel_rx) = watch::channel(false);
        let err = vm.run(&tx, &cancel_rx).await.unwrap_err();
        assert!(err.to_string().contains("subscript out of range"));
    }

    #[tokio::test]
    async fn data_read_round() {
        let bc = program(&[
            (10, "DATA 3, 4"),
            (20, "READ A"),
            (30, "READ B"),
            (40, "PRINT A+B"),
        ]);
        let mut vm = Vm::new(bc);
        let (_, msgs) = run_collect(&mut vm).await;
        assert_eq!(texts(&msgs), vec!["7"]);
    }

    #[tokio::test]
    async fn media_ops_emit_typed_messages() {
        let bc = program(&[
            (10, "SOUND 440, 200"),
            (20, "PLOT 10, 20"),
            (30, "PHYSICS GRAVITY 9"),
        ]);
        let mut vm = Vm::new(bc);
        let (_, msgs) = run_collect(&mut vm).await;
        assert!(msgs.iter().any(|m| m.kind == MessageKind::Sound && m.content == "SOUND 440,200"));
        assert!(msgs.iter().any(|m| m.kind == MessageKind::Graphics && m.content == "PLOT 10,20"));
        assert!(msgs.iter().any(|m| m.kind == MessageKind::Physics && m.content == "GRAVITY 9"));
    }

    #[tokio::test]
    async fn legacy_switch_agrees_with_handler_table() {
        let lines = [
            (10, "DIM A(4)"),
            (20, "FOR I=0 TO 4"),
            (30, "A(I) = I*I"),
            (40, "NEXT I"),
            (50, "IF A(3) = 9 AND A(2) = 4 THEN PRINT \"square\" ELSE PRINT \"broken\""),
            (60, "PRINT MID$(\"HELLO\", 2, 3)"),
            (70, "PRINT 10 MOD 3"),
        ];
        let bc = program(&lines);
        let mut fast = Vm::new(bc.clone());
        let (_, fast_msgs) = run_collect(&mut fast).await;
        let mut legacy = Vm::new(bc);
        legacy.force_legacy = true;
        let (_, legacy_msgs) = run_collect(&mut legacy).await;
        assert_eq!(texts(&fast_msgs), texts(&legacy_msgs));
        assert_eq!(texts(&fast_msgs), vec!["square", "ELL", "1"]);
    }

    #[tokio::test]
    async fn deep_gosub_overflows_call_stack() {
        let bc = program(&[(10, "GOSUB 10")]);
        let mut vm = Vm::new(bc);
        let (tx, _rx) = mpsc::channel(16);
        let (_c, cancel_rx) = watch::channel(false);
        let err = vm.run(&tx, &cancel_rx).await.unwrap_err();
        assert!(err.to_string().contains("GOSUB nesting too deep"));
    }

    #[tokio::test]
    async fn randomize_seeds_deterministically() {
        let lines = [(10, "RANDOMIZE 42"), (20, "PRINT RND(6)")];
        let bc = program(&lines);
        let mut a = Vm::new(bc.clone());
        let (_, m1) = run_collect(&mut a).await;
        let mut b = Vm::new(bc);
        let (_, m2) = run_collect(&mut b).await;
        assert_eq!(texts(&m1), texts(&m2));
    }

    #[test]
    fn instruction_cache_is_bounded() {
        let bc = Arc::new(Bytecode::default());
        let mut vm = Vm::new(bc);
        for i in 0..(INSTR_CACHE_CAP + 100) {
            vm.executed += 1;
            let ins = Instruction::with_a(Opcode::Nop, i as i32, 1);
            let _ = vm.dispatch(ins);
        }
        assert!(vm.cache.len() <= INSTR_CACHE_CAP);
    }
}
