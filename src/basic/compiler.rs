use crate::basic::error::BasicError;
use crate::basic::funcs::is_builtin;
use crate::basic::opcode::{Instruction, Opcode, TARGET_ABSOLUTE, TARGET_LABEL};
use crate::basic::program::{Bytecode, SourceProgram};
use crate::basic::value::Value;
use std::collections::HashMap;

/// Compile a line-numbered source program into bytecode. Line numbers
/// become labels; FOR/NEXT pairs are linked by variable name and may span
/// lines.
pub fn compile(prog: &SourceProgram) -> Result<Bytecode, BasicError> {
    let mut c = Compiler::default();
    for (number, text) in prog.iter() {
        c.compile_line(number, text)?;
    }
    if let Some(open) = c.for_stack.last() {
        return Err(BasicError::Compile {
            line: open.line,
            message: format!("FOR {} without NEXT", c.bc.names[open.var_idx]),
        });
    }
    // Implicit end of program
    let last_line = prog.iter().last().map(|(n, _)| n).unwrap_or(0);
    c.emit(Instruction::new(Opcode::Halt, last_line));
    // Jumps to line numbers that never appeared are compile errors,
    // reported at the jumping line
    for ins in &c.bc.instructions {
        if ins.is_jump() && ins.b == TARGET_LABEL && !c.bc.labels.contains_key(&(ins.a as u32)) {
            return Err(BasicError::Compile {
                line: ins.line,
                message: format!("jump to undefined line {}", ins.a),
            });
        }
    }
    c.bc
        .validate()
        .map_err(|message| BasicError::Compile { line: 0, message })?;
    Ok(c.bc)
}

struct OpenFor {
    var_idx: usize,
    for_init_pc: usize,
    line: u32,
}

#[derive(Default)]
struct Compiler {
    bc: Bytecode,
    num_pool: HashMap<u64, usize>,
    str_pool: HashMap<String, usize>,
    name_pool: HashMap<String, usize>,
    for_stack: Vec<OpenFor>,
}

impl Compiler {
    fn compile_line(&mut self, number: u32, text: &str) -> Result<(), BasicError> {
        self.bc.labels.insert(number, self.bc.instructions.len());
        self.bc.source.insert(number, text.to_string());
        let toks = tokenize(text).map_err(|message| BasicError::Compile { line: number, message })?;
        let mut p = LineParser { toks, pos: 0, line: number };
        self.compile_statements(&mut p)
            .map_err(|message| BasicError::Compile { line: number, message })
    }

    fn emit(&mut self, ins: Instruction) -> usize {
        self.bc.instructions.push(ins);
        self.bc.instructions.len() - 1
    }

    fn patch_abs(&mut self, pc: usize, target: usize) {
        self.bc.instructions[pc].a = target as i32;
        self.bc.instructions[pc].b = TARGET_ABSOLUTE;
    }

    fn here(&self) -> usize {
        self.bc.instructions.len()
    }

    fn intern_num(&mut self, n: f64) -> i32 {
        let key = n.to_bits();
        let idx = *self.num_pool.entry(key).or_insert_with(|| {
            self.bc.num_consts.push(n);
            self.bc.num_consts.len() - 1
        });
        idx as i32
    }

    fn intern_str(&mut self, s: &str) -> i32 {
        if let Some(&idx) = self.str_pool.get(s) {
            return idx as i32;
        }
        self.bc.str_consts.push(s.to_string());
        let idx = self.bc.str_consts.len() - 1;
        self.str_pool.insert(s.to_string(), idx);
        idx as i32
    }

    fn intern_name(&mut self, s: &str) -> i32 {
        if let Some(&idx) = self.name_pool.get(s) {
            return idx as i32;
        }
        self.bc.names.push(s.to_string());
        let idx = self.bc.names.len() - 1;
        self.name_pool.insert(s.to_string(), idx);
        idx as i32
    }

    /// Compile statements separated by `:` until the tokens run out.
    fn compile_statements(&mut self, p: &mut LineParser) -> Result<(), String> {
        loop {
            while p.eat(&Tok::Colon) {}
            if p.at_end() {
                return Ok(());
            }
            self.compile_statement(p)?;
            if p.at_end() {
                return Ok(());
            }
            p.expect(&Tok::Colon)?;
        }
    }

    fn compile_statement(&mut self, p: &mut LineParser) -> Result<(), String> {
        let line = p.line;
        let Some(tok) = p.peek().cloned() else {
            return Ok(());
        };
        let keyword = match &tok {
            Tok::Ident(name) => name.clone(),
            _ => String::new(),
        };
        match keyword.as_str() {
            "REM" => {
                // REM swallows the rest of the line, colons included
                p.pos = p.toks.len();
                Ok(())
            }
            "LET" => {
                p.next();
                self.compile_assignment(p)
            }
            "PRINT" => {
                p.next();
                self.compile_print(p)
            }
            "INPUT" => {
                p.next();
                self.compile_input(p)
            }
            "IF" => {
                p.next();
                self.compile_if(p)
            }
            "GOTO" => {
                p.next();
                let n = p.expect_line_number()?;
                self.emit(Instruction::with_ab(Opcode::Jump, n as i32, TARGET_LABEL, line));
                Ok(())
            }
            "GOSUB" => {
                p.next();
                let n = p.expect_line_number()?;
                self.emit(Instruction::with_ab(Opcode::Call, n as i32, TARGET_LABEL, line));
                Ok(())
            }
            "RETURN" => {
                p.next();
                self.emit(Instruction::new(Opcode::Return, line));
                Ok(())
            }
            "END" | "STOP" => {
                p.next();
                self.emit(Instruction::new(Opcode::Halt, line));
                Ok(())
            }
            "FOR" => {
                p.next();
                self.compile_for(p)
            }
            "NEXT" => {
                p.next();
                self.compile_next(p)
            }
            "DIM" => {
                p.next();
                self.compile_dim(p)
            }
            "DATA" => {
                p.next();
                self.compile_data(p)
            }
            "READ" => {
                p.next();
                loop {
                    let name = p.expect_ident()?;
                    let idx = self.intern_name(&name);
                    self.emit(Instruction::with_a(Opcode::Read, idx, line));
                    if !p.eat(&Tok::Comma) {
                        break;
                    }
                }
                Ok(())
            }
            "RANDOMIZE" => {
                p.next();
                if p.at_statement_end() {
                    self.emit(Instruction::with_a(Opcode::Randomize, 0, line));
                } else {
                    self.compile_expr(p)?;
                    self.emit(Instruction::with_a(Opcode::Randomize, 1, line));
                }
                Ok(())
            }
            "CLS" => self.simple_media(p, Opcode::Cls, 0, 0),
            "BEEP" => self.simple_media(p, Opcode::Beep, 0, 0),
            "INVERSE" => self.simple_media(p, Opcode::Inverse, 0, 1),
            "CLEARGRAPHICS" => self.simple_media(p, Opcode::Cleargraphics, 0, 0),
            "TEXTGFX" => self.simple_media(p, Opcode::Textgfx, 0, 1),
            "WAIT" => self.simple_media(p, Opcode::Wait, 1, 1),
            "SOUND" => self.simple_media(p, Opcode::Sound, 2, 2),
            "NOISE" => self.simple_media(p, Opcode::Noise, 2, 2),
            "MUSIC" => self.simple_media(p, Opcode::Music, 1, 1),
            "SPEAK" => self.simple_media(p, Opcode::Speak, 1, 1),
            "SAY" => self.simple_media(p, Opcode::Say, 1, 1),
            "PLOT" => self.simple_media(p, Opcode::Plot, 2, 2),
            "LINE" => self.simple_media(p, Opcode::Line, 4, 4),
            "RECT" => self.simple_media(p, Opcode::Rect, 4, 5),
            "CIRCLE" => self.simple_media(p, Opcode::Circle, 3, 4),
            "SPRITE" => self.simple_media(p, Opcode::Sprite, 1, 4),
            "VECTOR" => self.simple_media(p, Opcode::Vector, 1, 6),
            "LOCATE" => self.simple_media(p, Opcode::Locate, 2, 2),
            "COLOR" => self.simple_media(p, Opcode::Color, 1, 2),
            "KEY" => self.simple_media(p, Opcode::Key, 1, 2),
            "PHYSICS" => {
                p.next();
                let sub = p.expect_ident()?;
                let name_idx = self.intern_name(&sub);
                let mut argc = 0;
                if !p.at_statement_end() {
                    loop {
                        self.compile_expr(p)?;
                        argc += 1;
                        if !p.eat(&Tok::Comma) {
                            break;
                        }
                    }
                }
                self.emit(Instruction::with_ab(Opcode::Physics, name_idx, argc, line));
                Ok(())
            }
            "DEBUG" => {
                p.next();
                let mut argc = 0;
                if !p.at_statement_end() {
                    self.compile_expr(p)?;
                    argc = 1;
                }
                self.emit(Instruction::with_a(Opcode::Debug, argc, line));
                Ok(())
            }
            _ => {
                // Implicit LET: `A = expr` or `A(i) = expr`
                if matches!(p.peek(), Some(Tok::Ident(_))) {
                    self.compile_assignment(p)
                } else {
                    Err(format!("unknown statement near {}", p.describe_here()))
                }
            }
        }
    }

    /// Media statements with a fixed argument-count range. The VM receives
    /// the actual count in `a`.
    fn simple_media(
        &mut self,
        p: &mut LineParser,
        op: Opcode,
        min_args: i32,
        max_args: i32,
    ) -> Result<(), String> {
        let line = p.line;
        p.next(); // keyword
        let mut argc = 0;
        if !p.at_statement_end() {
            loop {
                self.compile_expr(p)?;
                argc += 1;
                if !p.eat(&Tok::Comma) {
                    break;
                }
            }
        }
        if argc < min_args || argc > max_args {
            return Err(format!("{op} takes {min_args}..{max_args} argument(s), got {argc}"));
        }
        self.emit(Instruction::with_a(op, argc, line));
        Ok(())
    }

    fn compile_assignment(&mut self, p: &mut LineParser) -> Result<(), String> {
        let line = p.line;
        let name = p.expect_ident()?;
        if keyword_like(&name) {
            return Err(format!("unknown statement near {name}"));
        }
        if p.eat(&Tok::Lp) {
            // Array element target: indices first, value last
            let ndims = self.compile_index_list(p)?;
            p.expect(&Tok::Eq)?;
            self.compile_expr(p)?;
            let idx = self.intern_name(&name);
            self.emit(Instruction::with_ab(Opcode::StoreElem, idx, ndims, line));
            return Ok(());
        }
        p.expect(&Tok::Eq)?;
        self.compile_expr(p)?;
        let idx = self.intern_name(&name);
        self.emit(Instruction::with_a(Opcode::StoreVar, idx, line));
        Ok(())
    }

    fn compile_index_list(&mut self, p: &mut LineParser) -> Result<i32, String> {
        let mut ndims = 0;
        loop {
            self.compile_expr(p)?;
            ndims += 1;
            if !p.eat(&Tok::Comma) {
                break;
            }
        }
        p.expect(&Tok::Rp)?;
        if ndims > 2 {
            return Err("arrays have at most 2 dimensions".into());
        }
        Ok(ndims)
    }

    fn compile_print(&mut self, p: &mut LineParser) -> Result<(), String> {
        let line = p.line;
        if p.at_statement_end() {
            self.emit(Instruction::new(Opcode::PrintNl, line));
            return Ok(());
        }
        let mut newline = true;
        loop {
            self.compile_expr(p)?;
            self.emit(Instruction::new(Opcode::Print, line));
            if p.eat(&Tok::Semi) {
                if p.at_statement_end() {
                    newline = false;
                    break;
                }
            } else if p.eat(&Tok::Comma) {
                let sp = self.intern_str(" ");
                self.emit(Instruction::with_a(Opcode::PushStr, sp, line));
                self.emit(Instruction::new(Opcode::Print, line));
                if p.at_statement_end() {
                    newline = false;
                    break;
                }
            } else {
                break;
            }
        }
        if newline {
            self.emit(Instruction::new(Opcode::PrintNl, line));
        }
        Ok(())
    }

    fn compile_input(&mut self, p: &mut LineParser) -> Result<(), String> {
        let line = p.line;
        if let Some(Tok::Str(prompt)) = p.peek().cloned() {
            p.next();
            p.expect(&Tok::Semi)?;
            let idx = self.intern_str(&prompt);
            self.emit(Instruction::with_a(Opcode::PushStr, idx, line));
            self.emit(Instruction::new(Opcode::Print, line));
        }
        let name = p.expect_ident()?;
        let idx = self.intern_name(&name);
        self.emit(Instruction::with_a(Opcode::Input, idx, line));
        Ok(())
    }

    fn compile_if(&mut self, p: &mut LineParser) -> Result<(), String> {
        let line = p.line;
        self.compile_expr(p)?;
        match p.next() {
            Some(Tok::Ident(k)) if k == "THEN" => {}
            _ => return Err("expected THEN".into()),
        }
        let skip_then = self.emit(Instruction::with_ab(Opcode::JumpUnless, 0, TARGET_ABSOLUTE, line));

        // THEN branch: a bare line number is a GOTO
        if let Some(Tok::Num(n)) = p.peek().cloned() {
            p.next();
            self.emit(Instruction::with_ab(Opcode::Jump, n as i32, TARGET_LABEL, line));
        } else {
            loop {
                self.compile_statement(p)?;
                if p.peek_is_else() || p.at_end() {
                    break;
                }
                if !p.eat(&Tok::Colon) {
                    break;
                }
                if p.peek_is_else() || p.at_end() {
                    break;
                }
            }
        }

        if p.eat_else() {
            let skip_else = self.emit(Instruction::with_ab(Opcode::Jump, 0, TARGET_ABSOLUTE, line));
            let else_start = self.here();
            self.patch_abs(skip_then, else_start);
            if let Some(Tok::Num(n)) = p.peek().cloned() {
                p.next();
                self.emit(Instruction::with_ab(Opcode::Jump, n as i32, TARGET_LABEL, line));
            } else {
                self.compile_statements(p)?;
            }
            let after = self.here();
            self.patch_abs(skip_else, after);
        } else {
            let after = self.here();
            self.patch_abs(skip_then, after);
        }
        Ok(())
    }

    fn compile_for(&mut self, p: &mut LineParser) -> Result<(), String> {
        let line = p.line;
        let var = p.expect_ident()?;
        if var.ends_with('$') {
            return Err("FOR variable must be numeric".into());
        }
        p.expect(&Tok::Eq)?;
        self.compile_expr(p)?;
        let var_idx = self.intern_name(&var);
        self.emit(Instruction::with_a(Opcode::StoreVar, var_idx, line));
        match p.next() {
            Some(Tok::Ident(k)) if k == "TO" => {}
            _ => return Err("expected TO".into()),
        }
        self.compile_expr(p)?;
        if matches!(p.peek(), Some(Tok::Ident(k)) if k == "STEP") {
            p.next();
            self.compile_expr(p)?;
        } else {
            let one = self.intern_num(1.0);
            self.emit(Instruction::with_a(Opcode::PushNum, one, line));
        }
        let for_init_pc = self.emit(Instruction::with_ab(Opcode::ForInit, var_idx as i32, 0, line));
        self.for_stack.push(OpenFor {
            var_idx: var_idx as usize,
            for_init_pc,
            line,
        });
        Ok(())
    }

    fn compile_next(&mut self, p: &mut LineParser) -> Result<(), String> {
        let line = p.line;
        let var = if matches!(p.peek(), Some(Tok::Ident(_))) {
            Some(p.expect_ident()?)
        } else {
            None
        };
        let open = self.for_stack.pop().ok_or("NEXT without FOR")?;
        if let Some(v) = &var {
            if self.bc.names[open.var_idx] != *v {
                return Err(format!(
                    "NEXT {v} does not match FOR {}",
                    self.bc.names[open.var_idx]
                ));
            }
        }
        self.emit(Instruction::with_a(Opcode::ForNext, open.var_idx as i32, line));
        let after = self.here();
        self.bc.instructions[open.for_init_pc].b = after as i32;
        Ok(())
    }

    fn compile_dim(&mut self, p: &mut LineParser) -> Result<(), String> {
        let line = p.line;
        loop {
            let name = p.expect_ident()?;
            p.expect(&Tok::Lp)?;
            let ndims = self.compile_index_list(p)?;
            let idx = self.intern_name(&name);
            self.emit(Instruction::with_ab(Opcode::Dim, idx, ndims, line));
            if !p.eat(&Tok::Comma) {
                break;
            }
        }
        Ok(())
    }

    fn compile_data(&mut self, p: &mut LineParser) -> Result<(), String> {
        let line = p.line;
        let first = self.bc.data.len();
        loop {
            match p.next() {
                Some(Tok::Num(n)) => self.bc.data.push(Value::Num(n)),
                Some(Tok::Minus) => match p.next() {
                    Some(Tok::Num(n)) => self.bc.data.push(Value::Num(-n)),
                    _ => return Err("expected number after - in DATA".into()),
                },
                Some(Tok::Str(s)) => self.bc.data.push(Value::Str(s)),
                Some(Tok::Ident(w)) => self.bc.data.push(Value::Str(w)),
                other => return Err(format!("bad DATA value: {other:?}")),
            }
            if !p.eat(&Tok::Comma) {
                break;
            }
        }
        let count = (self.bc.data.len() - first) as i32;
        // Marker only; the constants already live in the data pool
        self.emit(Instruction::with_ab(Opcode::Data, first as i32, count, line));
        Ok(())
    }

    // ── expressions ─────────────────────────────────────────────────────

    fn compile_expr(&mut self, p: &mut LineParser) -> Result<(), String> {
        self.compile_or(p)
    }

    fn compile_or(&mut self, p: &mut LineParser) -> Result<(), String> {
        let line = p.line;
        self.compile_and(p)?;
        if !p.peek_kw("OR") {
            return Ok(());
        }
        // Short-circuit: any truthy operand settles the result
        let mut true_jumps = vec![self.emit(Instruction::with_ab(Opcode::JumpIf, 0, TARGET_ABSOLUTE, line))];
        while p.eat_kw("OR") {
            self.compile_and(p)?;
            true_jumps.push(self.emit(Instruction::with_ab(Opcode::JumpIf, 0, TARGET_ABSOLUTE, line)));
        }
        let zero = self.intern_num(0.0);
        self.emit(Instruction::with_a(Opcode::PushNum, zero, line));
        let done = self.emit(Instruction::with_ab(Opcode::Jump, 0, TARGET_ABSOLUTE, line));
        let true_pc = self.here();
        let neg_one = self.intern_num(-1.0);
        self.emit(Instruction::with_a(Opcode::PushNum, neg_one, line));
        let after = self.here();
        for pc in true_jumps {
            self.patch_abs(pc, true_pc);
        }
        self.patch_abs(done, after);
        Ok(())
    }

    fn compile_and(&mut self, p: &mut LineParser) -> Result<(), String> {
        let line = p.line;
        self.compile_not(p)?;
        if !p.peek_kw("AND") {
            return Ok(());
        }
        let mut false_jumps =
            vec![self.emit(Instruction::with_ab(Opcode::JumpUnless, 0, TARGET_ABSOLUTE, line))];
        while p.eat_kw("AND") {
            self.compile_not(p)?;
            false_jumps.push(self.emit(Instruction::with_ab(Opcode::JumpUnless, 0, TARGET_ABSOLUTE, line)));
        }
        let neg_one = self.intern_num(-1.0);
        self.emit(Instruction::with_a(Opcode::PushNum, neg_one, line));
        let done = self.emit(Instruction::with_ab(Opcode::Jump, 0, TARGET_ABSOLUTE, line));
        let false_pc = self.here();
        let zero = self.intern_num(0.0);
        self.emit(Instruction::with_a(Opcode::PushNum, zero, line));
        let after = self.here();
        for pc in false_jumps {
            self.patch_abs(pc, false_pc);
        }
        self.patch_abs(done, after);
        Ok(())
    }

    fn compile_not(&mut self, p: &mut LineParser) -> Result<(), String> {
        let line = p.line;
        if p.eat_kw("NOT") {
            self.compile_not(p)?;
            self.emit(Instruction::new(Opcode::Not, line));
            return Ok(());
        }
        self.compile_comparison(p)
    }

    fn compile_comparison(&mut self, p: &mut LineParser) -> Result<(), String> {
        let line = p.line;
        self.compile_additive(p)?;
        let op = match p.peek() {
            Some(Tok::Eq) => Some(Opcode::Eq),
            Some(Tok::Ne) => Some(Opcode::Ne),
            Some(Tok::Lt) => Some(Opcode::Lt),
            Some(Tok::Le) => Some(Opcode::Le),
            Some(Tok::Gt) => Some(Opcode::Gt),
            Some(Tok::Ge) => Some(Opcode::Ge),
            _ => None,
        };
        if let Some(op) = op {
            p.next();
            self.compile_additive(p)?;
            self.emit(Instruction::new(op, line));
        }
        Ok(())
    }

    fn compile_additive(&mut self, p: &mut LineParser) -> Result<(), String> {
        let line = p.line;
        self.compile_term(p)?;
        loop {
            if p.eat(&Tok::Plus) {
                self.compile_term(p)?;
                self.emit(Instruction::new(Opcode::Add, line));
            } else if p.eat(&Tok::Minus) {
                self.compile_term(p)?;
                self.emit(Instruction::new(Opcode::Sub, line));
            } else {
                return Ok(());
            }
        }
    }

    fn compile_term(&mut self, p: &mut LineParser) -> Result<(), String> {
        let line = p.line;
        self.compile_power(p)?;
        loop {
            if p.eat(&Tok::Star) {
                self.compile_power(p)?;
                self.emit(Instruction::new(Opcode::Mul, line));
            } else if p.eat(&Tok::Slash) {
                self.compile_power(p)?;
                self.emit(Instruction::new(Opcode::Div, line));
            } else if p.eat_kw("MOD") {
                self.compile_power(p)?;
                self.emit(Instruction::new(Opcode::Mod, line));
            } else {
                return Ok(());
            }
        }
    }

    fn compile_power(&mut self, p: &mut LineParser) -> Result<(), String> {
        let line = p.line;
        self.compile_unary(p)?;
        if p.eat(&Tok::Caret) {
            // Right-associative
            self.compile_power(p)?;
            self.emit(Instruction::new(Opcode::Pow, line));
        }
        Ok(())
    }

    fn compile_unary(&mut self, p: &mut LineParser) -> Result<(), String> {
        let line = p.line;
        if p.eat(&Tok::Minus) {
            self.compile_unary(p)?;
            self.emit(Instruction::new(Opcode::Neg, line));
            return Ok(());
        }
        if p.eat(&Tok::Plus) {
            return self.compile_unary(p);
        }
        self.compile_primary(p)
    }

    fn compile_primary(&mut self, p: &mut LineParser) -> Result<(), String> {
        let line = p.line;
        match p.next() {
            Some(Tok::Num(n)) => {
                let idx = self.intern_num(n);
                self.emit(Instruction::with_a(Opcode::PushNum, idx, line));
                Ok(())
            }
            Some(Tok::Str(s)) => {
                let idx = self.intern_str(&s);
                self.emit(Instruction::with_a(Opcode::PushStr, idx, line));
                Ok(())
            }
            Some(Tok::Lp) => {
                self.compile_expr(p)?;
                p.expect(&Tok::Rp)?;
                Ok(())
            }
            Some(Tok::Ident(name)) => {
                if p.eat(&Tok::Lp) {
                    if is_builtin(&name) {
                        let mut argc = 0;
                        if !matches!(p.peek(), Some(Tok::Rp)) {
                            loop {
                                self.compile_expr(p)?;
                                argc += 1;
                                if !p.eat(&Tok::Comma) {
                                    break;
                                }
                            }
                        }
                        p.expect(&Tok::Rp)?;
                        let idx = self.intern_name(&name);
                        self.emit(Instruction::with_ab(Opcode::CallFunc, idx, argc, line));
                    } else {
                        // Array element load
                        let ndims = self.compile_index_list(p)?;
                        let idx = self.intern_name(&name);
                        self.emit(Instruction::with_ab(Opcode::LoadElem, idx, ndims, line));
                    }
                    Ok(())
                } else if is_builtin(&name) {
                    // Zero-arg builtins usable without parentheses (PI, E)
                    let idx = self.intern_name(&name);
                    self.emit(Instruction::with_ab(Opcode::CallFunc, idx, 0, line));
                    Ok(())
                } else {
                    let idx = self.intern_name(&name);
                    self.emit(Instruction::with_a(Opcode::LoadVar, idx, line));
                    Ok(())
                }
            }
            other => Err(format!("unexpected token {other:?} in expression")),
        }
    }
}

fn keyword_like(name: &str) -> bool {
    matches!(
        name,
        "THEN" | "ELSE" | "TO" | "STEP" | "AND" | "OR" | "NOT" | "MOD"
    )
}

// ── tokens ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    Lp,
    Rp,
    Comma,
    Semi,
    Colon,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

struct LineParser {
    toks: Vec<Tok>,
    pos: usize,
    line: u32,
}

impl LineParser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn at_end(&self) -> bool {
        self.pos >= self.toks.len()
    }

    fn at_statement_end(&self) -> bool {
        self.at_end() || matches!(self.peek(), Some(Tok::Colon)) || self.peek_is_else()
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn peek_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Tok::Ident(k)) if k == kw)
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.peek_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn peek_is_else(&self) -> bool {
        self.peek_kw("ELSE")
    }

    fn eat_else(&mut self) -> bool {
        self.eat_kw("ELSE")
    }

    fn expect(&mut self, tok: &Tok) -> Result<(), String> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(format!("expected {tok:?}, found {:?}", self.peek()))
        }
    }

    fn expect_ident(&mut self) -> Result<String, String> {
        match self.next() {
            Some(Tok::Ident(name)) => Ok(name),
            other => Err(format!("expected identifier, found {other:?}")),
        }
    }

    fn expect_line_number(&mut self) -> Result<u32, String> {
        match self.next() {
            Some(Tok::Num(n)) if n > 0.0 && n.fract() == 0.0 => Ok(n as u32),
            other => Err(format!("expected line number, found {other:?}")),
        }
    }

    fn describe_here(&self) -> String {
        match self.peek() {
            Some(t) => format!("{t:?}"),
            None => "end of line".into(),
        }
    }
}

fn tokenize(src: &str) -> Result<Vec<Tok>, String> {
    let mut toks = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '"' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => return Err("unterminated string".into()),
                    }
                }
                toks.push(Tok::Str(s));
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text.parse().map_err(|_| format!("bad number {text}"))?;
                toks.push(Tok::Num(n));
            }
            'A'..='Z' | 'a'..='z' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let mut name: String = chars[start..i].iter().collect::<String>().to_uppercase();
                if chars.get(i) == Some(&'$') {
                    name.push('$');
                    i += 1;
                }
                let is_rem = name == "REM";
                toks.push(Tok::Ident(name));
                if is_rem {
                    // Comment text may contain anything; stop tokenizing
                    break;
                }
            }
            '\'' => break,
            '+' => {
                toks.push(Tok::Plus);
                i += 1;
            }
            '-' => {
                toks.push(Tok::Minus);
                i += 1;
            }
            '*' => {
                toks.push(Tok::Star);
                i += 1;
            }
            '/' => {
                toks.push(Tok::Slash);
                i += 1;
            }
            '^' => {
                toks.push(Tok::Caret);
                i += 1;
            }
            '(' => {
                toks.push(Tok::Lp);
                i += 1;
            }
            ')' => {
                toks.push(Tok::Rp);
                i += 1;
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            ';' => {
                toks.push(Tok::Semi);
                i += 1;
            }
            ':' => {
                toks.push(Tok::Colon);
                i += 1;
            }
            '=' => {
                toks.push(Tok::Eq);
                i += 1;
            }
            '<' => {
                if chars.get(i + 1) == Some(&'>') {
                    toks.push(Tok::Ne);
                    i += 2;
                } else if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Le);
                    i += 2;
                } else {
                    toks.push(Tok::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Ge);
                    i += 2;
                } else {
                    toks.push(Tok::Gt);
                    i += 1;
                }
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }
    Ok(toks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_src(lines: &[(u32, &str)]) -> Bytecode {
        let mut p = SourceProgram::new();
        for (n, s) in lines {
            p.upsert(*n, *s);
        }
        compile(&p).unwrap()
    }

    #[test]
    fn labels_point_at_line_starts() {
        let bc = compile_src(&[(10, "PRINT 1"), (20, "GOTO 10")]);
        assert_eq!(bc.labels[&10], 0);
        assert!(bc.labels[&20] > 0);
        bc.validate().unwrap();
    }

    #[test]
    fn goto_unknown_line_is_a_compile_error() {
        let mut p = SourceProgram::new();
        p.upsert(10, "GOTO 999");
        assert!(matches!(compile(&p), Err(BasicError::Compile { .. })));
    }

    #[test]
    fn unknown_statement_is_a_compile_error() {
        let mut p = SourceProgram::new();
        p.upsert(10, "FROB 1,2");
        let err = compile(&p).unwrap_err();
        assert!(err.to_string().contains("line 10"));
    }

    #[test]
    fn next_must_match_for_variable() {
        let mut p = SourceProgram::new();
        p.upsert(10, "FOR I=1 TO 3");
        p.upsert(20, "NEXT J");
        assert!(compile(&p).is_err());
    }

    #[test]
    fn for_without_next_is_rejected() {
        let mut p = SourceProgram::new();
        p.upsert(10, "FOR I=1 TO 3");
        assert!(compile(&p).is_err());
    }

    #[test]
    fn for_init_skip_lands_past_next() {
        let bc = compile_src(&[(10, "FOR I=1 TO 3"), (20, "PRINT I"), (30, "NEXT I")]);
        let (pc, ins) = bc
            .instructions
            .iter()
            .enumerate()
            .find(|(_, i)| i.op == Opcode::ForInit)
            .unwrap();
        let next_pc = bc
            .instructions
            .iter()
            .position(|i| i.op == Opcode::ForNext)
            .unwrap();
        assert!(pc < next_pc);
        assert_eq!(ins.b as usize, next_pc + 1);
    }

    #[test]
    fn if_then_else_compiles_both_branches() {
        let bc = compile_src(&[(10, r#"IF A > 1 THEN PRINT "big" ELSE PRINT "small""#)]);
        assert!(bc.instructions.iter().any(|i| i.op == Opcode::JumpUnless));
        assert_eq!(
            bc.str_consts.iter().filter(|s| *s == "big" || *s == "small").count(),
            2
        );
    }

    #[test]
    fn if_then_line_number_is_a_goto() {
        let bc = compile_src(&[(10, "IF A THEN 30"), (30, "END")]);
        assert!(bc
            .instructions
            .iter()
            .any(|i| i.op == Opcode::Jump && i.a == 30 && i.b == TARGET_LABEL));
    }

    #[test]
    fn logical_ops_short_circuit() {
        let bc = compile_src(&[(10, "IF A AND B THEN 10")]);
        assert!(bc.instructions.iter().any(|i| i.op == Opcode::JumpUnless));
        let bc = compile_src(&[(10, "IF A OR B THEN 10")]);
        assert!(bc.instructions.iter().any(|i| i.op == Opcode::JumpIf));
    }

    #[test]
    fn data_values_land_in_the_pool() {
        let bc = compile_src(&[(10, r#"DATA 1, -2, "x", HELLO"#), (20, "READ A")]);
        assert_eq!(
            bc.data,
            vec![
                Value::Num(1.0),
                Value::Num(-2.0),
                Value::Str("x".into()),
                Value::Str("HELLO".into())
            ]
        );
    }

    #[test]
    fn rem_swallows_the_rest_of_the_line() {
        let bc = compile_src(&[(10, "REM PRINT 1 : PRINT 2")]);
        // Only the implicit HALT remains
        assert_eq!(bc.instructions.len(), 1);
        assert_eq!(bc.instructions[0].op, Opcode::Halt);
    }

    #[test]
    fn media_arity_is_enforced_at_compile_time() {
        let mut p = SourceProgram::new();
        p.upsert(10, "SOUND 440");
        assert!(compile(&p).is_err());
        let mut p = SourceProgram::new();
        p.upsert(10, "SOUND 440, 200");
        assert!(compile(&p).is_ok());
    }

    #[test]
    fn compile_listing_reparse_is_stable() {
        let mut p = SourceProgram::new();
        p.upsert(10, "FOR I=1 TO 3");
        p.upsert(20, "PRINT I*2");
        p.upsert(30, "NEXT I");
        let bc1 = compile(&p).unwrap();
        let p2 = SourceProgram::from_listing(&p.listing());
        let bc2 = compile(&p2).unwrap();
        assert_eq!(bc1.instructions, bc2.instructions);
        assert_eq!(bc1.labels, bc2.labels);
    }
}
