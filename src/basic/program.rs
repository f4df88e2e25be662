use crate::basic::opcode::{Instruction, Opcode, TARGET_ABSOLUTE, TARGET_LABEL};
use crate::basic::value::Value;
use std::collections::{BTreeMap, HashMap};

/// The editable, line-numbered source form of a program. Line numbers are
/// unique; storing an existing line is an upsert.
#[derive(Debug, Clone, Default)]
pub struct SourceProgram {
    lines: BTreeMap<u32, String>,
}

impl SourceProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&mut self, number: u32, text: impl Into<String>) {
        self.lines.insert(number, text.into());
    }

    pub fn delete(&mut self, number: u32) -> bool {
        self.lines.remove(&number).is_some()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.lines.iter().map(|(n, s)| (*n, s.as_str()))
    }

    /// Render the program the way `LIST` shows it.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for (n, text) in self.iter() {
            out.push_str(&format!("{n} {text}\n"));
        }
        out
    }

    /// Parse a listing back into a program. Inverse of [`Self::listing`].
    pub fn from_listing(text: &str) -> Self {
        let mut prog = Self::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Some((num, rest)) = split_line_number(trimmed) {
                prog.upsert(num, rest);
            }
        }
        prog
    }
}

/// `"10 PRINT X"` → `(10, "PRINT X")`.
pub fn split_line_number(line: &str) -> Option<(u32, String)> {
    let digits: String = line.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let num: u32 = digits.parse().ok()?;
    if num == 0 {
        return None;
    }
    Some((num, line[digits.len()..].trim_start().to_string()))
}

/// A compiled program: flat instruction vector plus pools and the
/// line-number label table.
#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    pub instructions: Vec<Instruction>,
    pub num_consts: Vec<f64>,
    pub str_consts: Vec<String>,
    pub names: Vec<String>,
    /// line number → instruction index of the first instruction of the line
    pub labels: HashMap<u32, usize>,
    /// DATA constants in program order
    pub data: Vec<Value>,
    /// line number → original source, for error reporting
    pub source: HashMap<u32, String>,
}

impl Bytecode {
    pub fn num(&self, idx: i32) -> Option<f64> {
        self.num_consts.get(idx as usize).copied()
    }

    pub fn str_const(&self, idx: i32) -> Option<&str> {
        self.str_consts.get(idx as usize).map(|s| s.as_str())
    }

    pub fn name(&self, idx: i32) -> Option<&str> {
        self.names.get(idx as usize).map(|s| s.as_str())
    }

    /// Human-readable form of one instruction, used in runtime errors.
    pub fn disassemble(&self, pc: usize) -> String {
        let Some(ins) = self.instructions.get(pc) else {
            return format!("<pc {pc} out of range>");
        };
        match ins.op {
            Opcode::PushNum => format!("{} {}", ins.op, self.num(ins.a).unwrap_or(f64::NAN)),
            Opcode::PushStr => format!("{} {:?}", ins.op, self.str_const(ins.a).unwrap_or("?")),
            Opcode::LoadVar
            | Opcode::StoreVar
            | Opcode::Input
            | Opcode::Read
            | Opcode::ForNext => {
                format!("{} {}", ins.op, self.name(ins.a).unwrap_or("?"))
            }
            Opcode::ForInit | Opcode::Dim | Opcode::LoadElem | Opcode::StoreElem => {
                format!("{} {} {}", ins.op, self.name(ins.a).unwrap_or("?"), ins.b)
            }
            Opcode::CallFunc | Opcode::Physics => {
                format!("{} {}/{}", ins.op, self.name(ins.a).unwrap_or("?"), ins.b)
            }
            Opcode::Jump | Opcode::JumpIf | Opcode::JumpUnless | Opcode::Call => {
                let kind = if ins.b == TARGET_LABEL { "line" } else { "abs" };
                format!("{} {} {}", ins.op, kind, ins.a)
            }
            _ => ins.op.to_string(),
        }
    }

    /// Enforce the jump-target invariant: every jump either targets a label
    /// present in `labels` or a valid absolute index.
    pub fn validate(&self) -> Result<(), String> {
        for (pc, ins) in self.instructions.iter().enumerate() {
            if ins.is_jump() {
                match ins.b {
                    TARGET_LABEL => {
                        if !self.labels.contains_key(&(ins.a as u32)) {
                            return Err(format!(
                                "instruction {pc}: jump to undefined line {}",
                                ins.a
                            ));
                        }
                    }
                    TARGET_ABSOLUTE => {
                        if ins.a < 0 || ins.a as usize > self.instructions.len() {
                            return Err(format!("instruction {pc}: jump out of range {}", ins.a));
                        }
                    }
                    other => return Err(format!("instruction {pc}: bad target kind {other}")),
                }
            }
            if ins.op == Opcode::ForInit && (ins.b < 0 || ins.b as usize > self.instructions.len())
            {
                return Err(format!("instruction {pc}: FOR skip target out of range"));
            }
        }
        Ok(())
    }
}
