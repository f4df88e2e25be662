use std::fmt;

/// Bytecode operations. Operand meanings are per-opcode; see
/// [`Instruction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Neg,
    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // Logical
    And,
    Or,
    Not,
    // Stack / variables
    PushNum,
    PushStr,
    LoadVar,
    StoreVar,
    Pop,
    // Array elements
    LoadElem,
    StoreElem,
    // Control flow
    Jump,
    JumpIf,
    JumpUnless,
    Call,
    Return,
    // FOR loops
    ForInit,
    ForCheck,
    ForNext,
    // I/O
    Print,
    PrintNl,
    Input,
    // Media / graphics passthrough
    Sound,
    Wait,
    Noise,
    Beep,
    Cls,
    Music,
    Speak,
    Say,
    Plot,
    Line,
    Rect,
    Circle,
    Sprite,
    Vector,
    Locate,
    Color,
    Key,
    Textgfx,
    Cleargraphics,
    Inverse,
    Physics,
    // Data
    Data,
    Read,
    Dim,
    Randomize,
    // Halting
    Halt,
    Nop,
    Debug,
    // Builtin functions
    CallFunc,
}

pub const OPCODE_COUNT: usize = Opcode::CallFunc as usize + 1;

/// How a jump operand is to be interpreted.
pub const TARGET_LABEL: i32 = 0;
pub const TARGET_ABSOLUTE: i32 = 1;

/// One instruction. `a` and `b` are operand slots whose meaning depends on
/// the opcode:
///
/// - `PushNum`/`PushStr`: `a` indexes the number/string pool
/// - `LoadVar`/`StoreVar`/`Input`/`Read`: `a` indexes the name pool
/// - `Jump`/`JumpIf`/`JumpUnless`/`Call`: `a` is a line-number label when
///   `b == TARGET_LABEL`, an absolute instruction index when
///   `b == TARGET_ABSOLUTE`
/// - `ForInit`: `a` names the loop variable, `b` is the absolute index just
///   past the matching `ForNext`
/// - `ForNext`: `a` names the loop variable
/// - `Dim`/`LoadElem`/`StoreElem`: `a` names the array, `b` is the number
///   of dimensions
/// - `CallFunc`: `a` indexes the function name, `b` is the argument count
/// - `Physics`: `a` indexes the sub-command name, `b` is the argument count
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instruction {
    pub op: Opcode,
    pub a: i32,
    pub b: i32,
    /// Source line this instruction was compiled from, for error reports.
    pub line: u32,
}

impl Instruction {
    pub fn new(op: Opcode, line: u32) -> Self {
        Self { op, a: -1, b: -1, line }
    }

    pub fn with_a(op: Opcode, a: i32, line: u32) -> Self {
        Self { op, a, b: -1, line }
    }

    pub fn with_ab(op: Opcode, a: i32, b: i32, line: u32) -> Self {
        Self { op, a, b, line }
    }

    pub fn is_jump(&self) -> bool {
        matches!(
            self.op,
            Opcode::Jump | Opcode::JumpIf | Opcode::JumpUnless | Opcode::Call
        )
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Mod => "MOD",
            Opcode::Pow => "POW",
            Opcode::Neg => "NEG",
            Opcode::Eq => "EQ",
            Opcode::Ne => "NE",
            Opcode::Lt => "LT",
            Opcode::Le => "LE",
            Opcode::Gt => "GT",
            Opcode::Ge => "GE",
            Opcode::And => "AND",
            Opcode::Or => "OR",
            Opcode::Not => "NOT",
            Opcode::PushNum => "PUSH_NUM",
            Opcode::PushStr => "PUSH_STR",
            Opcode::LoadVar => "LOAD_VAR",
            Opcode::StoreVar => "STORE_VAR",
            Opcode::Pop => "POP",
            Opcode::LoadElem => "LOAD_ELEM",
            Opcode::StoreElem => "STORE_ELEM",
            Opcode::Jump => "JUMP",
            Opcode::JumpIf => "JUMP_IF",
            Opcode::JumpUnless => "JUMP_UNLESS",
            Opcode::Call => "CALL",
            Opcode::Return => "RETURN",
            Opcode::ForInit => "FOR_INIT",
            Opcode::ForCheck => "FOR_CHECK",
            Opcode::ForNext => "FOR_NEXT",
            Opcode::Print => "PRINT",
            Opcode::PrintNl => "PRINT_NL",
            Opcode::Input => "INPUT",
            Opcode::Sound => "SOUND",
            Opcode::Wait => "WAIT",
            Opcode::Noise => "NOISE",
            Opcode::Beep => "BEEP",
            Opcode::Cls => "CLS",
            Opcode::Music => "MUSIC",
            Opcode::Speak => "SPEAK",
            Opcode::Say => "SAY",
            Opcode::Plot => "PLOT",
            Opcode::Line => "LINE",
            Opcode::Rect => "RECT",
            Opcode::Circle => "CIRCLE",
            Opcode::Sprite => "SPRITE",
            Opcode::Vector => "VECTOR",
            Opcode::Locate => "LOCATE",
            Opcode::Color => "COLOR",
            Opcode::Key => "KEY",
            Opcode::Textgfx => "TEXTGFX",
            Opcode::Cleargraphics => "CLEARGRAPHICS",
            Opcode::Inverse => "INVERSE",
            Opcode::Physics => "PHYSICS",
            Opcode::Data => "DATA",
            Opcode::Read => "READ",
            Opcode::Dim => "DIM",
            Opcode::Randomize => "RANDOMIZE",
            Opcode::Halt => "HALT",
            Opcode::Nop => "NOP",
            Opcode::Debug => "DEBUG",
            Opcode::CallFunc => "CALL_FUNC",
        };
        f.write_str(name)
    }
}
