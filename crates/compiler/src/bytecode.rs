//! Concrete bytecode instruction encoding (§6.2) -- the output of
//! `ir_emit`, and the format `code_unit` packs into a `code_script` blob.
//!
//! Every instruction is a 32-bit little-endian word, one of three shapes:
//!
//! ```text
//! AB: [ opcode:8 | r:8 | a:8  | b:8  ]   -- register/register form
//! AI: [ opcode:8 | r:8 | a:8  | i:s8 ]   -- register + signed immediate
//! C:  [ opcode:8 | r:8 | c:u16        ]  -- register + 16-bit constant/selector index
//! J:  [ opcode:8 | r:8 | j:s16        ]  -- register + signed relative jump
//! ```
//!
//! `r` doubles as a boolean flag on the compare-then-jump pairs (`JEQ`,
//! `JLT`, ...): the jump that follows fires on `true` when `r == 1`, on
//! `false` when `r == 0`. `OP_STACK_MARK` (0xFF) in an `a`/`b` register
//! field means "the current stack top (`xp`)", used by variable-arity
//! calls and unpacks.

pub const OP_STACK_MARK: u8 = 0xFF;

/// `a`/`b`/result-count value meaning "expand to the current stack top".
pub const EXPAND_TO_XP: u8 = 0xFF;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Mov = 0,
    Swp,
    Ldv,
    Ldk,

    Neg,
    Pos,
    BitNot,
    Add,
    Addn,
    Sub,
    Subn,
    Mul,
    Muln,
    Div,
    IntDiv,
    Mod,
    LShift,
    RShift,
    AShift,
    BitAnd,
    BitXor,
    BitOr,
    Len,

    Concat,
    Concats,
    Rconcats,

    Not,
    Is,

    Jmp,
    Jt,
    Jf,
    Jeq,
    Jeqn,
    Jeqs,
    Jlt,
    Jltn,
    Jgtn,
    Jle,
    Jlen,
    Jgen,

    GetGlobal,
    GetKey,
    SetKey,
    GetIndex,
    GetIndexi,
    SetIndex,
    SetIndexi,
    NewObject,
    NewArray,
    NewTable,
    Append,
    Super,
    Throw,

    NewEnv,
    GetVarenv,
    SetVarenv,
    GetOutenv,
    SetOutenv,

    Call,
    Callr,
    Ycall,
    Yield,
    Return,
    Vararg,
    Unpack,
    Extend,

    Generate,
    ForEach,
    ForStep,

    Function,
    FMethod,
    FVarenv,
    FOutenv,
}

/// `LDV`'s `c` field: which of the three singleton values to load.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Ldv {
    Null = 0,
    False = 1,
    True = 2,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Instr {
    pub opcode: OpCode,
    pub r: u8,
    pub a: u8,
    pub b: u8,
}

impl Instr {
    pub fn ab(opcode: OpCode, r: u8, a: u8, b: u8) -> Self {
        Instr { opcode, r, a, b }
    }

    pub fn ai(opcode: OpCode, r: u8, a: u8, i: i8) -> Self {
        Instr { opcode, r, a, b: i as u8 }
    }

    pub fn c(opcode: OpCode, r: u8, c: u16) -> Self {
        let [lo, hi] = c.to_le_bytes();
        Instr { opcode, r, a: lo, b: hi }
    }

    pub fn j(opcode: OpCode, r: u8, j: i16) -> Self {
        let [lo, hi] = j.to_le_bytes();
        Instr { opcode, r, a: lo, b: hi }
    }

    pub fn c_value(self) -> u16 {
        u16::from_le_bytes([self.a, self.b])
    }

    pub fn j_value(self) -> i16 {
        i16::from_le_bytes([self.a, self.b])
    }

    pub fn to_u32(self) -> u32 {
        u32::from_le_bytes([self.opcode as u8, self.r, self.a, self.b])
    }

    pub fn from_u32(word: u32) -> Result<Self, u8> {
        let bytes = word.to_le_bytes();
        let opcode = OpCode::try_from(bytes[0])?;
        Ok(Instr {
            opcode,
            r: bytes[1],
            a: bytes[2],
            b: bytes[3],
        })
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(tag: u8) -> Result<Self, u8> {
        use OpCode::*;
        const TABLE: &[OpCode] = &[
            Mov, Swp, Ldv, Ldk, Neg, Pos, BitNot, Add, Addn, Sub, Subn, Mul, Muln, Div, IntDiv,
            Mod, LShift, RShift, AShift, BitAnd, BitXor, BitOr, Len, Concat, Concats, Rconcats,
            Not, Is, Jmp, Jt, Jf, Jeq, Jeqn, Jeqs, Jlt, Jltn, Jgtn, Jle, Jlen, Jgen, GetGlobal,
            GetKey, SetKey, GetIndex, GetIndexi, SetIndex, SetIndexi, NewObject, NewArray,
            NewTable, Append, Super, Throw, NewEnv, GetVarenv, SetVarenv, GetOutenv, SetOutenv,
            Call, Callr, Ycall, Yield, Return, Vararg, Unpack, Extend, Generate, ForEach, ForStep,
            Function, FMethod, FVarenv, FOutenv,
        ];
        TABLE.get(tag as usize).copied().ok_or(tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ab_round_trips_through_u32() {
        let i = Instr::ab(OpCode::Add, 3, 4, 5);
        let w = i.to_u32();
        let back = Instr::from_u32(w).unwrap();
        assert_eq!(i, back);
    }

    #[test]
    fn jump_offset_round_trips_negative() {
        let i = Instr::j(OpCode::Jmp, 0, -12);
        assert_eq!(i.j_value(), -12);
    }

    #[test]
    fn constant_index_round_trips() {
        let i = Instr::c(OpCode::Ldk, 1, 4000);
        assert_eq!(i.c_value(), 4000);
    }
}
