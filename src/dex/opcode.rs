//! Opcode table
//!
//! Only the opcodes the transformation engine needs to reason about are modelled. Each opcode has
//! a Dalvik [format][0] (which fixes its width in 16-bit code units and the bit width of every
//! operand field) and a set of [`OpcodeFlags`] classifying its control flow. The flags are the one
//! place that decides whether an instruction "may throw": control-flow graph construction,
//! liveness and the sync engine all read them from here.
//!
//! [0]: https://source.android.com/docs/core/runtime/instruction-formats

use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Control-flow classification of an opcode
    pub struct OpcodeFlags: u16 {
        /// Unconditional jump
        const GOTO = 0x0001;
        /// Two-way branch (jumps or falls through)
        const CONDITIONAL = 0x0002;
        /// Multi-way branch through a payload table
        const SWITCH = 0x0004;
        const RETURN = 0x0008;
        const THROW = 0x0010;
        /// Can raise an exception (edges to handlers when inside a try region)
        const MAY_THROW = 0x0020;
        const INVOKE = 0x0040;
        /// Must immediately follow an invoke
        const MOVE_RESULT = 0x0080;
    }
}

/// Instruction format
///
/// The name is the usual Dalvik format id: code units, register count, and operand kind (`x` no
/// extra data, `n`/`s`/`i`/`b` literal, `t` branch offset, `c` pool index).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Format {
    F10x,
    F12x,
    F11n,
    F11x,
    F10t,
    F20t,
    F22x,
    F21t,
    F21s,
    F21c,
    F23x,
    F22b,
    F22t,
    F22c,
    F30t,
    F32x,
    F31i,
    F31t,
    F35c,
}

impl Format {
    /// Size of the encoding in code units
    pub fn size(self) -> u32 {
        match self {
            Format::F10x | Format::F12x | Format::F11n | Format::F11x | Format::F10t => 1,
            Format::F20t
            | Format::F22x
            | Format::F21t
            | Format::F21s
            | Format::F21c
            | Format::F23x
            | Format::F22b
            | Format::F22t
            | Format::F22c => 2,
            Format::F30t | Format::F32x | Format::F31i | Format::F31t | Format::F35c => 3,
        }
    }

    /// Bit widths of the register fields, in operand order
    ///
    /// `35c` has a variable number of 4-bit argument registers, up to five.
    pub fn register_widths(self, operand_count: usize) -> Vec<u32> {
        match self {
            Format::F10x | Format::F10t | Format::F20t | Format::F30t => vec![],
            Format::F12x | Format::F22t | Format::F22c => vec![4, 4],
            Format::F11n => vec![4],
            Format::F11x | Format::F21t | Format::F21s | Format::F21c | Format::F31i | Format::F31t => {
                vec![8]
            }
            Format::F22x => vec![8, 16],
            Format::F23x => vec![8, 8, 8],
            Format::F22b => vec![8, 8],
            Format::F32x => vec![16, 16],
            Format::F35c => vec![4; operand_count.min(5)],
        }
    }

    /// Bit width of the literal field, if any
    pub fn literal_width(self) -> Option<u32> {
        match self {
            Format::F11n => Some(4),
            Format::F22b => Some(8),
            Format::F21s => Some(16),
            Format::F31i => Some(32),
            _ => None,
        }
    }

    /// Bit width of the branch offset field, if any
    pub fn offset_width(self) -> Option<u32> {
        match self {
            Format::F10t => Some(8),
            Format::F20t | Format::F21t | Format::F22t => Some(16),
            Format::F30t | Format::F31t => Some(32),
            _ => None,
        }
    }
}

/// Supported Dalvik opcodes
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum DexOpcode {
    Nop,
    Move,
    MoveFrom16,
    Move16,
    MoveObject,
    MoveObjectFrom16,
    MoveObject16,
    MoveResult,
    MoveResultObject,
    MoveException,
    ReturnVoid,
    Return,
    ReturnObject,
    Const4,
    Const16,
    Const,
    ConstString,
    ConstClass,
    ArrayLength,
    NewInstance,
    Throw,
    Goto,
    Goto16,
    Goto32,
    PackedSwitch,
    SparseSwitch,
    IfEq,
    IfNe,
    IfLt,
    IfGe,
    IfGt,
    IfLe,
    IfEqz,
    IfNez,
    IfLtz,
    IfGez,
    IfGtz,
    IfLez,
    Iget,
    Iput,
    Sget,
    Sput,
    InvokeVirtual,
    InvokeDirect,
    InvokeStatic,
    AddInt,
    SubInt,
    MulInt,
    DivInt,
    AddInt2Addr,
    SubInt2Addr,
    MulInt2Addr,
    DivInt2Addr,
    AddIntLit8,
}

impl DexOpcode {
    /// Opcode byte
    pub fn value(self) -> u8 {
        use DexOpcode::*;
        match self {
            Nop => 0x00,
            Move => 0x01,
            MoveFrom16 => 0x02,
            Move16 => 0x03,
            MoveObject => 0x07,
            MoveObjectFrom16 => 0x08,
            MoveObject16 => 0x09,
            MoveResult => 0x0a,
            MoveResultObject => 0x0c,
            MoveException => 0x0d,
            ReturnVoid => 0x0e,
            Return => 0x0f,
            ReturnObject => 0x11,
            Const4 => 0x12,
            Const16 => 0x13,
            Const => 0x14,
            ConstString => 0x1a,
            ConstClass => 0x1c,
            ArrayLength => 0x21,
            NewInstance => 0x22,
            Throw => 0x27,
            Goto => 0x28,
            Goto16 => 0x29,
            Goto32 => 0x2a,
            PackedSwitch => 0x2b,
            SparseSwitch => 0x2c,
            IfEq => 0x32,
            IfNe => 0x33,
            IfLt => 0x34,
            IfGe => 0x35,
            IfGt => 0x36,
            IfLe => 0x37,
            IfEqz => 0x38,
            IfNez => 0x39,
            IfLtz => 0x3a,
            IfGez => 0x3b,
            IfGtz => 0x3c,
            IfLez => 0x3d,
            Iget => 0x52,
            Iput => 0x59,
            Sget => 0x60,
            Sput => 0x67,
            InvokeVirtual => 0x6e,
            InvokeDirect => 0x70,
            InvokeStatic => 0x71,
            AddInt => 0x90,
            SubInt => 0x91,
            MulInt => 0x92,
            DivInt => 0x93,
            AddInt2Addr => 0xb0,
            SubInt2Addr => 0xb1,
            MulInt2Addr => 0xb2,
            DivInt2Addr => 0xb3,
            AddIntLit8 => 0xd8,
        }
    }

    /// Look up an opcode from its opcode byte
    pub fn from_value(value: u8) -> Option<DexOpcode> {
        use DexOpcode::*;
        Some(match value {
            0x00 => Nop,
            0x01 => Move,
            0x02 => MoveFrom16,
            0x03 => Move16,
            0x07 => MoveObject,
            0x08 => MoveObjectFrom16,
            0x09 => MoveObject16,
            0x0a => MoveResult,
            0x0c => MoveResultObject,
            0x0d => MoveException,
            0x0e => ReturnVoid,
            0x0f => Return,
            0x11 => ReturnObject,
            0x12 => Const4,
            0x13 => Const16,
            0x14 => Const,
            0x1a => ConstString,
            0x1c => ConstClass,
            0x21 => ArrayLength,
            0x22 => NewInstance,
            0x27 => Throw,
            0x28 => Goto,
            0x29 => Goto16,
            0x2a => Goto32,
            0x2b => PackedSwitch,
            0x2c => SparseSwitch,
            0x32 => IfEq,
            0x33 => IfNe,
            0x34 => IfLt,
            0x35 => IfGe,
            0x36 => IfGt,
            0x37 => IfLe,
            0x38 => IfEqz,
            0x39 => IfNez,
            0x3a => IfLtz,
            0x3b => IfGez,
            0x3c => IfGtz,
            0x3d => IfLez,
            0x52 => Iget,
            0x59 => Iput,
            0x60 => Sget,
            0x67 => Sput,
            0x6e => InvokeVirtual,
            0x70 => InvokeDirect,
            0x71 => InvokeStatic,
            0x90 => AddInt,
            0x91 => SubInt,
            0x92 => MulInt,
            0x93 => DivInt,
            0xb0 => AddInt2Addr,
            0xb1 => SubInt2Addr,
            0xb2 => MulInt2Addr,
            0xb3 => DivInt2Addr,
            0xd8 => AddIntLit8,
            _ => return None,
        })
    }

    pub fn format(self) -> Format {
        use DexOpcode::*;
        match self {
            Nop | ReturnVoid => Format::F10x,
            Move | MoveObject | ArrayLength => Format::F12x,
            AddInt2Addr | SubInt2Addr | MulInt2Addr | DivInt2Addr => Format::F12x,
            MoveFrom16 | MoveObjectFrom16 => Format::F22x,
            Move16 | MoveObject16 => Format::F32x,
            MoveResult | MoveResultObject | MoveException | Return | ReturnObject | Throw => {
                Format::F11x
            }
            Const4 => Format::F11n,
            Const16 => Format::F21s,
            Const => Format::F31i,
            ConstString | ConstClass | NewInstance | Sget | Sput => Format::F21c,
            Goto => Format::F10t,
            Goto16 => Format::F20t,
            Goto32 => Format::F30t,
            PackedSwitch | SparseSwitch => Format::F31t,
            IfEq | IfNe | IfLt | IfGe | IfGt | IfLe => Format::F22t,
            IfEqz | IfNez | IfLtz | IfGez | IfGtz | IfLez => Format::F21t,
            Iget | Iput => Format::F22c,
            InvokeVirtual | InvokeDirect | InvokeStatic => Format::F35c,
            AddInt | SubInt | MulInt | DivInt => Format::F23x,
            AddIntLit8 => Format::F22b,
        }
    }

    pub fn flags(self) -> OpcodeFlags {
        use DexOpcode::*;
        match self {
            Goto | Goto16 | Goto32 => OpcodeFlags::GOTO,
            IfEq | IfNe | IfLt | IfGe | IfGt | IfLe | IfEqz | IfNez | IfLtz | IfGez | IfGtz
            | IfLez => OpcodeFlags::CONDITIONAL,
            PackedSwitch | SparseSwitch => OpcodeFlags::SWITCH,
            ReturnVoid | Return | ReturnObject => OpcodeFlags::RETURN,
            Throw => OpcodeFlags::THROW | OpcodeFlags::MAY_THROW,
            InvokeVirtual | InvokeDirect | InvokeStatic => {
                OpcodeFlags::INVOKE | OpcodeFlags::MAY_THROW
            }
            MoveResult | MoveResultObject => OpcodeFlags::MOVE_RESULT,
            ConstString | ConstClass | ArrayLength | NewInstance | Iget | Iput | Sget | Sput
            | DivInt | DivInt2Addr => OpcodeFlags::MAY_THROW,
            _ => OpcodeFlags::empty(),
        }
    }

    /// Does the instruction write a destination register?
    pub fn has_dest(self) -> bool {
        use DexOpcode::*;
        matches!(
            self,
            Move | MoveFrom16
                | Move16
                | MoveObject
                | MoveObjectFrom16
                | MoveObject16
                | MoveResult
                | MoveResultObject
                | MoveException
                | Const4
                | Const16
                | Const
                | ConstString
                | ConstClass
                | ArrayLength
                | NewInstance
                | Iget
                | Sget
                | AddInt
                | SubInt
                | MulInt
                | DivInt
                | AddInt2Addr
                | SubInt2Addr
                | MulInt2Addr
                | DivInt2Addr
                | AddIntLit8
        )
    }

    /// Is this a `binop/2addr`, whose destination is also its first source?
    pub fn is_2addr(self) -> bool {
        use DexOpcode::*;
        matches!(self, AddInt2Addr | SubInt2Addr | MulInt2Addr | DivInt2Addr)
    }

    /// Next wider encoding in the same family (if the opcode can widen in place)
    pub fn widened(self) -> Option<DexOpcode> {
        use DexOpcode::*;
        Some(match self {
            Goto => Goto16,
            Goto16 => Goto32,
            Move => MoveFrom16,
            MoveFrom16 => Move16,
            MoveObject => MoveObjectFrom16,
            MoveObjectFrom16 => MoveObject16,
            Const4 => Const16,
            Const16 => Const,
            AddInt2Addr => AddInt,
            SubInt2Addr => SubInt,
            MulInt2Addr => MulInt,
            DivInt2Addr => DivInt,
            _ => return None,
        })
    }

    /// Conditional branch testing the opposite condition
    pub fn inverted(self) -> Option<DexOpcode> {
        use DexOpcode::*;
        Some(match self {
            IfEq => IfNe,
            IfNe => IfEq,
            IfLt => IfGe,
            IfGe => IfLt,
            IfGt => IfLe,
            IfLe => IfGt,
            IfEqz => IfNez,
            IfNez => IfEqz,
            IfLtz => IfGez,
            IfGez => IfLtz,
            IfGtz => IfLez,
            IfLez => IfGtz,
            _ => return None,
        })
    }

    pub fn is_goto(self) -> bool {
        self.flags().contains(OpcodeFlags::GOTO)
    }

    pub fn is_conditional(self) -> bool {
        self.flags().contains(OpcodeFlags::CONDITIONAL)
    }

    pub fn is_switch(self) -> bool {
        self.flags().contains(OpcodeFlags::SWITCH)
    }

    /// Goto, conditional branch, or switch
    pub fn is_branch(self) -> bool {
        self.flags()
            .intersects(OpcodeFlags::GOTO | OpcodeFlags::CONDITIONAL | OpcodeFlags::SWITCH)
    }

    pub fn is_return(self) -> bool {
        self.flags().contains(OpcodeFlags::RETURN)
    }

    pub fn is_throw(self) -> bool {
        self.flags().contains(OpcodeFlags::THROW)
    }

    pub fn may_throw(self) -> bool {
        self.flags().contains(OpcodeFlags::MAY_THROW)
    }

    pub fn is_invoke(self) -> bool {
        self.flags().contains(OpcodeFlags::INVOKE)
    }

    pub fn is_move_result(self) -> bool {
        self.flags().contains(OpcodeFlags::MOVE_RESULT)
    }

    /// Control never reaches the next instruction by falling through
    pub fn ends_flow(self) -> bool {
        self.is_goto() || self.is_return() || self.is_throw()
    }

    pub fn name(self) -> &'static str {
        use DexOpcode::*;
        match self {
            Nop => "nop",
            Move => "move",
            MoveFrom16 => "move/from16",
            Move16 => "move/16",
            MoveObject => "move-object",
            MoveObjectFrom16 => "move-object/from16",
            MoveObject16 => "move-object/16",
            MoveResult => "move-result",
            MoveResultObject => "move-result-object",
            MoveException => "move-exception",
            ReturnVoid => "return-void",
            Return => "return",
            ReturnObject => "return-object",
            Const4 => "const/4",
            Const16 => "const/16",
            Const => "const",
            ConstString => "const-string",
            ConstClass => "const-class",
            ArrayLength => "array-length",
            NewInstance => "new-instance",
            Throw => "throw",
            Goto => "goto",
            Goto16 => "goto/16",
            Goto32 => "goto/32",
            PackedSwitch => "packed-switch",
            SparseSwitch => "sparse-switch",
            IfEq => "if-eq",
            IfNe => "if-ne",
            IfLt => "if-lt",
            IfGe => "if-ge",
            IfGt => "if-gt",
            IfLe => "if-le",
            IfEqz => "if-eqz",
            IfNez => "if-nez",
            IfLtz => "if-ltz",
            IfGez => "if-gez",
            IfGtz => "if-gtz",
            IfLez => "if-lez",
            Iget => "iget",
            Iput => "iput",
            Sget => "sget",
            Sput => "sput",
            InvokeVirtual => "invoke-virtual",
            InvokeDirect => "invoke-direct",
            InvokeStatic => "invoke-static",
            AddInt => "add-int",
            SubInt => "sub-int",
            MulInt => "mul-int",
            DivInt => "div-int",
            AddInt2Addr => "add-int/2addr",
            SubInt2Addr => "sub-int/2addr",
            MulInt2Addr => "mul-int/2addr",
            DivInt2Addr => "div-int/2addr",
            AddIntLit8 => "add-int/lit8",
        }
    }
}

impl fmt::Display for DexOpcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
