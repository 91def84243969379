//! Fixed-width instructions
//!
//! A [`DexInstruction`] stores its operands logically (destination register, source registers,
//! literal, pool index) rather than as raw code units, so that rewriting a register or moving to a
//! wider opcode does not require re-packing bit fields by hand. Encoding and decoding to 16-bit
//! code units happens only at the [`DexInstruction::encode`]/[`DexInstruction::decode`] boundary.
//!
//! Branch offsets are only meaningful in encoded form: in the IR the target of a branch is given by
//! the position of its branch target nodes.

use super::{DexOpcode, Error, Format};

/// Register number
pub type Reg = u16;

/// First code unit of a packed-switch payload
pub const PACKED_SWITCH_IDENT: u16 = 0x0100;

/// First code unit of a sparse-switch payload
pub const SPARSE_SWITCH_IDENT: u16 = 0x0200;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DexInstruction {
    opcode: DexOpcode,
    dest: Option<Reg>,
    srcs: Vec<Reg>,
    literal: i64,
    index: u32,
    offset: i32,
    switch_keys: Option<SwitchKeys>,
}

/// Case keys of a switch, in payload order
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SwitchKeys {
    /// Consecutive keys starting at `first_key`
    Packed { first_key: i32, size: u16 },

    /// Explicit keys (ascending)
    Sparse(Vec<i32>),
}

impl SwitchKeys {
    pub fn len(&self) -> usize {
        match self {
            SwitchKeys::Packed { size, .. } => *size as usize,
            SwitchKeys::Sparse(keys) => keys.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Key of the case at `index`
    pub fn key(&self, index: usize) -> i32 {
        match self {
            SwitchKeys::Packed { first_key, .. } => first_key.wrapping_add(index as i32),
            SwitchKeys::Sparse(keys) => keys[index],
        }
    }

    /// Size of the payload pseudo-instruction, in code units
    pub fn payload_size(&self) -> u32 {
        match self {
            SwitchKeys::Packed { size, .. } => 4 + 2 * *size as u32,
            SwitchKeys::Sparse(keys) => 2 + 4 * keys.len() as u32,
        }
    }

    /// Append the payload with the given relative targets
    pub fn encode_payload(&self, targets: &[i32], out: &mut Vec<u16>) {
        assert_eq!(targets.len(), self.len(), "switch payload target count");
        match self {
            SwitchKeys::Packed { first_key, size } => {
                out.push(PACKED_SWITCH_IDENT);
                out.push(*size);
                push_u32(out, *first_key as u32);
            }
            SwitchKeys::Sparse(keys) => {
                out.push(SPARSE_SWITCH_IDENT);
                out.push(keys.len() as u16);
                for key in keys {
                    push_u32(out, *key as u32);
                }
            }
        }
        for target in targets {
            push_u32(out, *target as u32);
        }
    }

    /// Decode a payload starting at `addr`, returning the keys, the relative targets, and the
    /// payload size
    pub fn decode_payload(insns: &[u16], addr: u32) -> Result<(SwitchKeys, Vec<i32>, u32), Error> {
        let pos = addr as usize;
        let unit = |idx: usize| -> Result<u16, Error> {
            insns
                .get(pos + idx)
                .copied()
                .ok_or(Error::TruncatedInstruction { addr, opcode: None })
        };
        let wide = |idx: usize| -> Result<u32, Error> {
            Ok(unit(idx)? as u32 | (unit(idx + 1)? as u32) << 16)
        };
        let size = unit(1)? as usize;
        match unit(0)? {
            PACKED_SWITCH_IDENT => {
                let first_key = wide(2)? as i32;
                let targets = (0..size)
                    .map(|i| wide(4 + 2 * i).map(|t| t as i32))
                    .collect::<Result<Vec<i32>, Error>>()?;
                let keys = SwitchKeys::Packed {
                    first_key,
                    size: size as u16,
                };
                let payload_size = keys.payload_size();
                Ok((keys, targets, payload_size))
            }
            SPARSE_SWITCH_IDENT => {
                let keys = (0..size)
                    .map(|i| wide(2 + 2 * i).map(|k| k as i32))
                    .collect::<Result<Vec<i32>, Error>>()?;
                let targets = (0..size)
                    .map(|i| wide(2 + 2 * size + 2 * i).map(|t| t as i32))
                    .collect::<Result<Vec<i32>, Error>>()?;
                let keys = SwitchKeys::Sparse(keys);
                let payload_size = keys.payload_size();
                Ok((keys, targets, payload_size))
            }
            other => Err(Error::UnknownOpcode {
                addr,
                code_unit: other,
            }),
        }
    }
}

fn push_u32(out: &mut Vec<u16>, value: u32) {
    out.push(value as u16);
    out.push((value >> 16) as u16);
}

fn fits_signed(value: i64, bits: u32) -> bool {
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    (min..=max).contains(&value)
}

impl DexInstruction {
    pub fn new(opcode: DexOpcode) -> DexInstruction {
        DexInstruction {
            opcode,
            dest: None,
            srcs: vec![],
            literal: 0,
            index: 0,
            offset: 0,
            switch_keys: None,
        }
    }

    pub fn with_dest(mut self, dest: Reg) -> DexInstruction {
        self.dest = Some(dest);
        self
    }

    pub fn with_srcs(mut self, srcs: Vec<Reg>) -> DexInstruction {
        self.srcs = srcs;
        self
    }

    pub fn with_literal(mut self, literal: i64) -> DexInstruction {
        self.literal = literal;
        self
    }

    pub fn with_index(mut self, index: u32) -> DexInstruction {
        self.index = index;
        self
    }

    pub fn with_switch_keys(mut self, keys: SwitchKeys) -> DexInstruction {
        self.switch_keys = Some(keys);
        self
    }

    /// `binop/2addr vA, vB`: `vA` is both the destination and the first source
    pub fn binop_2addr(opcode: DexOpcode, a: Reg, b: Reg) -> DexInstruction {
        assert!(opcode.is_2addr(), "{} is not a 2addr opcode", opcode);
        DexInstruction::new(opcode).with_dest(a).with_srcs(vec![a, b])
    }

    pub fn opcode(&self) -> DexOpcode {
        self.opcode
    }

    pub fn dest(&self) -> Option<Reg> {
        self.dest
    }

    pub fn srcs(&self) -> &[Reg] {
        &self.srcs
    }

    pub fn literal(&self) -> i64 {
        self.literal
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Branch offset (only meaningful on decoded/encoded instructions)
    pub fn offset(&self) -> i32 {
        self.offset
    }

    pub fn switch_keys(&self) -> Option<&SwitchKeys> {
        self.switch_keys.as_ref()
    }

    pub fn set_opcode(&mut self, opcode: DexOpcode) {
        self.opcode = opcode;
    }

    pub fn set_dest(&mut self, dest: Reg) {
        self.dest = Some(dest);
    }

    pub fn set_src(&mut self, idx: usize, reg: Reg) {
        self.srcs[idx] = reg;
    }

    pub fn set_offset(&mut self, offset: i32) {
        self.offset = offset;
    }

    pub fn set_switch_keys(&mut self, keys: SwitchKeys) {
        self.switch_keys = Some(keys);
    }

    /// Rewrite every register operand
    pub fn map_registers(&mut self, mut map: impl FnMut(Reg) -> Reg) {
        if let Some(dest) = self.dest.as_mut() {
            *dest = map(*dest);
        }
        for src in self.srcs.iter_mut() {
            *src = map(*src);
        }
    }

    /// Registers in encoding field order
    fn operand_registers(&self) -> Vec<Reg> {
        if self.opcode.is_2addr() {
            let b = self.srcs.get(1).copied().unwrap_or(0);
            vec![self.dest.unwrap_or(0), b]
        } else {
            self.dest.iter().chain(self.srcs.iter()).copied().collect()
        }
    }

    /// Highest register referenced
    pub fn max_register(&self) -> Option<Reg> {
        self.dest.iter().chain(self.srcs.iter()).copied().max()
    }

    /// Size of the encoding, in code units
    pub fn size(&self) -> u32 {
        self.opcode.format().size()
    }

    /// Do the register and literal operands fit the current opcode's fields?
    pub fn fits_operands(&self) -> bool {
        let format = self.opcode.format();
        let regs = self.operand_registers();
        let widths = format.register_widths(regs.len());
        if widths.len() != regs.len() {
            return false;
        }
        let regs_fit = regs
            .iter()
            .zip(widths)
            .all(|(reg, bits)| (*reg as u32) < (1 << bits));
        let literal_fits = match format.literal_width() {
            Some(bits) => fits_signed(self.literal, bits),
            None => true,
        };
        regs_fit && literal_fits
    }

    /// Can the relative branch offset be encoded by the current opcode?
    ///
    /// A zero offset is only encodable by `goto/32` (and the switch formats).
    pub fn branch_offset_fits(&self, offset: i64) -> bool {
        match self.opcode.format().offset_width() {
            Some(32) => fits_signed(offset, 32),
            Some(bits) => offset != 0 && fits_signed(offset, bits),
            None => false,
        }
    }

    /// Move to the next wider opcode in the family, returning `false` when already widest
    pub fn widen(&mut self) -> bool {
        match self.opcode.widened() {
            Some(wider) => {
                self.opcode = wider;
                true
            }
            None => false,
        }
    }

    /// Largest register number every field of the widest encoding in this opcode's family can hold
    pub fn widest_register_limit(&self) -> u32 {
        let mut opcode = self.opcode;
        while let Some(wider) = opcode.widened() {
            opcode = wider;
        }
        let operand_count = self.dest.iter().count() + self.srcs.len();
        let operand_count = if opcode.is_2addr() { 2 } else { operand_count };
        opcode
            .format()
            .register_widths(operand_count)
            .into_iter()
            .map(|bits| (1u32 << bits) - 1)
            .min()
            .unwrap_or(u16::MAX as u32)
    }

    /// Append the encoding to `out`
    ///
    /// The operands must fit (see [`DexInstruction::fits_operands`]); a misfit is an invariant
    /// violation since the sync engine widens instructions before encoding them.
    pub fn encode(&self, out: &mut Vec<u16>) {
        assert!(
            self.fits_operands(),
            "operands of {:?} do not fit {:?}",
            self,
            self.opcode.format()
        );
        let op = self.opcode.value() as u16;
        let regs = self.operand_registers();
        let r = |idx: usize| regs[idx];
        match self.opcode.format() {
            Format::F10x => out.push(op),
            Format::F12x => out.push(op | r(0) << 8 | r(1) << 12),
            Format::F11n => out.push(op | r(0) << 8 | ((self.literal as u16) & 0xf) << 12),
            Format::F11x => out.push(op | r(0) << 8),
            Format::F10t => out.push(op | ((self.offset as i8 as u8 as u16) << 8)),
            Format::F20t => {
                out.push(op);
                out.push(self.offset as i16 as u16);
            }
            Format::F22x => {
                out.push(op | r(0) << 8);
                out.push(r(1));
            }
            Format::F21t => {
                out.push(op | r(0) << 8);
                out.push(self.offset as i16 as u16);
            }
            Format::F21s => {
                out.push(op | r(0) << 8);
                out.push(self.literal as i16 as u16);
            }
            Format::F21c => {
                out.push(op | r(0) << 8);
                out.push(self.index as u16);
            }
            Format::F23x => {
                out.push(op | r(0) << 8);
                out.push(r(1) | r(2) << 8);
            }
            Format::F22b => {
                out.push(op | r(0) << 8);
                out.push(r(1) | (self.literal as i8 as u8 as u16) << 8);
            }
            Format::F22t => {
                out.push(op | r(0) << 8 | r(1) << 12);
                out.push(self.offset as i16 as u16);
            }
            Format::F22c => {
                out.push(op | r(0) << 8 | r(1) << 12);
                out.push(self.index as u16);
            }
            Format::F30t => {
                out.push(op);
                push_u32(out, self.offset as u32);
            }
            Format::F32x => {
                out.push(op);
                out.push(r(0));
                out.push(r(1));
            }
            Format::F31i => {
                out.push(op | r(0) << 8);
                push_u32(out, self.literal as i32 as u32);
            }
            Format::F31t => {
                out.push(op | r(0) << 8);
                push_u32(out, self.offset as u32);
            }
            Format::F35c => {
                let count = regs.len() as u16;
                let arg = |idx: usize| regs.get(idx).copied().unwrap_or(0);
                out.push(op | arg(4) << 8 | count << 12);
                out.push(self.index as u16);
                out.push(arg(0) | arg(1) << 4 | arg(2) << 8 | arg(3) << 12);
            }
        }
    }

    /// Decode the instruction starting at `addr`, returning it with its size in code units
    ///
    /// Switch instructions come back without their keys: those live in the payload, which the
    /// caller locates through the decoded offset.
    pub fn decode(insns: &[u16], addr: u32) -> Result<(DexInstruction, u32), Error> {
        let pos = addr as usize;
        let first = *insns
            .get(pos)
            .ok_or(Error::TruncatedInstruction { addr, opcode: None })?;
        let opcode = DexOpcode::from_value(first as u8).ok_or(Error::UnknownOpcode {
            addr,
            code_unit: first,
        })?;
        let format = opcode.format();
        let size = format.size();
        if pos + size as usize > insns.len() {
            return Err(Error::TruncatedInstruction {
                addr,
                opcode: Some(opcode),
            });
        }
        let unit = |idx: usize| insns[pos + idx];
        let wide = |idx: usize| unit(idx) as u32 | (unit(idx + 1) as u32) << 16;
        let a4 = (first >> 8) & 0xf;
        let b4 = first >> 12;
        let aa = first >> 8;

        let mut insn = DexInstruction::new(opcode);
        let regs: Vec<Reg> = match format {
            Format::F10x => vec![],
            Format::F12x => vec![a4, b4],
            Format::F11n => {
                insn.literal = (((first >> 12) as i8) << 4 >> 4) as i64;
                vec![a4]
            }
            Format::F11x => vec![aa],
            Format::F10t => {
                insn.offset = aa as u8 as i8 as i32;
                vec![]
            }
            Format::F20t => {
                insn.offset = unit(1) as i16 as i32;
                vec![]
            }
            Format::F22x => vec![aa, unit(1)],
            Format::F21t => {
                insn.offset = unit(1) as i16 as i32;
                vec![aa]
            }
            Format::F21s => {
                insn.literal = unit(1) as i16 as i64;
                vec![aa]
            }
            Format::F21c => {
                insn.index = unit(1) as u32;
                vec![aa]
            }
            Format::F23x => vec![aa, unit(1) & 0xff, unit(1) >> 8],
            Format::F22b => {
                insn.literal = (unit(1) >> 8) as u8 as i8 as i64;
                vec![aa, unit(1) & 0xff]
            }
            Format::F22t => {
                insn.offset = unit(1) as i16 as i32;
                vec![a4, b4]
            }
            Format::F22c => {
                insn.index = unit(1) as u32;
                vec![a4, b4]
            }
            Format::F30t => {
                insn.offset = wide(1) as i32;
                vec![]
            }
            Format::F32x => vec![unit(1), unit(2)],
            Format::F31i => {
                insn.literal = wide(1) as i32 as i64;
                vec![aa]
            }
            Format::F31t => {
                insn.offset = wide(1) as i32;
                vec![aa]
            }
            Format::F35c => {
                let count = first >> 12;
                if count > 5 {
                    return Err(Error::TooManyArguments {
                        addr,
                        count: count as u8,
                    });
                }
                insn.index = unit(1) as u32;
                let packed = unit(2);
                let all = [
                    packed & 0xf,
                    (packed >> 4) & 0xf,
                    (packed >> 8) & 0xf,
                    packed >> 12,
                    a4,
                ];
                all[..count as usize].to_vec()
            }
        };

        if opcode.is_2addr() {
            insn.dest = Some(regs[0]);
            insn.srcs = vec![regs[0], regs[1]];
        } else if opcode.has_dest() {
            insn.dest = Some(regs[0]);
            insn.srcs = regs[1..].to_vec();
        } else {
            insn.srcs = regs;
        }
        Ok((insn, size))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn encoded(insn: &DexInstruction) -> Vec<u16> {
        let mut out = vec![];
        insn.encode(&mut out);
        out
    }

    #[test]
    fn encode_matches_dalvik_layout() {
        let mov = DexInstruction::new(DexOpcode::Move).with_dest(1).with_srcs(vec![2]);
        assert_eq!(encoded(&mov), vec![0x2101]);

        let konst = DexInstruction::new(DexOpcode::Const4).with_dest(3).with_literal(-1);
        assert_eq!(encoded(&konst), vec![0xf312]);

        let invoke = DexInstruction::new(DexOpcode::InvokeStatic)
            .with_srcs(vec![1, 2])
            .with_index(7);
        assert_eq!(encoded(&invoke), vec![0x2071, 0x0007, 0x0021]);
    }

    #[test]
    fn decode_inverts_encode() {
        let insns = vec![
            DexInstruction::new(DexOpcode::Const16).with_dest(200).with_literal(-300),
            DexInstruction::binop_2addr(DexOpcode::AddInt2Addr, 3, 4),
            DexInstruction::new(DexOpcode::AddIntLit8)
                .with_dest(5)
                .with_srcs(vec![6])
                .with_literal(-7),
            DexInstruction::new(DexOpcode::Iget)
                .with_dest(1)
                .with_srcs(vec![2])
                .with_index(0x1234),
            DexInstruction::new(DexOpcode::Move16).with_dest(300).with_srcs(vec![40000]),
            DexInstruction::new(DexOpcode::InvokeVirtual)
                .with_srcs(vec![1, 2, 3, 4, 5])
                .with_index(9),
        ];
        for insn in insns {
            let code = encoded(&insn);
            let (decoded, size) = DexInstruction::decode(&code, 0).unwrap();
            assert_eq!(size as usize, code.len());
            assert_eq!(decoded, insn);
        }
    }

    #[test]
    fn branch_offsets() {
        let mut goto = DexInstruction::new(DexOpcode::Goto);
        assert!(goto.branch_offset_fits(-128));
        assert!(!goto.branch_offset_fits(128));
        assert!(!goto.branch_offset_fits(0));
        assert!(goto.widen());
        assert!(goto.branch_offset_fits(30000));
        assert!(!goto.branch_offset_fits(0));
        assert!(goto.widen());
        assert!(goto.branch_offset_fits(0));
        assert!(!goto.widen());

        goto.set_offset(-70000);
        let code = encoded(&goto);
        assert_eq!(DexInstruction::decode(&code, 0).unwrap().0.offset(), -70000);
    }

    #[test]
    fn register_fit_and_widening() {
        let mut mov = DexInstruction::new(DexOpcode::Move).with_dest(20).with_srcs(vec![1]);
        assert!(!mov.fits_operands());
        assert!(mov.widen());
        assert_eq!(mov.opcode(), DexOpcode::MoveFrom16);
        assert!(mov.fits_operands());
        assert_eq!(mov.widest_register_limit(), u16::MAX as u32);

        let iget = DexInstruction::new(DexOpcode::Iget).with_dest(1).with_srcs(vec![2]);
        assert_eq!(iget.widest_register_limit(), 15);
    }

    #[test]
    fn payload_round_trip() {
        let keys = SwitchKeys::Sparse(vec![-5, 10, 1000]);
        let mut out = vec![];
        keys.encode_payload(&[3, -6, 9], &mut out);
        assert_eq!(out.len() as u32, keys.payload_size());
        let (decoded, targets, size) = SwitchKeys::decode_payload(&out, 0).unwrap();
        assert_eq!(decoded, keys);
        assert_eq!(targets, vec![3, -6, 9]);
        assert_eq!(size, keys.payload_size());
        assert_eq!(decoded.key(1), 10);
    }
}
