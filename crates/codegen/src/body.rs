use riptide_core::{CompileError, ExecutionTier, FeatureSet};

// Lowered form of one function body. Emission turns each op into a fixed
// template; the optimizing tier folds constants first.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum LowOp {
    Const32(i32),
    Const64(i64),
    ConstF32(u32),
    ConstF64(u64),
    Simple(u8),
    WithImm(u8, u64),
    Misc(u32),
}

struct BodyReader<'a> {
    func_index: u32,
    body: &'a [u8],
    pos: usize,
    base: u32,
}

impl<'a> BodyReader<'a> {
    fn err(&self, message: impl Into<String>) -> CompileError {
        CompileError::new(self.func_index, self.base + self.pos as u32, message)
    }

    fn u8(&mut self) -> Result<u8, CompileError> {
        let byte = *self
            .body
            .get(self.pos)
            .ok_or_else(|| self.err("truncated function body"))?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CompileError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.body.len())
            .ok_or_else(|| self.err("truncated function body"))?;
        let slice = &self.body[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn leb_u32(&mut self) -> Result<u32, CompileError> {
        let mut value: u32 = 0;
        for i in 0..5 {
            let byte = self.u8()?;
            let payload = (byte & 0x7F) as u32;
            if i == 4 && payload > 0x0F {
                return Err(self.err("malformed varint"));
            }
            value |= payload << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(self.err("malformed varint"))
    }

    fn leb_i32(&mut self) -> Result<i32, CompileError> {
        let mut value: i32 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            value |= ((byte & 0x7F) as i32) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 32 && byte & 0x40 != 0 {
                    value |= -1i32 << shift;
                }
                return Ok(value);
            }
            if shift >= 35 {
                return Err(self.err("malformed varint"));
            }
        }
    }

    fn leb_i64(&mut self) -> Result<i64, CompileError> {
        let mut value: i64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.u8()?;
            value |= ((byte & 0x7F) as i64) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    value |= -1i64 << shift;
                }
                return Ok(value);
            }
            if shift >= 70 {
                return Err(self.err("malformed varint"));
            }
        }
    }
}

const MAX_LOCALS: u32 = 50_000;

/// Scan one function body: decode locals and the opcode stream, gate and
/// record optional features, and produce the lowered op sequence.
pub(crate) fn scan_body(
    func_index: u32,
    body: &[u8],
    body_offset: u32,
    total_functions: u32,
    enabled: FeatureSet,
    detected: &mut FeatureSet,
) -> Result<Vec<LowOp>, CompileError> {
    let mut r = BodyReader {
        func_index,
        body,
        pos: 0,
        base: body_offset,
    };

    let local_groups = r.leb_u32()?;
    let mut num_locals: u32 = 0;
    for _ in 0..local_groups {
        let count = r.leb_u32()?;
        let ty = r.u8()?;
        if !(0x7C..=0x7F).contains(&ty) {
            return Err(r.err(format!("invalid local type 0x{ty:02x}")));
        }
        num_locals = num_locals
            .checked_add(count)
            .filter(|&n| n <= MAX_LOCALS)
            .ok_or_else(|| r.err("too many locals"))?;
    }

    let mut ops = Vec::new();
    let mut depth: u32 = 1;
    loop {
        let op = r.u8()?;
        match op {
            // unreachable / nop
            0x00 | 0x01 => ops.push(LowOp::Simple(op)),
            // block / loop / if carry a block type immediate
            0x02..=0x04 => {
                let bt = r.u8()?;
                if bt != 0x40 && !(0x7C..=0x7F).contains(&bt) {
                    return Err(r.err(format!("invalid block type 0x{bt:02x}")));
                }
                depth += 1;
                ops.push(LowOp::Simple(op));
            }
            0x05 => ops.push(LowOp::Simple(op)),
            0x0B => {
                depth -= 1;
                ops.push(LowOp::Simple(op));
                if depth == 0 {
                    break;
                }
            }
            // br / br_if
            0x0C | 0x0D => {
                let label = r.leb_u32()?;
                ops.push(LowOp::WithImm(op, label as u64));
            }
            // br_table
            0x0E => {
                let count = r.leb_u32()?;
                for _ in 0..count {
                    r.leb_u32()?;
                }
                r.leb_u32()?;
                ops.push(LowOp::WithImm(op, count as u64));
            }
            0x0F => ops.push(LowOp::Simple(op)),
            // call
            0x10 => {
                let target = r.leb_u32()?;
                if target >= total_functions {
                    return Err(r.err(format!("call target {target} out of bounds")));
                }
                ops.push(LowOp::WithImm(op, target as u64));
            }
            // call_indirect
            0x11 => {
                let type_index = r.leb_u32()?;
                let table = r.u8()?;
                if table != 0x00 {
                    return Err(r.err("call_indirect table index must be zero"));
                }
                ops.push(LowOp::WithImm(op, type_index as u64));
            }
            // drop / select
            0x1A | 0x1B => ops.push(LowOp::Simple(op)),
            // local.* / global.*
            0x20..=0x24 => {
                let index = r.leb_u32()?;
                ops.push(LowOp::WithImm(op, index as u64));
            }
            // memory loads and stores: alignment + offset immediates
            0x28..=0x3E => {
                r.leb_u32()?;
                let offset = r.leb_u32()?;
                ops.push(LowOp::WithImm(op, offset as u64));
            }
            // memory.size / memory.grow
            0x3F | 0x40 => {
                let mem = r.u8()?;
                if mem != 0x00 {
                    return Err(r.err("memory index must be zero"));
                }
                ops.push(LowOp::Simple(op));
            }
            0x41 => ops.push(LowOp::Const32(r.leb_i32()?)),
            0x42 => ops.push(LowOp::Const64(r.leb_i64()?)),
            0x43 => {
                let raw = r.take(4)?;
                ops.push(LowOp::ConstF32(u32::from_le_bytes([
                    raw[0], raw[1], raw[2], raw[3],
                ])));
            }
            0x44 => {
                let raw = r.take(8)?;
                ops.push(LowOp::ConstF64(u64::from_le_bytes([
                    raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
                ])));
            }
            // numeric operators, no immediates
            0x45..=0xBF => ops.push(LowOp::Simple(op)),
            // sign-extension operators
            0xC0..=0xC4 => {
                if !enabled.contains(FeatureSet::SIGN_EXTENSION) {
                    return Err(r.err("sign-extension operators are not enabled"));
                }
                detected.insert(FeatureSet::SIGN_EXTENSION);
                ops.push(LowOp::Simple(op));
            }
            0xFC => {
                let sub = r.leb_u32()?;
                if sub <= 7 {
                    if !enabled.contains(FeatureSet::SATURATING_TRUNCATION) {
                        return Err(r.err("saturating truncation is not enabled"));
                    }
                    detected.insert(FeatureSet::SATURATING_TRUNCATION);
                    ops.push(LowOp::Misc(sub));
                } else {
                    return Err(r.err(format!("unsupported misc opcode {sub}")));
                }
            }
            _ => return Err(r.err(format!("unsupported opcode 0x{op:02x}"))),
        }
    }

    if r.pos != r.body.len() {
        return Err(r.err("trailing bytes after function end"));
    }
    Ok(ops)
}

const I32_ADD: u8 = 0x6A;
const I32_SUB: u8 = 0x6B;
const I32_MUL: u8 = 0x6C;
const NOP: u8 = 0x01;

// Peephole pass for the optimizing tier: fold constant i32 arithmetic and
// drop nops.
fn fold_constants(ops: Vec<LowOp>) -> Vec<LowOp> {
    let mut out: Vec<LowOp> = Vec::with_capacity(ops.len());
    for op in ops {
        match op {
            LowOp::Simple(NOP) => continue,
            LowOp::Simple(code @ (I32_ADD | I32_SUB | I32_MUL)) => {
                if let [.., LowOp::Const32(a), LowOp::Const32(b)] = out[..] {
                    let folded = match code {
                        I32_ADD => a.wrapping_add(b),
                        I32_SUB => a.wrapping_sub(b),
                        _ => a.wrapping_mul(b),
                    };
                    out.truncate(out.len() - 2);
                    out.push(LowOp::Const32(folded));
                } else {
                    out.push(op);
                }
            }
            _ => out.push(op),
        }
    }
    out
}

/// Encode the lowered ops into the simulated native buffer.
pub(crate) fn emit(ops: Vec<LowOp>, tier: ExecutionTier) -> Vec<u8> {
    let ops = match tier {
        ExecutionTier::Baseline => ops,
        ExecutionTier::Optimized => fold_constants(ops),
    };

    let mut out = Vec::with_capacity(ops.len() * 6 + 6);
    out.extend_from_slice(&[0x55, 0x48, 0x89, 0xE5]);
    for op in ops {
        match op {
            LowOp::Const32(v) => {
                out.push(0xB8);
                out.extend_from_slice(&v.to_le_bytes());
            }
            LowOp::Const64(v) => {
                out.extend_from_slice(&[0x48, 0xB8]);
                out.extend_from_slice(&v.to_le_bytes());
            }
            LowOp::ConstF32(bits) => {
                out.extend_from_slice(&[0xF3, 0x0F, 0x10, 0x05]);
                out.extend_from_slice(&bits.to_le_bytes());
            }
            LowOp::ConstF64(bits) => {
                out.extend_from_slice(&[0xF2, 0x0F, 0x10, 0x05]);
                out.extend_from_slice(&bits.to_le_bytes());
            }
            LowOp::Simple(code) => {
                out.extend_from_slice(&[0xE8, code, 0x00, 0x00, 0x00]);
            }
            LowOp::WithImm(code, imm) => {
                out.extend_from_slice(&[0x48, 0xBF]);
                out.extend_from_slice(&imm.to_le_bytes());
                out.extend_from_slice(&[0xE8, code, 0x00, 0x00, 0x00]);
            }
            LowOp::Misc(sub) => {
                out.extend_from_slice(&[0xE8, 0xFC, sub as u8, 0x00, 0x00]);
            }
        }
    }
    out.extend_from_slice(&[0x5D, 0xC3]);
    out
}
