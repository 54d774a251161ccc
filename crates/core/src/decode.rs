use crate::error::DecodeError;
use crate::features::FeatureSet;
use crate::module::{
    Export, ExportKind, FuncType, FunctionBody, FunctionDecl, Module, ModuleOrigin, ValType,
};
use crate::wire::WireBytes;

/// Section ids of the module binary.
pub mod section {
    /// Custom section (exempt from ordering).
    pub const CUSTOM: u8 = 0;
    /// Type section.
    pub const TYPE: u8 = 1;
    /// Import section.
    pub const IMPORT: u8 = 2;
    /// Function section.
    pub const FUNCTION: u8 = 3;
    /// Table section.
    pub const TABLE: u8 = 4;
    /// Memory section.
    pub const MEMORY: u8 = 5;
    /// Global section.
    pub const GLOBAL: u8 = 6;
    /// Export section.
    pub const EXPORT: u8 = 7;
    /// Start section.
    pub const START: u8 = 8;
    /// Element section.
    pub const ELEMENT: u8 = 9;
    /// Code section.
    pub const CODE: u8 = 10;
    /// Data section.
    pub const DATA: u8 = 11;
    /// Data-count section.
    pub const DATA_COUNT: u8 = 12;
}

/// The four magic bytes opening every module.
pub const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6D];
/// The only supported binary version.
pub const WASM_VERSION: u32 = 1;
/// Length of the module header (magic + version).
pub const HEADER_LEN: usize = 8;

/// Try to read an unsigned LEB128 u32 from the start of `bytes`.
///
/// Returns `Ok(None)` when the buffer ends inside the varint (more input is
/// needed), `Ok(Some((value, consumed)))` on success. `abs_offset` is the
/// absolute position of `bytes[0]`, used only for error reporting.
pub fn try_leb_u32(bytes: &[u8], abs_offset: u32) -> Result<Option<(u32, usize)>, DecodeError> {
    let mut value: u32 = 0;
    for (i, &byte) in bytes.iter().enumerate().take(5) {
        let payload = (byte & 0x7F) as u32;
        if i == 4 && payload > 0x0F {
            return Err(DecodeError::BadVarint { offset: abs_offset });
        }
        value |= payload << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if bytes.len() >= 5 {
        return Err(DecodeError::BadVarint { offset: abs_offset });
    }
    Ok(None)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    base: u32,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], base: u32) -> Self {
        Self {
            bytes,
            pos: 0,
            base,
        }
    }

    fn offset(&self) -> u32 {
        self.base + self.pos as u32
    }

    fn done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or(DecodeError::UnexpectedEof {
                offset: self.offset(),
            })?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(len).ok_or(DecodeError::UnexpectedEof {
            offset: self.offset(),
        })?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(DecodeError::UnexpectedEof {
                offset: self.offset(),
            })?;
        self.pos = end;
        Ok(slice)
    }

    fn leb_u32(&mut self) -> Result<u32, DecodeError> {
        match try_leb_u32(&self.bytes[self.pos.min(self.bytes.len())..], self.offset())? {
            Some((value, consumed)) => {
                self.pos += consumed;
                Ok(value)
            }
            None => Err(DecodeError::UnexpectedEof {
                offset: self.base + self.bytes.len() as u32,
            }),
        }
    }

    fn name(&mut self) -> Result<String, DecodeError> {
        let at = self.offset();
        let len = self.leb_u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::BadImport { offset: at })
    }

    fn val_type(&mut self) -> Result<ValType, DecodeError> {
        let at = self.offset();
        let byte = self.u8()?;
        ValType::from_byte(byte).ok_or(DecodeError::BadValueType { byte, offset: at })
    }

    fn limits(&mut self) -> Result<(), DecodeError> {
        let at = self.offset();
        let flag = self.u8()?;
        self.leb_u32()?;
        match flag {
            0x00 => Ok(()),
            0x01 => self.leb_u32().map(|_| ()),
            _ => Err(DecodeError::BadImport { offset: at }),
        }
    }
}

// Ordering rank of a non-custom section; data-count sits between the
// element and code sections.
fn section_rank(id: u8) -> u8 {
    match id {
        section::DATA_COUNT => 2 * section::ELEMENT + 1,
        _ => 2 * id,
    }
}

/// Incremental module decoder.
///
/// Drives both the bulk path (header, then one [`decode_section`] per
/// section) and the streaming path, where the code section is delivered as a
/// count header followed by individual function bodies.
///
/// [`decode_section`]: IncrementalDecoder::decode_section
pub struct IncrementalDecoder {
    origin: ModuleOrigin,
    enabled: FeatureSet,
    header_seen: bool,
    last_rank: u8,
    types: Vec<FuncType>,
    num_imported_functions: u32,
    func_type_indices: Vec<u32>,
    exports: Vec<Export>,
    bodies: Vec<FunctionBody>,
    code_count: Option<u32>,
}

impl IncrementalDecoder {
    /// Start decoding a module of the given origin with the given enabled
    /// feature set.
    pub fn new(origin: ModuleOrigin, enabled: FeatureSet) -> Self {
        Self {
            origin,
            enabled,
            header_seen: false,
            last_rank: 0,
            types: Vec::new(),
            num_imported_functions: 0,
            func_type_indices: Vec::new(),
            exports: Vec::new(),
            bodies: Vec::new(),
            code_count: None,
        }
    }

    /// The module origin this decoder was started with.
    pub fn origin(&self) -> ModuleOrigin {
        self.origin
    }

    /// Decode the 8-byte module header.
    pub fn decode_module_header(&mut self, bytes: &[u8], offset: u32) -> Result<(), DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::UnexpectedEof {
                offset: offset + bytes.len() as u32,
            });
        }
        if bytes[..4] != WASM_MAGIC {
            return Err(DecodeError::BadMagic { offset });
        }
        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != WASM_VERSION {
            return Err(DecodeError::BadVersion { version });
        }
        self.header_seen = true;
        Ok(())
    }

    fn check_order(&mut self, id: u8, offset: u32) -> Result<(), DecodeError> {
        if id == section::CUSTOM {
            return Ok(());
        }
        if id > section::DATA_COUNT {
            return Err(DecodeError::UnknownSection { id, offset });
        }
        let rank = section_rank(id);
        if rank <= self.last_rank {
            return Err(DecodeError::SectionOutOfOrder { id, offset });
        }
        self.last_rank = rank;
        Ok(())
    }

    /// Record that the code section starts at `offset` (ordering check).
    pub fn begin_code_section(&mut self, offset: u32) -> Result<(), DecodeError> {
        self.check_order(section::CODE, offset)
    }

    /// Whether the code section has been seen.
    pub fn code_section_seen(&self) -> bool {
        self.code_count.is_some()
    }

    /// Decode one complete section payload. `offset` is the absolute
    /// position of the first payload byte.
    pub fn decode_section(
        &mut self,
        id: u8,
        payload: &[u8],
        offset: u32,
    ) -> Result<(), DecodeError> {
        debug_assert!(self.header_seen, "section before module header");
        if id == section::CODE {
            return self.decode_code_payload(payload, offset);
        }
        self.check_order(id, offset)?;
        let mut r = Reader::new(payload, offset);
        match id {
            section::TYPE => {
                let count = r.leb_u32()?;
                for _ in 0..count {
                    let at = r.offset();
                    let form = r.u8()?;
                    if form != 0x60 {
                        return Err(DecodeError::BadValueType {
                            byte: form,
                            offset: at,
                        });
                    }
                    let num_params = r.leb_u32()?;
                    let mut params = Vec::with_capacity(num_params as usize);
                    for _ in 0..num_params {
                        params.push(r.val_type()?);
                    }
                    let num_results = r.leb_u32()?;
                    if num_results > 1 && !self.enabled.contains(FeatureSet::MULTI_VALUE) {
                        return Err(DecodeError::FeatureDisabled {
                            feature: "multi-value",
                            offset: at,
                        });
                    }
                    let mut results = Vec::with_capacity(num_results as usize);
                    for _ in 0..num_results {
                        results.push(r.val_type()?);
                    }
                    self.types.push(FuncType { params, results });
                }
            }
            section::IMPORT => {
                let count = r.leb_u32()?;
                for _ in 0..count {
                    r.name()?;
                    r.name()?;
                    let at = r.offset();
                    match r.u8()? {
                        0x00 => {
                            let index = r.leb_u32()?;
                            if index as usize >= self.types.len() {
                                return Err(DecodeError::TypeIndexOutOfBounds {
                                    index,
                                    offset: at,
                                });
                            }
                            self.num_imported_functions += 1;
                        }
                        0x01 => {
                            let reftype = r.u8()?;
                            if reftype != 0x70 && reftype != 0x6F {
                                return Err(DecodeError::BadImport { offset: at });
                            }
                            r.limits()?;
                        }
                        0x02 => r.limits()?,
                        0x03 => {
                            r.val_type()?;
                            r.u8()?;
                        }
                        _ => return Err(DecodeError::BadImport { offset: at }),
                    }
                }
            }
            section::FUNCTION => {
                let count = r.leb_u32()?;
                for _ in 0..count {
                    let at = r.offset();
                    let index = r.leb_u32()?;
                    if index as usize >= self.types.len() {
                        return Err(DecodeError::TypeIndexOutOfBounds { index, offset: at });
                    }
                    self.func_type_indices.push(index);
                }
            }
            section::EXPORT => {
                let count = r.leb_u32()?;
                for _ in 0..count {
                    let name = r.name()?;
                    let at = r.offset();
                    let kind = match r.u8()? {
                        0x00 => ExportKind::Function,
                        0x01 => ExportKind::Table,
                        0x02 => ExportKind::Memory,
                        0x03 => ExportKind::Global,
                        _ => return Err(DecodeError::BadExport { offset: at }),
                    };
                    let index = r.leb_u32()?;
                    self.exports.push(Export { name, kind, index });
                }
            }
            // Sections the pipeline does not consume are length-validated
            // by the caller and skipped here.
            _ => return Ok(()),
        }
        if !r.done() {
            return Err(DecodeError::TrailingBytes { offset: r.offset() });
        }
        Ok(())
    }

    fn decode_code_payload(&mut self, payload: &[u8], offset: u32) -> Result<(), DecodeError> {
        self.begin_code_section(offset)?;
        let mut r = Reader::new(payload, offset);
        let count = r.leb_u32()?;
        self.check_functions_count(count, offset)?;
        for _ in 0..count {
            let len = r.leb_u32()?;
            let body_at = r.offset();
            r.take(len as usize)?;
            self.decode_function_body(body_at, len)?;
        }
        if !r.done() {
            return Err(DecodeError::TrailingBytes { offset: r.offset() });
        }
        Ok(())
    }

    /// Verify the code-section entry count against the function section.
    pub fn check_functions_count(&mut self, count: u32, offset: u32) -> Result<(), DecodeError> {
        let _ = offset;
        let declared = self.func_type_indices.len() as u32;
        if count != declared {
            return Err(DecodeError::FunctionCountMismatch {
                declared,
                bodies: count,
            });
        }
        self.code_count = Some(count);
        Ok(())
    }

    fn push_body(&mut self, body: FunctionBody) -> Result<u32, DecodeError> {
        let index = self.bodies.len() as u32;
        let declared = self.func_type_indices.len() as u32;
        if index >= declared {
            return Err(DecodeError::FunctionCountMismatch {
                declared,
                bodies: index + 1,
            });
        }
        self.bodies.push(body);
        Ok(index)
    }

    /// Record one function body as a range into the shared wire bytes.
    /// Returns the declared index of the function.
    pub fn decode_function_body(&mut self, offset: u32, len: u32) -> Result<u32, DecodeError> {
        self.push_body(FunctionBody {
            offset,
            len,
            bytes: None,
        })
    }

    /// Record one function body with an inline copy of its bytes
    /// (streaming). Returns the declared index of the function.
    pub fn decode_function_body_owned(
        &mut self,
        bytes: WireBytes,
        offset: u32,
    ) -> Result<u32, DecodeError> {
        let len = bytes.len() as u32;
        self.push_body(FunctionBody {
            offset,
            len,
            bytes: Some(bytes),
        })
    }

    /// Number of bodies decoded so far.
    pub fn num_bodies(&self) -> u32 {
        self.bodies.len() as u32
    }

    /// A module view of everything decoded so far. Functions whose bodies
    /// have not arrived yet have `body: None`.
    pub fn snapshot_module(&self) -> Module {
        Module {
            origin: self.origin,
            types: self.types.clone(),
            num_imported_functions: self.num_imported_functions,
            functions: self
                .func_type_indices
                .iter()
                .enumerate()
                .map(|(i, &type_index)| FunctionDecl {
                    type_index,
                    body: self.bodies.get(i).cloned(),
                })
                .collect(),
            exports: self.exports.clone(),
        }
    }

    /// Finish decoding. With `verify_functions`, every declared function
    /// must have a body.
    pub fn finish_decoding(&mut self, verify_functions: bool) -> Result<Module, DecodeError> {
        if verify_functions {
            let declared = self.func_type_indices.len() as u32;
            let bodies = self.bodies.len() as u32;
            if bodies != declared {
                return Err(DecodeError::FunctionCountMismatch { declared, bodies });
            }
        }
        Ok(self.snapshot_module())
    }
}

/// Bulk module decoder.
#[derive(Debug, Clone, Copy)]
pub struct Decoder {
    /// Module origin.
    pub origin: ModuleOrigin,
    /// Enabled feature set.
    pub enabled: FeatureSet,
}

impl Decoder {
    /// Build a decoder.
    pub fn new(origin: ModuleOrigin, enabled: FeatureSet) -> Self {
        Self { origin, enabled }
    }

    /// Decode a complete module binary.
    pub fn decode_module(&self, bytes: &[u8]) -> Result<Module, DecodeError> {
        let mut inc = IncrementalDecoder::new(self.origin, self.enabled);
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::UnexpectedEof {
                offset: bytes.len() as u32,
            });
        }
        inc.decode_module_header(&bytes[..HEADER_LEN], 0)?;
        let mut pos = HEADER_LEN;
        while pos < bytes.len() {
            let section_at = pos as u32;
            let id = bytes[pos];
            pos += 1;
            let (len, used) = try_leb_u32(&bytes[pos..], pos as u32)?.ok_or(
                DecodeError::UnexpectedEof {
                    offset: bytes.len() as u32,
                },
            )?;
            pos += used;
            let end = pos
                .checked_add(len as usize)
                .filter(|&end| end <= bytes.len())
                .ok_or(DecodeError::SectionOverflow {
                    id,
                    offset: section_at,
                })?;
            inc.decode_section(id, &bytes[pos..end], pos as u32)?;
            pos = end;
        }
        inc.finish_decoding(true)
    }
}
