use std::sync::{Arc, Mutex, Weak};

use riptide_core::decode::{HEADER_LEN, section, try_leb_u32};
use riptide_core::{DecodeError, FunctionBody, ModuleOrigin, WireBytes};

use crate::api::{CompileResolver, PipelineEngine};
use crate::job::AsyncCompileJob;
use crate::unit::UnitBuilder;

/// Start a streaming compilation job for the engine.
pub(crate) fn start(
    engine: &Arc<PipelineEngine>,
    origin: ModuleOrigin,
    resolver: Box<dyn CompileResolver>,
) -> StreamingHandle {
    let job = AsyncCompileJob::start_streaming(engine, origin, resolver);
    let job_id = job.id();
    StreamingHandle {
        processor: Arc::new(Mutex::new(StreamingProcessor::new(engine, job))),
        job_id,
    }
}

/// Push interface of a streaming compilation.
///
/// Bytes arrive in arbitrary chunks; the processor decodes incrementally
/// and starts compiling function bodies before the stream has ended.
pub struct StreamingHandle {
    processor: Arc<Mutex<StreamingProcessor>>,
    job_id: u64,
}

impl StreamingHandle {
    /// Feed one chunk of wire bytes.
    pub fn process_bytes(&self, chunk: &[u8]) {
        self.processor
            .lock()
            .expect("stream processor poisoned")
            .process_bytes(chunk);
    }

    /// The stream ended; finish decoding and let the job complete.
    pub fn finish(&self) {
        self.processor
            .lock()
            .expect("stream processor poisoned")
            .finish();
    }

    /// Abort the stream and its job.
    pub fn abort(&self) {
        self.processor
            .lock()
            .expect("stream processor poisoned")
            .abort();
    }

    /// Id of the underlying job.
    pub fn job_id(&self) -> u64 {
        self.job_id
    }
}

#[derive(Debug, Clone, Copy)]
enum Stage {
    Header,
    SectionStart,
    SectionPayload {
        id: u8,
        len: u32,
    },
    CodeCount {
        section_end: u32,
    },
    FunctionLength {
        section_end: u32,
        remaining: u32,
    },
    FunctionBody {
        section_end: u32,
        remaining: u32,
        len: u32,
    },
}

// Push-driven section splitter plus the streaming side of the job: decodes
// incrementally, starts compilation at the code-section header, and
// publishes one unit batch per received chunk.
struct StreamingProcessor {
    engine: Weak<PipelineEngine>,
    job: Arc<AsyncCompileJob>,
    inc: riptide_core::IncrementalDecoder,
    stage: Stage,
    // Unconsumed tail of the stream; `consumed` is the absolute offset of
    // its first byte.
    buf: Vec<u8>,
    consumed: u32,
    full: Vec<u8>,
    builder: Option<UnitBuilder>,
    started_compile: bool,
    done: bool,
    trace: bool,
}

impl StreamingProcessor {
    fn new(engine: &Arc<PipelineEngine>, job: Arc<AsyncCompileJob>) -> Self {
        let inc = riptide_core::IncrementalDecoder::new(job.origin(), engine.enabled());
        Self {
            engine: Arc::downgrade(engine),
            job,
            inc,
            stage: Stage::Header,
            buf: Vec::new(),
            consumed: 0,
            full: Vec::new(),
            builder: None,
            started_compile: false,
            done: false,
            trace: engine.config().trace.streaming,
        }
    }

    fn process_bytes(&mut self, chunk: &[u8]) {
        if self.done {
            return;
        }
        if self.trace {
            tracing::trace!(target: "riptide::stream", len = chunk.len(), "chunk");
        }
        self.full.extend_from_slice(chunk);
        self.buf.extend_from_slice(chunk);
        if let Err(err) = self.drive() {
            self.fail(err);
            return;
        }
        // Commit the builder at every chunk boundary so workers can start
        // as soon as possible.
        self.flush_builder();
    }

    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Err(err) = self.finish_inner() {
            self.discard_builder();
            self.job.fail_with(err.into());
        }
    }

    fn abort(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.discard_builder();
        self.job.abort();
    }

    fn fail(&mut self, err: DecodeError) {
        self.done = true;
        self.discard_builder();
        self.job.fail_with(err.into());
    }

    fn discard_builder(&mut self) {
        if let Some(builder) = self.builder.as_mut() {
            builder.clear();
        }
        self.builder = None;
    }

    fn flush_builder(&mut self) {
        let Some(builder) = self.builder.as_mut() else {
            return;
        };
        match self.job.state() {
            Some(state) => {
                if builder.commit(&state) && self.trace {
                    tracing::trace!(target: "riptide::stream", "committed unit batch");
                }
            }
            None => builder.clear(),
        }
    }

    fn consume(&mut self, n: usize) {
        self.buf.drain(..n);
        self.consumed += n as u32;
    }

    // Run the splitter until it needs more bytes. Stops with `Ok(())` at
    // the first incomplete structure.
    fn drive(&mut self) -> Result<(), DecodeError> {
        loop {
            match self.stage {
                Stage::Header => {
                    if self.buf.len() < HEADER_LEN {
                        return Ok(());
                    }
                    self.inc
                        .decode_module_header(&self.buf[..HEADER_LEN], self.consumed)?;
                    self.consume(HEADER_LEN);
                    self.stage = Stage::SectionStart;
                }
                Stage::SectionStart => {
                    if self.buf.is_empty() {
                        return Ok(());
                    }
                    let id = self.buf[0];
                    let Some((len, used)) = try_leb_u32(&self.buf[1..], self.consumed + 1)?
                    else {
                        return Ok(());
                    };
                    let header_offset = self.consumed;
                    self.consume(1 + used);
                    if id == section::CODE {
                        self.inc.begin_code_section(header_offset)?;
                        let section_end = self.consumed.checked_add(len).ok_or(
                            DecodeError::SectionOverflow {
                                id,
                                offset: header_offset,
                            },
                        )?;
                        self.stage = Stage::CodeCount { section_end };
                    } else {
                        self.stage = Stage::SectionPayload { id, len };
                    }
                }
                Stage::SectionPayload { id, len } => {
                    if (self.buf.len() as u32) < len {
                        return Ok(());
                    }
                    if self.inc.code_section_seen() && self.builder.is_some() {
                        // First section after the code section: publish what
                        // is buffered and discard the builder.
                        self.flush_builder();
                        self.builder = None;
                    }
                    let offset = self.consumed;
                    self.inc
                        .decode_section(id, &self.buf[..len as usize], offset)?;
                    self.consume(len as usize);
                    self.stage = Stage::SectionStart;
                }
                Stage::CodeCount { section_end } => {
                    let Some((count, used)) = try_leb_u32(&self.buf, self.consumed)? else {
                        return Ok(());
                    };
                    let offset = self.consumed;
                    self.consume(used);
                    self.inc.check_functions_count(count, offset)?;
                    self.start_compilation();
                    self.stage = Stage::FunctionLength {
                        section_end,
                        remaining: count,
                    };
                }
                Stage::FunctionLength {
                    section_end,
                    remaining,
                } => {
                    if remaining == 0 {
                        if self.consumed != section_end {
                            return Err(DecodeError::TrailingBytes {
                                offset: self.consumed,
                            });
                        }
                        self.stage = Stage::SectionStart;
                        continue;
                    }
                    let Some((len, used)) = try_leb_u32(&self.buf, self.consumed)? else {
                        return Ok(());
                    };
                    let offset = self.consumed;
                    self.consume(used);
                    let fits = self
                        .consumed
                        .checked_add(len)
                        .is_some_and(|end| end <= section_end);
                    if !fits {
                        return Err(DecodeError::SectionOverflow {
                            id: section::CODE,
                            offset,
                        });
                    }
                    self.stage = Stage::FunctionBody {
                        section_end,
                        remaining,
                        len,
                    };
                }
                Stage::FunctionBody {
                    section_end,
                    remaining,
                    len,
                } => {
                    if (self.buf.len() as u32) < len {
                        return Ok(());
                    }
                    let offset = self.consumed;
                    let bytes = WireBytes::from(&self.buf[..len as usize]);
                    self.consume(len as usize);
                    let index = self.inc.decode_function_body_owned(bytes.clone(), offset)?;
                    if let Some(builder) = self.builder.as_mut() {
                        builder.add(
                            index,
                            FunctionBody {
                                offset,
                                len,
                                bytes: Some(bytes),
                            },
                        );
                    }
                    if self.trace {
                        tracing::trace!(target: "riptide::stream", index, len, "function body");
                    }
                    self.stage = Stage::FunctionLength {
                        section_end,
                        remaining: remaining - 1,
                    };
                }
            }
        }
    }

    // The code-section header arrived: initialize compilation synchronously
    // (not as a task) with the two-producer finisher latch, and allocate
    // the unit builder. Bodies carry inline copies until the stream
    // finalizes the shared wire bytes.
    fn start_compilation(&mut self) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let module = Arc::new(self.inc.snapshot_module());
        self.job
            .prepare_and_start_compile(&engine, module, WireBytes::default(), 2, false);
        self.started_compile = true;
        if let Some(state) = self.job.state() {
            self.builder = Some(UnitBuilder::new(state.mode()));
        }
    }

    fn finish_inner(&mut self) -> Result<(), DecodeError> {
        // Consume any transition that needs no further bytes (e.g. the
        // empty tail of the code section).
        self.drive()?;
        let complete = self.buf.is_empty() && matches!(self.stage, Stage::SectionStart);
        if !complete {
            return Err(DecodeError::UnexpectedEof {
                offset: self.full.len() as u32,
            });
        }
        let module = self.inc.finish_decoding(true)?;
        self.flush_builder();
        self.builder = None;

        let full = WireBytes::from(std::mem::take(&mut self.full));
        if self.started_compile {
            self.job.set_wire_bytes(full);
        } else {
            // No code section: create the native module now.
            let Some(engine) = self.engine.upgrade() else {
                return Ok(());
            };
            self.job
                .prepare_and_start_compile(&engine, Arc::new(module), full, 2, false);
        }
        // The streaming producer is done; the compilation callback is the
        // other half of the latch.
        self.job.finisher_done();
        Ok(())
    }
}
