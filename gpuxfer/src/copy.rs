//! Issuing asynchronous copies to the hardware.
//!
//! A copy either goes to one engine chosen by the driver, or is split into
//! page-aligned chunks spread over several SDMA engines. Each piece gets
//! its own signal descriptor pushed on the interface queue.

use crate::completion::Completion;
use crate::config::{ChunkCompletion, EngineFallback};
use crate::device::{CopyRequest, DeviceDriver};
use crate::engine::EngineSelector;
use crate::error::{Result, Status, XferError};
use crate::signal::{SignalPool, SignalQueue};
use crate::types::{AgentId, EngineId};

/// One logical copy.
#[derive(Debug, Clone)]
pub struct CopyJob {
    pub dst: u64,
    pub dst_agent: AgentId,
    pub src: u64,
    pub src_agent: AgentId,
    pub size: usize,
    /// Local base of the remote mapping involved, recorded in descriptors.
    pub mapped_base: u64,
    pub completion: Option<Completion>,
}

/// Multi-engine parameters taken from the interface configuration.
#[derive(Debug, Clone, Copy)]
pub struct MultiEngine<'a> {
    pub max_engines: usize,
    pub thresh: usize,
    pub policy: ChunkCompletion,
    pub fallback: &'a EngineFallback,
}

/// A piece of a split copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub offset: usize,
    pub len: usize,
}

fn align_up(n: usize, align: usize) -> usize {
    n.div_ceil(align) * align
}

/// Split `size` bytes into at most `n` chunks.
///
/// Every chunk but the last is `align_up(size / n, page)` bytes; the last
/// takes the rest. If alignment makes chunks so large that later ones would
/// be empty, fewer chunks are returned. The lengths always sum to `size`.
pub fn chunk_plan(size: usize, n: usize, page: usize) -> Vec<Chunk> {
    if size == 0 {
        return Vec::new();
    }
    let n = n.max(1);
    let chunk = align_up(size / n, page.max(1)).max(1);
    let n = n.min(size.div_ceil(chunk));
    (0..n)
        .map(|i| {
            let offset = i * chunk;
            let len = if i == n - 1 { size - offset } else { chunk };
            Chunk { offset, len }
        })
        .collect()
}

/// Engines a multi-engine copy of `size` bytes uses, given `available`.
pub fn engine_count(size: usize, available: usize, multi: &MultiEngine<'_>) -> usize {
    let by_size = size / multi.thresh.max(1);
    available.min(multi.max_engines).min(by_size).max(1)
}

/// Issues copies and queues their descriptors.
pub struct CopyDispatcher<'a> {
    driver: &'a dyn DeviceDriver,
    pool: &'a mut SignalPool,
    queue: &'a mut SignalQueue,
}

impl<'a> CopyDispatcher<'a> {
    pub fn new(driver: &'a dyn DeviceDriver, pool: &'a mut SignalPool, queue: &'a mut SignalQueue) -> Self {
        Self { driver, pool, queue }
    }

    /// Issue `job`, split across engines when `multi` is given.
    pub fn issue(&mut self, job: CopyJob, multi: Option<&MultiEngine<'_>>) -> Result<Status> {
        if job.size == 0 {
            return Ok(Status::Done);
        }
        match multi {
            Some(multi) => self.issue_multi(job, multi),
            None => self.issue_single(job),
        }
    }

    /// One descriptor, one copy, engine chosen by the driver.
    pub fn issue_single(&mut self, job: CopyJob) -> Result<Status> {
        if job.size == 0 {
            return Ok(Status::Done);
        }
        self.issue_piece(&job, 0, job.size, None, job.completion.clone())?;
        if let Some(comp) = &job.completion {
            comp.add_bytes(job.size);
        }
        tracing::trace!(size = job.size, "async copy issued");
        Ok(Status::InProgress)
    }

    /// Split `job` over several engines.
    pub fn issue_multi(&mut self, job: CopyJob, multi: &MultiEngine<'_>) -> Result<Status> {
        if job.size == 0 {
            return Ok(Status::Done);
        }
        let selector = EngineSelector::new(self.driver, multi.fallback);
        let mut engines = selector
            .candidates(job.dst_agent, job.src_agent, multi.max_engines)
            .inspect_err(|e| tracing::error!(error = %e, "couldn't find any engines to execute data transfer"))?;
        let wanted = engine_count(job.size, engines.len(), multi);
        selector.rotate(&mut engines, job.dst_agent, wanted);

        let chunks = chunk_plan(job.size, wanted, self.driver.page_size());
        let n = chunks.len();
        tracing::trace!(
            engines = n,
            chunk_size = chunks[0].len,
            first_engine = engines[0].0,
            "splitting copy across engines"
        );

        if let Some(comp) = &job.completion {
            if multi.policy == ChunkCompletion::AllChunks {
                comp.add_pending(n - 1);
            }
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let last = i == n - 1;
            let comp = match multi.policy {
                ChunkCompletion::AllChunks => job.completion.clone(),
                ChunkCompletion::LastChunk if last => job.completion.clone(),
                ChunkCompletion::LastChunk => None,
            };
            let engine = engines[i % engines.len()];
            if let Err(e) = self.issue_piece(&job, chunk.offset, chunk.len, Some(engine), comp) {
                if multi.policy == ChunkCompletion::AllChunks {
                    if let Some(comp) = &job.completion {
                        // Chunks from `i` on never retire. With nothing
                        // issued the operation failed as a whole and the
                        // completion must not fire.
                        let never = n - i;
                        if i > 0 {
                            comp.add_bytes(chunks[..i].iter().map(|c| c.len).sum());
                        }
                        comp.cancel_pending(if i == 0 { never - 1 } else { never });
                    }
                }
                return Err(e);
            }
        }
        // Nothing retires before the dispatcher returns, so the count is in
        // place before the completion can fire.
        if let Some(comp) = &job.completion {
            comp.add_bytes(job.size);
        }
        Ok(Status::InProgress)
    }

    fn issue_piece(
        &mut self,
        job: &CopyJob,
        offset: usize,
        len: usize,
        engine: Option<EngineId>,
        completion: Option<Completion>,
    ) -> Result<()> {
        let id = self.pool.get().inspect_err(|e| {
            tracing::error!(error = %e, "failed to get signal descriptor");
        })?;
        let signal = self.pool.desc(id).signal;
        self.driver.signal_store(signal, 1);

        let req = CopyRequest {
            dst: job.dst + offset as u64,
            dst_agent: job.dst_agent,
            src: job.src + offset as u64,
            src_agent: job.src_agent,
            size: len,
            signal,
            engine,
        };
        // SAFETY: the endpoints validated both ranges against driver
        // allocations; callers keep them alive until the completion fires.
        if let Err(e) = unsafe { self.driver.async_copy(&req) } {
            self.pool.put(id);
            tracing::error!(error = %e, size = len, engine = ?engine, "copy error");
            return Err(XferError::io_with_source("async copy", e));
        }

        let desc = self.pool.desc_mut(id);
        desc.completion = completion;
        desc.mapped_addr = job.mapped_base;
        desc.length = len;
        self.queue.push(id);
        Ok(())
    }
}
