//!
//! Bulk ingestion of blk files.
//!
//! ## Workers
//! - A fixed number of threads take one file at a time from a shared
//!   queue guarded by a single mutex.
//! - Each worker reads and decodes its file on its own and hands every
//!   block to the callback. The callback sits behind one output mutex,
//!   so calls never overlap, but blocks from different files interleave
//!   in whatever order workers finish them.
//! - Each worker owns a [`WorkerContext`] that is passed to the callback.
//!
//! ## Stopping
//! - A failing worker records its error, raises the shared stop flag and
//!   quits. The others observe the flag between blocks and quit too.
//! - [`StopHandle`] raises the same flag from outside.
//! - `run` joins all workers before it returns; the first error wins.
//!

pub mod catalog;

use crate::parser::block::{BlockDecoder, BlockSource};
use crate::parser::errors::{OpError, OpErrorKind, OpResult};
use crate::parser::proto::Block;
use log::{info, warn};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Per-worker scratch state.
#[derive(Debug, Clone, Default)]
pub struct WorkerContext {
    pub thread_number: usize,
    pub files_done: usize,
    pub blocks_done: u64,
}

/// Raises the stop flag of a running processor.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IngestReport {
    pub files: usize,
    pub blocks: u64,
    /// true if the run ended on the stop flag rather than an empty queue
    pub stopped: bool,
}

pub struct ParallelBlockProcessor {
    decoder: BlockDecoder,
    threads: usize,
    stopper: Arc<AtomicBool>,
}

impl ParallelBlockProcessor {
    pub fn new(decoder: BlockDecoder, threads: usize) -> Self {
        ParallelBlockProcessor {
            decoder,
            threads: threads.max(1),
            stopper: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(self.stopper.clone())
    }

    ///
    /// Decode every block of `files`, calling `callback` once per block.
    ///
    pub fn run<F>(&self, files: Vec<PathBuf>, callback: F) -> OpResult<IngestReport>
    where
        F: FnMut(&mut WorkerContext, &Path, Block) -> OpResult<()> + Send,
    {
        let queue = Mutex::new(files.into_iter().collect::<VecDeque<_>>());
        let output = Mutex::new(callback);
        let first_error: Mutex<Option<OpError>> = Mutex::new(None);

        let contexts: Vec<WorkerContext> = thread::scope(|scope| {
            let handles: Vec<_> = (0..self.threads)
                .map(|thread_number| {
                    let queue = &queue;
                    let output = &output;
                    let first_error = &first_error;
                    scope.spawn(move || {
                        let mut context = WorkerContext {
                            thread_number,
                            ..WorkerContext::default()
                        };
                        while !self.stopper.load(Ordering::SeqCst) {
                            let path = match next_file(queue) {
                                Some(path) => path,
                                None => break,
                            };
                            if let Err(e) = self.process_file(&path, &mut context, output) {
                                warn!("worker {} failed on {}: {}", thread_number, path.display(), e);
                                self.stopper.store(true, Ordering::SeqCst);
                                if let Ok(mut slot) = first_error.lock() {
                                    slot.get_or_insert(e);
                                }
                                break;
                            }
                        }
                        context
                    })
                })
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(thread_number, h)| match h.join() {
                    Ok(context) => context,
                    Err(_) => {
                        warn!("worker {} panicked", thread_number);
                        self.stopper.store(true, Ordering::SeqCst);
                        if let Ok(mut slot) = first_error.lock() {
                            slot.get_or_insert(
                                OpError::new(OpErrorKind::RuntimeError)
                                    .join_msg(&format!("worker {} panicked", thread_number)),
                            );
                        }
                        WorkerContext::default()
                    }
                })
                .collect()
        });

        if let Some(e) = first_error.into_inner()? {
            return Err(e);
        }
        let report = IngestReport {
            files: contexts.iter().map(|c| c.files_done).sum(),
            blocks: contexts.iter().map(|c| c.blocks_done).sum(),
            stopped: self.stopper.load(Ordering::SeqCst),
        };
        info!(
            "ingested {} blocks from {} files{}",
            report.blocks,
            report.files,
            if report.stopped { " (stopped)" } else { "" }
        );
        Ok(report)
    }

    fn process_file<F>(
        &self,
        path: &Path,
        context: &mut WorkerContext,
        output: &Mutex<F>,
    ) -> OpResult<()>
    where
        F: FnMut(&mut WorkerContext, &Path, Block) -> OpResult<()>,
    {
        let data = fs::read(path).map_err(|e| OpError::from(e).join_msg(&path.display().to_string()))?;
        let name = path.display().to_string();
        for block in self.decoder.blocks(BlockSource::File { name: &name, data: &data }) {
            if self.stopper.load(Ordering::SeqCst) {
                return Ok(());
            }
            let block = block?;
            let mut callback = output.lock()?;
            (*callback)(context, path, block)?;
            context.blocks_done += 1;
        }
        context.files_done += 1;
        info!("worker {} finished {}", context.thread_number, name);
        Ok(())
    }
}

fn next_file(queue: &Mutex<VecDeque<PathBuf>>) -> Option<PathBuf> {
    queue.lock().ok()?.pop_front()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::reader::write_varint;
    use bitcoin::Network;
    use tempdir::TempDir;

    /// A header-only block whose nonce tells blocks apart.
    fn framed_block(nonce: u32) -> Vec<u8> {
        let mut body = vec![1, 0, 0, 0];
        body.extend_from_slice(&[0u8; 64]);
        body.extend_from_slice(&[0u8; 8]);
        body.extend_from_slice(&nonce.to_le_bytes());
        write_varint(&mut body, 0);
        let mut out = Network::Bitcoin.magic().to_le_bytes().to_vec();
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend(body);
        out
    }

    fn write_files(dir: &TempDir, files: usize, per_file: u32) -> Vec<PathBuf> {
        (0..files)
            .map(|f| {
                let mut data = Vec::new();
                for b in 0..per_file {
                    data.extend(framed_block(f as u32 * 1000 + b));
                }
                let path = dir.path().join(format!("blk{:05}.dat", f));
                fs::write(&path, data).unwrap();
                path
            })
            .collect()
    }

    #[test]
    fn test_all_blocks_delivered() {
        let dir = TempDir::new("ingest_all").unwrap();
        let files = write_files(&dir, 5, 4);
        let processor = ParallelBlockProcessor::new(BlockDecoder::new(Network::Bitcoin), 3);
        let mut nonces = Vec::new();
        let report = processor
            .run(files, |_, _, block| {
                nonces.push(block.header.nonce);
                Ok(())
            })
            .unwrap();
        assert_eq!(report.blocks, 20);
        assert_eq!(report.files, 5);
        assert!(!report.stopped);
        nonces.sort_unstable();
        let expected: Vec<u32> = (0..5).flat_map(|f| (0..4).map(move |b| f * 1000 + b)).collect();
        assert_eq!(nonces, expected);
    }

    #[test]
    fn test_error_stops_workers() {
        let dir = TempDir::new("ingest_err").unwrap();
        let files = write_files(&dir, 8, 3);
        let processor = ParallelBlockProcessor::new(BlockDecoder::new(Network::Bitcoin), 2);
        let mut seen = 0;
        let err = processor
            .run(files, |_, _, _| {
                seen += 1;
                if seen == 2 {
                    Err(OpError::from("callback refused block"))
                } else {
                    Ok(())
                }
            })
            .unwrap_err();
        assert!(err.is_kind(OpErrorKind::RuntimeError));
        assert!(seen < 24);
        assert!(processor.stop_handle().is_stopped());
    }

    #[test]
    fn test_panicking_callback_fails_run() {
        let dir = TempDir::new("ingest_panic").unwrap();
        let files = write_files(&dir, 2, 2);
        let processor = ParallelBlockProcessor::new(BlockDecoder::new(Network::Bitcoin), 1);
        let err = processor
            .run(files, |_, _, _| panic!("callback blew up"))
            .unwrap_err();
        assert!(err.is_kind(OpErrorKind::RuntimeError));
        assert!(err.to_string().contains("panicked"));
        assert!(processor.stop_handle().is_stopped());
    }

    #[test]
    fn test_stop_handle() {
        let dir = TempDir::new("ingest_stop").unwrap();
        let files = write_files(&dir, 4, 2);
        let processor = ParallelBlockProcessor::new(BlockDecoder::new(Network::Bitcoin), 1);
        let handle = processor.stop_handle();
        let report = processor
            .run(files, |_, _, _| {
                handle.stop();
                Ok(())
            })
            .unwrap();
        assert!(report.stopped);
        assert_eq!(report.blocks, 1);
    }
}
