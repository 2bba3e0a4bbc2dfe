//! Cold-start side of the log: walking the chain, claiming its blocks so the
//! main store won't reuse them, and replaying records into the object layer.

use crate::base_types::*;
use crate::chain;
use crate::error::{IoError, ParseError, ReplayError};
use crate::header::LogHeaderPhys;
use crate::io::{BlockIo, ReplayDispatch};
use crate::record::{LogRecord, RecordBody, WriteData};
use crate::zilog::Zilog;
use async_stream::stream;
use futures::pin_mut;
use futures::StreamExt;
use futures_core::Stream;
use log::*;
use std::sync::Arc;

#[derive(Debug)]
pub enum ChainEntry {
    Block { bp: BlockPointer, nused: usize },
    Record(LogRecord),
}

/// Walk the chain from the header's first block, yielding each valid block
/// and (optionally) the records inside it.
///
/// The first invalid block is normally the torn tail left by a crash and ends
/// the stream cleanly.  Once the log has been claimed, though, every block up
/// to the claimed bound was seen intact at claim time, so an invalid one
/// before that bound is real corruption.
pub fn parse_chain(
    io: Arc<dyn BlockIo>,
    header: LogHeaderPhys,
    decode_records: bool,
) -> impl Stream<Item = Result<ChainEntry, ParseError>> {
    stream! {
        let identity = header.identity;
        let claimed = !header.claim_txg.is_none();
        let blk_limit = if claimed { header.claim_blk_seq } else { u64::MAX };
        let lr_limit = if header.claim_lr_seq_valid {
            header.claim_lr_seq
        } else {
            u64::MAX
        };
        let mut next = header.log;
        while let Some(bp) = next {
            if bp.seq > blk_limit {
                // Written after the claim; not part of the recovered log.
                return;
            }
            let buf = match io.read(bp.extent).await {
                Ok(buf) => buf,
                Err(e) => {
                    yield Err(ParseError::Io(e));
                    return;
                }
            };
            let (records, block_next, nused) = match chain::open_block(&buf, &identity, bp.seq) {
                Ok(opened) => (
                    opened.records.to_vec(),
                    opened.next,
                    opened.nused,
                ),
                Err(invalid) => {
                    if claimed && bp.seq <= blk_limit {
                        yield Err(ParseError::LogCorrupt {
                            bp,
                            detail: invalid.to_string(),
                        });
                    } else {
                        trace!("chain ends at {}: {}", bp, invalid);
                    }
                    return;
                }
            };
            yield Ok(ChainEntry::Block { bp, nused });
            if decode_records {
                let mut offset = 0;
                while offset < records.len() {
                    match LogRecord::decode(&records[offset..]) {
                        Ok((record, consumed)) => {
                            offset += consumed;
                            if record.seq > lr_limit {
                                // Past what claim saw; ignore the rest.
                                return;
                            }
                            yield Ok(ChainEntry::Record(record));
                        }
                        Err(e) => {
                            // The block checksum covered these bytes, so
                            // this is damage, not a torn write.
                            yield Err(ParseError::LogCorrupt {
                                bp,
                                detail: format!("record at offset {}: {}", offset, e),
                            });
                            return;
                        }
                    }
                }
            }
            next = block_next;
        }
    }
}

impl Zilog {
    /// Claim the chain after a crash: mark every live block (and indirect
    /// write payload) born since `claim_txg` as in-use, and record the
    /// claimed bounds in the header.
    pub async fn claim(&self, claim_txg: Txg) -> Result<(), ParseError> {
        let header = self.header();
        if !header.claim_txg.is_none() {
            info!("log {} already claimed at txg {}", header.identity.guid, header.claim_txg);
            return Ok(());
        }
        let mut max_blk_seq = 0;
        let mut max_lr_seq = 0;
        let mut blocks = 0u64;
        let mut records = 0u64;
        {
            let stream = parse_chain(self.io().clone(), header.clone(), true);
            pin_mut!(stream);
            while let Some(entry) = stream.next().await {
                match entry? {
                    ChainEntry::Block { bp, .. } => {
                        if bp.birth_txg >= claim_txg {
                            self.alloc().claim(bp.extent).await.map_err(ParseError::Io)?;
                        }
                        max_blk_seq = bp.seq;
                        blocks += 1;
                    }
                    ChainEntry::Record(record) => {
                        if let RecordBody::Write(write) = &record.body {
                            if let WriteData::Indirect(bp) = &write.data {
                                if bp.birth_txg >= claim_txg {
                                    self.alloc().claim(bp.extent).await.map_err(ParseError::Io)?;
                                }
                            }
                        }
                        max_lr_seq = record.seq;
                        records += 1;
                    }
                }
            }
        }
        let mut header = header;
        header.claim_txg = claim_txg;
        header.claim_blk_seq = max_blk_seq;
        header.claim_lr_seq = max_lr_seq;
        header.claim_lr_seq_valid = true;
        header.replay_needed = records > 0;
        header.write(&**self.io()).await.map_err(ParseError::Io)?;
        self.set_header(header);
        info!(
            "claimed log at txg {}: {} blocks, {} records, blk_seq {}, lr_seq {}",
            claim_txg, blocks, records, max_blk_seq, max_lr_seq
        );
        Ok(())
    }

    /// Replay the claimed chain into the object layer, then free it.  Safe
    /// to interrupt: applied progress is recorded in the header and skipped
    /// on the next attempt.
    pub async fn replay(&self, dispatch: &dyn ReplayDispatch) -> Result<(), ReplayError> {
        let header = self.header();
        if !header.replay_needed {
            debug!("no log replay needed");
            return Ok(());
        }
        let claim_txg = header.claim_txg;
        let mut replay_seq = header.replay_seq;
        let mut applied = 0u64;
        let mut skipped = 0u64;
        let mut chain_extents = Vec::new();
        {
            let stream = parse_chain(self.io().clone(), header.clone(), true);
            pin_mut!(stream);
            while let Some(entry) = stream.next().await {
                match entry? {
                    ChainEntry::Block { bp, .. } => {
                        // Blocks born before the claim weren't claimed by it;
                        // they were freed when their txg synced.
                        if bp.birth_txg >= claim_txg {
                            chain_extents.push(bp.extent);
                        }
                    }
                    ChainEntry::Record(record) => {
                        if record.seq <= replay_seq {
                            // Applied by an interrupted earlier replay.
                            skipped += 1;
                            continue;
                        }
                        if record.txg < claim_txg {
                            // The main store synced this before the crash.
                            skipped += 1;
                            continue;
                        }
                        if let Err(first) = dispatch.apply(&record.body).await {
                            // The object layer may just be behind (e.g. a
                            // pending free); give it one sync to catch up.
                            debug!(
                                "replay of seq {} failed ({:#}); retrying after sync",
                                record.seq, first
                            );
                            self.txgs().wait_synced(record.txg).await;
                            if let Err(source) = dispatch.apply(&record.body).await {
                                self.save_replay_progress(replay_seq).await;
                                return Err(ReplayError::Apply {
                                    seq: record.seq,
                                    txg: record.txg,
                                    source,
                                });
                            }
                        }
                        replay_seq = record.seq;
                        self.save_replay_progress(replay_seq).await;
                        applied += 1;
                    }
                }
            }
        }
        info!("log replay complete: {} applied, {} skipped", applied, skipped);
        self.reset_log(chain_extents)
            .await
            .map_err(|e| ParseError::Io(IoError::new(format!("log reset failed: {:#}", e))))?;
        Ok(())
    }

    async fn save_replay_progress(&self, replay_seq: u64) {
        let mut header = self.header();
        header.replay_seq = replay_seq;
        self.set_header(header.clone());
        if let Err(e) = header.write(&**self.io()).await {
            warn!("couldn't persist replay progress: {}", e);
        }
    }
}
