//! File- or device-backed block i/o.  Plain pread/pwrite on a blocking
//! thread, with semaphores bounding the queue depth per direction; an
//! explicit fsync is the durability point, so the page cache is fine in
//! between.

use crate::base_types::*;
use crate::error::IoError;
use crate::io::BlockIo;
use anyhow::{Context, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use log::*;
use metered::common::*;
use metered::hdr_histogram::AtomicHdrHistogram;
use metered::metered;
use metered::time_source::StdInstantMicros;
use nix::sys::stat::SFlag;
use std::os::unix::prelude::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::sync::Semaphore;
use util::get_tunable;

lazy_static! {
    static ref READ_QUEUE_DEPTH: usize = get_tunable("zil_vdev_read_queue_depth", 32usize);
    static ref WRITE_QUEUE_DEPTH: usize = get_tunable("zil_vdev_write_queue_depth", 32usize);
}

// Generate ioctl function for block device sizing
nix::ioctl_read!(ioctl_blkgetsize64, 0x12u8, 114u8, u64);

#[derive(Debug)]
struct Disk {
    file: File,
    path: PathBuf,
    size: u64,
}

#[derive(Debug)]
pub struct FileVdev {
    disks: Vec<Disk>,
    metrics: FileVdevMetrics,
    reads: Semaphore,
    writes: Semaphore,
}

async fn disk_size(file: &File, path: &Path) -> Result<u64> {
    let stat = nix::sys::stat::fstat(file.as_raw_fd())?;
    let mode = SFlag::from_bits_truncate(stat.st_mode);
    if mode.contains(SFlag::S_IFBLK) {
        let mut size = 0u64;
        unsafe { ioctl_blkgetsize64(file.as_raw_fd(), &mut size) }
            .with_context(|| format!("sizing block device {:?}", path))?;
        Ok(size)
    } else {
        Ok(file.metadata().await?.len())
    }
}

#[metered(registry = FileVdevMetrics)]
impl FileVdev {
    /// Open the log devices; index in `paths` becomes the VdevId.
    pub async fn open(paths: &[PathBuf]) -> Result<Arc<FileVdev>> {
        assert!(!paths.is_empty());
        let mut disks = Vec::with_capacity(paths.len());
        for path in paths {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .await
                .with_context(|| format!("opening log device {:?}", path))?;
            let size = disk_size(&file, path).await?;
            info!("opened log device {:?}: {} bytes", path, size);
            disks.push(Disk {
                file,
                path: path.clone(),
                size,
            });
        }
        Ok(Arc::new(FileVdev {
            disks,
            metrics: Default::default(),
            reads: Semaphore::new(*READ_QUEUE_DEPTH),
            writes: Semaphore::new(*WRITE_QUEUE_DEPTH),
        }))
    }

    pub fn size(&self, vdev: VdevId) -> Option<u64> {
        self.disk(vdev).map(|disk| disk.size)
    }

    pub fn dump_metrics(&self) {
        debug!("vdev metrics: {:#?}", self.metrics);
    }

    fn disk(&self, vdev: VdevId) -> Option<&Disk> {
        self.disks.get(vdev.0 as usize)
    }

    fn disk_or_err(&self, vdev: VdevId) -> Result<&Disk, IoError> {
        self.disk(vdev)
            .ok_or_else(|| IoError::new(format!("no such vdev {}", vdev)))
    }

    #[measure(type = ResponseTime<AtomicHdrHistogram, StdInstantMicros>)]
    #[measure(InFlight)]
    #[measure(Throughput)]
    #[measure(HitCount)]
    pub async fn read_raw(&self, extent: Extent) -> Result<Vec<u8>, IoError> {
        let disk = self.disk_or_err(extent.vdev)?;
        let fd = disk.file.as_raw_fd();
        let _permit = self.reads.acquire().await.unwrap();
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; extent.size as usize];
            let mut done = 0;
            while done < buf.len() {
                let n = nix::sys::uio::pread(
                    fd,
                    &mut buf[done..],
                    (extent.location.offset + done as u64) as i64,
                )?;
                if n == 0 {
                    return Err(IoError::new(format!("short read at {}", extent)));
                }
                done += n;
            }
            Ok(buf)
        })
        .await
        .unwrap()
    }

    #[measure(type = ResponseTime<AtomicHdrHistogram, StdInstantMicros>)]
    #[measure(InFlight)]
    #[measure(Throughput)]
    #[measure(HitCount)]
    pub async fn write_raw(
        &self,
        vdev: VdevId,
        location: DiskLocation,
        data: Vec<u8>,
    ) -> Result<(), IoError> {
        let disk = self.disk_or_err(vdev)?;
        let fd = disk.file.as_raw_fd();
        let _permit = self.writes.acquire().await.unwrap();
        tokio::task::spawn_blocking(move || {
            let mut done = 0;
            while done < data.len() {
                let n = nix::sys::uio::pwrite(
                    fd,
                    &data[done..],
                    (location.offset + done as u64) as i64,
                )?;
                if n == 0 {
                    return Err(IoError::new(format!(
                        "short write at {}:{}",
                        vdev, location
                    )));
                }
                done += n;
            }
            Ok(())
        })
        .await
        .unwrap()
    }

    #[measure(type = ResponseTime<AtomicHdrHistogram, StdInstantMicros>)]
    #[measure(Throughput)]
    #[measure(HitCount)]
    pub async fn flush_raw(&self, vdev: VdevId) -> Result<(), IoError> {
        let disk = self.disk_or_err(vdev)?;
        let fd = disk.file.as_raw_fd();
        trace!("flushing {:?}", disk.path);
        tokio::task::spawn_blocking(move || {
            nix::unistd::fsync(fd)?;
            Ok(())
        })
        .await
        .unwrap()
    }
}

#[async_trait]
impl BlockIo for FileVdev {
    async fn read(&self, extent: Extent) -> Result<Vec<u8>, IoError> {
        self.read_raw(extent).await
    }

    async fn write(
        &self,
        vdev: VdevId,
        location: DiskLocation,
        data: Vec<u8>,
    ) -> Result<(), IoError> {
        self.write_raw(vdev, location, data).await
    }

    async fn flush(&self, vdev: VdevId) -> Result<(), IoError> {
        self.flush_raw(vdev).await
    }
}
