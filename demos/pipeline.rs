//! 两级流水线 - RDI 阶段产出，consumer 线程阻塞获取
//!
//! Producer 线程按 seqId 顺序 setup、写入并标记 Ready，
//! 主线程用阻塞的 `get_target_buffers` 逐帧读取。
//!
//! 使用方法:
//! ```bash
//! RUST_LOG=tbm_core=debug cargo run --example pipeline
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tbm_core::{
    BufferManagerCreateData, Collaborators, MetadataPool, PixelFormat, TargetBufferManager,
    TargetBufferManagerConfig, TargetId, TargetStatus,
};
use tracing_subscriber::EnvFilter;

const META: TargetId = 1;
const RDI: TargetId = 2;
const FRAMES: u32 = 8;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = TargetBufferManagerConfig::new("rdi")
        .with_metadata(META)
        .with_internal_stream(
            RDI,
            "rdi_pool",
            BufferManagerCreateData::new(64, 4, PixelFormat::Blob).with_counts(3, 6),
        );
    let tbm = TargetBufferManager::create(
        &config,
        Collaborators::new().with_metadata_manager(Arc::new(MetadataPool::new())),
    )?;
    println!("Created manager: {:?}", tbm);

    // 先 setup 全部帧，consumer 才能按 seqId 阻塞等待
    let mut handles = Vec::new();
    for seq_id in 0..FRAMES.min(tbm.max_buffer_count()) {
        handles.push(tbm.setup_target_buffer(seq_id)?);
    }
    let produced = handles.len() as u32;

    let producer = thread::spawn({
        let tbm = tbm.clone();
        move || -> tbm_core::Result<()> {
            for handle in handles {
                thread::sleep(Duration::from_millis(20));
                let seq_id = handle.seq_id();
                for target in [META, RDI] {
                    let payload = tbm
                        .get_target(&handle, target)
                        .ok_or(tbm_core::Error::UnknownTarget(target))?;
                    if let Some(stream) = payload.as_stream() {
                        stream.buffer.write(format!("frame {}", seq_id).as_bytes());
                    }
                    tbm.update_target(seq_id, target, Some(&payload), TargetStatus::Ready, false)?;
                }
            }
            Ok(())
        }
    });

    for seq_id in 0..produced {
        let leases = tbm.get_target_buffers(seq_id, 1, true, None)?;
        for lease in leases.into_iter().flatten() {
            if let Some(stream) = lease.target(RDI).and_then(|p| p.as_stream().cloned()) {
                let data = stream.buffer.lock();
                let text = String::from_utf8_lossy(&data.as_slice()[..16]);
                println!("seqId {}: {}", lease.seq_id(), text.trim_end_matches('\0'));
            }
        }
    }

    match producer.join() {
        Ok(result) => result?,
        Err(_) => return Err("producer thread panicked".into()),
    }
    println!("Stats: {:?}", tbm.stats());
    Ok(())
}
