//! 回调消费 - 对尚未完成的帧注册回调
//!
//! 启用 fence 时，非阻塞获取直接返回还在生产中的记录；
//! 这里关闭 fence，演示回调在记录 Ready 时被调用一次。
//!
//! 使用方法:
//! ```bash
//! RUST_LOG=tbm_core=trace cargo run --example callback
//! ```

use std::sync::mpsc;
use std::sync::Arc;

use parking_lot::Mutex;
use tbm_core::{
    BufferManagerCreateData, Collaborators, PixelFormat, TargetBufferLease, TargetBufferManager,
    TargetBufferManagerConfig, TargetCallback, TargetId, TargetStatus,
};
use tracing_subscriber::EnvFilter;

const RAW: TargetId = 7;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = TargetBufferManagerConfig::new("raw").with_internal_stream(
        RAW,
        "raw_pool",
        BufferManagerCreateData::new(32, 1, PixelFormat::Blob).with_counts(2, 4),
    );
    let tbm = TargetBufferManager::create(&config, Collaborators::new())?;

    let (tx, rx) = mpsc::channel::<TargetBufferLease>();
    let tx = Mutex::new(tx);
    let callback: TargetCallback = Arc::new(move |lease: TargetBufferLease| {
        println!("callback: seqId {} is {:?}", lease.seq_id(), lease.status());
        let _ = tx.lock().send(lease);
    });

    let handle = tbm.setup_target_buffer(100)?;
    let slots = tbm.get_target_buffers(100, 1, false, Some(callback))?;
    println!("registered callback, immediate result: {:?}", slots);

    let payload = tbm
        .get_target(&handle, RAW)
        .ok_or(tbm_core::Error::UnknownTarget(RAW))?;
    if let Some(stream) = payload.as_stream() {
        stream.buffer.write(b"raw frame");
    }
    tbm.update_target(100, RAW, Some(&payload), TargetStatus::Ready, false)?;

    let lease = rx.recv()?;
    println!(
        "received lease on seqId {}, first / last ready: {:?} / {:?}",
        lease.seq_id(),
        tbm.first_ready_sequence_id(),
        tbm.last_ready_sequence_id()
    );
    lease.release()?;
    println!("Stats: {:?}", tbm.stats());
    Ok(())
}
