#![forbid(unsafe_code)]
//! Full capture-session walkthroughs over the assembled pipeline: RT entry,
//! buffered writes deferred behind RT mode, forced flush, and a direct-mode
//! capture landing whole pages on contiguous media.

use revo::{
    BitmapAllocator, BlockNumber, DeviceId, FileId, FlushState, MemTransport, Pipeline,
    PipelineConfig, ReservoirConfig, RtState, Segment, SgConfig, StreamMode, Transport as _,
};
use std::sync::Arc;

const DEV: DeviceId = DeviceId(0);
const BLOCK: u32 = 512;

fn pipeline() -> Pipeline {
    Pipeline::new(PipelineConfig {
        reservoir: ReservoirConfig {
            target_depth: 4,
            descriptor_budget: 64,
            block_bytes: BLOCK,
            claim_retries: 1,
        },
        sg: SgConfig {
            page_bytes: 1024,
            page_entries: 4,
            min_unit: 256,
        },
        scratch_base: 0x8_0000,
        scratch_bytes: 128 * 1024,
        ..PipelineConfig::default()
    })
}

fn attach(pipeline: &Pipeline) -> Arc<MemTransport> {
    let transport = Arc::new(MemTransport::new(1 << 20));
    pipeline
        .attach_device(DEV, Arc::new(BitmapAllocator::new(256)), transport.clone())
        .expect("attach");
    transport
}

/// Idle device enters RT mode, defers its writes, leaves RT mode, and a
/// forced flush persists everything and puts the daemon back to sleep.
#[test]
fn rt_session_defers_writes_until_flushed() {
    let pipeline = pipeline();
    let transport = attach(&pipeline);
    let stream = pipeline
        .open_stream(DEV, FileId(1), StreamMode {
            real_time: true,
            direct: false,
        })
        .expect("open");

    assert_eq!(pipeline.rt_state(DEV), RtState::Normal);
    assert_eq!(pipeline.flush_state(DEV), Some(FlushState::Sleep));

    // RT request promotes immediately (no guard held) and arms the daemon.
    pipeline.request_rt(DEV);
    assert_eq!(pipeline.rt_state(DEV), RtState::RtOn);
    assert_eq!(pipeline.flush_state(DEV), Some(FlushState::Standby));

    // Below the target depth nothing reaches media.
    transport.fill_bus(0, &[0x5A; BLOCK as usize]);
    stream
        .write(vec![Segment { addr: 0, len: BLOCK }])
        .expect("write");
    stream
        .write(vec![Segment { addr: 0, len: BLOCK }])
        .expect("write");
    assert_eq!(transport.stats().dispatched, 0);

    // Leaving RT mode keeps the daemon armed while data is dirty.
    pipeline.clear_rt(DEV);
    assert_eq!(pipeline.rt_state(DEV), RtState::Normal);
    assert_eq!(pipeline.flush_state(DEV), Some(FlushState::Standby));

    // Forced flush persists the queue; the daemon can finally sleep.
    let dispatched = pipeline.flush_now(DEV, false).expect("flush");
    assert!(dispatched >= 2);
    assert!(transport.stats().dispatched >= 2);
    assert_eq!(pipeline.flush_state(DEV), Some(FlushState::Sleep));

    stream.close().expect("close");
}

/// A promotion requested while the guard is held stays Suspended and lands
/// when the last hold is dropped.
#[test]
fn rt_promotion_defers_behind_the_guard() {
    let pipeline = pipeline();
    attach(&pipeline);

    pipeline.rt_lock(DEV);
    pipeline.request_rt(DEV);
    assert_eq!(pipeline.rt_state(DEV), RtState::Suspended);

    let waiter = {
        let pipeline = Arc::new(pipeline);
        let handle = {
            let pipeline = Arc::clone(&pipeline);
            std::thread::spawn(move || pipeline.wait_rt(DEV))
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        pipeline.rt_unlock(DEV);
        assert_eq!(pipeline.rt_state(DEV), RtState::RtOn);
        handle
    };
    assert!(waiter.join().expect("join"), "waiter saw the promotion");
}

/// Direct-mode capture: raw runs become whole pages, the burst drains onto
/// consecutive blocks, and the close pads both the final page and the
/// placement unit.
#[test]
fn direct_capture_lands_whole_pages_contiguously() {
    let pipeline = pipeline();
    let transport = attach(&pipeline);
    pipeline.request_rt(DEV);
    let stream = pipeline
        .open_stream(DEV, FileId(9), StreamMode {
            real_time: true,
            direct: true,
        })
        .expect("open");

    // Two full 1024-byte pages from four raw runs, then a 500-byte tail.
    for i in 0..4_u64 {
        let addr = i * 512;
        transport.fill_bus(addr, &[0xC0 + u8::try_from(i).expect("pattern"); 512]);
        stream.write_direct(addr, 512).expect("direct write");
    }
    transport.fill_bus(0x5000, &[0xEE; 500]);
    stream.write_direct(0x5000, 500).expect("direct write");

    stream.close().expect("close");

    // Three pages (third sealed with a 524-byte scratch pad) plus one unit
    // pad block: dispatched 4, padding 1.
    let stats = transport.stats();
    assert_eq!(stats.dispatched, 4);
    assert_eq!(stats.padding_dispatched, 1);

    // Page contents land in capture order on consecutive blocks.
    let first = transport.block_bytes(BlockNumber(0)).expect("page 0");
    assert_eq!(first.len(), 1024);
    assert_eq!(&first[..512], &[0xC0; 512][..]);
    assert_eq!(&first[512..], &[0xC1; 512][..]);
    let second = transport.block_bytes(BlockNumber(1)).expect("page 1");
    assert_eq!(&second[..512], &[0xC2; 512][..]);
    let third = transport.block_bytes(BlockNumber(2)).expect("page 2");
    assert_eq!(&third[..500], &[0xEE; 500][..]);
}

/// Metadata-only sync persists structural writes and leaves file data
/// queued for a later full pass.
#[test]
fn metadata_only_sync_skips_file_data() {
    let pipeline = pipeline();
    let transport = attach(&pipeline);
    let stream = pipeline
        .open_stream(DEV, FileId(1), StreamMode::default())
        .expect("open");

    stream
        .write(vec![Segment { addr: 0, len: BLOCK }])
        .expect("write");
    pipeline
        .write_metadata(DEV, vec![Segment { addr: 0x400, len: BLOCK }])
        .expect("metadata");

    let dispatched = pipeline.flush_now(DEV, true).expect("syssync");
    assert_eq!(dispatched, 1, "only the metadata descriptor went out");
    assert_eq!(transport.stats().dispatched, 1);

    let dispatched = pipeline.flush_now(DEV, false).expect("sync");
    assert!(dispatched >= 1, "file data follows on the full pass");

    stream.close().expect("close");
}
