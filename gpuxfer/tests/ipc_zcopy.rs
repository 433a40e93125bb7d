mod common;

use common::{Fixture, PEER_PID, REMOTE_BASE};
use gpuxfer::device::{EngineStatus, PointerKind};
use gpuxfer::{
    AgentId, ChunkCompletion, Completion, DeviceDriver, IoVec, IpcIface, IpcIfaceConfig, Status,
    Transport, XferError,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const MIB: usize = 1024 * 1024;

fn counting_completion() -> (Completion, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let bytes = Arc::new(AtomicUsize::new(0));
    let (c, b) = (Arc::clone(&calls), Arc::clone(&bytes));
    let comp = Completion::with_callback(move |n| {
        c.fetch_add(1, Ordering::SeqCst);
        b.store(n, Ordering::SeqCst);
    });
    (comp, calls, bytes)
}

#[test]
fn get_zcopy_end_to_end() {
    let f = Fixture::new(4096);
    let iface = IpcIface::new(f.driver(), IpcIfaceConfig::default());
    let ep = iface.connect(PEER_PID);
    let (comp, calls, bytes) = counting_completion();
    let iov = [IoVec::new(f.local_ptr, 4096)];

    let st = unsafe { ep.get_zcopy(&iov, REMOTE_BASE, &f.key, Some(&comp)) }.unwrap();
    assert_eq!(st, Status::InProgress);
    assert_eq!(iface.outstanding(), 1);
    assert_eq!(f.drv.issued().len(), 1);

    // Signal not fired yet.
    assert_eq!(iface.progress(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    f.drv.complete_all();
    assert_eq!(iface.progress(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(bytes.load(Ordering::SeqCst), 4096);
    assert_eq!(f.local, f.remote);

    // Exactly once.
    assert_eq!(iface.progress(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(ep.stats().get_zcopy.bytes, 4096);
}

#[test]
fn put_zcopy_moves_local_into_remote() {
    let mut f = Fixture::new(8192);
    f.local.iter_mut().for_each(|b| *b = 0xab);
    let iface = IpcIface::new(f.driver(), IpcIfaceConfig::default());
    let ep = iface.connect(PEER_PID);
    let iov = [IoVec::new(f.local_ptr + 1024, 2048)];

    let st = unsafe { ep.put_zcopy(&iov, REMOTE_BASE + 4096, &f.key, None) }.unwrap();
    assert_eq!(st, Status::InProgress);
    f.drv.complete_all();
    assert_eq!(iface.progress(), 1);

    assert!(f.remote[4096..6144].iter().all(|&b| b == 0xab));
    assert_ne!(f.remote[4095], 0xab);
    assert_ne!(f.remote[6144], 0xab);
}

#[test]
fn zero_length_is_done() {
    let f = Fixture::new(4096);
    let iface = IpcIface::new(f.driver(), IpcIfaceConfig::default());
    let ep = iface.connect(PEER_PID);

    let st = unsafe { ep.get_zcopy(&[IoVec::new(f.local_ptr, 0)], REMOTE_BASE, &f.key, None) };
    assert_eq!(st.unwrap(), Status::Done);
    let st = unsafe { ep.get_zcopy(&[], REMOTE_BASE, &f.key, None) };
    assert_eq!(st.unwrap(), Status::Done);
    let empty = [IoVec::new(f.local_ptr, 0), IoVec::new(f.local_ptr, 0)];
    let st = unsafe { ep.put_zcopy(&empty, REMOTE_BASE, &f.key, None) };
    assert_eq!(st.unwrap(), Status::Done);
    assert_eq!(ep.stats().errors, 0);
    assert_eq!(iface.outstanding(), 0);
    assert_eq!(f.drv.attach_calls(), 0);
}

#[test]
fn out_of_range_rejected_before_hardware() {
    let f = Fixture::new(4096);
    let iface = IpcIface::new(f.driver(), IpcIfaceConfig::default());
    let ep = iface.connect(PEER_PID);

    for (addr, len) in [(REMOTE_BASE + 1, 4096), (REMOTE_BASE - 1, 16), (REMOTE_BASE + 4096, 1)] {
        let iov = [IoVec::new(f.local_ptr, len)];
        let err = unsafe { ep.get_zcopy(&iov, addr, &f.key, None) }.unwrap_err();
        assert!(matches!(err, XferError::InvalidParam(_)), "{err}");
    }
    assert_eq!(iface.outstanding(), 0);
    assert_eq!(f.drv.attach_calls(), 0);
    assert!(f.drv.issued().is_empty());
}

#[test]
fn unknown_local_buffer_is_invalid_address() {
    let f = Fixture::new(4096);
    let iface = IpcIface::new(f.driver(), IpcIfaceConfig::default());
    let ep = iface.connect(PEER_PID);
    let mut plain = vec![0u8; 64];
    let iov = [IoVec::new(plain.as_mut_ptr() as u64, 64)];

    let err = unsafe { ep.get_zcopy(&iov, REMOTE_BASE, &f.key, None) }.unwrap_err();
    assert!(matches!(err, XferError::InvalidAddress { .. }));
    assert_eq!(iface.outstanding(), 0);
}

#[test]
fn attach_failure_is_mapping_failed() {
    let f = Fixture::new(4096);
    f.drv.fail_attach(true);
    let iface = IpcIface::new(f.driver(), IpcIfaceConfig::default());
    let ep = iface.connect(PEER_PID);
    let iov = [IoVec::new(f.local_ptr, 64)];

    let err = unsafe { ep.get_zcopy(&iov, REMOTE_BASE, &f.key, None) }.unwrap_err();
    assert!(matches!(err, XferError::MappingFailed { pid: PEER_PID, .. }));
    assert_eq!(ep.mapped_regions(), 0);
}

#[test]
fn remote_mapping_unknown_to_driver() {
    let f = Fixture::new(4096);
    let iface = IpcIface::new(f.driver(), IpcIfaceConfig::default());
    let ep = iface.connect(PEER_PID);
    let iov = [IoVec::new(f.local_ptr, 64)];

    // Map once, then make the mapping disappear from the driver's tables.
    unsafe { ep.get_zcopy(&iov, REMOTE_BASE, &f.key, None) }.unwrap();
    f.drv.unregister(f.remote.as_ptr() as u64);
    let err = unsafe { ep.get_zcopy(&iov, REMOTE_BASE, &f.key, None) }.unwrap_err();
    assert!(matches!(err, XferError::InvalidAddress { .. }));
    assert_eq!(iface.outstanding(), 1);
    f.drv.complete_all();
    iface.progress();
}

#[test]
fn allow_access_failure_is_invalid_address() {
    let f = Fixture::new(4096);
    f.drv.fail_allow_access(true);
    let iface = IpcIface::new(f.driver(), IpcIfaceConfig::default());
    let ep = iface.connect(PEER_PID);
    let iov = [IoVec::new(f.local_ptr, 64)];

    let err = unsafe { ep.put_zcopy(&iov, REMOTE_BASE, &f.key, None) }.unwrap_err();
    assert!(matches!(err, XferError::InvalidAddress { .. }));
    assert_eq!(iface.outstanding(), 0);
}

#[test]
fn invisible_remote_agent_uses_local_agent() {
    let f = Fixture::new(4096);
    let mut hidden = vec![0u8; 4096];
    let key = f.drv.export(PEER_PID, 0x9000, hidden.as_mut_ptr() as u64, 4096, AgentId::NULL);
    f.drv.fail_allow_access(true);
    let iface = IpcIface::new(f.driver(), IpcIfaceConfig::default());
    let ep = iface.connect(PEER_PID);
    let iov = [IoVec::new(f.local_ptr, 4096)];

    let st = unsafe { ep.get_zcopy(&iov, 0x9000, &key, None) }.unwrap();
    assert_eq!(st, Status::InProgress);
    let req = f.drv.issued()[0];
    assert_eq!(req.src_agent, f.drv.gpu(0));
    assert_eq!(req.dst_agent, f.drv.gpu(0));
    // No access grant is attempted for an invisible peer.
    assert!(f.drv.access_grants().is_empty());
    f.drv.complete_all();
    assert_eq!(iface.progress(), 1);
}

#[test]
fn access_granted_to_all_gpus_on_local_base() {
    let f = Fixture::new(4096);
    let iface = IpcIface::new(f.driver(), IpcIfaceConfig::default());
    let ep = iface.connect(PEER_PID);
    let iov = [IoVec::new(f.local_ptr + 128, 64)];

    unsafe { ep.put_zcopy(&iov, REMOTE_BASE, &f.key, None) }.unwrap();
    let grants = f.drv.access_grants();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].0, vec![f.drv.gpu(0), f.drv.gpu(1)]);
    assert_eq!(grants[0].1, f.local_ptr);
    f.drv.complete_all();
    iface.progress();
}

#[test]
fn mapping_reused_across_operations() {
    let f = Fixture::new(4096);
    let iface = IpcIface::new(f.driver(), IpcIfaceConfig::default());
    {
        let ep = iface.connect(PEER_PID);
        for _ in 0..3 {
            let iov = [IoVec::new(f.local_ptr, 512)];
            unsafe { ep.get_zcopy(&iov, REMOTE_BASE, &f.key, None) }.unwrap();
        }
        assert_eq!(f.drv.attach_calls(), 1);
        assert_eq!(ep.mapped_regions(), 1);
        f.drv.complete_all();
        assert_eq!(iface.progress(), 3);
    }
    // Dropping the endpoint detaches its mappings.
    assert_eq!(f.drv.detach_calls(), 1);
    assert_eq!(
        f.drv.pointer_info(f.remote.as_ptr() as u64, 1).unwrap().kind,
        PointerKind::Unknown
    );
}

#[test]
fn progress_is_fifo() {
    let f = Fixture::new(8192);
    let iface = IpcIface::new(f.driver(), IpcIfaceConfig::default());
    let ep = iface.connect(PEER_PID);
    let (c1, calls1, _) = counting_completion();
    let (c2, calls2, _) = counting_completion();

    let iov1 = [IoVec::new(f.local_ptr, 4096)];
    let iov2 = [IoVec::new(f.local_ptr + 4096, 4096)];
    unsafe {
        ep.get_zcopy(&iov1, REMOTE_BASE, &f.key, Some(&c1)).unwrap();
        ep.get_zcopy(&iov2, REMOTE_BASE + 4096, &f.key, Some(&c2)).unwrap();
    }

    // D2 fires first: the un-fired head blocks it.
    f.drv.complete_last();
    assert_eq!(iface.progress(), 0);
    assert_eq!(calls2.load(Ordering::SeqCst), 0);

    f.drv.complete_next();
    assert_eq!(iface.progress(), 2);
    assert_eq!(calls1.load(Ordering::SeqCst), 1);
    assert_eq!(calls2.load(Ordering::SeqCst), 1);
}

#[test]
fn flush_reports_outstanding_work() {
    let f = Fixture::new(4096);
    let iface = IpcIface::new(f.driver(), IpcIfaceConfig::default());
    let ep = iface.connect(PEER_PID);
    assert_eq!(iface.flush(None).unwrap(), Status::Done);

    let iov = [IoVec::new(f.local_ptr, 4096)];
    unsafe { ep.get_zcopy(&iov, REMOTE_BASE, &f.key, None) }.unwrap();
    assert_eq!(iface.flush(None).unwrap(), Status::InProgress);
    let comp = Completion::new();
    assert!(matches!(iface.flush(Some(&comp)), Err(XferError::Unsupported(_))));

    f.drv.complete_all();
    iface.progress();
    assert_eq!(iface.flush(None).unwrap(), Status::Done);
    let stats = iface.stats();
    assert_eq!(stats.flush, 2);
    assert_eq!(stats.flush_wait, 1);
    assert_eq!(stats.retired, 1);
}

#[test]
fn large_copy_split_across_engines() {
    let size = 4 * MIB + 3000;
    let f = Fixture::new(size);
    f.drv.set_default_engine_mask(0b1111_0000);
    let iface = IpcIface::new(f.driver(), IpcIfaceConfig::default());
    let ep = iface.connect(PEER_PID);
    let (comp, calls, bytes) = counting_completion();
    let iov = [IoVec::new(f.local_ptr, size)];

    unsafe { ep.get_zcopy(&iov, REMOTE_BASE, &f.key, Some(&comp)) }.unwrap();
    let issued = f.drv.issued();
    assert_eq!(issued.len(), 4);
    assert_eq!(issued.iter().map(|r| r.size).sum::<usize>(), size);
    let chunk = issued[0].size;
    assert_eq!(chunk % 4096, 0);
    assert!(issued[..3].iter().all(|r| r.size == chunk));
    for (i, r) in issued.iter().enumerate() {
        assert_eq!(r.dst, f.local_ptr + (i * chunk) as u64);
    }
    // Destination is GPU 0: engines in ascending order, unrotated.
    let engines: Vec<u32> = issued.iter().map(|r| r.engine.unwrap().0).collect();
    assert_eq!(engines, vec![4, 5, 6, 7]);

    f.drv.complete_all();
    assert_eq!(iface.progress(), 4);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(bytes.load(Ordering::SeqCst), size);
    assert_eq!(f.local, f.remote);
}

#[test]
fn put_to_second_gpu_rotates_engines() {
    let size = 2 * MIB;
    let f = Fixture::new(size);
    f.drv.set_default_engine_mask(0b1111);
    let iface = IpcIface::new(f.driver(), IpcIfaceConfig::default());
    let ep = iface.connect(PEER_PID);
    let iov = [IoVec::new(f.local_ptr, size)];

    unsafe { ep.put_zcopy(&iov, REMOTE_BASE, &f.key, None) }.unwrap();
    // Destination GPU 1, two engines used: rotated left by 2.
    let engines: Vec<u32> = f.drv.issued().iter().map(|r| r.engine.unwrap().0).collect();
    assert_eq!(engines, vec![2, 3]);
    f.drv.complete_all();
    iface.progress();
}

#[test]
fn last_chunk_carries_completion() {
    let size = 2 * MIB;
    let f = Fixture::new(size);
    let iface = IpcIface::new(f.driver(), IpcIfaceConfig::default());
    let ep = iface.connect(PEER_PID);
    let comp = Completion::new();
    let iov = [IoVec::new(f.local_ptr, size)];

    unsafe { ep.get_zcopy(&iov, REMOTE_BASE, &f.key, Some(&comp)) }.unwrap();
    assert_eq!(iface.outstanding(), 2);

    // Retiring the first chunk leaves the completion pending.
    f.drv.complete_next();
    assert_eq!(iface.progress(), 1);
    assert!(!comp.is_done());

    f.drv.complete_next();
    assert_eq!(iface.progress(), 1);
    assert!(comp.is_done());
    assert_eq!(comp.bytes(), size);
}

#[test]
fn all_chunks_completion_waits_for_every_chunk() {
    let size = 3 * MIB;
    let f = Fixture::new(size);
    let config = IpcIfaceConfig {
        chunk_completion: ChunkCompletion::AllChunks,
        ..IpcIfaceConfig::default()
    };
    let iface = IpcIface::new(f.driver(), config);
    let ep = iface.connect(PEER_PID);
    let (comp, calls, _) = counting_completion();
    let iov = [IoVec::new(f.local_ptr, size)];

    unsafe { ep.get_zcopy(&iov, REMOTE_BASE, &f.key, Some(&comp)) }.unwrap();
    assert_eq!(iface.outstanding(), 3);

    f.drv.complete_next();
    f.drv.complete_next();
    assert_eq!(iface.progress(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    f.drv.complete_next();
    assert_eq!(iface.progress(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn fallback_engines_when_mask_too_small() {
    let size = 4 * MIB;
    let f = Fixture::new(size);
    f.drv.set_engine_status(
        f.drv.gpu(0),
        f.drv.gpu(1),
        EngineStatus {
            mask: 0b1,
            exhausted: true,
        },
    );
    let iface = IpcIface::new(f.driver(), IpcIfaceConfig::default());
    let ep = iface.connect(PEER_PID);
    let iov = [IoVec::new(f.local_ptr, size)];

    unsafe { ep.get_zcopy(&iov, REMOTE_BASE, &f.key, None) }.unwrap();
    let engines: Vec<u32> = f.drv.issued().iter().map(|r| r.engine.unwrap().0).collect();
    assert_eq!(engines, vec![2, 3, 4]);
    f.drv.complete_all();
    iface.progress();
}

#[test]
fn single_engine_when_multi_sdma_disabled() {
    let size = 4 * MIB;
    let f = Fixture::new(size);
    let config = IpcIfaceConfig {
        enable_multi_sdma: false,
        ..IpcIfaceConfig::default()
    };
    let iface = IpcIface::new(f.driver(), config);
    let ep = iface.connect(PEER_PID);
    let iov = [IoVec::new(f.local_ptr, size)];

    unsafe { ep.get_zcopy(&iov, REMOTE_BASE, &f.key, None) }.unwrap();
    let issued = f.drv.issued();
    assert_eq!(issued.len(), 1);
    assert_eq!(issued[0].engine, None);
    f.drv.complete_all();
    iface.progress();
}

#[test]
fn device_failure_is_io_error_and_rolls_back() {
    let f = Fixture::new(4096);
    f.drv.fail_copies_after(Some(0));
    let config = IpcIfaceConfig {
        enable_multi_sdma: false,
        ..IpcIfaceConfig::default()
    };
    let iface = IpcIface::new(f.driver(), config);
    let ep = iface.connect(PEER_PID);
    let (comp, calls, _) = counting_completion();
    let iov = [IoVec::new(f.local_ptr, 4096)];

    let err = unsafe { ep.get_zcopy(&iov, REMOTE_BASE, &f.key, Some(&comp)) }.unwrap_err();
    assert!(matches!(err, XferError::IoError { .. }));
    assert_eq!(iface.outstanding(), 0);
    assert_eq!(iface.progress(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(ep.stats().errors, 1);
}

#[test]
fn signal_pool_exhaustion_is_no_memory() {
    let f = Fixture::new(4096);
    let mut config = IpcIfaceConfig {
        enable_multi_sdma: false,
        ..IpcIfaceConfig::default()
    };
    config.signal_pool.per_chunk = 2;
    config.signal_pool.max = 2;
    let iface = IpcIface::new(f.driver(), config);
    let ep = iface.connect(PEER_PID);
    let iov = [IoVec::new(f.local_ptr, 64)];

    unsafe {
        ep.get_zcopy(&iov, REMOTE_BASE, &f.key, None).unwrap();
        ep.get_zcopy(&iov, REMOTE_BASE, &f.key, None).unwrap();
        let err = ep.get_zcopy(&iov, REMOTE_BASE, &f.key, None).unwrap_err();
        assert!(matches!(err, XferError::NoMemory { in_use: 2, max: 2, .. }));
    }

    f.drv.complete_all();
    assert_eq!(iface.progress(), 2);
    unsafe { ep.get_zcopy(&iov, REMOTE_BASE, &f.key, None) }.unwrap();
    f.drv.complete_all();
    iface.progress();
}

#[test]
fn retry_after_pool_exhaustion_reports_size_once() {
    let f = Fixture::new(8192);
    let mut config = IpcIfaceConfig {
        enable_multi_sdma: false,
        ..IpcIfaceConfig::default()
    };
    config.signal_pool.per_chunk = 1;
    config.signal_pool.max = 1;
    let iface = IpcIface::new(f.driver(), config);
    let ep = iface.connect(PEER_PID);
    let (comp, calls, bytes) = counting_completion();
    let first = [IoVec::new(f.local_ptr, 4096)];
    let second = [IoVec::new(f.local_ptr + 4096, 4096)];

    unsafe { ep.get_zcopy(&first, REMOTE_BASE, &f.key, None) }.unwrap();
    let err = unsafe { ep.get_zcopy(&second, REMOTE_BASE + 4096, &f.key, Some(&comp)) }.unwrap_err();
    assert!(matches!(err, XferError::NoMemory { .. }));
    assert_eq!(comp.bytes(), 0);

    f.drv.complete_all();
    assert_eq!(iface.progress(), 1);
    let st = unsafe { ep.get_zcopy(&second, REMOTE_BASE + 4096, &f.key, Some(&comp)) }.unwrap();
    assert_eq!(st, Status::InProgress);
    f.drv.complete_all();
    assert_eq!(iface.progress(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(bytes.load(Ordering::SeqCst), 4096);
    assert_eq!(f.local, f.remote);
}
