mod common;

use common::{pattern, BrokenSink, MockDevice, RecordingLogger, TrippingSink};
use memetch_core::digest::HashingSink;
use memetch_core::info::{MemoryRange, RawMemoryInfo, NUMBER_OF_RUNS};
use memetch_core::ioctl::{IOCTL_GET_INFO, IOCTL_SET_MODE};
use memetch_core::{codec, AcquisitionEngine, AcquisitionMode, Error, SilentLogger, BUFFER_SIZE, PAGE_SIZE};
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

fn expected_bytes(base: u64, len: usize) -> Vec<u8> {
    (0..len as u64).map(|i| pattern(base + i)).collect()
}

fn engine(device: MockDevice) -> AcquisitionEngine<MockDevice> {
    AcquisitionEngine::new(device, Arc::new(SilentLogger)).unwrap()
}

#[test]
fn construction_queries_device_info() {
    let device = MockDevice::new(&[(0x1000, 0x9e000), (0x100000, 0x2000)]);
    let log = device.log();
    let engine = engine(device);

    assert_eq!(engine.info().cr3, 0x1ad000);
    assert_eq!(engine.info().kpcr, vec![0xfffff806_27b6c000]);
    assert_eq!(
        engine.info().ranges,
        vec![MemoryRange::new(0x1000, 0x9e000), MemoryRange::new(0x100000, 0x2000)]
    );
    assert_eq!(log.lock().unwrap().controls[0].0, IOCTL_GET_INFO);
}

#[test]
fn failed_info_query_is_an_open_error_and_releases_the_handle() {
    let device = MockDevice::new(&[(0x1000, 0x1000)]).fail_get_info();
    let log = device.log();

    match AcquisitionEngine::new(device, Arc::new(SilentLogger)) {
        Err(Error::Open(cause)) => assert!(matches!(*cause, Error::Ioctl { code: IOCTL_GET_INFO, .. })),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("engine should not open"),
    }
    assert_eq!(log.lock().unwrap().closes, 1);
}

#[test]
fn set_mode_sends_little_endian_mode() {
    let device = MockDevice::new(&[(0x1000, 0x1000)]);
    let log = device.log();
    let engine = engine(device);

    assert_eq!(engine.mode(), None);
    engine.set_mode(AcquisitionMode::Pte).unwrap();
    assert_eq!(engine.mode(), Some(AcquisitionMode::Pte));

    let log = log.lock().unwrap();
    let (code, input) = log.controls.last().unwrap();
    assert_eq!(*code, IOCTL_SET_MODE);
    assert_eq!(input, &vec![2, 0, 0, 0]);
}

#[test]
fn rejected_mode_is_an_ioctl_error() {
    let engine = engine(MockDevice::new(&[(0x1000, 0x1000)]).reject_set_mode());
    let err = engine.set_mode(AcquisitionMode::Physical).unwrap_err();
    assert!(matches!(err, Error::Ioctl { code: IOCTL_SET_MODE, .. }));
    assert_eq!(engine.mode(), None);
}

#[test]
fn dump_pads_leading_gap_then_copies_range() {
    let engine = engine(MockDevice::new(&[(0x1000, 0x1000)]));
    let mut sink = Vec::new();
    engine.sequential_dump(&mut sink, &AtomicBool::new(true)).unwrap();

    assert_eq!(sink.len(), 2 * PAGE_SIZE);
    assert!(sink[..PAGE_SIZE].iter().all(|&b| b == 0));
    assert_eq!(&sink[PAGE_SIZE..], &expected_bytes(0x1000, PAGE_SIZE)[..]);
}

#[test]
fn sparse_dump_to_file_leaves_identical_contents() {
    let ranges = [(0x1000, 0x2000), (0x10000, 0x1000)];
    let engine = engine(MockDevice::new(&ranges));
    engine.set_sparse(true);

    let mut file = tempfile::tempfile().unwrap();
    engine.sequential_dump(&mut file, &AtomicBool::new(true)).unwrap();

    let mut image = Vec::new();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.read_to_end(&mut image).unwrap();

    assert_eq!(image.len(), 0x11000);
    assert!(image[..0x1000].iter().all(|&b| b == 0));
    assert_eq!(&image[0x1000..0x3000], &expected_bytes(0x1000, 0x2000)[..]);
    assert!(image[0x3000..0x10000].iter().all(|&b| b == 0));
    assert_eq!(&image[0x10000..], &expected_bytes(0x10000, 0x1000)[..]);
}

#[test]
fn empty_range_list_dumps_nothing() {
    let device = MockDevice::new(&[]);
    let log = device.log();
    let engine = engine(device);

    let mut sink = Vec::new();
    engine.sequential_dump(&mut sink, &AtomicBool::new(true)).unwrap();
    assert!(sink.is_empty());
    assert!(log.lock().unwrap().reads.is_empty());
}

#[test]
fn full_run_table_is_dumped_completely() {
    let mut raw = RawMemoryInfo {
        number_of_runs: NUMBER_OF_RUNS as u64,
        ..Default::default()
    };
    for (slot, run) in raw.runs.iter_mut().enumerate() {
        *run = MemoryRange::new((slot as u64 * 2 + 1) * PAGE_SIZE as u64, PAGE_SIZE as u64);
    }
    let engine = engine(MockDevice::with_info(raw));
    assert_eq!(engine.info().ranges.len(), NUMBER_OF_RUNS);

    let mut sink = Vec::new();
    engine.sequential_dump(&mut sink, &AtomicBool::new(true)).unwrap();
    assert_eq!(sink.len(), NUMBER_OF_RUNS * 2 * PAGE_SIZE);
}

#[test]
fn random_read_in_gap_issues_no_device_io() {
    let device = MockDevice::new(&[(0x1000, 0x1000)]);
    let log = device.log();
    let engine = engine(device);

    let mut buf = vec![0xaau8; 0x200];
    assert_eq!(engine.read_at(&mut buf, 0x500).unwrap(), 0x200);
    assert!(buf.iter().all(|&b| b == 0));
    assert!(log.lock().unwrap().reads.is_empty());
}

#[test]
fn random_read_stitches_runs_and_stops_at_end_of_space() {
    let engine = engine(MockDevice::new(&[(0x1000, 0x1000), (0x3000, 0x1000)]));
    let mut buf = vec![0xaau8; 0x5000];
    let n = engine.read_at(&mut buf, 0x800).unwrap();

    assert_eq!(n, 0x3800);
    assert!(buf[..0x800].iter().all(|&b| b == 0));
    assert_eq!(&buf[0x800..0x1800], &expected_bytes(0x1000, 0x1000)[..]);
    assert!(buf[0x1800..0x2800].iter().all(|&b| b == 0));
    assert_eq!(&buf[0x2800..0x3800], &expected_bytes(0x3000, 0x1000)[..]);
}

#[test]
fn random_read_past_last_range_returns_zero() {
    let engine = engine(MockDevice::new(&[(0x1000, 0x1000)]));
    let mut buf = [0u8; 16];
    assert_eq!(engine.read_at(&mut buf, 0x2000).unwrap(), 0);
}

#[test]
fn random_read_zero_fills_only_the_bad_page() {
    let device = MockDevice::new(&[(0x1000, 0x4000)]).bad_page(0x3000);
    let engine = engine(device);

    let mut buf = vec![0xaau8; 0x4000];
    assert_eq!(engine.read_at(&mut buf, 0x1000).unwrap(), 0x4000);
    assert_eq!(&buf[..0x2000], &expected_bytes(0x1000, 0x2000)[..]);
    assert!(buf[0x2000..0x3000].iter().all(|&b| b == 0));
    assert_eq!(&buf[0x3000..], &expected_bytes(0x4000, 0x1000)[..]);
}

#[test]
fn unaligned_random_read_zero_fills_only_the_bad_page() {
    let device = MockDevice::new(&[(0x1000, 0x4000)]).bad_page(0x3000);
    let engine = engine(device);

    let mut buf = vec![0xaau8; 0x2000];
    assert_eq!(engine.read_at(&mut buf, 0x1800).unwrap(), 0x2000);
    assert_eq!(&buf[..0x1800], &expected_bytes(0x1800, 0x1800)[..]);
    assert!(buf[0x1800..].iter().all(|&b| b == 0));
}

#[test]
fn failed_bulk_read_retries_every_page_and_succeeds() {
    let base = 0x100000u64;
    let bad = [base + 0x5000, base + 0x200000, base + BUFFER_SIZE as u64 - 0x1000];
    let mut device = MockDevice::new(&[(base, BUFFER_SIZE as u64)]).fail_bulk();
    for address in bad {
        device = device.bad_page(address);
    }
    let log = device.log();
    let logger = Arc::new(RecordingLogger::default());
    let engine = AcquisitionEngine::new(device, logger.clone()).unwrap();

    let mut sink = Vec::new();
    engine
        .copy_range(base, BUFFER_SIZE as u64, &mut sink, &AtomicBool::new(true))
        .unwrap();

    assert_eq!(log.lock().unwrap().page_reads(), BUFFER_SIZE / PAGE_SIZE);
    assert_eq!(sink.len(), BUFFER_SIZE);
    for (index, page) in sink.chunks(PAGE_SIZE).enumerate() {
        let address = base + (index * PAGE_SIZE) as u64;
        if bad.contains(&address) {
            assert!(page.iter().all(|&b| b == 0), "page {address:#x} not zeroed");
        } else {
            assert_eq!(page, &expected_bytes(address, PAGE_SIZE)[..], "page {address:#x}");
        }
    }
    assert_eq!(logger.total_pages(), (BUFFER_SIZE / PAGE_SIZE - bad.len()) as u64);
    assert!(logger.debugs.lock().unwrap().iter().any(|line| line.contains("0x105000")));
}

#[test]
fn cancellation_after_first_range_keeps_only_its_bytes() {
    let engine = engine(MockDevice::new(&[(0x1000, 0x1000), (0x3000, 0x1000), (0x5000, 0x1000)]));
    let running = Arc::new(AtomicBool::new(true));
    let mut sink = TrippingSink::new(Vec::<u8>::new(), running.clone(), 0x2000);

    let err = engine.sequential_dump(&mut sink, &running).unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(sink.inner.len(), 0x2000);
    assert_eq!(&sink.inner[0x1000..], &expected_bytes(0x1000, 0x1000)[..]);
}

#[test]
fn cancellation_during_a_long_gap_stops_after_one_zero_chunk() {
    let device = MockDevice::new(&[(0x1000000, 0x1000)]);
    let log = device.log();
    let engine = engine(device);
    let running = Arc::new(AtomicBool::new(true));
    let mut sink = TrippingSink::new(Vec::<u8>::new(), running.clone(), 1);

    let err = engine.sequential_dump(&mut sink, &running).unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(sink.inner.len(), BUFFER_SIZE);
    assert!(sink.inner.iter().all(|&b| b == 0));
    assert!(log.lock().unwrap().reads.is_empty());
}

#[test]
fn cancelled_s2_dump_still_decodes_the_first_range() {
    let engine = engine(MockDevice::new(&[(0x1000, 0x1000), (0x3000, 0x1000), (0x5000, 0x1000)]));
    let running = Arc::new(AtomicBool::new(true));

    let mut stream = Vec::new();
    {
        let writer = codec::select_compressor("s2", &mut stream).unwrap();
        let mut sink = TrippingSink::new(writer, running.clone(), 0x2000);
        let err = engine.sequential_dump(&mut sink, &running).unwrap_err();
        assert!(err.is_cancelled());
    }

    let mut reader = codec::select_decompressor(&stream, Cursor::new(&stream)).unwrap();
    let mut restored = Vec::new();
    reader.read_to_end(&mut restored).unwrap();
    assert_eq!(restored.len(), 0x2000);
    assert!(restored[..0x1000].iter().all(|&b| b == 0));
    assert_eq!(&restored[0x1000..], &expected_bytes(0x1000, 0x1000)[..]);
}

#[test]
fn short_bulk_reads_write_exactly_what_was_returned() {
    let device = MockDevice::new(&[(0x1000, 0x4000)]).max_read(0x1800);
    let log = device.log();
    let engine = engine(device);

    let mut sink = Vec::new();
    engine
        .copy_range(0x1000, 0x4000, &mut sink, &AtomicBool::new(true))
        .unwrap();

    assert_eq!(sink, expected_bytes(0x1000, 0x4000));
    let offsets: Vec<u64> = log.lock().unwrap().reads.iter().map(|&(offset, _)| offset).collect();
    assert_eq!(offsets, vec![0x1000, 0x2800, 0x4000]);
}

#[test]
fn cancelled_before_start_writes_nothing() {
    let engine = engine(MockDevice::new(&[(0x1000, 0x1000)]));
    let mut sink = Vec::new();
    let err = engine
        .sequential_dump(&mut sink, &AtomicBool::new(false))
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(sink.is_empty());
}

#[test]
fn sink_failure_propagates_as_io_error() {
    let engine = engine(MockDevice::new(&[(0x1000, 0x1000)]));
    let err = engine
        .sequential_dump(&mut BrokenSink, &AtomicBool::new(true))
        .unwrap_err();
    assert!(matches!(err, Error::Io(_)));
}

#[test]
fn close_is_idempotent() {
    let device = MockDevice::new(&[(0x1000, 0x1000)]);
    let log = device.log();
    let engine = engine(device);

    engine.close().unwrap();
    engine.close().unwrap();
    assert!(engine.is_closed());

    let mut buf = [0u8; 16];
    assert!(matches!(engine.read_at(&mut buf, 0x1000), Err(Error::Closed)));
    drop(engine);
    assert_eq!(log.lock().unwrap().closes, 1);
}

#[test]
fn drop_releases_the_handle() {
    let device = MockDevice::new(&[(0x1000, 0x1000)]);
    let log = device.log();
    drop(engine(device));
    assert_eq!(log.lock().unwrap().closes, 1);
}

#[test]
fn concurrent_random_reads_see_their_own_data() {
    let engine = engine(MockDevice::new(&[(0x1000, 0x40000), (0x80000, 0x40000)]));

    std::thread::scope(|scope| {
        for worker in 0..8u64 {
            let engine = &engine;
            scope.spawn(move || {
                for round in 0..32u64 {
                    let offset = 0x1000 + ((worker * 32 + round) * 0x1700) % 0xbe000;
                    let mut buf = vec![0u8; 0x1800];
                    let n = engine.read_at(&mut buf, offset).unwrap();
                    for (i, &byte) in buf[..n].iter().enumerate() {
                        let address = offset + i as u64;
                        let backed = (0x1000..0x41000).contains(&address)
                            || (0x80000..0xc0000).contains(&address);
                        let expected = if backed { pattern(address) } else { 0 };
                        assert_eq!(byte, expected, "at {address:#x}");
                    }
                }
            });
        }
    });
}

#[test]
fn progress_counts_every_imaged_page() {
    let logger = Arc::new(RecordingLogger::default());
    let engine =
        AcquisitionEngine::new(MockDevice::new(&[(0x2000, 0x3000), (0x8000, 0x1000)]), logger.clone())
            .unwrap();

    engine.sequential_dump(&mut Vec::<u8>::new(), &AtomicBool::new(true)).unwrap();
    assert_eq!(logger.total_pages(), engine.info().image_pages());

    let infos = logger.infos.lock().unwrap();
    assert_eq!(infos[0], "Padding 2 pages from 0x0");
    assert_eq!(infos[1], "Copying 3 pages (0x3000) from 0x2000");
}

#[test]
fn compressed_dump_round_trips() {
    let engine = engine(MockDevice::new(&[(0x1000, 0x3000), (0x9000, 0x2000)]));
    let running = AtomicBool::new(true);

    let mut raw = Vec::new();
    engine.sequential_dump(&mut raw, &running).unwrap();

    for name in ["s2", "snappy", "gzip"] {
        let mut writer = codec::select_compressor(name, Vec::new()).unwrap();
        engine.sequential_dump(&mut writer, &running).unwrap();
        let stream = writer.finish().unwrap();

        let mut reader = codec::select_decompressor(&stream, Cursor::new(&stream)).unwrap();
        let mut restored = Vec::new();
        reader.read_to_end(&mut restored).unwrap();
        assert_eq!(restored, raw, "{name}");
    }
}

#[test]
fn digest_is_independent_of_sparse_output() {
    let ranges = [(0x1000, 0x1000), (0x20000, 0x2000)];
    let running = AtomicBool::new(true);

    let dense = engine(MockDevice::new(&ranges));
    let mut dense_sink = HashingSink::new(Vec::new());
    dense.sequential_dump(&mut dense_sink, &running).unwrap();

    let sparse = engine(MockDevice::new(&ranges));
    sparse.set_sparse(true);
    let mut sparse_sink = HashingSink::new(tempfile::tempfile().unwrap());
    sparse.sequential_dump(&mut sparse_sink, &running).unwrap();

    assert_eq!(sparse_sink.total(), 0x22000);
    assert_eq!(dense_sink.finish().1, sparse_sink.finish().1);
}
