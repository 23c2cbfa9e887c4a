//! Writers under backpressure and the binary log channel

mod common;

use std::thread;
use std::time::Duration;

use apptrace::logtrace::{TAG_INLINE_FMT, TAG_OVERFLOW, TAG_PRINTF};
use apptrace::{
    trace_printf, ArenaTransport, Destination, LogTrace, RawEncoder, Registry, SessionConfig,
    Timeout, TraceContext, TraceError, TraceWriter, Transport,
};
use common::{MemLink, TestPlatform};

#[test]
fn nonblocking_writer_sees_backpressure() {
    let platform = TestPlatform::new();
    let transport = ArenaTransport::<256, _>::new(MemLink::new(Destination::Jtag), &platform);
    let raw = RawEncoder::new();
    let registry = Registry::new()
        .with_transport(&transport)
        .and_then(|r| r.with_encoder(&raw))
        .unwrap();
    let ctx = TraceContext::new(registry, &platform);
    ctx.create(&SessionConfig::default()).unwrap();

    let mut writer = TraceWriter::new(&ctx, Destination::Jtag, 7);
    for i in 0..100u32 {
        let _ = writer.write(&i.to_le_bytes(), Timeout::NoWait);
    }

    let stats = writer.stats();
    assert_eq!(stats.attempts(), 100);
    assert_eq!(stats.errors, 0);
    assert!(stats.would_block > 0);
    assert_eq!(writer.wr_cnt(), stats.ok);
    assert!(matches!(writer.try_write(b"more"), Err(nb::Error::WouldBlock)));

    // Only accepted writes reach the host, each with the next counter value.
    transport.flush(Timeout::Micros(100_000)).unwrap();
    let frames = transport.link().frames();
    assert_eq!(frames.len() as u32, stats.ok);
    for (n, frame) in frames.iter().enumerate() {
        assert_eq!(frame.origin, 7);
        assert_eq!(frame.wr_cnt, n as u32);
        assert_eq!(frame.payload, (n as u32).to_le_bytes());
    }
}

#[test]
fn blocked_writer_resumes_once_drained() {
    let platform = TestPlatform::new();
    let transport = ArenaTransport::<128, _>::new(MemLink::new(Destination::Uart), &platform);
    let raw = RawEncoder::new();
    let registry = Registry::new()
        .with_transport(&transport)
        .and_then(|r| r.with_encoder(&raw))
        .unwrap();
    let ctx = TraceContext::new(registry, &platform);
    ctx.create(&SessionConfig::new("raw", "uart")).unwrap();

    while ctx.write(Destination::Uart, &[0xAA; 20], Timeout::NoWait).is_ok() {}

    thread::scope(|s| {
        let blocked = s.spawn(|| {
            let mut writer = TraceWriter::new(&ctx, Destination::Uart, 1);
            writer.write(&[0xBB; 20], Timeout::Infinite)
        });

        thread::sleep(Duration::from_millis(10));
        assert!(!blocked.is_finished());
        ctx.pump(Timeout::NoWait).unwrap();

        assert_eq!(blocked.join().unwrap(), Ok(()));
    });

    ctx.flush(Destination::Uart, Timeout::Micros(100_000)).unwrap();
    let last = transport.link().frames().pop().unwrap();
    assert_eq!(last.origin, 1);
    assert_eq!(last.payload, vec![0xBB; 20]);
}

#[test]
fn timed_out_write_leaves_arena_untouched() {
    let platform = TestPlatform::new();
    let transport = ArenaTransport::<128, _>::new(MemLink::new(Destination::Jtag), &platform);
    let raw = RawEncoder::new();
    let registry = Registry::new()
        .with_transport(&transport)
        .and_then(|r| r.with_encoder(&raw))
        .unwrap();
    let ctx = TraceContext::new(registry, &platform);
    ctx.create(&SessionConfig::default()).unwrap();

    while ctx.write(Destination::Jtag, &[1; 16], Timeout::NoWait).is_ok() {}
    let before = transport.info();

    assert_eq!(
        ctx.write(Destination::Jtag, &[2; 16], Timeout::Micros(5_000)),
        Err(TraceError::Timeout)
    );
    assert_eq!(transport.info(), before);
}

#[test]
fn log_channel_reports_dropped_records() {
    let platform = TestPlatform::new();
    let transport = ArenaTransport::<128, _>::new(MemLink::new(Destination::Jtag), &platform);
    let raw = RawEncoder::new();
    let registry = Registry::new()
        .with_transport(&transport)
        .and_then(|r| r.with_encoder(&raw))
        .unwrap();
    let ctx = TraceContext::new(registry, &platform);
    ctx.create(&SessionConfig::default()).unwrap();

    while ctx.write(Destination::Jtag, &[0; 4], Timeout::NoWait).is_ok() {}

    let mut log = LogTrace::new(&ctx, Destination::Jtag).with_origin(3);
    assert_eq!(log.printf(Timeout::NoWait, "n=%d", &[5i32.into()]), Err(TraceError::Busy));
    assert_eq!(log.printf(Timeout::NoWait, "n=%d", &[6i32.into()]), Err(TraceError::Busy));
    assert_eq!(log.dropped(), 2);

    transport.flush(Timeout::Micros(100_000)).unwrap();
    let filler = transport.link().frames().len();

    assert!(log.printf(Timeout::NoWait, "n=%d", &[7i32.into()]).unwrap() > 0);
    assert_eq!(log.dropped(), 0);
    transport.flush(Timeout::Micros(100_000)).unwrap();

    let frames = transport.link().frames();
    assert_eq!(frames.len(), filler + 2);
    assert_eq!(frames[filler].payload, vec![TAG_OVERFLOW, 2]);
    let record = &frames[filler + 1].payload;
    assert_eq!(record[0], TAG_PRINTF | TAG_INLINE_FMT);
    assert_eq!(&record[record.len() - 2..], &[1, 7]);

    // Dropped records leave the counter alone; stored ones advance it.
    let stamps: Vec<(u8, u32)> = frames[filler..].iter().map(|f| (f.origin, f.wr_cnt)).collect();
    assert_eq!(stamps, vec![(3, 0), (3, 1)]);
}

#[test]
fn printf_macro_checks_arguments() {
    let platform = TestPlatform::new();
    let transport = ArenaTransport::<512, _>::new(MemLink::new(Destination::Jtag), &platform);
    let raw = RawEncoder::new();
    let registry = Registry::new()
        .with_transport(&transport)
        .and_then(|r| r.with_encoder(&raw))
        .unwrap();
    let ctx = TraceContext::new(registry, &platform);
    ctx.create(&SessionConfig::default()).unwrap();

    let n = trace_printf!(&ctx, Destination::Jtag, Timeout::NoWait, "%s=%u", "x", 3u32).unwrap();
    assert_eq!(
        trace_printf!(&ctx, Destination::Jtag, Timeout::NoWait, "%s=%u", "x"),
        Err(TraceError::InvalidArgument)
    );

    transport.flush(Timeout::Micros(100_000)).unwrap();
    let frames = transport.link().frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].payload.len(), n);
    assert_eq!(&frames[0].payload[frames[0].payload.len() - 4..], &[2, 1, b'x', 3]);
}
