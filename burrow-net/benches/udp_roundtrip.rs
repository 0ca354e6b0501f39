use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::net::UdpSocket;
use std::os::unix::io::IntoRawFd;

use burrow_io::EventBase;
use burrow_net::{CommPoint, NetEvent, ReplyInfo, SizedBuffer};

/// One query-reply exchange through the full loop: client sendto,
/// readiness wakeup, callback, synchronous echo, client recv.
fn bench_udp_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("udp_roundtrip");

    for payload_size in [64usize, 512, 1400] {
        group.throughput(Throughput::Bytes(payload_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(payload_size),
            &payload_size,
            |b, &size| {
                let base = EventBase::create(false).unwrap();
                let server = UdpSocket::bind("127.0.0.1:0").unwrap();
                let server_addr = server.local_addr().unwrap();
                server.set_nonblocking(true).unwrap();
                let base2 = base.clone();
                let _point = CommPoint::create_udp(
                    &base,
                    server.into_raw_fd(),
                    SizedBuffer::new(65535),
                    move |_c: &mut CommPoint, _ev: NetEvent, _reply: Option<&mut ReplyInfo>| {
                        base2.exit();
                        true
                    },
                )
                .unwrap();

                let client = UdpSocket::bind("127.0.0.1:0").unwrap();
                let payload = vec![0xA5u8; size];
                let mut back = vec![0u8; 65535];

                b.iter(|| {
                    client.send_to(&payload, server_addr).unwrap();
                    base.dispatch();
                    client.recv_from(&mut back).unwrap()
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_udp_roundtrip);
criterion_main!(benches);
